//! Backup directory format
//!
//! One YAML file per record, named `<kind-prefix>-<uid>`, holding the whole
//! record (metadata, spec and status). There is no index; loading reads and
//! classifies every file in the directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::error::{ControllerError, Result};
use crate::store::Kind;

/// Records loaded from a backup, grouped by kind and sorted by namespace
/// and name.
pub type Snapshot = BTreeMap<Kind, Vec<DynamicObject>>;

#[derive(Debug, Clone)]
pub struct Archive {
    dir: PathBuf,
}

impl Archive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Filename for a record. The record must have been persisted (have a uid).
    pub fn file_name(kind: Kind, obj: &DynamicObject) -> Result<String> {
        let uid = obj
            .uid()
            .ok_or_else(|| ControllerError::migration(format!("{} {} has no uid", kind, obj.name_any())))?;
        Ok(format!("{}-{}", kind.file_prefix(), uid))
    }

    /// Write one record, replacing any earlier copy.
    pub async fn write(&self, kind: Kind, obj: &DynamicObject) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::file_name(kind, obj)?);
        let encoded = serde_yaml::to_string(obj)?;
        tokio::fs::write(&path, encoded)
            .await
            .map_err(|e| ControllerError::migration(format!("while writing {}: {}", path.display(), e)))?;
        debug!("Saved {} {} to {}", kind, obj.name_any(), path.display());
        Ok(path)
    }

    /// Read every record in the directory. Files without a catalog kind
    /// prefix are skipped.
    pub async fn load(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ControllerError::migration(format!("while reading {}: {}", self.dir.display(), e)))?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(kind) = file_name
                .split_once('-')
                .and_then(|(prefix, _)| Kind::from_file_prefix(prefix))
            else {
                warn!("Skipping unrecognized backup file {}", file_name);
                continue;
            };

            let path = entry.path();
            let contents = tokio::fs::read_to_string(&path).await?;
            let obj: DynamicObject = serde_yaml::from_str(&contents)
                .map_err(|e| ControllerError::migration(format!("while decoding {}: {}", path.display(), e)))?;
            snapshot.entry(kind).or_default().push(obj);
        }

        for records in snapshot.values_mut() {
            records.sort_by(|a, b| (a.namespace(), a.name_any()).cmp(&(b.namespace(), b.name_any())));
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: Kind, name: &str, uid: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &kind.api_resource()).within("default");
        obj.metadata.uid = Some(uid.to_string());
        obj.data = json!({"spec": {"secretName": name}, "status": {"lastConditionState": "Ready"}});
        obj
    }

    #[tokio::test]
    async fn test_write_then_load_classifies_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());

        let path = archive
            .write(Kind::ServiceBinding, &record(Kind::ServiceBinding, "b1", "1234-abcd"))
            .await
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "servicebinding-1234-abcd");
        archive
            .write(Kind::ServiceInstance, &record(Kind::ServiceInstance, "i1", "5678"))
            .await
            .unwrap();
        std::fs::write(dir.path().join("README"), "not a record").unwrap();

        let snapshot = archive.load().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        let bindings = &snapshot[&Kind::ServiceBinding];
        assert_eq!(bindings[0].name_any(), "b1");
        assert_eq!(bindings[0].data["status"]["lastConditionState"], "Ready");
        assert_eq!(bindings[0].uid().as_deref(), Some("1234-abcd"));
    }

    #[tokio::test]
    async fn test_misspelled_plan_prefix_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let obj = record(Kind::ServicePlan, "p1", "9");
        std::fs::write(dir.path().join("servicdirplan-9"), serde_yaml::to_string(&obj).unwrap()).unwrap();

        let snapshot = Archive::new(dir.path()).load().await.unwrap();
        assert_eq!(snapshot[&Kind::ServicePlan].len(), 1);
    }

    #[test]
    fn test_file_name_requires_uid() {
        let obj = DynamicObject::new("b1", &Kind::ServiceBinding.api_resource());
        assert!(Archive::file_name(Kind::ServiceBinding, &obj).is_err());
    }
}

//! Migration engine
//!
//! Moves every catalog record out of a source store into a backup directory
//! and back into a target store. Exclusive access comes from scaling the
//! controller to zero and installing a webhook that rejects writes, not
//! from any in-process lock.
//!
//! Backup: blocker on, controller down, snapshot, detach binding secrets,
//! blocker off, delete records (bindings first), release finalizers.
//! Restore: controller down, re-create records (brokers first) with their
//! status, repair owner references, re-attach secrets, controller up.

pub mod archive;
pub mod cleaner;
pub mod cluster;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::conditions::last_condition_state;
use crate::crd::{BrokerResource, ClusterServiceBroker, ServiceBinding, ServiceBroker, ServiceInstance};
use crate::error::{ControllerError, Result};
use crate::retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};
use crate::store::{typed, Kind, ListOptions, Store, StoreKind};

pub use archive::{Archive, Snapshot};
pub use cleaner::{remove_finalizers, Cleaner};
pub use cluster::{
    blocker_configuration, scale, ClusterOps, KubeCluster, ReplicaStatus, ScalePolicy, BLOCKER_NAME,
};

/// Instance spec fields the target store may refuse on create.
const RESOLVED_REF_FIELDS: [&str; 4] = [
    "clusterServiceClassRef",
    "clusterServicePlanRef",
    "serviceClassRef",
    "servicePlanRef",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MigrationAction {
    Backup,
    Restore,
    #[value(name = "deployBlocker", alias = "deploy-blocker")]
    DeployBlocker,
    #[value(name = "undeployBlocker", alias = "undeploy-blocker")]
    UndeployBlocker,
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Backup directory
    pub storage_path: PathBuf,
    /// Namespace of the catalog deployments
    pub namespace: String,
    /// Controller deployment scaled down for the duration
    pub controller_manager: String,
    /// Deployment whose presence marks the source store as live. Without
    /// one, backup always runs.
    pub apiserver: Option<String>,
}

/// (kind, namespace, name) of a restored record, for owner-reference repair
type RecordKey = (String, Option<String>, String);

pub struct Migration {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterOps>,
    archive: Archive,
    options: MigrationOptions,
    policy: ScalePolicy,
    retry: RetryConfig,
}

impl Migration {
    pub fn new(store: Arc<dyn Store>, cluster: Arc<dyn ClusterOps>, options: MigrationOptions) -> Self {
        Self {
            store,
            cluster,
            archive: Archive::new(options.storage_path.clone()),
            options,
            policy: ScalePolicy::MIGRATION,
            retry: RetryConfig::with_max_attempts(5),
        }
    }

    pub fn with_policy(mut self, policy: ScalePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self, action: MigrationAction) -> Result<()> {
        match action {
            MigrationAction::Backup => self.backup().await,
            MigrationAction::Restore => self.restore().await,
            MigrationAction::DeployBlocker => self.deploy_blocker().await,
            MigrationAction::UndeployBlocker => {
                self.undeploy_blocker().await;
                Ok(())
            }
        }
    }

    /// Whether the source store is live and needs migrating.
    pub async fn is_migration_required(&self) -> Result<bool> {
        match &self.options.apiserver {
            Some(name) => self.cluster.deployment_exists(&self.options.namespace, name).await,
            None => Ok(true),
        }
    }

    /// Install the blocker. Safe to repeat: any earlier copy is removed first.
    pub async fn deploy_blocker(&self) -> Result<()> {
        self.undeploy_blocker().await;
        info!("Deploying write blocker {}", BLOCKER_NAME);
        self.cluster.create_blocker(BLOCKER_NAME).await?;
        info!("All catalog records are read-only");
        Ok(())
    }

    /// Remove the blocker. Failures are logged, never returned.
    pub async fn undeploy_blocker(&self) {
        match self.cluster.delete_validating_webhook(BLOCKER_NAME).await {
            Ok(()) => debug!("Write blocker {} removed", BLOCKER_NAME),
            Err(e) => warn!("Could not remove write blocker {}: {}", BLOCKER_NAME, e),
        }
    }

    pub async fn backup(&self) -> Result<()> {
        if !self.is_migration_required().await? {
            info!("Source store is not running, skipping the migration");
            return Ok(());
        }
        info!("Executing backup to {}", self.archive.dir().display());

        self.deploy_blocker().await?;
        let result = self.backup_blocked().await;
        // Also runs when a step above failed.
        self.undeploy_blocker().await;
        result
    }

    async fn backup_blocked(&self) -> Result<()> {
        self.scale_controller(0).await?;
        let snapshot = self.save_records().await?;
        self.detach_secrets().await?;

        // Deletes are writes; the blocker would reject them.
        self.undeploy_blocker().await;
        self.delete_records(&snapshot).await?;

        info!("Removing finalizers");
        remove_finalizers(self.store.as_ref(), &self.retry).await?;
        info!("Backup complete");
        Ok(())
    }

    pub async fn restore(&self) -> Result<()> {
        info!("Executing restore from {}", self.archive.dir().display());
        self.scale_controller(0).await?;
        let snapshot = self.archive.load().await?;
        self.restore_snapshot(&snapshot).await?;
        self.scale_controller(1).await?;
        info!("Restore complete");
        Ok(())
    }

    async fn scale_controller(&self, replicas: i32) -> Result<()> {
        scale(
            self.cluster.as_ref(),
            &self.options.namespace,
            &self.options.controller_manager,
            replicas,
            self.policy,
        )
        .await
    }

    /// Write every catalog record to the archive.
    pub async fn save_records(&self) -> Result<Snapshot> {
        info!("Saving resources");
        let mut snapshot = Snapshot::new();
        for kind in Kind::CATALOG {
            let records = self
                .store
                .list(kind, &ListOptions::all())
                .await
                .map_err(|e| ControllerError::migration(format!("while listing {}: {}", kind, e)))?;
            for obj in &records {
                retry_with_backoff(&self.retry, "backup record", || self.archive.write(kind, obj)).await?;
            }
            info!("Saved {} {} records", records.len(), kind);
            snapshot.insert(kind, records);
        }
        Ok(snapshot)
    }

    /// Drop owner references from every binding's secret so deleting the
    /// binding leaves the secret in place.
    pub async fn detach_secrets(&self) -> Result<()> {
        info!("Removing owner references from secrets");
        let bindings: Vec<ServiceBinding> = typed::list(self.store.as_ref(), &ListOptions::all()).await?;
        for binding in &bindings {
            let namespace = binding.namespace();
            let name = binding.secret_name();
            self.rewrite_secret(namespace.as_deref(), &name, |secret| {
                secret.metadata.owner_references = None;
            })
            .await?;
        }
        Ok(())
    }

    /// Point a binding's secret back at the (re-created) binding.
    async fn attach_secret(&self, binding: &ServiceBinding) -> Result<()> {
        let Some(owner) = binding.controller_owner_ref(&()) else {
            return Err(ControllerError::migration(format!(
                "binding {} has no uid after restore",
                binding.name_any()
            )));
        };
        let namespace = binding.namespace();
        self.rewrite_secret(namespace.as_deref(), &binding.secret_name(), move |secret| {
            secret.metadata.owner_references = Some(vec![owner.clone()]);
        })
        .await
    }

    async fn rewrite_secret<F>(&self, namespace: Option<&str>, name: &str, edit: F) -> Result<()>
    where
        F: Fn(&mut Secret),
    {
        let store = self.store.as_ref();
        retry_with_backoff_if(&self.retry, "rewrite secret", ControllerError::is_conflict, || async {
            let Some(mut secret) = typed::get::<Secret>(store, namespace, name).await? else {
                warn!("Secret {}/{} not found", namespace.unwrap_or_default(), name);
                return Ok(());
            };
            edit(&mut secret);
            typed::update(store, &secret).await.map(|_| ())
        })
        .await
    }

    /// Delete the snapshotted records, dependents first.
    pub async fn delete_records(&self, snapshot: &Snapshot) -> Result<()> {
        info!("Cleaning up catalog records");
        for kind in Kind::CATALOG.into_iter().rev() {
            for obj in snapshot.get(&kind).into_iter().flatten() {
                let namespace = obj.namespace();
                let name = obj.name_any();
                retry_with_backoff(&self.retry, "delete record", || async {
                    match self.store.delete(kind, namespace.as_deref(), &name).await {
                        Err(e) if e.is_not_found() => Ok(()),
                        other => other,
                    }
                })
                .await
                .map_err(|e| ControllerError::migration(format!("while deleting {} {}: {}", kind, name, e)))?;
            }
        }
        Ok(())
    }

    /// Re-create every record of a snapshot, brokers first.
    pub async fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        // Secrets must survive bindings that get deleted and re-created.
        self.detach_secrets().await?;

        let mut uids: HashMap<RecordKey, String> = HashMap::new();
        for kind in Kind::CATALOG {
            let records = snapshot.get(&kind).map(Vec::as_slice).unwrap_or_default();
            info!("Applying {} {} records", records.len(), kind);
            for original in records {
                let name = original.name_any();
                let restored = retry_with_backoff(&self.retry, "restore record", || {
                    self.restore_record(kind, original, &uids)
                })
                .await
                .map_err(|e| ControllerError::migration(format!("while restoring {} {}: {}", kind, name, e)))?;

                if let Some(uid) = restored.uid() {
                    uids.insert((kind.as_str().to_string(), restored.namespace(), name.clone()), uid);
                }
                if kind == Kind::ServiceBinding {
                    let binding: ServiceBinding = typed::from_dynamic(&restored)?;
                    retry_with_backoff(&self.retry, "attach secret", || self.attach_secret(&binding)).await?;
                }
            }
        }
        Ok(())
    }

    async fn restore_record(
        &self,
        kind: Kind,
        original: &DynamicObject,
        uids: &HashMap<RecordKey, String>,
    ) -> Result<DynamicObject> {
        let mut obj = original.clone();
        recalculate_printer_columns(kind, &mut obj)?;
        let status = take_field(&mut obj.data, "status");
        clear_server_fields(&mut obj);
        repair_owner_references(&mut obj, uids);

        let resolved_refs: Vec<(&str, Value)> = if kind == Kind::ServiceInstance {
            RESOLVED_REF_FIELDS
                .into_iter()
                .filter_map(|field| obj.data.get_mut("spec").and_then(|s| take_field(s, field)).map(|v| (field, v)))
                .collect()
        } else {
            Vec::new()
        };

        let mut current = self.create_fresh(kind, &obj).await?;

        if !resolved_refs.is_empty() {
            if let Some(spec) = current.data.get_mut("spec").and_then(Value::as_object_mut) {
                for (field, value) in resolved_refs {
                    spec.insert(field.to_string(), value);
                }
            }
            current = self.store.update(kind, &current).await?;
        }

        if let Some(mut status) = status {
            let observed = observed_generation(&status);
            let caught_up = observed.is_some() && observed == original.metadata.generation;
            if kind == Kind::ServiceInstance || caught_up {
                if let Some(map) = status.as_object_mut() {
                    let generation = current.metadata.generation.unwrap_or(1);
                    map.insert("observedGeneration".to_string(), generation.into());
                }
            }
            if let Some(data) = current.data.as_object_mut() {
                data.insert("status".to_string(), status);
            }
            current = self.store.update_status(kind, &current).await?;
        }
        debug!("Restored {} {}", kind, current.name_any());
        Ok(current)
    }

    /// Create a record; an existing one is released, deleted and replaced.
    async fn create_fresh(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject> {
        match self.store.create(kind, obj).await {
            Err(e) if e.is_already_exists() => {
                let namespace = obj.namespace();
                let name = obj.name_any();
                info!("{} {} already exists, deleting and re-creating", kind, name);
                if let Some(mut existing) = self.store.get(kind, namespace.as_deref(), &name).await? {
                    if !existing.finalizers().is_empty() {
                        existing.metadata.finalizers = None;
                        existing = self.store.update(kind, &existing).await?;
                    }
                    match self.store.delete(kind, namespace.as_deref(), &existing.name_any()).await {
                        Err(e) if e.is_not_found() => {}
                        other => other?,
                    }
                }
                self.store.create(kind, obj).await
            }
            other => other,
        }
    }
}

fn take_field(value: &mut Value, field: &str) -> Option<Value> {
    value.as_object_mut().and_then(|map| map.remove(field))
}

fn observed_generation(status: &Value) -> Option<i64> {
    status.get("observedGeneration").and_then(Value::as_i64)
}

/// Metadata the target store assigns itself.
fn clear_server_fields(obj: &mut DynamicObject) {
    let meta = &mut obj.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
}

/// Point owner references at the uids of re-created owners. References to
/// owners that were not restored are left alone.
fn repair_owner_references(obj: &mut DynamicObject, uids: &HashMap<RecordKey, String>) {
    let namespace = obj.metadata.namespace.clone();
    let Some(refs) = obj.metadata.owner_references.as_mut() else {
        return;
    };
    for owner in refs.iter_mut() {
        let scoped = (owner.kind.clone(), namespace.clone(), owner.name.clone());
        let cluster = (owner.kind.clone(), None, owner.name.clone());
        if let Some(uid) = uids.get(&scoped).or_else(|| uids.get(&cluster)) {
            owner.uid = uid.clone();
        }
    }
}

/// Recompute the status fields behind printer columns.
fn recalculate_printer_columns(kind: Kind, obj: &mut DynamicObject) -> Result<()> {
    if obj.data.get("status").is_none() {
        return Ok(());
    }
    match kind {
        Kind::ServiceInstance => retyped::<ServiceInstance>(obj, ServiceInstance::recalculate_printer_columns),
        Kind::ServiceBinding => retyped::<ServiceBinding>(obj, ServiceBinding::recalculate_printer_columns),
        Kind::ClusterServiceBroker => retyped::<ClusterServiceBroker>(obj, refresh_broker),
        Kind::ServiceBroker => retyped::<ServiceBroker>(obj, refresh_broker),
        _ => Ok(()),
    }
}

fn retyped<K: StoreKind>(obj: &mut DynamicObject, edit: impl FnOnce(&mut K)) -> Result<()> {
    let mut record: K = typed::from_dynamic(obj)?;
    edit(&mut record);
    let metadata = obj.metadata.clone();
    *obj = typed::to_dynamic(&record)?;
    obj.metadata = metadata;
    Ok(())
}

fn refresh_broker<B: BrokerResource>(broker: &mut B) {
    let status = broker.broker_status_mut();
    status.last_condition_state = last_condition_state(&status.conditions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::CATALOG_FINALIZER;
    use crate::store::MemoryStore;
    use cluster::MockClusterOps;
    use mockall::Sequence;
    use serde_json::json;
    use std::time::Duration;

    fn options(dir: &std::path::Path, apiserver: Option<&str>) -> MigrationOptions {
        MigrationOptions {
            storage_path: dir.to_path_buf(),
            namespace: "catalog".to_string(),
            controller_manager: "controller-manager".to_string(),
            apiserver: apiserver.map(str::to_string),
        }
    }

    fn quick() -> ScalePolicy {
        ScalePolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }

    fn scaling(cluster: &mut MockClusterOps) {
        cluster.expect_set_replicas().returning(|_, _, _| Ok(()));
        cluster.expect_replica_status().returning(|_, _| {
            Ok(ReplicaStatus {
                desired: 1,
                ready: 1,
                available: 1,
            })
        });
    }

    #[tokio::test]
    async fn test_backup_skipped_without_source_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_deployment_exists()
            .withf(|ns, name| ns == "catalog" && name == "apiserver")
            .times(1)
            .returning(|_, _| Ok(false));
        cluster.expect_create_blocker().never();
        cluster.expect_set_replicas().never();

        let migration = Migration::new(
            Arc::new(MemoryStore::new()),
            Arc::new(cluster),
            options(dir.path(), Some("apiserver")),
        );
        migration.run(MigrationAction::Backup).await.unwrap();
    }

    #[tokio::test]
    async fn test_deploy_blocker_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterOps::new();
        let mut seq = Sequence::new();
        cluster
            .expect_delete_validating_webhook()
            .withf(|name| name == BLOCKER_NAME)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        cluster
            .expect_create_blocker()
            .withf(|name| name == BLOCKER_NAME)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let migration = Migration::new(Arc::new(MemoryStore::new()), Arc::new(cluster), options(dir.path(), None));
        migration.run(MigrationAction::DeployBlocker).await.unwrap();
    }

    #[tokio::test]
    async fn test_undeploy_blocker_tolerates_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_delete_validating_webhook()
            .returning(|_| Err(ControllerError::migration("webhook API unavailable")));

        let migration = Migration::new(Arc::new(MemoryStore::new()), Arc::new(cluster), options(dir.path(), None));
        migration.run(MigrationAction::UndeployBlocker).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_backup_still_removes_blocker() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterOps::new();
        cluster.expect_create_blocker().times(1).returning(|_| Ok(()));
        // Before create, after the failure.
        cluster
            .expect_delete_validating_webhook()
            .times(2)
            .returning(|_| Ok(()));
        cluster
            .expect_set_replicas()
            .returning(|_, _, _| Err(ControllerError::migration("deployment not found")));

        let migration = Migration::new(Arc::new(MemoryStore::new()), Arc::new(cluster), options(dir.path(), None))
            .with_retry(RetryConfig::none());
        assert!(migration.run(MigrationAction::Backup).await.is_err());
    }

    #[tokio::test]
    async fn test_backup_empties_source_and_keeps_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let binding: ServiceBinding = serde_json::from_value(json!({
            "apiVersion": "servicecatalog.k8s.io/v1beta1",
            "kind": "ServiceBinding",
            "metadata": {"name": "b1", "namespace": "default", "finalizers": [CATALOG_FINALIZER]},
            "spec": {"instanceRef": {"name": "i1"}, "secretName": "creds-b1"}
        }))
        .unwrap();
        let binding = typed::create(store.as_ref(), &binding).await.unwrap();
        let secret: Secret = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "creds-b1", "namespace": "default"},
            "data": {"username": "dQ=="}
        }))
        .unwrap();
        let mut secret = secret;
        secret.metadata.owner_references = binding.controller_owner_ref(&()).map(|r| vec![r]);
        typed::create(store.as_ref(), &secret).await.unwrap();

        let mut cluster = MockClusterOps::new();
        scaling(&mut cluster);
        cluster.expect_create_blocker().returning(|_| Ok(()));
        cluster.expect_delete_validating_webhook().returning(|_| Ok(()));

        let migration = Migration::new(store.clone(), Arc::new(cluster), options(dir.path(), None))
            .with_policy(quick());
        migration.run(MigrationAction::Backup).await.unwrap();

        assert_eq!(store.count(Kind::ServiceBinding), 0);
        let kept: Option<Secret> = typed::get(store.as_ref(), Some("default"), "creds-b1").await.unwrap();
        assert!(kept.unwrap().metadata.owner_references.is_none());
        let snapshot = Archive::new(dir.path()).load().await.unwrap();
        assert_eq!(snapshot[&Kind::ServiceBinding].len(), 1);
    }

    #[test]
    fn test_owner_references_follow_new_uids() {
        let mut class = DynamicObject::new("s1-id", &Kind::ClusterServiceClass.api_resource());
        class.metadata.owner_references = Some(vec![
            serde_json::from_value(json!({
                "apiVersion": "servicecatalog.k8s.io/v1beta1",
                "kind": "ClusterServiceBroker",
                "name": "ups",
                "uid": "old-uid",
                "controller": true
            }))
            .unwrap(),
        ]);
        let mut uids = HashMap::new();
        uids.insert(("ClusterServiceBroker".to_string(), None, "ups".to_string()), "new-uid".to_string());

        repair_owner_references(&mut class, &uids);
        assert_eq!(class.owner_references()[0].uid, "new-uid");
    }

    #[test]
    fn test_printer_columns_recomputed_from_conditions() {
        let mut instance = DynamicObject::new("i1", &Kind::ServiceInstance.api_resource()).within("default");
        instance.data = json!({
            "spec": {
                "clusterServiceClassExternalName": "s1",
                "clusterServicePlanExternalName": "p1-free"
            },
            "status": {
                "conditions": [{"type": "Ready", "status": "True", "reason": "ProvisionedSuccessfully", "message": ""}]
            }
        });
        recalculate_printer_columns(Kind::ServiceInstance, &mut instance).unwrap();
        assert_eq!(instance.data["status"]["lastConditionState"], "Ready");
        assert_eq!(instance.name_any(), "i1");
    }
}

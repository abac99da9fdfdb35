//! Record store abstraction
//!
//! Reconcilers and the migration engine talk to a [`Store`], never to a
//! backend directly. Records cross the boundary as `DynamicObject`; the
//! [`typed`] helpers convert to and from the generated record types.
//!
//! Backends:
//! - [`MemoryStore`]: in-process, full API-server write semantics
//! - [`KubeStore`]: custom resources on a Kubernetes API server

pub mod kube_store;
pub mod memory;
pub mod typed;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;

use crate::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceBroker,
    ServiceClass, ServiceInstance, ServicePlan,
};
use crate::error::Result;

pub use kube_store::{install_crds, KubeStore};
pub use memory::MemoryStore;
pub use typed::StoreKind;

/// Every kind of record the controller reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    ClusterServiceBroker,
    ServiceBroker,
    ClusterServiceClass,
    ServiceClass,
    ClusterServicePlan,
    ServicePlan,
    ServiceInstance,
    ServiceBinding,
    Secret,
}

impl Kind {
    /// Catalog kinds in forward dependency order (create order).
    pub const CATALOG: [Kind; 8] = [
        Kind::ClusterServiceBroker,
        Kind::ServiceBroker,
        Kind::ClusterServiceClass,
        Kind::ServiceClass,
        Kind::ClusterServicePlan,
        Kind::ServicePlan,
        Kind::ServiceInstance,
        Kind::ServiceBinding,
    ];

    pub fn api_resource(self) -> ApiResource {
        match self {
            Kind::ClusterServiceBroker => ApiResource::erase::<ClusterServiceBroker>(&()),
            Kind::ServiceBroker => ApiResource::erase::<ServiceBroker>(&()),
            Kind::ClusterServiceClass => ApiResource::erase::<ClusterServiceClass>(&()),
            Kind::ServiceClass => ApiResource::erase::<ServiceClass>(&()),
            Kind::ClusterServicePlan => ApiResource::erase::<ClusterServicePlan>(&()),
            Kind::ServicePlan => ApiResource::erase::<ServicePlan>(&()),
            Kind::ServiceInstance => ApiResource::erase::<ServiceInstance>(&()),
            Kind::ServiceBinding => ApiResource::erase::<ServiceBinding>(&()),
            Kind::Secret => ApiResource::erase::<Secret>(&()),
        }
    }

    pub fn is_namespaced(self) -> bool {
        !matches!(
            self,
            Kind::ClusterServiceBroker | Kind::ClusterServiceClass | Kind::ClusterServicePlan
        )
    }

    /// Whether the kind has a status subresource.
    pub fn has_status(self) -> bool {
        self != Kind::Secret
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::ClusterServiceBroker => "ClusterServiceBroker",
            Kind::ServiceBroker => "ServiceBroker",
            Kind::ClusterServiceClass => "ClusterServiceClass",
            Kind::ServiceClass => "ServiceClass",
            Kind::ClusterServicePlan => "ClusterServicePlan",
            Kind::ServicePlan => "ServicePlan",
            Kind::ServiceInstance => "ServiceInstance",
            Kind::ServiceBinding => "ServiceBinding",
            Kind::Secret => "Secret",
        }
    }

    /// Backup filename prefix.
    pub fn file_prefix(self) -> &'static str {
        match self {
            Kind::ClusterServiceBroker => "clusterservicebroker",
            Kind::ServiceBroker => "servicebroker",
            Kind::ClusterServiceClass => "clusterserviceclass",
            Kind::ServiceClass => "serviceclass",
            Kind::ClusterServicePlan => "clusterserviceplan",
            Kind::ServicePlan => "serviceplan",
            Kind::ServiceInstance => "serviceinstance",
            Kind::ServiceBinding => "servicebinding",
            Kind::Secret => "secret",
        }
    }

    /// Inverse of [`Kind::file_prefix`] for catalog kinds. `servicdirplan`
    /// is accepted for service plans.
    pub fn from_file_prefix(prefix: &str) -> Option<Kind> {
        match prefix {
            "servicdirplan" => Some(Kind::ServicePlan),
            _ => Kind::CATALOG.into_iter().find(|k| k.file_prefix() == prefix),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// List filter. Field selectors are dotted JSON paths such as
/// `spec.instanceRef.name`, compared against the value's string form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

impl ListOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn in_scope(namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(path.into(), value.into());
        self
    }

    /// `k=v,k2=v2` form for API-server label selectors.
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.metadata.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        let labels = obj.labels();
        if !self.labels.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return false;
        }
        self.fields
            .iter()
            .all(|(path, expected)| field_value(obj, path).as_deref() == Some(expected.as_str()))
    }
}

/// Resolve a dotted path against a record.
pub fn field_value(obj: &DynamicObject, path: &str) -> Option<String> {
    match path {
        "metadata.name" => return obj.metadata.name.clone(),
        "metadata.namespace" => return obj.metadata.namespace.clone(),
        _ => {}
    }
    let mut current = &obj.data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Change notification from a watch
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
}

impl WatchEvent {
    pub fn object(&self) -> &DynamicObject {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Persistent store of catalog records.
///
/// Writes follow API-server semantics: `update` ignores status and bumps
/// generation only on spec change; `update_status` touches only status; a
/// stale `resourceVersion` yields a conflict; `delete` of a record with
/// finalizers only sets its deletion timestamp.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list(&self, kind: Kind, options: &ListOptions) -> Result<Vec<DynamicObject>>;

    async fn get(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>>;

    async fn create(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update_status(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Fails with `NotFound` when the record does not exist.
    async fn delete(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Current records as `Added`, followed by live changes.
    async fn watch(&self, kind: Kind) -> Result<BoxStream<'static, Result<WatchEvent>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(ns: &str, name: &str, data: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &Kind::ServiceBinding.api_resource()).data(data);
        obj.metadata.namespace = Some(ns.to_string());
        obj
    }

    #[test]
    fn test_kind_prefixes_roundtrip() {
        for kind in Kind::CATALOG {
            assert_eq!(Kind::from_file_prefix(kind.file_prefix()), Some(kind));
        }
        assert_eq!(Kind::from_file_prefix("servicdirplan"), Some(Kind::ServicePlan));
        assert_eq!(Kind::from_file_prefix("secret"), None);
    }

    #[test]
    fn test_kind_scope() {
        assert!(!Kind::ClusterServiceBroker.is_namespaced());
        assert!(Kind::ServiceBroker.is_namespaced());
        assert!(Kind::Secret.is_namespaced());
        assert_eq!(Kind::ServiceInstance.api_resource().plural, "serviceinstances");
        assert_eq!(Kind::Secret.api_resource().group, "");
    }

    #[test]
    fn test_list_options_matching() {
        let mut obj = object("team-a", "b1", json!({"spec": {"instanceRef": {"name": "i1"}}}));
        obj.metadata.labels = Some([("app".to_string(), "db".to_string())].into());

        assert!(ListOptions::in_namespace("team-a").matches(&obj));
        assert!(!ListOptions::in_namespace("team-b").matches(&obj));
        assert!(ListOptions::all().label("app", "db").matches(&obj));
        assert!(!ListOptions::all().label("app", "web").matches(&obj));
        assert!(ListOptions::all().field("spec.instanceRef.name", "i1").matches(&obj));
        assert!(!ListOptions::all().field("spec.instanceRef.name", "i2").matches(&obj));
        assert!(ListOptions::all().field("metadata.name", "b1").matches(&obj));
    }

    #[test]
    fn test_label_selector_format() {
        let opts = ListOptions::all().label("b", "2").label("a", "1");
        assert_eq!(opts.label_selector().as_deref(), Some("a=1,b=2"));
        assert_eq!(ListOptions::all().label_selector(), None);
    }
}

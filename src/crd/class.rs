//! ClusterServiceClass and ServiceClass Custom Resource Definitions
//!
//! Classes are the controller-side projection of a broker catalog's services.
//! They are written only by the catalog reconciler.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{opaque_object_schema, Condition};

/// Label carrying the owning broker's name on classes and plans.
pub const LABEL_BROKER_NAME: &str = "servicecatalog.k8s.io/broker";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServiceClass",
    status = "CatalogEntryStatus",
    shortname = "csc",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.clusterServiceBrokerName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceClassSpec {
    #[serde(flatten)]
    pub common: CommonServiceClassSpec,

    pub cluster_service_broker_name: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceClass",
    namespaced,
    status = "CatalogEntryStatus",
    shortname = "sc",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.serviceBrokerName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    #[serde(flatten)]
    pub common: CommonServiceClassSpec,

    pub service_broker_name: String,
}

/// Fields projected from a catalog service
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommonServiceClassSpec {
    /// Service name in the broker catalog
    pub external_name: String,

    /// Service id in the broker catalog
    #[serde(rename = "externalID")]
    pub external_id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub bindable: bool,

    #[serde(default)]
    pub binding_retrievable: bool,

    #[serde(default)]
    pub plan_updatable: bool,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(default)]
    #[schemars(schema_with = "opaque_object_schema")]
    pub external_metadata: Option<serde_json::Value>,
}

/// Status of a class or plan
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntryStatus {
    /// Set when the entry disappeared from the broker's catalog
    #[serde(default)]
    pub removed_from_broker_catalog: bool,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Operations the catalog reconciler needs from either class scope.
pub trait ClassResource: Sized {
    fn build(name: &str, namespace: Option<&str>, broker: &str, spec: CommonServiceClassSpec) -> Self;

    fn class_spec(&self) -> &CommonServiceClassSpec;

    fn class_spec_mut(&mut self) -> &mut CommonServiceClassSpec;

    fn broker_name(&self) -> &str;

    fn entry_status(&self) -> Option<&CatalogEntryStatus>;

    fn entry_status_mut(&mut self) -> &mut CatalogEntryStatus;

    fn is_removed_from_catalog(&self) -> bool {
        self.entry_status().is_some_and(|s| s.removed_from_broker_catalog)
    }
}

impl ClassResource for ClusterServiceClass {
    fn build(name: &str, _namespace: Option<&str>, broker: &str, spec: CommonServiceClassSpec) -> Self {
        ClusterServiceClass::new(
            name,
            ClusterServiceClassSpec {
                common: spec,
                cluster_service_broker_name: broker.to_string(),
            },
        )
    }

    fn class_spec(&self) -> &CommonServiceClassSpec {
        &self.spec.common
    }

    fn class_spec_mut(&mut self) -> &mut CommonServiceClassSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.cluster_service_broker_name
    }

    fn entry_status(&self) -> Option<&CatalogEntryStatus> {
        self.status.as_ref()
    }

    fn entry_status_mut(&mut self) -> &mut CatalogEntryStatus {
        self.status.get_or_insert_with(CatalogEntryStatus::default)
    }
}

impl ClassResource for ServiceClass {
    fn build(name: &str, namespace: Option<&str>, broker: &str, spec: CommonServiceClassSpec) -> Self {
        let mut class = ServiceClass::new(
            name,
            ServiceClassSpec {
                common: spec,
                service_broker_name: broker.to_string(),
            },
        );
        class.metadata.namespace = namespace.map(str::to_string);
        class
    }

    fn class_spec(&self) -> &CommonServiceClassSpec {
        &self.spec.common
    }

    fn class_spec_mut(&mut self) -> &mut CommonServiceClassSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.service_broker_name
    }

    fn entry_status(&self) -> Option<&CatalogEntryStatus> {
        self.status.as_ref()
    }

    fn entry_status_mut(&mut self) -> &mut CatalogEntryStatus {
        self.status.get_or_insert_with(CatalogEntryStatus::default)
    }
}

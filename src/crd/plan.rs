//! ClusterServicePlan and ServicePlan Custom Resource Definitions

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::class::CatalogEntryStatus;
use super::common::{opaque_object_schema, ClusterObjectReference, LocalObjectReference};

/// Label carrying the owning class's name on plans.
pub const LABEL_CLASS_NAME: &str = "servicecatalog.k8s.io/class";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServicePlan",
    status = "CatalogEntryStatus",
    shortname = "csp",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.clusterServiceBrokerName"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.clusterServiceClassRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServicePlanSpec {
    #[serde(flatten)]
    pub common: CommonServicePlanSpec,

    pub cluster_service_broker_name: String,

    pub cluster_service_class_ref: ClusterObjectReference,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServicePlan",
    namespaced,
    status = "CatalogEntryStatus",
    shortname = "sp",
    printcolumn = r#"{"name":"External-Name","type":"string","jsonPath":".spec.externalName"}"#,
    printcolumn = r#"{"name":"Broker","type":"string","jsonPath":".spec.serviceBrokerName"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.serviceClassRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanSpec {
    #[serde(flatten)]
    pub common: CommonServicePlanSpec,

    pub service_broker_name: String,

    pub service_class_ref: LocalObjectReference,
}

/// Fields projected from a catalog plan
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommonServicePlanSpec {
    pub external_name: String,

    #[serde(rename = "externalID")]
    pub external_id: String,

    #[serde(default)]
    pub description: String,

    /// Overrides the class's bindable flag when set
    #[serde(default)]
    pub bindable: Option<bool>,

    #[serde(default)]
    pub free: bool,

    #[serde(default)]
    #[schemars(schema_with = "opaque_object_schema")]
    pub external_metadata: Option<serde_json::Value>,

    #[serde(default)]
    #[schemars(schema_with = "opaque_object_schema")]
    pub instance_create_parameter_schema: Option<serde_json::Value>,

    #[serde(default)]
    #[schemars(schema_with = "opaque_object_schema")]
    pub instance_update_parameter_schema: Option<serde_json::Value>,

    #[serde(default)]
    #[schemars(schema_with = "opaque_object_schema")]
    pub service_binding_create_parameter_schema: Option<serde_json::Value>,
}

/// Operations the catalog reconciler needs from either plan scope.
pub trait PlanResource: Sized {
    fn build(
        name: &str,
        namespace: Option<&str>,
        broker: &str,
        class_name: &str,
        spec: CommonServicePlanSpec,
    ) -> Self;

    fn plan_spec(&self) -> &CommonServicePlanSpec;

    fn plan_spec_mut(&mut self) -> &mut CommonServicePlanSpec;

    fn broker_name(&self) -> &str;

    fn class_name(&self) -> &str;

    fn set_class_name(&mut self, class_name: &str);

    fn entry_status(&self) -> Option<&CatalogEntryStatus>;

    fn entry_status_mut(&mut self) -> &mut CatalogEntryStatus;

    fn is_removed_from_catalog(&self) -> bool {
        self.entry_status().is_some_and(|s| s.removed_from_broker_catalog)
    }
}

impl PlanResource for ClusterServicePlan {
    fn build(
        name: &str,
        _namespace: Option<&str>,
        broker: &str,
        class_name: &str,
        spec: CommonServicePlanSpec,
    ) -> Self {
        ClusterServicePlan::new(
            name,
            ClusterServicePlanSpec {
                common: spec,
                cluster_service_broker_name: broker.to_string(),
                cluster_service_class_ref: ClusterObjectReference {
                    name: class_name.to_string(),
                },
            },
        )
    }

    fn plan_spec(&self) -> &CommonServicePlanSpec {
        &self.spec.common
    }

    fn plan_spec_mut(&mut self) -> &mut CommonServicePlanSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.cluster_service_broker_name
    }

    fn class_name(&self) -> &str {
        &self.spec.cluster_service_class_ref.name
    }

    fn set_class_name(&mut self, class_name: &str) {
        self.spec.cluster_service_class_ref.name = class_name.to_string();
    }

    fn entry_status(&self) -> Option<&CatalogEntryStatus> {
        self.status.as_ref()
    }

    fn entry_status_mut(&mut self) -> &mut CatalogEntryStatus {
        self.status.get_or_insert_with(CatalogEntryStatus::default)
    }
}

impl PlanResource for ServicePlan {
    fn build(
        name: &str,
        namespace: Option<&str>,
        broker: &str,
        class_name: &str,
        spec: CommonServicePlanSpec,
    ) -> Self {
        let mut plan = ServicePlan::new(
            name,
            ServicePlanSpec {
                common: spec,
                service_broker_name: broker.to_string(),
                service_class_ref: LocalObjectReference {
                    name: class_name.to_string(),
                },
            },
        );
        plan.metadata.namespace = namespace.map(str::to_string);
        plan
    }

    fn plan_spec(&self) -> &CommonServicePlanSpec {
        &self.spec.common
    }

    fn plan_spec_mut(&mut self) -> &mut CommonServicePlanSpec {
        &mut self.spec.common
    }

    fn broker_name(&self) -> &str {
        &self.spec.service_broker_name
    }

    fn class_name(&self) -> &str {
        &self.spec.service_class_ref.name
    }

    fn set_class_name(&mut self, class_name: &str) {
        self.spec.service_class_ref.name = class_name.to_string();
    }

    fn entry_status(&self) -> Option<&CatalogEntryStatus> {
        self.status.as_ref()
    }

    fn entry_status_mut(&mut self) -> &mut CatalogEntryStatus {
        self.status.get_or_insert_with(CatalogEntryStatus::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_spec_parsing() {
        let json = r#"{
            "externalName": "p1-free",
            "externalID": "p1",
            "free": true,
            "clusterServiceBrokerName": "ups",
            "clusterServiceClassRef": {"name": "s1"},
            "instanceCreateParameterSchema": {"type": "object"}
        }"#;
        let spec: ClusterServicePlanSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.common.external_name, "p1-free");
        assert!(spec.common.free);
        assert_eq!(spec.common.bindable, None);
        assert_eq!(spec.cluster_service_class_ref.name, "s1");
        assert!(spec.common.instance_create_parameter_schema.is_some());
    }

    #[test]
    fn test_build_and_relink_plan() {
        let mut plan = ServicePlan::build("p1", Some("team-a"), "ups", "s1", CommonServicePlanSpec::default());
        assert_eq!(plan.class_name(), "s1");
        plan.set_class_name("s2");
        assert_eq!(plan.spec.service_class_ref.name, "s2");
        assert_eq!(plan.metadata.namespace.as_deref(), Some("team-a"));
    }
}

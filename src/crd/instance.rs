//! ServiceInstance Custom Resource Definition
//!
//! An instance is a user request for a provisioned service from a (class, plan)
//! pair. Users identify the class and plan by external name, external id or
//! internal name; the controller resolves that into the `*Ref` fields.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    ClusterObjectReference, Condition, LastOperation, LocalObjectReference, Parameters,
    ParametersFromSource,
};
use crate::conditions::last_condition_state;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceInstance",
    namespaced,
    status = "ServiceInstanceStatus",
    shortname = "inst",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".status.userSpecifiedClassName"}"#,
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".status.userSpecifiedPlanName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// User-specified class and plan
    #[serde(flatten)]
    pub plan_reference: PlanReference,

    /// Resolved cluster-scoped class (controller-owned)
    #[serde(default)]
    pub cluster_service_class_ref: Option<ClusterObjectReference>,

    /// Resolved cluster-scoped plan (controller-owned)
    #[serde(default)]
    pub cluster_service_plan_ref: Option<ClusterObjectReference>,

    /// Resolved namespaced class (controller-owned)
    #[serde(default)]
    pub service_class_ref: Option<LocalObjectReference>,

    /// Resolved namespaced plan (controller-owned)
    #[serde(default)]
    pub service_plan_ref: Option<LocalObjectReference>,

    #[serde(default)]
    pub parameters: Option<Parameters>,

    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Instance id sent to the broker; defaulted by the controller
    #[serde(default, rename = "externalID")]
    pub external_id: String,

    /// Incrementing this forces an update call to the broker
    #[serde(default)]
    pub update_requests: i64,
}

/// How the user names a class and a plan. Exactly one scope (cluster or
/// namespaced) is used, and within it one identification method.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlanReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "clusterServiceClassExternalID")]
    pub cluster_service_class_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "clusterServicePlanExternalID")]
    pub cluster_service_plan_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_service_plan_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "serviceClassExternalID")]
    pub service_class_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "servicePlanExternalID")]
    pub service_plan_external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_name: Option<String>,
}

/// One way of identifying a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySelector {
    ExternalName(String),
    ExternalId(String),
    Name(String),
}

impl EntrySelector {
    fn pick(external_name: &Option<String>, external_id: &Option<String>, name: &Option<String>) -> Option<Self> {
        if let Some(v) = external_name {
            Some(Self::ExternalName(v.clone()))
        } else if let Some(v) = external_id {
            Some(Self::ExternalId(v.clone()))
        } else {
            name.as_ref().map(|v| Self::Name(v.clone()))
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::ExternalName(v) | Self::ExternalId(v) | Self::Name(v) => v,
        }
    }
}

impl PlanReference {
    pub fn is_cluster_scoped(&self) -> bool {
        self.cluster_service_class_external_name.is_some()
            || self.cluster_service_class_external_id.is_some()
            || self.cluster_service_class_name.is_some()
            || self.cluster_service_plan_external_name.is_some()
            || self.cluster_service_plan_external_id.is_some()
            || self.cluster_service_plan_name.is_some()
    }

    pub fn is_namespaced(&self) -> bool {
        self.service_class_external_name.is_some()
            || self.service_class_external_id.is_some()
            || self.service_class_name.is_some()
            || self.service_plan_external_name.is_some()
            || self.service_plan_external_id.is_some()
            || self.service_plan_name.is_some()
    }

    pub fn class_selector(&self) -> Option<EntrySelector> {
        if self.is_cluster_scoped() {
            EntrySelector::pick(
                &self.cluster_service_class_external_name,
                &self.cluster_service_class_external_id,
                &self.cluster_service_class_name,
            )
        } else {
            EntrySelector::pick(
                &self.service_class_external_name,
                &self.service_class_external_id,
                &self.service_class_name,
            )
        }
    }

    pub fn plan_selector(&self) -> Option<EntrySelector> {
        if self.is_cluster_scoped() {
            EntrySelector::pick(
                &self.cluster_service_plan_external_name,
                &self.cluster_service_plan_external_id,
                &self.cluster_service_plan_name,
            )
        } else {
            EntrySelector::pick(
                &self.service_plan_external_name,
                &self.service_plan_external_id,
                &self.service_plan_name,
            )
        }
    }

    /// Printer-column form, e.g. `ClusterServiceClass/mysql`.
    pub fn class_display_name(&self) -> String {
        let kind = if self.is_cluster_scoped() { "ClusterServiceClass" } else { "ServiceClass" };
        match self.class_selector() {
            Some(sel) => format!("{}/{}", kind, sel.value()),
            None => String::new(),
        }
    }

    pub fn plan_display_name(&self) -> String {
        let kind = if self.is_cluster_scoped() { "ClusterServicePlan" } else { "ServicePlan" };
        match self.plan_selector() {
            Some(sel) => format!("{}/{}", kind, sel.value()),
            None => String::new(),
        }
    }
}

/// Whether the broker holds a provisioned instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ProvisionStatus {
    #[default]
    NotProvisioned,
    Provisioned,
}

/// Whether a deprovision call is still owed to the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum DeprovisionStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

/// What was last sent to the broker successfully
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProperties {
    /// Instance id the broker knows this instance by
    #[serde(default, rename = "externalID")]
    pub external_id: String,
    #[serde(rename = "serviceClassExternalID")]
    pub class_external_id: String,
    #[serde(default)]
    pub class_external_name: String,
    #[serde(rename = "servicePlanExternalID")]
    pub plan_external_id: String,
    #[serde(default)]
    pub plan_external_name: String,
    /// SHA-256 of the canonical JSON parameters
    #[serde(default)]
    pub parameters_checksum: Option<String>,
    #[serde(default)]
    pub update_requests: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// True while an asynchronous broker operation is outstanding
    #[serde(default)]
    pub async_op_in_progress: bool,

    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    #[serde(default)]
    pub last_operation: Option<LastOperation>,

    /// When the current operation first started (RFC 3339)
    #[serde(default)]
    pub operation_start_time: Option<String>,

    #[serde(default, rename = "dashboardURL")]
    pub dashboard_url: Option<String>,

    #[serde(default)]
    pub provision_status: ProvisionStatus,

    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,

    #[serde(default)]
    pub observed_generation: i64,

    /// Last properties the broker accepted
    #[serde(default)]
    pub external_properties: Option<InstanceProperties>,

    /// Properties of the request currently outstanding at the broker
    #[serde(default)]
    pub in_progress_properties: Option<InstanceProperties>,

    #[serde(default)]
    pub user_specified_class_name: String,

    #[serde(default)]
    pub user_specified_plan_name: String,

    #[serde(default)]
    pub last_condition_state: String,
}

impl ServiceInstance {
    /// Recompute the status fields that back printer columns.
    pub fn recalculate_printer_columns(&mut self) {
        let class = self.spec.plan_reference.class_display_name();
        let plan = self.spec.plan_reference.plan_display_name();
        let status = self.status.get_or_insert_with(ServiceInstanceStatus::default);
        status.user_specified_class_name = class;
        status.user_specified_plan_name = plan;
        status.last_condition_state = last_condition_state(&status.conditions);
    }

    /// Clear the controller-owned resolved references.
    pub fn clear_resolved_refs(&mut self) {
        self.spec.cluster_service_class_ref = None;
        self.spec.cluster_service_plan_ref = None;
        self.spec.service_class_ref = None;
        self.spec.service_plan_ref = None;
    }

    pub fn has_resolved_refs(&self) -> bool {
        (self.spec.cluster_service_class_ref.is_some() && self.spec.cluster_service_plan_ref.is_some())
            || (self.spec.service_class_ref.is_some() && self.spec.service_plan_ref.is_some())
    }
}

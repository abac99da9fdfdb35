//! ServiceBinding Custom Resource Definition
//!
//! A binding asks the broker for credentials to an instance and has them
//! written into a Secret in the binding's namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{
    Condition, LastOperation, LocalObjectReference, Parameters, ParametersFromSource,
    SecretReference,
};
use crate::conditions::last_condition_state;

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBinding",
    namespaced,
    status = "ServiceBindingStatus",
    shortname = "sbnd",
    printcolumn = r#"{"name":"Service-Instance","type":"string","jsonPath":".spec.instanceRef.name"}"#,
    printcolumn = r#"{"name":"Secret-Name","type":"string","jsonPath":".spec.secretName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Instance in the same namespace
    pub instance_ref: LocalObjectReference,

    #[serde(default)]
    pub parameters: Option<Parameters>,

    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,

    /// Secret to write credentials into; defaults to the binding's name
    #[serde(default)]
    pub secret_name: Option<String>,

    /// When set, the whole credential object is stored as JSON under this key
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Transformations applied to the credentials before they are written
    #[serde(default)]
    pub secret_transforms: Vec<SecretTransform>,

    /// Binding id sent to the broker; defaulted by the controller
    #[serde(default, rename = "externalID")]
    pub external_id: String,

    #[serde(default)]
    pub update_requests: i64,
}

/// A single credential transformation. Exactly one field is set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretTransform {
    #[serde(default)]
    pub rename_key: Option<RenameKeyTransform>,
    #[serde(default)]
    pub add_key: Option<AddKeyTransform>,
    #[serde(default)]
    pub add_keys_from: Option<AddKeysFromTransform>,
    #[serde(default)]
    pub remove_key: Option<RemoveKeyTransform>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RenameKeyTransform {
    pub from: String,
    pub to: String,
}

/// Adds a key. `value` is base64-encoded bytes; `stringValue` wins when both are set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyTransform {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub string_value: Option<String>,
}

/// Merges every key of another Secret
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddKeysFromTransform {
    pub secret_ref: SecretReference,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RemoveKeyTransform {
    pub key: String,
}

/// Whether an unbind call is still owed to the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum UnbindStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BindingProperties {
    #[serde(default)]
    pub parameters_checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub async_op_in_progress: bool,

    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,

    #[serde(default)]
    pub last_operation: Option<LastOperation>,

    #[serde(default)]
    pub operation_start_time: Option<String>,

    #[serde(default)]
    pub unbind_status: UnbindStatus,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub external_properties: Option<BindingProperties>,

    #[serde(default)]
    pub last_condition_state: String,
}

impl ServiceBinding {
    /// Name of the Secret this binding owns.
    pub fn secret_name(&self) -> String {
        match &self.spec.secret_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn recalculate_printer_columns(&mut self) {
        let status = self.status.get_or_insert_with(ServiceBindingStatus::default);
        status.last_condition_state = last_condition_state(&status.conditions);
    }
}

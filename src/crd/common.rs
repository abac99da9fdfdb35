//! Types shared by several catalog records

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Metadata, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of every catalog record.
pub const GROUP: &str = "servicecatalog.k8s.io";
/// API version of every catalog record.
pub const VERSION: &str = "v1beta1";

/// Status condition (Kubernetes-standard shape)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Ready, Failed, OrphanMitigation, RemovedFromBrokerCatalog)
    pub r#type: String,
    /// Status (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Reference to a cluster-scoped record by name
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct ClusterObjectReference {
    pub name: String,
}

/// Reference to a record in the same namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Reference to a Secret. The namespace is only honored for cluster-scoped owners.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct SecretReference {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
}

/// Reference to a single key of a Secret in the record's namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Source of parameters to merge into a request
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// Secret key holding a JSON object of parameters
    #[serde(default)]
    pub secret_key_ref: Option<SecretKeyReference>,
}

/// Opaque user parameters. The controller never inspects them; the broker
/// client checks that they form a JSON object when building a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Parameters(pub serde_json::Value);

impl JsonSchema for Parameters {
    fn schema_name() -> String {
        "Parameters".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        let mut schema = match opaque_object_schema(gen) {
            Schema::Object(obj) => obj,
            other => return other,
        };
        schema.metadata = Some(Box::new(Metadata {
            description: Some("Opaque parameters passed to the broker".to_string()),
            ..Default::default()
        }));
        Schema::Object(schema)
    }
}

/// Schema for free-form JSON objects (broker metadata, parameter schemas).
pub fn opaque_object_schema(_gen: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(obj)
}

/// Broker operation recorded in status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum OperationKind {
    Provision,
    Update,
    Deprovision,
    Bind,
    Unbind,
}

/// State of the recorded operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed,
}

/// The one broker operation that is current for a record. When `state` is
/// `InProgress` and the owning status has `asyncOpInProgress`, `operationKey`
/// is the broker's async key (possibly empty).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    pub operation: OperationKind,
    pub state: OperationState,
    #[serde(default)]
    pub operation_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl LastOperation {
    pub fn in_progress(operation: OperationKind) -> Self {
        Self {
            operation,
            state: OperationState::InProgress,
            operation_key: None,
            description: None,
        }
    }

    pub fn is_in_progress(&self, operation: OperationKind) -> bool {
        self.operation == operation && self.state == OperationState::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_are_opaque() {
        let json = r#"{"size":"large","nested":{"a":[1,2,3]}}"#;
        let params: Parameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.0["nested"]["a"][2], 3);
        assert_eq!(serde_json::to_string(&params).unwrap(), json);
    }

    #[test]
    fn test_opaque_schema_preserves_unknown_fields() {
        let mut gen = SchemaGenerator::default();
        let schema = serde_json::to_value(Parameters::json_schema(&mut gen)).unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["x-kubernetes-preserve-unknown-fields"], true);
    }

    #[test]
    fn test_last_operation_roundtrip_camel_case() {
        let op = LastOperation {
            operation: OperationKind::Provision,
            state: OperationState::InProgress,
            operation_key: Some("op-42".to_string()),
            description: None,
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["operationKey"], "op-42");
        assert_eq!(value["state"], "InProgress");
        assert!(op.is_in_progress(OperationKind::Provision));
        assert!(!op.is_in_progress(OperationKind::Deprovision));
    }
}

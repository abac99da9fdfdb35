//! OSB v2 wire types
//!
//! Request structs carry the path and query values as `#[serde(skip)]`
//! fields so the same struct describes the whole call; only the body fields
//! are serialized.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `GET /v2/catalog` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogResponse {
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub plan_updateable: Option<bool>,
    #[serde(default)]
    pub bindings_retrievable: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub plans: Vec<Plan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub free: Option<bool>,
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub schemas: Option<Schemas>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Schemas {
    #[serde(default)]
    pub service_instance: Option<ServiceInstanceSchema>,
    #[serde(default)]
    pub service_binding: Option<ServiceBindingSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceInstanceSchema {
    #[serde(default)]
    pub create: Option<InputParametersSchema>,
    #[serde(default)]
    pub update: Option<InputParametersSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceBindingSchema {
    #[serde(default)]
    pub create: Option<InputParametersSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InputParametersSchema {
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// OSB `context` object sent with provision and bind requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformContext {
    pub platform: String,
    pub namespace: String,
    pub clusterid: String,
}

impl PlatformContext {
    pub fn kubernetes(namespace: &str, cluster_id: &str) -> Self {
        Self {
            platform: "kubernetes".to_string(),
            namespace: namespace.to_string(),
            clusterid: cluster_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProvisionRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<PlatformContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProvisionResponse {
    pub dashboard_url: Option<String>,
    /// Set when the broker answered 202; may be empty
    pub operation_key: Option<String>,
}

impl ProvisionResponse {
    pub fn is_async(&self) -> bool {
        self.operation_key.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PreviousValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UpdateInstanceRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<PreviousValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<PlatformContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateInstanceResponse {
    pub dashboard_url: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeprovisionResponse {
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLastOperationRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation_key: Option<String>,
}

/// Broker-side state of an asynchronous operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    pub description: Option<String>,
    /// From the `Retry-After` header
    pub poll_delay: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BindRequest {
    #[serde(skip)]
    pub instance_id: String,
    #[serde(skip)]
    pub binding_id: String,
    #[serde(skip)]
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<PlatformContext>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BindResponse {
    /// Present for synchronous responses
    pub credentials: Option<Map<String, Value>>,
    pub syslog_drain_url: Option<String>,
    pub route_service_url: Option<String>,
    pub volume_mounts: Option<Value>,
    pub operation_key: Option<String>,
}

impl BindResponse {
    pub fn is_async(&self) -> bool {
        self.operation_key.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub accepts_incomplete: bool,
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnbindResponse {
    pub operation_key: Option<String>,
}

/// Body shapes the client parses off the wire.
pub(crate) mod wire {
    use serde::Deserialize;
    use serde_json::{Map, Value};

    #[derive(Debug, Deserialize, Default)]
    pub struct AsyncBody {
        #[serde(default)]
        pub dashboard_url: Option<String>,
        #[serde(default)]
        pub operation: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct LastOperationBody {
        pub state: super::LastOperationState,
        #[serde(default)]
        pub description: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct BindBody {
        #[serde(default)]
        pub credentials: Option<Map<String, Value>>,
        #[serde(default)]
        pub syslog_drain_url: Option<String>,
        #[serde(default)]
        pub route_service_url: Option<String>,
        #[serde(default)]
        pub volume_mounts: Option<Value>,
        #[serde(default)]
        pub operation: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct ErrorBody {
        #[serde(default)]
        pub error: Option<String>,
        #[serde(default)]
        pub description: Option<String>,
    }
}

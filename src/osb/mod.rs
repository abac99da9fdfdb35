//! Open Service Broker v2 client
//!
//! [`BrokerClient`] is the seam between reconcilers and brokers. The HTTP
//! implementation is [`OsbClient`]; tests substitute a scripted fake.

pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use client::{BrokerAuth, OsbClient, OsbClientConfig, API_VERSION_HEADER, DEFAULT_API_VERSION};
pub use error::{BrokerError, ErrorDisposition};
pub use types::*;

/// Typed OSB v2 operations against one broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Broker name, for logging
    fn name(&self) -> &str;

    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError>;

    async fn provision_instance(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, BrokerError>;

    async fn update_instance(&self, request: &UpdateInstanceRequest) -> Result<UpdateInstanceResponse, BrokerError>;

    async fn deprovision_instance(&self, request: &DeprovisionRequest) -> Result<DeprovisionResponse, BrokerError>;

    async fn poll_last_operation(&self, request: &LastOperationRequest) -> Result<LastOperationResponse, BrokerError>;

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError>;

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<BindResponse, BrokerError>;

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError>;
}

/// Turn opaque user parameters into the JSON object sent on the wire.
///
/// `null` and absent parameters are omitted; anything other than an object is
/// rejected.
pub fn parameters_to_wire(parameters: Option<&Value>) -> Result<Option<Map<String, Value>>, BrokerError> {
    match parameters {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(BrokerError::InvalidRequest(format!(
            "parameters must be a JSON object, got {}",
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parameters_to_wire() {
        assert_eq!(parameters_to_wire(None).unwrap(), None);
        assert_eq!(parameters_to_wire(Some(&json!({}))).unwrap(), None);
        let map = parameters_to_wire(Some(&json!({"size": 3}))).unwrap().unwrap();
        assert_eq!(map["size"], 3);
        let err = parameters_to_wire(Some(&json!([1, 2]))).unwrap_err();
        assert!(err.to_string().contains("array"));
    }
}

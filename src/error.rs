//! Error types for the service catalog controller

use thiserror::Error;

use crate::osb::BrokerError;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors that can occur while reconciling, storing or migrating catalog records
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Watch stream failure
    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    /// Error returned by a service broker
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML (de)serialization error, used by the backup archive
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure on write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Create of a record that already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Migration step failure
    #[error("Migration error: {0}")]
    Migration(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl ControllerError {
    pub fn reconciliation(msg: impl Into<String>) -> Self {
        Self::Reconciliation(msg.into())
    }

    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// True for a 404 from the API server or a missing record in any store.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True for a resource-version conflict (HTTP 409 with reason Conflict).
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "Conflict",
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControllerError::NotFound("serviceinstances/default/db".to_string());
        assert!(err.to_string().contains("Resource not found"));
    }

    #[test]
    fn test_error_variants() {
        let errors = vec![
            ControllerError::Configuration("config".to_string()),
            ControllerError::reconciliation("reconcile"),
            ControllerError::NotFound("resource".to_string()),
            ControllerError::Conflict("rv".to_string()),
            ControllerError::AlreadyExists("name".to_string()),
            ControllerError::invalid_state("state"),
            ControllerError::migration("restore"),
            ControllerError::Timeout("scale".to_string()),
        ];

        for err in errors {
            let _ = format!("{}", err);
        }
    }

    #[test]
    fn test_classification_from_api_errors() {
        let api = |code: u16, reason: &str| {
            ControllerError::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "m".to_string(),
                reason: reason.to_string(),
                code,
            }))
        };
        assert!(api(404, "NotFound").is_not_found());
        assert!(api(409, "Conflict").is_conflict());
        assert!(!api(409, "Conflict").is_already_exists());
        assert!(api(409, "AlreadyExists").is_already_exists());
        assert!(!api(500, "InternalError").is_conflict());
    }

    #[test]
    fn test_broker_error_converts() {
        let err: ControllerError = BrokerError::AsyncRequired.into();
        assert!(matches!(err, ControllerError::Broker(_)));
    }
}

//! ClusterServiceBroker and ServiceBroker Custom Resource Definitions
//!
//! A broker record points at a remote Open Service Broker endpoint. The
//! catalog reconciler fetches its catalog and materializes classes and plans.

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{Condition, SecretReference};

/// Default period between catalog refetches.
pub const DEFAULT_RELIST_DURATION: Duration = Duration::from_secs(15 * 60);

/// Cluster-scoped broker, visible to every namespace
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ClusterServiceBroker",
    status = "BrokerStatus",
    shortname = "csb",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceBrokerSpec {
    #[serde(flatten)]
    pub common: CommonBrokerSpec,

    /// Credentials for the broker; the secret reference must carry a namespace
    #[serde(default)]
    pub auth_info: Option<BrokerAuthInfo>,
}

/// Namespaced broker, visible only to its own namespace
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    kind = "ServiceBroker",
    namespaced,
    status = "BrokerStatus",
    shortname = "sb",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastConditionState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    #[serde(flatten)]
    pub common: CommonBrokerSpec,

    /// Credentials for the broker; secrets are read from the broker's namespace
    #[serde(default)]
    pub auth_info: Option<BrokerAuthInfo>,
}

/// Fields shared by both broker scopes
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommonBrokerSpec {
    /// Base URL of the broker
    pub url: String,

    /// Skip TLS verification of the broker endpoint
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,

    /// Base64-encoded PEM bundle used to verify the broker's certificate
    #[serde(default)]
    pub ca_bundle: Option<String>,

    /// When to refetch the catalog
    #[serde(default)]
    pub relist_behavior: RelistBehavior,

    /// Refetch period for the Duration behavior, e.g. "15m" or "1h30m"
    #[serde(default)]
    pub relist_duration: Option<String>,

    /// Incrementing this forces a catalog refetch
    #[serde(default)]
    pub relist_requests: i64,
}

/// Catalog relist behavior
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum RelistBehavior {
    #[default]
    Duration,
    Manual,
}

/// Broker authentication. At most one of the methods may be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BrokerAuthInfo {
    /// HTTP Basic; the secret holds `username` and `password`
    #[serde(default)]
    pub basic: Option<AuthSecretConfig>,
    /// Bearer token; the secret holds `token`
    #[serde(default)]
    pub bearer: Option<AuthSecretConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthSecretConfig {
    pub secret_ref: SecretReference,
}

/// Status shared by both broker scopes
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation whose catalog has been fully reconciled
    #[serde(default)]
    pub observed_generation: i64,

    /// Generation for which the last catalog fetch completed (success or terminal failure)
    #[serde(default)]
    pub reconciled_generation: i64,

    #[serde(default)]
    pub last_catalog_retrieval_time: Option<String>,

    /// Printer column summarizing the conditions
    #[serde(default)]
    pub last_condition_state: String,
}

/// Credential method resolved from a broker's auth info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Bearer,
}

/// Operations the catalog reconciler needs from either broker scope.
pub trait BrokerResource {
    fn common_spec(&self) -> &CommonBrokerSpec;

    fn auth_info(&self) -> Option<&BrokerAuthInfo>;

    /// Namespace used to look up auth secrets.
    fn secret_namespace(&self, secret: &SecretReference) -> Option<String>;

    fn broker_status(&self) -> Option<&BrokerStatus>;

    fn broker_status_mut(&mut self) -> &mut BrokerStatus;

    /// Resolved auth secret, if any.
    fn auth_secret(&self) -> Option<(AuthMethod, SecretReference)> {
        let info = self.auth_info()?;
        let (method, config) = match (&info.basic, &info.bearer) {
            (Some(basic), _) => (AuthMethod::Basic, basic),
            (None, Some(bearer)) => (AuthMethod::Bearer, bearer),
            (None, None) => return None,
        };
        let secret = SecretReference {
            namespace: self.secret_namespace(&config.secret_ref),
            name: config.secret_ref.name.clone(),
        };
        Some((method, secret))
    }

    /// Refetch period; `None` for manual relisting.
    fn relist_interval(&self) -> Option<Duration> {
        let spec = self.common_spec();
        match spec.relist_behavior {
            RelistBehavior::Manual => None,
            RelistBehavior::Duration => Some(
                spec.relist_duration
                    .as_deref()
                    .and_then(parse_duration)
                    .unwrap_or(DEFAULT_RELIST_DURATION),
            ),
        }
    }
}

impl BrokerResource for ClusterServiceBroker {
    fn common_spec(&self) -> &CommonBrokerSpec {
        &self.spec.common
    }

    fn auth_info(&self) -> Option<&BrokerAuthInfo> {
        self.spec.auth_info.as_ref()
    }

    fn secret_namespace(&self, secret: &SecretReference) -> Option<String> {
        secret.namespace.clone()
    }

    fn broker_status(&self) -> Option<&BrokerStatus> {
        self.status.as_ref()
    }

    fn broker_status_mut(&mut self) -> &mut BrokerStatus {
        self.status.get_or_insert_with(BrokerStatus::default)
    }
}

impl BrokerResource for ServiceBroker {
    fn common_spec(&self) -> &CommonBrokerSpec {
        &self.spec.common
    }

    fn auth_info(&self) -> Option<&BrokerAuthInfo> {
        self.spec.auth_info.as_ref()
    }

    fn secret_namespace(&self, _secret: &SecretReference) -> Option<String> {
        self.metadata.namespace.clone()
    }

    fn broker_status(&self) -> Option<&BrokerStatus> {
        self.status.as_ref()
    }

    fn broker_status_mut(&mut self) -> &mut BrokerStatus {
        self.status.get_or_insert_with(BrokerStatus::default)
    }
}

/// Parse a Go-style duration such as `15m`, `1h30m` or `90s`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        total += match unit {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            _ => return None,
        };
    }
    Some(total)
}

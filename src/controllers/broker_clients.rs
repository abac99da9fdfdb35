//! Broker client construction
//!
//! Reconcilers ask a [`BrokerClientFactory`] for a client; the HTTP factory
//! reads the broker's auth secret through the store on every call so rotated
//! credentials take effect on the next reconciliation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use crate::crd::{AuthMethod, BrokerResource, CommonBrokerSpec, SecretReference};
use crate::error::{ControllerError, Result};
use crate::osb::{BrokerAuth, BrokerClient, OsbClient, OsbClientConfig};
use crate::store::{typed, Store};

/// Everything needed to reach one broker, independent of its scope
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    /// `name` for cluster brokers, `namespace/name` for namespaced ones
    pub name: String,
    pub spec: CommonBrokerSpec,
    pub auth: Option<(AuthMethod, SecretReference)>,
}

impl BrokerEndpoint {
    pub fn from_broker<B: BrokerResource + ResourceExt>(broker: &B) -> Self {
        let name = match broker.namespace() {
            Some(ns) => format!("{}/{}", ns, broker.name_any()),
            None => broker.name_any(),
        };
        Self {
            name,
            spec: broker.common_spec().clone(),
            auth: broker.auth_secret(),
        }
    }
}

#[async_trait]
pub trait BrokerClientFactory: Send + Sync {
    async fn client_for(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerClient>>;
}

/// Builds [`OsbClient`]s
pub struct OsbClientFactory {
    store: Arc<dyn Store>,
    timeout: Duration,
    api_version: String,
}

impl OsbClientFactory {
    pub fn new(store: Arc<dyn Store>, timeout: Duration, api_version: impl Into<String>) -> Self {
        Self {
            store,
            timeout,
            api_version: api_version.into(),
        }
    }

    async fn resolve_auth(&self, endpoint: &BrokerEndpoint) -> Result<BrokerAuth> {
        let Some((method, secret_ref)) = &endpoint.auth else {
            return Ok(BrokerAuth::None);
        };
        let namespace = secret_ref.namespace.as_deref().ok_or_else(|| {
            ControllerError::Configuration(format!(
                "auth secret {} for broker {} has no namespace",
                secret_ref.name, endpoint.name
            ))
        })?;
        let secret: Secret = typed::get(self.store.as_ref(), Some(namespace), &secret_ref.name)
            .await?
            .ok_or_else(|| {
                ControllerError::NotFound(format!(
                    "auth secret {}/{} for broker {}",
                    namespace, secret_ref.name, endpoint.name
                ))
            })?;
        auth_from_secret(*method, &secret)
    }
}

fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let value = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| ControllerError::Configuration(format!("secret {} has no key {}", secret.name_any(), key)))?;
    String::from_utf8(value.0.clone())
        .map_err(|_| ControllerError::Configuration(format!("secret {} key {} is not UTF-8", secret.name_any(), key)))
}

/// Credentials from a basic (`username`, `password`) or bearer (`token`) secret.
pub fn auth_from_secret(method: AuthMethod, secret: &Secret) -> Result<BrokerAuth> {
    match method {
        AuthMethod::Basic => Ok(BrokerAuth::Basic {
            username: secret_value(secret, "username")?,
            password: secret_value(secret, "password")?,
        }),
        AuthMethod::Bearer => Ok(BrokerAuth::Bearer {
            token: secret_value(secret, "token")?,
        }),
    }
}

#[async_trait]
impl BrokerClientFactory for OsbClientFactory {
    async fn client_for(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerClient>> {
        let auth = self.resolve_auth(endpoint).await?;
        let ca_bundle_pem = match endpoint.spec.ca_bundle.as_deref().filter(|b| !b.is_empty()) {
            Some(encoded) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| ControllerError::Configuration(format!("caBundle of broker {}: {}", endpoint.name, e)))?,
            ),
            None => None,
        };

        let mut config = OsbClientConfig::new(&endpoint.name, &endpoint.spec.url);
        config.auth = auth;
        config.timeout = self.timeout;
        config.api_version = self.api_version.clone();
        config.insecure_skip_tls_verify = endpoint.spec.insecure_skip_tls_verify;
        config.ca_bundle_pem = ca_bundle_pem;

        Ok(Arc::new(OsbClient::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterServiceBroker;
    use crate::store::MemoryStore;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("broker-auth".to_string()),
                namespace: Some("catalog".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn broker(auth: serde_json::Value) -> ClusterServiceBroker {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "servicecatalog.k8s.io/v1beta1",
            "kind": "ClusterServiceBroker",
            "metadata": {"name": "ups"},
            "spec": {"url": "http://broker.example:8080", "authInfo": auth}
        }))
        .unwrap()
    }

    #[test]
    fn test_auth_from_secret() {
        let basic = auth_from_secret(AuthMethod::Basic, &secret(&[("username", "u"), ("password", "p")])).unwrap();
        assert_eq!(
            basic,
            BrokerAuth::Basic {
                username: "u".to_string(),
                password: "p".to_string()
            }
        );
        let bearer = auth_from_secret(AuthMethod::Bearer, &secret(&[("token", "t")])).unwrap();
        assert_eq!(bearer, BrokerAuth::Bearer { token: "t".to_string() });
        assert!(auth_from_secret(AuthMethod::Basic, &secret(&[("username", "u")])).is_err());
    }

    #[test]
    fn test_endpoint_from_cluster_broker() {
        let endpoint = BrokerEndpoint::from_broker(&broker(serde_json::json!({
            "basic": {"secretRef": {"namespace": "catalog", "name": "broker-auth"}}
        })));
        assert_eq!(endpoint.name, "ups");
        let (method, secret_ref) = endpoint.auth.unwrap();
        assert_eq!(method, AuthMethod::Basic);
        assert_eq!(secret_ref.namespace.as_deref(), Some("catalog"));
    }

    #[tokio::test]
    async fn test_factory_requires_auth_secret() {
        let store = Arc::new(MemoryStore::new());
        let factory = OsbClientFactory::new(store.clone(), Duration::from_secs(5), "2.13");
        let endpoint = BrokerEndpoint::from_broker(&broker(serde_json::json!({
            "bearer": {"secretRef": {"namespace": "catalog", "name": "broker-auth"}}
        })));

        let err = factory.client_for(&endpoint).await.err().unwrap();
        assert!(err.is_not_found());

        typed::create(store.as_ref(), &secret(&[("token", "t")])).await.unwrap();
        let client = factory.client_for(&endpoint).await.unwrap();
        assert_eq!(client.name(), "ups");
    }
}

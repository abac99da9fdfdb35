//! Cluster operations used by the migration engine and the cleaner
//!
//! Everything outside the record store goes through [`ClusterOps`]:
//! deployment scaling, admission webhooks and the catalog's CRDs.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, RuleWithOperations, ServiceReference, ValidatingWebhook,
    ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{GROUP, VERSION};
use crate::error::{ControllerError, Result};
use crate::validation::BLOCKED_RESOURCES;

/// Name of the write-blocking webhook configuration
pub const BLOCKER_NAME: &str = "service-catalog-migration-blocker";

/// Name of the single webhook inside the blocker
pub const BLOCKER_WEBHOOK: &str = "validating.reject-changes-to-service-catalog-crds.servicecatalog.k8s.io";

const FIELD_MANAGER: &str = "service-catalog-migration";

/// Replica counts reported by a deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub desired: i32,
    pub ready: i32,
    pub available: i32,
}

impl ReplicaStatus {
    /// Whether the deployment has settled at `replicas`.
    pub fn settled_at(&self, replicas: i32) -> bool {
        if replicas == 0 {
            self.ready == 0 && self.available == 0
        } else {
            self.ready >= replicas
        }
    }
}

/// How often and how long to wait for a deployment to settle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl ScalePolicy {
    pub const MIGRATION: ScalePolicy = ScalePolicy {
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(45),
    };

    pub const CLEANER: ScalePolicy = ScalePolicy {
        interval: Duration::from_secs(3),
        timeout: Duration::from_secs(120),
    };
}

/// Cluster-level operations outside the record store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Whether a deployment exists.
    async fn deployment_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Set the desired replica count of a deployment.
    async fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Current replica counts of a deployment.
    async fn replica_status(&self, namespace: &str, name: &str) -> Result<ReplicaStatus>;

    /// Create the write-blocking validating webhook configuration.
    async fn create_blocker(&self, name: &str) -> Result<()>;

    /// Delete a validating webhook configuration. Missing is not an error.
    async fn delete_validating_webhook(&self, name: &str) -> Result<()>;

    /// Delete a mutating webhook configuration. Missing is not an error.
    async fn delete_mutating_webhook(&self, name: &str) -> Result<()>;

    /// Delete every CRD in the catalog API group.
    async fn delete_catalog_crds(&self) -> Result<()>;

    /// Names of catalog CRDs still registered.
    async fn remaining_catalog_crds(&self) -> Result<Vec<String>>;
}

/// Scale a deployment and wait until it reports the new size.
pub async fn scale(
    cluster: &dyn ClusterOps,
    namespace: &str,
    name: &str,
    replicas: i32,
    policy: ScalePolicy,
) -> Result<()> {
    info!("Scaling deployment {}/{} to {}", namespace, name, replicas);
    cluster.set_replicas(namespace, name, replicas).await?;

    let deadline = tokio::time::Instant::now() + policy.timeout;
    loop {
        let status = cluster.replica_status(namespace, name).await?;
        if status.settled_at(replicas) {
            debug!("Deployment {}/{} settled at {}", namespace, name, replicas);
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ControllerError::Timeout(format!(
                "deployment {}/{} did not reach {} replicas (ready: {}, available: {})",
                namespace, name, replicas, status.ready, status.available
            )));
        }
        debug!(
            "Waiting for {}/{} (ready: {}, available: {})",
            namespace, name, status.ready, status.available
        );
        tokio::time::sleep(policy.interval).await;
    }
}

/// The blocker: rejects every write to catalog records. It points at a
/// service that does not exist, so with `failurePolicy: Fail` every
/// admission call fails closed.
pub fn blocker_configuration(name: &str) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: BLOCKER_WEBHOOK.to_string(),
            failure_policy: Some("Fail".to_string()),
            side_effects: "None".to_string(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    name: name.to_string(),
                    namespace: "dummy".to_string(),
                    path: Some("/this-endpoint-does-not-have-to-exist".to_string()),
                    port: None,
                }),
                ..Default::default()
            },
            rules: Some(vec![RuleWithOperations {
                operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string(), "DELETE".to_string()]),
                api_groups: Some(vec![GROUP.to_string()]),
                api_versions: Some(vec![VERSION.to_string()]),
                resources: Some(BLOCKED_RESOURCES.iter().map(|r| r.to_string()).collect()),
                scope: None,
            }]),
            ..Default::default()
        }]),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// [`ClusterOps`] against a Kubernetes API server
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn catalog_crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }

    async fn list_catalog_crds(&self) -> Result<Vec<String>> {
        let crds = self.catalog_crds().list(&ListParams::default()).await?;
        Ok(crds
            .items
            .into_iter()
            .filter(|crd| crd.spec.group == GROUP)
            .map(|crd| crd.name_any())
            .collect())
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn deployment_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.deployments(namespace).get_opt(name).await?.is_some())
    }

    async fn set_replicas(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let patch = json!({"spec": {"replicas": replicas}});
        self.deployments(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn replica_status(&self, namespace: &str, name: &str) -> Result<ReplicaStatus> {
        let deployment = self.deployments(namespace).get(name).await?;
        let status = deployment.status.unwrap_or_default();
        Ok(ReplicaStatus {
            desired: deployment.spec.and_then(|s| s.replicas).unwrap_or(1),
            ready: status.ready_replicas.unwrap_or(0),
            available: status.available_replicas.unwrap_or(0),
        })
    }

    async fn create_blocker(&self, name: &str) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        api.create(&PostParams::default(), &blocker_configuration(name)).await?;
        Ok(())
    }

    async fn delete_validating_webhook(&self, name: &str) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_mutating_webhook(&self, name: &str) -> Result<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_catalog_crds(&self) -> Result<()> {
        let api = self.catalog_crds();
        for name in self.list_catalog_crds().await? {
            info!("Deleting CRD {}", name);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn remaining_catalog_crds(&self) -> Result<Vec<String>> {
        self.list_catalog_crds().await
    }
}

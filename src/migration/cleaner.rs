//! Catalog removal
//!
//! [`remove_finalizers`] releases every record still held by the catalog
//! finalizer; backup runs it after deleting the source records. [`Cleaner`]
//! uninstalls the catalog from a cluster outright.

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::cluster::{scale, ClusterOps, ScalePolicy};
use crate::conditions::CATALOG_FINALIZER;
use crate::error::{ControllerError, Result};
use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::store::{Kind, ListOptions, Store};

fn holds_finalizer(obj: &DynamicObject) -> bool {
    obj.finalizers().iter().any(|f| f == CATALOG_FINALIZER)
}

/// Strip the catalog finalizer from one record, re-reading it on conflict.
async fn release(store: &dyn Store, kind: Kind, namespace: Option<&str>, name: &str, retry: &RetryConfig) -> Result<()> {
    let operation = format!("remove finalizer from {} {}", kind, name);
    retry_with_backoff_if(retry, &operation, ControllerError::is_conflict, || async {
        let Some(mut current) = store.get(kind, namespace, name).await? else {
            return Ok(());
        };
        if !holds_finalizer(&current) {
            return Ok(());
        }
        current.finalizers_mut().retain(|f| f != CATALOG_FINALIZER);
        match store.update(kind, &current).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    })
    .await
}

/// Remove the catalog finalizer from every record of every catalog kind.
/// Returns how many records were released.
pub async fn remove_finalizers(store: &dyn Store, retry: &RetryConfig) -> Result<usize> {
    let mut released = 0;
    for kind in Kind::CATALOG {
        let records = match store.list(kind, &ListOptions::all()).await {
            Ok(records) => records,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        for obj in records.iter().filter(|o| holds_finalizer(o)) {
            debug!("Removing finalizer from {} {}", kind, obj.name_any());
            release(store, kind, obj.namespace().as_deref(), &obj.name_any(), retry).await?;
            released += 1;
        }
    }
    info!("Released {} records from the catalog finalizer", released);
    Ok(released)
}

/// Uninstalls the catalog: controller, webhooks, CRDs and any records the
/// finalizer still holds.
pub struct Cleaner {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterOps>,
    policy: ScalePolicy,
    retry: RetryConfig,
}

impl Cleaner {
    pub fn new(store: Arc<dyn Store>, cluster: Arc<dyn ClusterOps>) -> Self {
        Self {
            store,
            cluster,
            policy: ScalePolicy::CLEANER,
            retry: RetryConfig::with_max_attempts(5),
        }
    }

    pub fn with_policy(mut self, policy: ScalePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn run(&self, namespace: &str, controller_manager: &str, webhook_configurations: &[String]) -> Result<()> {
        scale(self.cluster.as_ref(), namespace, controller_manager, 0, self.policy)
            .await
            .map_err(|e| ControllerError::migration(format!("failed to scale down controller manager: {}", e)))?;

        for name in webhook_configurations {
            info!("Removing webhook configuration {}", name);
            self.cluster.delete_mutating_webhook(name).await?;
            self.cluster.delete_validating_webhook(name).await?;
        }

        self.cluster.delete_catalog_crds().await?;
        remove_finalizers(self.store.as_ref(), &self.retry).await?;
        self.wait_for_crds_removed().await
    }

    async fn wait_for_crds_removed(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.policy.timeout;
        loop {
            let remaining = self.cluster.remaining_catalog_crds().await?;
            if remaining.is_empty() {
                info!("All catalog CRDs removed");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ControllerError::migration(format!(
                    "CustomResourceDefinitions still present: {}",
                    remaining.join(", ")
                )));
            }
            warn!("Waiting for {} catalog CRDs to be removed", remaining.len());
            tokio::time::sleep(self.policy.interval).await;
        }
    }
}

//! Store backed by a Kubernetes API server
//!
//! Catalog records live as custom resources in the `servicecatalog.k8s.io`
//! group; the API server supplies generation, conflict, finalizer and garbage
//! collection semantics.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::{Kind, ListOptions, Store, WatchEvent};
use crate::crd::all_crds;
use crate::error::{ControllerError, Result};

const FIELD_MANAGER: &str = "service-catalog";

/// Kubernetes-backed [`Store`]
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, kind: Kind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, kind: Kind, obj: &DynamicObject) -> Api<DynamicObject> {
        self.api(kind, obj.metadata.namespace.as_deref())
    }
}

fn map_write_error(kind: Kind, name: &str, err: kube::Error) -> ControllerError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => ControllerError::NotFound(format!("{} {}", kind, name)),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ControllerError::AlreadyExists(format!("{} {}", kind, name))
        }
        kube::Error::Api(resp) if resp.code == 409 => ControllerError::Conflict(resp.message.clone()),
        _ => ControllerError::Kube(err),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn list(&self, kind: Kind, options: &ListOptions) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, options.namespace.as_deref());
        let mut params = ListParams::default();
        if let Some(selector) = options.label_selector() {
            params = params.labels(&selector);
        }
        // Field selectors on custom resources are limited; filter client side.
        let objects = api.list(&params).await?;
        Ok(objects.items.into_iter().filter(|o| options.matches(o)).collect())
    }

    async fn get(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.api(kind, namespace).get_opt(name).await?)
    }

    async fn create(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        self.api_for(kind, obj)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(kind, &name, e))
    }

    async fn update(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        self.api_for(kind, obj)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(kind, &name, e))
    }

    async fn update_status(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj.name_any();
        let patch = json!({
            "metadata": { "resourceVersion": obj.metadata.resource_version },
            "status": obj.data.get("status").cloned().unwrap_or_else(|| json!({})),
        });
        self.api_for(kind, obj)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_write_error(kind, &name, e))
    }

    async fn delete(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<()> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_write_error(kind, name, e))?;
        Ok(())
    }

    async fn watch(&self, kind: Kind) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let api = self.api(kind, None);
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(Event::InitApply(obj)) => Some(Ok(WatchEvent::Added(obj))),
                    Ok(Event::Apply(obj)) => Some(Ok(WatchEvent::Modified(obj))),
                    Ok(Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => Some(Err(ControllerError::from(e))),
                }
            });
        Ok(stream.boxed())
    }
}

/// Register every catalog CRD and wait until the API server reports them
/// established.
pub async fn install_crds(client: Client, timeout: Duration) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let crds = all_crds();
    for crd in &crds {
        let name = crd.name_any();
        info!("Applying CRD {}", name);
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(crd))
            .await?;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    for crd in &crds {
        let name = crd.name_any();
        loop {
            let current = api.get(&name).await?;
            let established = current
                .status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Established" && c.status == "True"));
            if established {
                debug!("CRD {} established", name);
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ControllerError::Timeout(format!("CRD {} not established", name)));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    Ok(())
}

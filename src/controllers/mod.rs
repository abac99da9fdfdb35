//! Reconcilers for the service catalog
//!
//! Each reconciler is an async function over a [`Context`] and a record key.
//! It reads the record from the store, performs at most one broker
//! interaction, persists the outcome and tells the [`manager`] when to look
//! at the record again.

pub mod binding;
pub mod broker_clients;
pub mod catalog;
pub mod injector;
pub mod instance;
pub mod manager;
pub mod queue;

#[cfg(test)]
mod properties;
#[cfg(test)]
pub(crate) mod test_support;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::conditions::CATALOG_FINALIZER;
use crate::config::ControllerConfig;
use crate::crd::{Parameters, ParametersFromSource};
use crate::error::Result;
use crate::store::{typed, Kind, Store, StoreKind};

pub use broker_clients::{BrokerClientFactory, BrokerEndpoint, OsbClientFactory};
pub use manager::Manager;
pub use queue::WorkQueue;

/// Shared state handed to every reconciliation
pub struct Context {
    pub store: Arc<dyn Store>,
    pub brokers: Arc<dyn BrokerClientFactory>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(store: Arc<dyn Store>, brokers: Arc<dyn BrokerClientFactory>, config: ControllerConfig) -> Self {
        Self { store, brokers, config }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}

/// What to do with a key after a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Look again after the given delay
    Requeue(Duration),
    /// Nothing to do until the record changes
    AwaitChange,
}

impl Action {
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }

    pub fn await_change() -> Self {
        Self::AwaitChange
    }
}

/// Work-queue key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

pub(crate) fn has_finalizer<K: ResourceExt>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == CATALOG_FINALIZER)
}

/// Add the catalog finalizer in memory. Returns whether anything changed.
pub(crate) fn add_finalizer<K: ResourceExt>(obj: &mut K) -> bool {
    if has_finalizer(obj) {
        return false;
    }
    obj.finalizers_mut().push(CATALOG_FINALIZER.to_string());
    true
}

/// Remove the catalog finalizer and persist. This is the last write a
/// reconciler makes to a record being deleted.
pub(crate) async fn remove_finalizer<K: StoreKind>(store: &dyn Store, obj: &K) -> Result<()> {
    if !has_finalizer(obj) {
        return Ok(());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().retain(|f| f != CATALOG_FINALIZER);
    match typed::update(store, &updated).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Time since an RFC 3339 timestamp; `None` if absent or unparseable.
pub(crate) fn elapsed_since(timestamp: Option<&str>) -> Option<Duration> {
    let start = DateTime::parse_from_rfc3339(timestamp?).ok()?;
    (Utc::now() - start.with_timezone(&Utc)).to_std().ok()
}

/// Failure raised by parameter assembly; always terminal for the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParametersError(pub String);

impl fmt::Display for ParametersError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Merge inline parameters with every `parametersFrom` source. A key that
/// appears in more than one place is an error.
pub(crate) async fn build_parameters(
    store: &dyn Store,
    namespace: &str,
    inline: Option<&Parameters>,
    sources: &[ParametersFromSource],
) -> Result<std::result::Result<Option<Value>, ParametersError>> {
    let mut merged = match inline.map(|p| &p.0) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Ok(Err(ParametersError("parameters must be a JSON object".to_string()))),
    };

    for source in sources {
        let Some(key_ref) = &source.secret_key_ref else {
            continue;
        };
        let secret: Option<k8s_openapi::api::core::v1::Secret> = typed::get(store, Some(namespace), &key_ref.name).await?;
        let Some(secret) = secret else {
            return Ok(Err(ParametersError(format!("secret {}/{} not found", namespace, key_ref.name))));
        };
        let Some(raw) = secret.data.as_ref().and_then(|d| d.get(&key_ref.key)) else {
            return Ok(Err(ParametersError(format!("secret {} has no key {}", key_ref.name, key_ref.key))));
        };
        let parsed: Value = match serde_json::from_slice(&raw.0) {
            Ok(v) => v,
            Err(e) => {
                return Ok(Err(ParametersError(format!(
                    "secret {} key {} is not valid JSON: {}",
                    key_ref.name, key_ref.key, e
                ))))
            }
        };
        let Value::Object(map) = parsed else {
            return Ok(Err(ParametersError(format!(
                "secret {} key {} must hold a JSON object",
                key_ref.name, key_ref.key
            ))));
        };
        for (k, v) in map {
            if merged.contains_key(&k) {
                return Ok(Err(ParametersError(format!("parameter {} is specified more than once", k))));
            }
            merged.insert(k, v);
        }
    }

    Ok(Ok(if merged.is_empty() { None } else { Some(Value::Object(merged)) }))
}

/// SHA-256 over the canonical (key-sorted) JSON of the parameters.
pub(crate) fn parameters_checksum(parameters: Option<&Value>) -> Option<String> {
    let value = parameters?;
    // serde_json maps are ordered by key, so to_string is canonical.
    let digest = Sha256::digest(value.to_string().as_bytes());
    Some(format!("{:x}", digest))
}

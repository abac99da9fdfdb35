//! Credential Secret materialization
//!
//! Shapes a broker's bind credentials into Secret data for a binding and
//! upserts the Secret. The Secret is owned by the binding through a
//! controller owner reference, so deleting the binding deletes it.

use std::collections::BTreeMap;

use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::crd::{SecretTransform, ServiceBinding};
use crate::error::ControllerError;
use crate::store::{typed, Store};

#[derive(Debug, Error)]
pub enum InjectError {
    /// The Secret exists and is not controlled by this binding
    #[error("secret {namespace}/{name} is not owned by binding {binding}")]
    Conflict {
        namespace: String,
        name: String,
        binding: String,
    },

    #[error("invalid secret transform: {0}")]
    Transform(String),

    #[error(transparent)]
    Store(#[from] ControllerError),
}

pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Secret data for a credentials object before transforms. Strings are
/// stored as-is; other values as their JSON text. With `secret_key` the whole
/// object is stored as JSON under that one key.
pub fn credentials_to_data(credentials: &Map<String, Value>, secret_key: Option<&str>) -> SecretData {
    if let Some(key) = secret_key.filter(|k| !k.is_empty()) {
        let json = Value::Object(credentials.clone()).to_string();
        return BTreeMap::from([(key.to_string(), json.into_bytes())]);
    }
    credentials
        .iter()
        .map(|(k, v)| {
            let bytes = match v {
                Value::String(s) => s.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            };
            (k.clone(), bytes)
        })
        .collect()
}

/// Apply transforms in order. `referenced` holds the data of Secrets named
/// by `addKeysFrom`, keyed by name.
pub fn apply_transforms(
    mut data: SecretData,
    transforms: &[SecretTransform],
    referenced: &BTreeMap<String, SecretData>,
) -> Result<SecretData, InjectError> {
    for transform in transforms {
        if let Some(rename) = &transform.rename_key {
            if let Some(value) = data.remove(&rename.from) {
                data.insert(rename.to.clone(), value);
            }
        }
        if let Some(add) = &transform.add_key {
            let value = match (&add.string_value, &add.value) {
                (Some(s), _) => s.clone().into_bytes(),
                (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| InjectError::Transform(format!("addKey {}: {}", add.key, e)))?,
                (None, None) => Vec::new(),
            };
            data.insert(add.key.clone(), value);
        }
        if let Some(from) = &transform.add_keys_from {
            let source = referenced.get(&from.secret_ref.name).ok_or_else(|| {
                InjectError::Transform(format!("addKeysFrom secret {} not found", from.secret_ref.name))
            })?;
            data.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(remove) = &transform.remove_key {
            data.remove(&remove.key);
        }
    }
    Ok(data)
}

fn owner_reference(binding: &ServiceBinding) -> Option<OwnerReference> {
    binding.controller_owner_ref(&())
}

fn is_controlled_by(secret: &Secret, binding: &ServiceBinding) -> bool {
    let uid = binding.metadata.uid.as_deref();
    secret
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && Some(r.uid.as_str()) == uid)
}

/// Build the Secret for a binding from the broker's credentials.
pub async fn build_secret(
    store: &dyn Store,
    binding: &ServiceBinding,
    credentials: &Map<String, Value>,
) -> Result<Secret, InjectError> {
    let namespace = binding.namespace().unwrap_or_default();

    let mut referenced = BTreeMap::new();
    for transform in &binding.spec.secret_transforms {
        if let Some(from) = &transform.add_keys_from {
            let ns = from.secret_ref.namespace.clone().unwrap_or_else(|| namespace.clone());
            let source: Option<Secret> = typed::get(store, Some(&ns), &from.secret_ref.name).await?;
            if let Some(source) = source {
                let data: SecretData = source
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect();
                referenced.insert(from.secret_ref.name.clone(), data);
            }
        }
    }

    let data = credentials_to_data(credentials, binding.spec.secret_key.as_deref());
    let data = apply_transforms(data, &binding.spec.secret_transforms, &referenced)?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(binding.secret_name()),
            namespace: Some(namespace),
            owner_references: owner_reference(binding).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
        ..Default::default()
    })
}

/// Create or update the binding's Secret. Refuses to touch a Secret that is
/// not controlled by the binding.
pub async fn inject(
    store: &dyn Store,
    binding: &ServiceBinding,
    credentials: &Map<String, Value>,
) -> Result<Secret, InjectError> {
    let desired = build_secret(store, binding, credentials).await?;
    let namespace = desired.metadata.namespace.clone().unwrap_or_default();
    let name = desired.name_any();

    let existing: Option<Secret> = typed::get(store, Some(&namespace), &name).await?;
    match existing {
        None => {
            info!("Creating secret {}/{} for binding {}", namespace, name, binding.name_any());
            Ok(typed::create(store, &desired).await?)
        }
        Some(existing) if !is_controlled_by(&existing, binding) => Err(InjectError::Conflict {
            namespace,
            name,
            binding: binding.name_any(),
        }),
        Some(mut existing) => {
            if existing.data == desired.data && existing.type_ == desired.type_ {
                debug!("Secret {}/{} already up to date", namespace, name);
                return Ok(existing);
            }
            existing.data = desired.data;
            existing.type_ = desired.type_;
            existing.metadata.owner_references = desired.metadata.owner_references;
            info!("Updating secret {}/{} for binding {}", namespace, name, binding.name_any());
            Ok(typed::update(store, &existing).await?)
        }
    }
}

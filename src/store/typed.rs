//! Typed access to the store
//!
//! Thin wrappers that convert generated record types to `DynamicObject` and
//! back through serde, so reconcilers work with `ServiceInstance` rather than
//! raw JSON.

use k8s_openapi::api::core::v1::Secret;
use kube::api::{DynamicObject, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Kind, ListOptions, Store};
use crate::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceBroker,
    ServiceClass, ServiceInstance, ServicePlan,
};
use crate::error::Result;

/// A record type the store knows how to hold
pub trait StoreKind:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    const KIND: Kind;
}

macro_rules! store_kind {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(impl StoreKind for $ty {
            const KIND: Kind = $kind;
        })*
    };
}

store_kind! {
    ClusterServiceBroker => Kind::ClusterServiceBroker,
    ServiceBroker => Kind::ServiceBroker,
    ClusterServiceClass => Kind::ClusterServiceClass,
    ServiceClass => Kind::ServiceClass,
    ClusterServicePlan => Kind::ClusterServicePlan,
    ServicePlan => Kind::ServicePlan,
    ServiceInstance => Kind::ServiceInstance,
    ServiceBinding => Kind::ServiceBinding,
    Secret => Kind::Secret,
}

/// Convert a typed record into the store's representation.
pub fn to_dynamic<K: StoreKind>(obj: &K) -> Result<DynamicObject> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(TypeMeta {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        });
    }
    Ok(dynamic)
}

/// Convert a stored record into its typed form.
pub fn from_dynamic<K: StoreKind>(obj: &DynamicObject) -> Result<K> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| K::api_version(&()).to_string().into());
        map.entry("kind").or_insert_with(|| K::kind(&()).to_string().into());
    }
    Ok(serde_json::from_value(value)?)
}

pub async fn get<K: StoreKind>(store: &dyn Store, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
    store
        .get(K::KIND, namespace, name)
        .await?
        .map(|obj| from_dynamic(&obj))
        .transpose()
}

pub async fn list<K: StoreKind>(store: &dyn Store, options: &ListOptions) -> Result<Vec<K>> {
    store
        .list(K::KIND, options)
        .await?
        .iter()
        .map(from_dynamic)
        .collect()
}

pub async fn create<K: StoreKind>(store: &dyn Store, obj: &K) -> Result<K> {
    from_dynamic(&store.create(K::KIND, &to_dynamic(obj)?).await?)
}

pub async fn update<K: StoreKind>(store: &dyn Store, obj: &K) -> Result<K> {
    from_dynamic(&store.update(K::KIND, &to_dynamic(obj)?).await?)
}

pub async fn update_status<K: StoreKind>(store: &dyn Store, obj: &K) -> Result<K> {
    from_dynamic(&store.update_status(K::KIND, &to_dynamic(obj)?).await?)
}

pub async fn delete<K: StoreKind>(store: &dyn Store, namespace: Option<&str>, name: &str) -> Result<()> {
    store.delete(K::KIND, namespace, name).await
}

/// Delete, treating an already-missing record as success.
pub async fn delete_if_exists<K: StoreKind>(store: &dyn Store, namespace: Option<&str>, name: &str) -> Result<()> {
    match store.delete(K::KIND, namespace, name).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ServiceBindingSpec;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn test_binding_roundtrip_through_dynamic() {
        let spec: ServiceBindingSpec =
            serde_json::from_value(serde_json::json!({"instanceRef": {"name": "i1"}})).unwrap();
        let mut binding = ServiceBinding::new("b1", spec);
        binding.metadata.namespace = Some("default".to_string());

        let dynamic = to_dynamic(&binding).unwrap();
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "ServiceBinding");
        assert_eq!(dynamic.data["spec"]["instanceRef"]["name"], "i1");

        let back: ServiceBinding = from_dynamic(&dynamic).unwrap();
        assert_eq!(back.spec.instance_ref.name, "i1");
        assert_eq!(back.metadata.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_secret_roundtrip_through_dynamic() {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("creds".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("password".to_string(), ByteString(b"p".to_vec()))])),
            ..Default::default()
        };
        let dynamic = to_dynamic(&secret).unwrap();
        assert_eq!(dynamic.data["data"]["password"], "cA==");
        let back: Secret = from_dynamic(&dynamic).unwrap();
        assert_eq!(back.data.unwrap()["password"].0, b"p".to_vec());
    }
}

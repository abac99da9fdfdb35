//! In-process store
//!
//! Mirrors the API-server behaviors the reconcilers depend on: generation
//! bumps on spec change only, status writes through a separate call,
//! optimistic concurrency on `resourceVersion`, finalizer-gated deletion and
//! owner-reference garbage collection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DynamicObject, TypeMeta};
use tokio::sync::broadcast;
use tracing::debug;

use super::{Kind, ListOptions, Store, WatchEvent};
use crate::error::{ControllerError, Result};

const WATCH_CAPACITY: usize = 4096;

type ObjectKey = (Kind, Option<String>, String);

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    resource_version: u64,
}

impl MemoryState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Store backed by a map guarded by a mutex. Cloning shares the contents.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    events: broadcast::Sender<(Kind, WatchEvent)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            events,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| ControllerError::invalid_state("memory store lock poisoned"))
    }

    fn emit(&self, events: Vec<(Kind, WatchEvent)>) {
        for event in events {
            // No receivers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Number of records of a kind, for tests and diagnostics.
    pub fn count(&self, kind: Kind) -> usize {
        self.lock()
            .map(|s| s.objects.keys().filter(|(k, _, _)| *k == kind).count())
            .unwrap_or(0)
    }
}

fn key(kind: Kind, namespace: Option<&str>, name: &str) -> ObjectKey {
    let namespace = if kind.is_namespaced() { namespace.map(str::to_string) } else { None };
    (kind, namespace, name.to_string())
}

fn object_key(kind: Kind, obj: &DynamicObject) -> Result<ObjectKey> {
    let name = obj
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ControllerError::invalid_state(format!("{} without a name", kind)))?;
    if kind.is_namespaced() && obj.metadata.namespace.is_none() {
        return Err(ControllerError::invalid_state(format!("{} {} without a namespace", kind, name)));
    }
    Ok(key(kind, obj.metadata.namespace.as_deref(), name))
}

fn describe(key: &ObjectKey) -> String {
    match &key.1 {
        Some(ns) => format!("{} {}/{}", key.0, ns, key.2),
        None => format!("{} {}", key.0, key.2),
    }
}

/// The user-owned part of a record: everything outside metadata and status.
fn spec_part(kind: Kind, obj: &DynamicObject) -> serde_json::Value {
    let mut data = obj.data.clone();
    if kind.has_status() {
        if let Some(map) = data.as_object_mut() {
            map.remove("status");
        }
    }
    data
}

fn has_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

fn check_resource_version(key: &ObjectKey, existing: &DynamicObject, incoming: &DynamicObject) -> Result<()> {
    match incoming.metadata.resource_version.as_deref() {
        Some(rv) if Some(rv) != existing.metadata.resource_version.as_deref() => Err(
            ControllerError::Conflict(format!("{} has been modified; resourceVersion {} is stale", describe(key), rv)),
        ),
        _ => Ok(()),
    }
}

/// Remove a record and everything that (transitively) names it as owner.
/// Dependents with finalizers are only marked for deletion.
fn remove_cascading(state: &mut MemoryState, root: ObjectKey, events: &mut Vec<(Kind, WatchEvent)>) {
    let mut pending = vec![root];
    while let Some(current) = pending.pop() {
        let Some(removed) = state.objects.remove(&current) else {
            continue;
        };
        let uid = removed.metadata.uid.clone();
        events.push((current.0, WatchEvent::Deleted(removed)));

        let Some(uid) = uid else { continue };
        let dependents: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|(_, obj)| {
                obj.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
            })
            .map(|(k, _)| k.clone())
            .collect();

        for dependent in dependents {
            let finalized = state.objects.get(&dependent).is_some_and(has_finalizers);
            if finalized {
                let rv = state.next_resource_version();
                if let Some(obj) = state.objects.get_mut(&dependent) {
                    if obj.metadata.deletion_timestamp.is_none() {
                        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                        obj.metadata.resource_version = Some(rv);
                        events.push((dependent.0, WatchEvent::Modified(obj.clone())));
                    }
                }
            } else {
                pending.push(dependent);
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list(&self, kind: Kind, options: &ListOptions) -> Result<Vec<DynamicObject>> {
        let state = self.lock()?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, _, _), obj)| *k == kind && options.matches(obj))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn get(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        let state = self.lock()?;
        Ok(state.objects.get(&key(kind, namespace, name)).cloned())
    }

    async fn create(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_key(kind, obj)?;
        let created = {
            let mut state = self.lock()?;
            if state.objects.contains_key(&key) {
                return Err(ControllerError::AlreadyExists(describe(&key)));
            }
            let mut created = obj.clone();
            let ar = kind.api_resource();
            created.types = Some(TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            });
            if kind.has_status() {
                if let Some(map) = created.data.as_object_mut() {
                    map.remove("status");
                }
            }
            created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            created.metadata.generation = Some(1);
            created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            created.metadata.deletion_timestamp = None;
            created.metadata.resource_version = Some(state.next_resource_version());
            state.objects.insert(key.clone(), created.clone());
            created
        };
        debug!("Created {}", describe(&key));
        self.emit(vec![(kind, WatchEvent::Added(created.clone()))]);
        Ok(created)
    }

    async fn update(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_key(kind, obj)?;
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock()?;
            let existing = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| ControllerError::NotFound(describe(&key)))?;
            check_resource_version(&key, &existing, obj)?;

            let mut updated = obj.clone();
            updated.types = existing.types.clone();
            updated.metadata.uid = existing.metadata.uid.clone();
            updated.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
            updated.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
            if kind.has_status() {
                if let Some(map) = updated.data.as_object_mut() {
                    match existing.data.get("status") {
                        Some(status) => {
                            map.insert("status".to_string(), status.clone());
                        }
                        None => {
                            map.remove("status");
                        }
                    }
                }
            }
            let generation = existing.metadata.generation.unwrap_or(1);
            updated.metadata.generation = if spec_part(kind, &existing) != spec_part(kind, &updated) {
                Some(generation + 1)
            } else {
                Some(generation)
            };
            updated.metadata.resource_version = Some(state.next_resource_version());

            if updated.metadata.deletion_timestamp.is_some() && !has_finalizers(&updated) {
                state.objects.insert(key.clone(), updated.clone());
                remove_cascading(&mut state, key.clone(), &mut events);
            } else {
                state.objects.insert(key.clone(), updated.clone());
                events.push((kind, WatchEvent::Modified(updated.clone())));
            }
            updated
        };
        self.emit(events);
        Ok(result)
    }

    async fn update_status(&self, kind: Kind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_key(kind, obj)?;
        if !kind.has_status() {
            return Err(ControllerError::invalid_state(format!("{} has no status subresource", kind)));
        }
        let updated = {
            let mut state = self.lock()?;
            let mut updated = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| ControllerError::NotFound(describe(&key)))?;
            check_resource_version(&key, &updated, obj)?;
            if let Some(map) = updated.data.as_object_mut() {
                match obj.data.get("status") {
                    Some(status) => {
                        map.insert("status".to_string(), status.clone());
                    }
                    None => {
                        map.remove("status");
                    }
                }
            }
            updated.metadata.resource_version = Some(state.next_resource_version());
            state.objects.insert(key.clone(), updated.clone());
            updated
        };
        self.emit(vec![(kind, WatchEvent::Modified(updated.clone()))]);
        Ok(updated)
    }

    async fn delete(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = key(kind, namespace, name);
        let mut events = Vec::new();
        {
            let mut state = self.lock()?;
            let existing = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| ControllerError::NotFound(describe(&key)))?;
            if has_finalizers(&existing) {
                if existing.metadata.deletion_timestamp.is_none() {
                    let rv = state.next_resource_version();
                    if let Some(obj) = state.objects.get_mut(&key) {
                        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                        obj.metadata.resource_version = Some(rv);
                        events.push((kind, WatchEvent::Modified(obj.clone())));
                    }
                }
            } else {
                remove_cascading(&mut state, key.clone(), &mut events);
            }
        }
        debug!("Deleted {}", describe(&key));
        self.emit(events);
        Ok(())
    }

    async fn watch(&self, kind: Kind) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        // Subscribe before listing so nothing between the two is lost.
        let receiver = self.events.subscribe();
        let initial: Vec<Result<WatchEvent>> = self
            .list(kind, &ListOptions::all())
            .await?
            .into_iter()
            .map(|obj| Ok(WatchEvent::Added(obj)))
            .collect();

        let live = stream::unfold(receiver, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok((k, event)) if k == kind => return Some((Ok(event), rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Watch on {} lagged by {} events", kind, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(initial).chain(live).boxed())
    }
}

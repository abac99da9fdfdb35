//! Catalog reconciler
//!
//! Fetches a broker's catalog and materializes it as classes and plans in the
//! broker's scope. Entries that disappear from the catalog are marked removed,
//! never deleted, so instances that still reference them can report a clear
//! error. Deleting the broker deletes its classes and plans before the
//! finalizer is released.

use std::collections::HashMap;
use std::time::Duration;

use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{add_finalizer, elapsed_since, has_finalizer, now_rfc3339, remove_finalizer, Action, BrokerEndpoint, Context};
use crate::conditions::{
    build_condition, condition_reason, is_condition_true, last_condition_state, remove_condition, set_condition,
    CONDITION_FALSE, CONDITION_READY, CONDITION_REMOVED_FROM_BROKER_CATALOG, CONDITION_TRUE, REASON_AUTH,
    REASON_ERROR_DELETING_CATALOG, REASON_ERROR_FETCHING_CATALOG, REASON_ERROR_GETTING_AUTH_CREDENTIALS,
    REASON_ERROR_SYNCING_CATALOG, REASON_FETCHED_CATALOG, REASON_FETCH_FAILED, REASON_REMOVED_FROM_CATALOG,
};
use crate::crd::{
    BrokerResource, BrokerStatus, ClassResource, CommonServiceClassSpec, CommonServicePlanSpec, PlanResource,
    LABEL_BROKER_NAME, LABEL_CLASS_NAME,
};
use crate::error::{ControllerError, Result};
use crate::osb::{BrokerError, CatalogResponse, ErrorDisposition, Plan, Service};
use crate::store::{typed, ListOptions, StoreKind};

const MAX_NAME_LENGTH: usize = 63;

/// Record name for a catalog entry: the external id when it is a valid DNS
/// label, otherwise a digest of it.
pub fn entry_name(external_id: &str) -> String {
    if is_dns_label(external_id) {
        return external_id.to_string();
    }
    let digest = format!("{:x}", Sha256::digest(external_id.as_bytes()));
    digest[..MAX_NAME_LENGTH].to_string()
}

fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_NAME_LENGTH
        && bytes.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

pub fn project_class(service: &Service) -> CommonServiceClassSpec {
    CommonServiceClassSpec {
        external_name: service.name.clone(),
        external_id: service.id.clone(),
        description: service.description.clone(),
        bindable: service.bindable,
        binding_retrievable: service.bindings_retrievable,
        plan_updatable: service.plan_updateable.unwrap_or(false),
        tags: service.tags.clone(),
        requires: service.requires.clone(),
        external_metadata: service.metadata.clone(),
    }
}

pub fn project_plan(plan: &Plan) -> CommonServicePlanSpec {
    let schemas = plan.schemas.clone().unwrap_or_default();
    let instance = schemas.service_instance.unwrap_or_default();
    let binding = schemas.service_binding.unwrap_or_default();
    CommonServicePlanSpec {
        external_name: plan.name.clone(),
        external_id: plan.id.clone(),
        description: plan.description.clone(),
        bindable: plan.bindable,
        free: plan.free.unwrap_or(true),
        external_metadata: plan.metadata.clone(),
        instance_create_parameter_schema: instance.create.and_then(|s| s.parameters),
        instance_update_parameter_schema: instance.update.and_then(|s| s.parameters),
        service_binding_create_parameter_schema: binding.create.and_then(|s| s.parameters),
    }
}

/// Desired classes and plans of a catalog: `(record name, spec)` and
/// `(record name, class record name, spec)`.
pub type DesiredCatalog = (
    Vec<(String, CommonServiceClassSpec)>,
    Vec<(String, String, CommonServicePlanSpec)>,
);

pub fn project_catalog(catalog: &CatalogResponse) -> DesiredCatalog {
    let mut classes = Vec::new();
    let mut plans = Vec::new();
    for service in &catalog.services {
        let class_name = entry_name(&service.id);
        classes.push((class_name.clone(), project_class(service)));
        for plan in &service.plans {
            plans.push((entry_name(&plan.id), class_name.clone(), project_plan(plan)));
        }
    }
    (classes, plans)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchDecision {
    Fetch,
    Wait(Duration),
    Idle,
}

fn fetch_decision<B: BrokerResource + Resource>(broker: &B) -> FetchDecision {
    let Some(status) = broker.broker_status() else {
        return FetchDecision::Fetch;
    };
    let generation = broker.meta().generation.unwrap_or(0);
    if status.reconciled_generation != generation {
        return FetchDecision::Fetch;
    }
    if is_condition_true(&status.conditions, CONDITION_READY) {
        return match broker.relist_interval() {
            None => FetchDecision::Idle,
            Some(interval) => match elapsed_since(status.last_catalog_retrieval_time.as_deref()) {
                Some(elapsed) if elapsed < interval => FetchDecision::Wait(interval - elapsed),
                _ => FetchDecision::Fetch,
            },
        };
    }
    match condition_reason(&status.conditions, CONDITION_READY) {
        // Terminal until the spec changes.
        Some(REASON_ERROR_FETCHING_CATALOG) | Some(REASON_AUTH) => FetchDecision::Idle,
        _ => FetchDecision::Fetch,
    }
}

async fn write_status<B>(ctx: &Context, broker: &mut B, update: impl FnOnce(&mut BrokerStatus)) -> Result<()>
where
    B: StoreKind + BrokerResource,
{
    let before = broker.broker_status().cloned();
    let status = broker.broker_status_mut();
    update(status);
    status.last_condition_state = last_condition_state(&status.conditions);
    if before.as_ref() == broker.broker_status() {
        return Ok(());
    }
    *broker = typed::update_status(ctx.store(), broker).await?;
    Ok(())
}

async fn set_ready<B>(ctx: &Context, broker: &mut B, status: &str, reason: &str, message: &str) -> Result<()>
where
    B: StoreKind + BrokerResource,
{
    let condition = build_condition(CONDITION_READY, status, reason, message);
    write_status(ctx, broker, |s| set_condition(&mut s.conditions, condition)).await
}

/// Reconcile a broker of either scope together with its class and plan kinds.
pub async fn reconcile_broker<B, C, P>(ctx: &Context, namespace: Option<&str>, name: &str) -> Result<Action>
where
    B: StoreKind + BrokerResource,
    C: StoreKind + ClassResource,
    P: StoreKind + PlanResource,
{
    let Some(mut broker) = typed::get::<B>(ctx.store(), namespace, name).await? else {
        debug!("{} {} no longer exists", B::KIND, name);
        return Ok(Action::await_change());
    };

    info!("Reconciling {} {}", B::KIND, display_name(namespace, name));

    if broker.meta().deletion_timestamp.is_some() {
        return handle_deletion::<B, C, P>(ctx, broker, namespace, name).await;
    }

    if add_finalizer(&mut broker) {
        broker = typed::update(ctx.store(), &broker).await?;
    }

    match fetch_decision(&broker) {
        FetchDecision::Fetch => {}
        FetchDecision::Wait(delay) => return Ok(Action::requeue(delay)),
        FetchDecision::Idle => return Ok(Action::await_change()),
    }

    let endpoint = BrokerEndpoint::from_broker(&broker);
    let client = match ctx.brokers.client_for(&endpoint).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot build client for broker {}: {}", endpoint.name, e);
            let message = format!("Error getting broker auth credentials: {}", e);
            set_ready(ctx, &mut broker, CONDITION_FALSE, REASON_ERROR_GETTING_AUTH_CREDENTIALS, &message).await?;
            return Err(e);
        }
    };

    let catalog = match client.get_catalog().await {
        Ok(catalog) => catalog,
        Err(e) => return handle_fetch_error(ctx, &mut broker, &endpoint, e).await,
    };
    info!(
        "Fetched catalog from broker {}: {} services",
        endpoint.name,
        catalog.services.len()
    );

    let (classes, plans) = project_catalog(&catalog);
    if let Err(e) = sync_catalog::<B, C, P>(ctx, &broker, namespace, name, classes, plans).await {
        warn!("Error syncing catalog of broker {}: {}", endpoint.name, e);
        let message = format!("Error syncing catalog from broker: {}", e);
        set_ready(ctx, &mut broker, CONDITION_FALSE, REASON_ERROR_SYNCING_CATALOG, &message).await?;
        return Err(e);
    }

    let generation = broker.meta().generation.unwrap_or(0);
    let condition = build_condition(
        CONDITION_READY,
        CONDITION_TRUE,
        REASON_FETCHED_CATALOG,
        "Successfully fetched catalog entries from broker",
    );
    let retrieved_at = now_rfc3339();
    write_status(ctx, &mut broker, |s| {
        set_condition(&mut s.conditions, condition);
        s.last_catalog_retrieval_time = Some(retrieved_at);
        s.observed_generation = generation;
        s.reconciled_generation = generation;
    })
    .await?;

    Ok(match broker.relist_interval() {
        Some(interval) => Action::requeue(interval),
        None => Action::await_change(),
    })
}

async fn handle_fetch_error<B>(ctx: &Context, broker: &mut B, endpoint: &BrokerEndpoint, err: BrokerError) -> Result<Action>
where
    B: StoreKind + BrokerResource,
{
    match err.read_disposition() {
        ErrorDisposition::Transient => {
            warn!("Broker {} unreachable: {}", endpoint.name, err);
            let message = format!("Error fetching catalog: {}", err);
            set_ready(ctx, broker, CONDITION_FALSE, REASON_FETCH_FAILED, &message).await?;
            Err(err.into())
        }
        _ => {
            warn!("Fetching catalog from broker {} failed: {}", endpoint.name, err);
            let reason = match err {
                BrokerError::Auth { .. } => REASON_AUTH,
                _ => REASON_ERROR_FETCHING_CATALOG,
            };
            let generation = broker.meta().generation.unwrap_or(0);
            let condition = build_condition(CONDITION_READY, CONDITION_FALSE, reason, &format!("Error fetching catalog: {}", err));
            write_status(ctx, broker, |s| {
                set_condition(&mut s.conditions, condition);
                s.reconciled_generation = generation;
            })
            .await?;
            Ok(Action::await_change())
        }
    }
}

fn display_name(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

fn entry_labels(broker_name: &str, class_name: Option<&str>) -> std::collections::BTreeMap<String, String> {
    let mut labels = std::collections::BTreeMap::from([(LABEL_BROKER_NAME.to_string(), broker_name.to_string())]);
    if let Some(class) = class_name {
        labels.insert(LABEL_CLASS_NAME.to_string(), class.to_string());
    }
    labels
}

/// Point a class or plan at its broker: labels plus a controller owner
/// reference. Returns whether anything changed.
fn link_to_broker<K: Resource, B: Resource<DynamicType = ()>>(
    entry: &mut K,
    broker: &B,
    broker_name: &str,
    class_name: Option<&str>,
) -> bool {
    let mut changed = false;
    let labels = entry.meta_mut().labels.get_or_insert_with(Default::default);
    for (k, v) in entry_labels(broker_name, class_name) {
        if labels.get(&k) != Some(&v) {
            labels.insert(k, v);
            changed = true;
        }
    }
    if let Some(owner) = broker.controller_owner_ref(&()) {
        let refs = entry.meta_mut().owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.retain(|r| r.controller != Some(true));
            refs.push(owner);
            changed = true;
        }
    }
    changed
}

fn mark_removed(status: &mut crate::crd::CatalogEntryStatus, removed: bool) {
    status.removed_from_broker_catalog = removed;
    if removed {
        set_condition(
            &mut status.conditions,
            build_condition(
                CONDITION_REMOVED_FROM_BROKER_CATALOG,
                CONDITION_TRUE,
                REASON_REMOVED_FROM_CATALOG,
                "The entry is no longer offered by the broker",
            ),
        );
    } else {
        remove_condition(&mut status.conditions, CONDITION_REMOVED_FROM_BROKER_CATALOG);
    }
}

async fn sync_catalog<B, C, P>(
    ctx: &Context,
    broker: &B,
    namespace: Option<&str>,
    broker_name: &str,
    classes: Vec<(String, CommonServiceClassSpec)>,
    plans: Vec<(String, String, CommonServicePlanSpec)>,
) -> Result<()>
where
    B: StoreKind + BrokerResource,
    C: StoreKind + ClassResource,
    P: StoreKind + PlanResource,
{
    let store = ctx.store();
    let owned = ListOptions::in_scope(namespace).label(LABEL_BROKER_NAME, broker_name);

    // Entries are written one at a time in catalog order, creates and updates
    // interleaved. A store error stops the pass and the next resync finishes
    // it. All classes go in before any plan.

    // Classes
    let mut existing: HashMap<String, C> = typed::list::<C>(store, &owned)
        .await?
        .into_iter()
        .map(|c| (c.class_spec().external_id.clone(), c))
        .collect();
    let mut created = 0;
    let mut updated = 0;
    for (name, spec) in classes {
        let current = match existing.remove(&spec.external_id) {
            Some(current) => Some(current),
            None => typed::get::<C>(store, namespace, &name).await?,
        };
        match current {
            None => {
                let mut class = C::build(&name, namespace, broker_name, spec);
                link_to_broker(&mut class, broker, broker_name, None);
                typed::create(store, &class).await?;
                created += 1;
            }
            Some(mut class) => {
                if class.broker_name() != broker_name {
                    return Err(ControllerError::reconciliation(format!(
                        "{} {} already belongs to broker {}",
                        C::KIND,
                        name,
                        class.broker_name()
                    )));
                }
                let relinked = link_to_broker(&mut class, broker, broker_name, None);
                if relinked || class.class_spec() != &spec {
                    *class.class_spec_mut() = spec;
                    class = typed::update(store, &class).await?;
                    updated += 1;
                }
                if class.is_removed_from_catalog() {
                    mark_removed(class.entry_status_mut(), false);
                    typed::update_status(store, &class).await?;
                }
            }
        }
    }
    let mut removed = 0;
    for (_, mut class) in existing {
        if !class.is_removed_from_catalog() {
            mark_removed(class.entry_status_mut(), true);
            typed::update_status(store, &class).await?;
            removed += 1;
        }
    }
    debug!(
        "Broker {}: classes created={} updated={} removed={}",
        broker_name, created, updated, removed
    );

    // Plans
    let mut existing: HashMap<String, P> = typed::list::<P>(store, &owned)
        .await?
        .into_iter()
        .map(|p| (p.plan_spec().external_id.clone(), p))
        .collect();
    for (name, class_name, spec) in plans {
        let current = match existing.remove(&spec.external_id) {
            Some(current) => Some(current),
            None => typed::get::<P>(store, namespace, &name).await?,
        };
        match current {
            None => {
                let mut plan = P::build(&name, namespace, broker_name, &class_name, spec);
                link_to_broker(&mut plan, broker, broker_name, Some(&class_name));
                typed::create(store, &plan).await?;
            }
            Some(mut plan) => {
                if plan.broker_name() != broker_name {
                    return Err(ControllerError::reconciliation(format!(
                        "{} {} already belongs to broker {}",
                        P::KIND,
                        name,
                        plan.broker_name()
                    )));
                }
                let relinked = link_to_broker(&mut plan, broker, broker_name, Some(&class_name));
                if relinked || plan.plan_spec() != &spec || plan.class_name() != class_name {
                    *plan.plan_spec_mut() = spec;
                    plan.set_class_name(&class_name);
                    plan = typed::update(store, &plan).await?;
                }
                if plan.is_removed_from_catalog() {
                    mark_removed(plan.entry_status_mut(), false);
                    typed::update_status(store, &plan).await?;
                }
            }
        }
    }
    for (_, mut plan) in existing {
        if !plan.is_removed_from_catalog() {
            mark_removed(plan.entry_status_mut(), true);
            typed::update_status(store, &plan).await?;
        }
    }
    Ok(())
}

async fn handle_deletion<B, C, P>(ctx: &Context, mut broker: B, namespace: Option<&str>, name: &str) -> Result<Action>
where
    B: StoreKind + BrokerResource,
    C: StoreKind + ClassResource,
    P: StoreKind + PlanResource,
{
    if !has_finalizer(&broker) {
        return Ok(Action::await_change());
    }
    info!("Handling deletion of {} {}", B::KIND, display_name(namespace, name));

    let store = ctx.store();
    let owned = ListOptions::in_scope(namespace).label(LABEL_BROKER_NAME, name);
    let result: Result<usize> = async {
        for plan in typed::list::<P>(store, &owned).await? {
            typed::delete_if_exists::<P>(store, namespace, &plan.name_any()).await?;
        }
        for class in typed::list::<C>(store, &owned).await? {
            typed::delete_if_exists::<C>(store, namespace, &class.name_any()).await?;
        }
        let remaining = typed::list::<P>(store, &owned).await?.len() + typed::list::<C>(store, &owned).await?.len();
        Ok(remaining)
    }
    .await;

    match result {
        Ok(0) => {
            remove_finalizer(store, &broker).await?;
            info!("Finalizer removed for {} {}", B::KIND, display_name(namespace, name));
            Ok(Action::await_change())
        }
        Ok(remaining) => {
            debug!("{} catalog entries of broker {} still present", remaining, name);
            Ok(Action::requeue(ctx.config.pending_retry_interval))
        }
        Err(e) => {
            let message = format!("Error deleting catalog entries: {}", e);
            set_ready(ctx, &mut broker, CONDITION_FALSE, REASON_ERROR_DELETING_CATALOG, &message).await?;
            Err(e)
        }
    }
}

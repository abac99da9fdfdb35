//! Instance reconciler
//!
//! Drives a ServiceInstance through provision, update and deprovision at its
//! broker. Every pass performs at most one broker call. Before a call that
//! may allocate, the intent is written to status so a crash between the call
//! and the status write is detected as a resend on the next pass.

use std::time::Duration;

use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::{
    add_finalizer, build_parameters, elapsed_since, has_finalizer, now_rfc3339, parameters_checksum,
    remove_finalizer, Action, BrokerEndpoint, Context,
};
use crate::conditions::*;
use crate::crd::{
    BrokerResource, ClassResource, ClusterObjectReference, ClusterServiceBroker, ClusterServiceClass,
    ClusterServicePlan, CommonServiceClassSpec, CommonServicePlanSpec, DeprovisionStatus, EntrySelector,
    InstanceProperties, LastOperation, LocalObjectReference, OperationKind, OperationState, PlanReference,
    PlanResource, ProvisionStatus, ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance,
    ServiceInstanceSpec, ServiceInstanceStatus, ServicePlan,
};
use crate::error::{ControllerError, Result};
use crate::osb::{
    parameters_to_wire, BrokerClient, BrokerError, DeprovisionRequest, ErrorDisposition, LastOperationRequest,
    LastOperationResponse, LastOperationState, PlatformContext, PreviousValues, ProvisionRequest,
    UpdateInstanceRequest,
};
use crate::store::{typed, ListOptions, StoreKind};
use crate::validation::{
    validate_against_provisioned, validate_instance_update, validate_plan_reference, ValidationError,
};

/// Where an instance stands, derived from its record alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Deleting,
    OrphanMitigation,
    PollingProvision,
    PollingUpdate,
    Provisioning,
    Updating,
    NoOp,
}

pub fn determine_state(instance: &ServiceInstance) -> InstanceState {
    if instance.meta().deletion_timestamp.is_some() {
        return InstanceState::Deleting;
    }
    let default_status = ServiceInstanceStatus::default();
    let status = instance.status.as_ref().unwrap_or(&default_status);
    if status.orphan_mitigation_in_progress {
        return InstanceState::OrphanMitigation;
    }
    if status.async_op_in_progress {
        match status.last_operation.as_ref().map(|op| op.operation) {
            Some(OperationKind::Provision) => return InstanceState::PollingProvision,
            Some(OperationKind::Update) => return InstanceState::PollingUpdate,
            _ => {}
        }
    }
    let generation = instance.meta().generation.unwrap_or(0);
    if is_condition_true(&status.conditions, CONDITION_FAILED) && status.observed_generation == generation {
        return InstanceState::NoOp;
    }
    if status.provision_status == ProvisionStatus::NotProvisioned {
        return InstanceState::Provisioning;
    }
    let applied_requests = status.external_properties.as_ref().map_or(0, |p| p.update_requests);
    if generation > status.observed_generation || instance.spec.update_requests > applied_requests {
        return InstanceState::Updating;
    }
    InstanceState::NoOp
}

/// A plan reference resolved against the catalog.
#[derive(Debug, Clone)]
struct Resolved {
    class_name: String,
    class: CommonServiceClassSpec,
    class_removed: bool,
    plan_name: String,
    plan: CommonServicePlanSpec,
    plan_removed: bool,
    endpoint: BrokerEndpoint,
}

#[derive(Debug, Clone)]
struct Unresolved {
    reason: &'static str,
    message: String,
}

type Resolution = std::result::Result<Resolved, Unresolved>;

fn matches_selector(selector: &EntrySelector, name: &str, external_name: &str, external_id: &str) -> bool {
    match selector {
        EntrySelector::Name(v) => v == name,
        EntrySelector::ExternalName(v) => v == external_name,
        EntrySelector::ExternalId(v) => v == external_id,
    }
}

async fn resolve_in_scope<B, C, P>(ctx: &Context, namespace: Option<&str>, reference: &PlanReference) -> Result<Resolution>
where
    B: StoreKind + BrokerResource,
    C: StoreKind + ClassResource,
    P: StoreKind + PlanResource,
{
    let store = ctx.store();
    let (Some(class_selector), Some(plan_selector)) = (reference.class_selector(), reference.plan_selector()) else {
        return Ok(Err(Unresolved {
            reason: REASON_INVALID_SPEC_CHANGE,
            message: ValidationError::MissingReference.to_string(),
        }));
    };

    let classes: Vec<C> = typed::list::<C>(store, &ListOptions::in_scope(namespace))
        .await?
        .into_iter()
        .filter(|c| {
            let spec = c.class_spec();
            matches_selector(&class_selector, &c.name_any(), &spec.external_name, &spec.external_id)
        })
        .collect();
    let class = match classes.as_slice() {
        [class] => class,
        [] => {
            return Ok(Err(Unresolved {
                reason: REASON_REFERENCES_NONEXISTENT_SERVICE_CLASS,
                message: format!("references a non-existent {} {:?}", C::KIND, class_selector.value()),
            }))
        }
        _ => {
            return Ok(Err(Unresolved {
                reason: REASON_REFERENCES_NONEXISTENT_SERVICE_CLASS,
                message: format!("{} {:?} matches more than one {}", C::KIND, class_selector.value(), C::KIND),
            }))
        }
    };
    let class_name = class.name_any();

    let plans: Vec<P> = typed::list::<P>(store, &ListOptions::in_scope(namespace))
        .await?
        .into_iter()
        .filter(|p| {
            let spec = p.plan_spec();
            p.class_name() == class_name
                && matches_selector(&plan_selector, &p.name_any(), &spec.external_name, &spec.external_id)
        })
        .collect();
    let [plan] = plans.as_slice() else {
        return Ok(Err(Unresolved {
            reason: REASON_REFERENCES_NONEXISTENT_SERVICE_PLAN,
            message: format!(
                "references a non-existent {} {:?} of class {}",
                P::KIND,
                plan_selector.value(),
                class_name
            ),
        }));
    };

    let Some(broker) = typed::get::<B>(store, namespace, class.broker_name()).await? else {
        return Ok(Err(Unresolved {
            reason: REASON_REFERENCES_NONEXISTENT_BROKER,
            message: format!("references a non-existent {} {}", B::KIND, class.broker_name()),
        }));
    };

    Ok(Ok(Resolved {
        class_name: class_name.clone(),
        class: class.class_spec().clone(),
        class_removed: class.is_removed_from_catalog(),
        plan_name: plan.name_any(),
        plan: plan.plan_spec().clone(),
        plan_removed: plan.is_removed_from_catalog(),
        endpoint: BrokerEndpoint::from_broker(&broker),
    }))
}

/// One reconciliation pass over an instance. Tracks the last persisted
/// status so unchanged status is never rewritten.
struct InstancePass<'a> {
    ctx: &'a Context,
    instance: ServiceInstance,
    persisted: Option<ServiceInstanceStatus>,
    persisted_spec: ServiceInstanceSpec,
}

impl<'a> InstancePass<'a> {
    fn new(ctx: &'a Context, instance: ServiceInstance) -> Self {
        let persisted = instance.status.clone();
        let persisted_spec = instance.spec.clone();
        Self {
            ctx,
            instance,
            persisted,
            persisted_spec,
        }
    }

    fn namespace(&self) -> String {
        self.instance.namespace().unwrap_or_default()
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.instance.name_any())
    }

    fn generation(&self) -> i64 {
        self.instance.meta().generation.unwrap_or(0)
    }

    fn external_id(&self) -> String {
        self.instance.spec.external_id.clone()
    }

    fn status(&mut self) -> &mut ServiceInstanceStatus {
        self.instance.status.get_or_insert_with(ServiceInstanceStatus::default)
    }

    fn status_ref(&self) -> Option<&ServiceInstanceStatus> {
        self.instance.status.as_ref()
    }

    fn set_ready(&mut self, status: &str, reason: &str, message: &str) {
        let condition = build_condition(CONDITION_READY, status, reason, message);
        set_condition(&mut self.status().conditions, condition);
    }

    fn set_failed(&mut self, reason: &str, message: &str) {
        let condition = build_condition(CONDITION_FAILED, CONDITION_TRUE, reason, message);
        set_condition(&mut self.status().conditions, condition);
    }

    fn clear_failed(&mut self) {
        remove_condition(&mut self.status().conditions, CONDITION_FAILED);
    }

    fn mark_observed(&mut self) {
        let generation = self.generation();
        self.status().observed_generation = generation;
    }

    async fn save_status(&mut self) -> Result<()> {
        self.instance.recalculate_printer_columns();
        if self.instance.status == self.persisted {
            return Ok(());
        }
        self.instance = typed::update_status(self.ctx.store(), &self.instance).await?;
        self.persisted = self.instance.status.clone();
        Ok(())
    }

    /// Persist controller-owned spec fields. Local status changes survive.
    async fn save_spec(&mut self) -> Result<()> {
        validate_instance_update(&self.persisted_spec, &self.instance.spec)
            .map_err(|e| ControllerError::invalid_state(format!("instance {}: {}", self.key(), e)))?;
        let local_status = self.instance.status.clone();
        self.instance = typed::update(self.ctx.store(), &self.instance).await?;
        self.instance.status = local_status;
        self.persisted_spec = self.instance.spec.clone();
        Ok(())
    }

    /// Terminal failure that needs a spec change to clear.
    async fn fail(&mut self, reason: &str, message: &str) -> Result<Action> {
        warn!("Instance {} failed: {}: {}", self.key(), reason, message);
        self.set_ready(CONDITION_FALSE, reason, message);
        self.set_failed(reason, message);
        let status = self.status();
        status.async_op_in_progress = false;
        status.operation_start_time = None;
        if let Some(op) = status.last_operation.as_mut() {
            op.state = OperationState::Failed;
        }
        self.mark_observed();
        self.save_status().await?;
        Ok(Action::await_change())
    }

    /// Dependency not there yet; recheck later.
    async fn pending(&mut self, unresolved: Unresolved) -> Result<Action> {
        info!("Instance {} waiting: {}", self.key(), unresolved.message);
        self.set_ready(CONDITION_FALSE, unresolved.reason, &unresolved.message);
        self.save_status().await?;
        Ok(Action::requeue(self.ctx.config.pending_retry_interval))
    }

    async fn client(&mut self, endpoint: &BrokerEndpoint) -> Result<std::sync::Arc<dyn BrokerClient>> {
        match self.ctx.brokers.client_for(endpoint).await {
            Ok(client) => Ok(client),
            Err(e) => {
                let message = format!("Error getting broker client for {}: {}", endpoint.name, e);
                self.set_ready(CONDITION_FALSE, REASON_ERROR_GETTING_AUTH_CREDENTIALS, &message);
                self.save_status().await?;
                Err(e)
            }
        }
    }

    async fn resolve_reference(&self) -> Result<Resolution> {
        let reference = &self.instance.spec.plan_reference;
        if reference.is_namespaced() {
            let namespace = self.namespace();
            resolve_in_scope::<ServiceBroker, ServiceClass, ServicePlan>(self.ctx, Some(&namespace), reference).await
        } else {
            resolve_in_scope::<ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan>(self.ctx, None, reference)
                .await
        }
    }

    async fn endpoint_for_applied(&self) -> Result<std::result::Result<BrokerEndpoint, Unresolved>> {
        Ok(self.resolve_reference().await?.map(|r| r.endpoint))
    }

    fn context(&self) -> PlatformContext {
        PlatformContext::kubernetes(&self.namespace(), &self.ctx.config.cluster_id)
    }

    /// Properties describing what is, or is about to be, at the broker.
    fn broker_properties(&self) -> Option<InstanceProperties> {
        let status = self.status_ref()?;
        status
            .in_progress_properties
            .clone()
            .or_else(|| status.external_properties.clone())
    }

    fn retry_window_exceeded(&self) -> bool {
        let started = self.status_ref().and_then(|s| s.operation_start_time.as_deref());
        elapsed_since(started).is_some_and(|elapsed| elapsed > self.ctx.config.reconciliation_retry_duration)
    }

    fn poll_delay(&self, response: &LastOperationResponse) -> Duration {
        self.ctx.config.poll_interval(response.poll_delay)
    }

    /// Resolve the plan reference and record the resolved names in the spec.
    async fn resolve(&mut self) -> Result<Resolution> {
        let resolved = match self.resolve_reference().await? {
            Ok(resolved) => resolved,
            Err(unresolved) => return Ok(Err(unresolved)),
        };

        let before = self.instance.spec.clone();
        let namespaced = self.instance.spec.plan_reference.is_namespaced();
        let spec = &mut self.instance.spec;
        if namespaced {
            spec.service_class_ref = Some(LocalObjectReference {
                name: resolved.class_name.clone(),
            });
            spec.service_plan_ref = Some(LocalObjectReference {
                name: resolved.plan_name.clone(),
            });
        } else {
            spec.cluster_service_class_ref = Some(ClusterObjectReference {
                name: resolved.class_name.clone(),
            });
            spec.cluster_service_plan_ref = Some(ClusterObjectReference {
                name: resolved.plan_name.clone(),
            });
        }
        if self.instance.spec != before {
            debug!(
                "Instance {} resolved to class {} plan {}",
                self.key(),
                resolved.class_name,
                resolved.plan_name
            );
            self.save_spec().await?;
        }
        Ok(Ok(resolved))
    }

    async fn parameters(&mut self) -> Result<std::result::Result<Option<serde_json::Value>, String>> {
        let namespace = self.namespace();
        let built = build_parameters(
            self.ctx.store(),
            &namespace,
            self.instance.spec.parameters.as_ref(),
            &self.instance.spec.parameters_from,
        )
        .await?;
        Ok(built.map_err(|e| e.to_string()))
    }

    fn desired_properties(&self, resolved: &Resolved, checksum: Option<String>) -> InstanceProperties {
        InstanceProperties {
            external_id: self.external_id(),
            class_external_id: resolved.class.external_id.clone(),
            class_external_name: resolved.class.external_name.clone(),
            plan_external_id: resolved.plan.external_id.clone(),
            plan_external_name: resolved.plan.external_name.clone(),
            parameters_checksum: checksum,
            update_requests: self.instance.spec.update_requests,
        }
    }

    /// Write the intent of an operation before calling the broker.
    fn begin_operation(&mut self, kind: OperationKind, properties: Option<InstanceProperties>) {
        let status = self.status();
        let resend = status.last_operation.as_ref().is_some_and(|op| op.is_in_progress(kind));
        if !resend || status.operation_start_time.is_none() {
            status.operation_start_time = Some(now_rfc3339());
        }
        status.last_operation = Some(LastOperation::in_progress(kind));
        status.async_op_in_progress = false;
        if properties.is_some() {
            status.in_progress_properties = properties;
        }
    }

    fn begin_async(&mut self, operation_key: Option<String>) {
        let status = self.status();
        status.async_op_in_progress = true;
        if let Some(op) = status.last_operation.as_mut() {
            op.operation_key = operation_key.filter(|k| !k.is_empty());
        }
    }

    fn complete_operation(&mut self) {
        let status = self.status();
        status.async_op_in_progress = false;
        status.operation_start_time = None;
        if let Some(op) = status.last_operation.as_mut() {
            op.state = OperationState::Succeeded;
            op.operation_key = None;
        }
    }

    // Provision

    async fn provision(&mut self) -> Result<Action> {
        let resolved = match self.resolve().await? {
            Ok(resolved) => resolved,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        if resolved.plan_removed || resolved.class_removed {
            let message = format!(
                "Plan {} of class {} has been removed from the broker catalog; provisioning is not allowed",
                resolved.plan.external_name, resolved.class.external_name
            );
            return self.fail(REASON_REFERENCES_DELETED_SERVICE_PLAN, &message).await;
        }
        let parameters = match self.parameters().await? {
            Ok(parameters) => parameters,
            Err(message) => return self.fail(REASON_ERROR_WITH_PARAMETERS, &message).await,
        };
        let wire_parameters = match parameters_to_wire(parameters.as_ref()) {
            Ok(p) => p,
            Err(e) => return self.fail(REASON_ERROR_WITH_PARAMETERS, &e.to_string()).await,
        };
        let checksum = parameters_checksum(parameters.as_ref());
        let desired = self.desired_properties(&resolved, checksum);

        // A request was in flight when the previous pass ended.
        let resend = self.status_ref().is_some_and(|s| {
            s.last_operation.as_ref().is_some_and(|op| op.is_in_progress(OperationKind::Provision))
                && s.in_progress_properties.as_ref() == Some(&desired)
        });

        let client = self.client(&resolved.endpoint).await?;

        self.clear_failed();
        self.begin_operation(OperationKind::Provision, Some(desired));
        self.status().deprovision_status = DeprovisionStatus::Required;
        self.set_ready(
            CONDITION_FALSE,
            REASON_PROVISION_REQUEST_IN_FLIGHT,
            "Provision request for ServiceInstance in-flight to Broker",
        );
        self.save_status().await?;

        let request = ProvisionRequest {
            instance_id: self.external_id(),
            accepts_incomplete: true,
            service_id: resolved.class.external_id.clone(),
            plan_id: resolved.plan.external_id.clone(),
            organization_guid: self.ctx.config.cluster_id.clone(),
            space_guid: self.namespace(),
            parameters: wire_parameters,
            context: Some(self.context()),
        };
        info!(
            "Provisioning instance {} at broker {} (service {}, plan {})",
            self.key(),
            resolved.endpoint.name,
            request.service_id,
            request.plan_id
        );

        match client.provision_instance(&request).await {
            Ok(response) if response.is_async() => {
                info!("Instance {} provisioning asynchronously", self.key());
                self.begin_async(response.operation_key);
                if response.dashboard_url.is_some() {
                    self.status().dashboard_url = response.dashboard_url;
                }
                self.set_ready(
                    CONDITION_FALSE,
                    REASON_PROVISIONING,
                    "The instance is being provisioned asynchronously",
                );
                self.save_status().await?;
                Ok(Action::requeue(self.ctx.config.poll_interval(None)))
            }
            Ok(response) => self.finish_provision(response.dashboard_url).await,
            Err(BrokerError::Conflict { .. }) if resend => {
                info!("Instance {} already exists at the broker with the same request", self.key());
                self.finish_provision(None).await
            }
            Err(e) => self.provision_failed(e).await,
        }
    }

    async fn provision_failed(&mut self, err: BrokerError) -> Result<Action> {
        match err.allocation_disposition() {
            ErrorDisposition::Transient if self.retry_window_exceeded() => {
                let message = format!("Stopped retrying provision after the reconciliation retry duration: {}", err);
                self.start_orphan_mitigation(REASON_RECONCILIATION_RETRY_TIMEOUT, &message).await
            }
            ErrorDisposition::Transient => {
                warn!("Provision of instance {} will be retried: {}", self.key(), err);
                self.set_ready(CONDITION_FALSE, err.reason(), &format!("Error provisioning: {}", err));
                self.save_status().await?;
                Err(err.into())
            }
            ErrorDisposition::OrphanMitigation => {
                let message = format!("Provision call failed and may have left an allocation: {}", err);
                self.start_orphan_mitigation(REASON_STARTING_ORPHAN_MITIGATION, &message).await
            }
            ErrorDisposition::Terminal | ErrorDisposition::Success => {
                self.status().deprovision_status = DeprovisionStatus::NotRequired;
                self.status().in_progress_properties = None;
                let message = format!("Provision call failed: {}", err);
                self.fail(REASON_PROVISION_CALL_FAILED, &message).await
            }
        }
    }

    async fn finish_provision(&mut self, dashboard_url: Option<String>) -> Result<Action> {
        info!("Instance {} provisioned", self.key());
        self.complete_operation();
        let status = self.status();
        status.provision_status = ProvisionStatus::Provisioned;
        status.deprovision_status = DeprovisionStatus::Required;
        if let Some(properties) = status.in_progress_properties.take() {
            status.external_properties = Some(properties);
        }
        if dashboard_url.is_some() {
            status.dashboard_url = dashboard_url;
        }
        self.clear_failed();
        self.set_ready(
            CONDITION_TRUE,
            REASON_PROVISIONED_SUCCESSFULLY,
            "The instance was provisioned successfully",
        );
        self.mark_observed();
        self.save_status().await?;
        Ok(Action::await_change())
    }

    // Update

    async fn update(&mut self) -> Result<Action> {
        let resolved = match self.resolve().await? {
            Ok(resolved) => resolved,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let applied = self
            .status_ref()
            .and_then(|s| s.external_properties.clone())
            .unwrap_or_default();

        if let Err(e) = validate_against_provisioned(
            &applied,
            &self.instance.spec.external_id,
            &resolved.class.external_id,
            &resolved.class.external_name,
            &resolved.plan.external_id,
            resolved.class.plan_updatable,
        ) {
            return self.fail(REASON_INVALID_SPEC_CHANGE, &e.to_string()).await;
        }
        if self.instance.spec.update_requests < applied.update_requests {
            let e = ValidationError::UpdateRequestsDecreased {
                old: applied.update_requests,
                new: self.instance.spec.update_requests,
            };
            return self.fail(REASON_INVALID_SPEC_CHANGE, &e.to_string()).await;
        }
        let plan_changed = applied.plan_external_id != resolved.plan.external_id;
        if plan_changed && resolved.plan_removed {
            let message = format!(
                "Plan {} has been removed from the broker catalog; changing to it is not allowed",
                resolved.plan.external_name
            );
            return self.fail(REASON_REFERENCES_DELETED_SERVICE_PLAN, &message).await;
        }

        let parameters = match self.parameters().await? {
            Ok(parameters) => parameters,
            Err(message) => return self.fail(REASON_ERROR_WITH_PARAMETERS, &message).await,
        };
        let checksum = parameters_checksum(parameters.as_ref());
        let parameters_changed = checksum != applied.parameters_checksum;
        let requests_changed = self.instance.spec.update_requests > applied.update_requests;

        if !plan_changed && !parameters_changed && !requests_changed {
            debug!("Instance {} has no broker-visible changes", self.key());
            self.clear_failed();
            self.mark_observed();
            self.save_status().await?;
            return Ok(Action::await_change());
        }

        let wire_parameters = if parameters_changed {
            match parameters_to_wire(parameters.as_ref()) {
                Ok(p) => Some(p.unwrap_or_default()),
                Err(e) => return self.fail(REASON_ERROR_WITH_PARAMETERS, &e.to_string()).await,
            }
        } else {
            None
        };

        let client = self.client(&resolved.endpoint).await?;
        let desired = self.desired_properties(&resolved, checksum);
        self.clear_failed();
        self.begin_operation(OperationKind::Update, Some(desired));
        self.set_ready(CONDITION_FALSE, REASON_UPDATING_INSTANCE, "The instance is being updated");
        self.save_status().await?;

        let request = UpdateInstanceRequest {
            instance_id: self.external_id(),
            accepts_incomplete: true,
            service_id: resolved.class.external_id.clone(),
            plan_id: plan_changed.then(|| resolved.plan.external_id.clone()),
            parameters: wire_parameters,
            previous_values: Some(PreviousValues {
                plan_id: Some(applied.plan_external_id.clone()),
                service_id: Some(applied.class_external_id.clone()),
            }),
            context: Some(self.context()),
        };
        info!(
            "Updating instance {} at broker {} (plan changed: {}, parameters changed: {})",
            self.key(),
            resolved.endpoint.name,
            plan_changed,
            parameters_changed
        );

        match client.update_instance(&request).await {
            Ok(response) if response.operation_key.is_some() => {
                self.begin_async(response.operation_key);
                self.save_status().await?;
                Ok(Action::requeue(self.ctx.config.poll_interval(None)))
            }
            Ok(response) => self.finish_update(response.dashboard_url).await,
            Err(e) => match e.read_disposition() {
                ErrorDisposition::Transient => {
                    warn!("Update of instance {} will be retried: {}", self.key(), e);
                    self.set_ready(CONDITION_FALSE, e.reason(), &format!("Error updating: {}", e));
                    self.save_status().await?;
                    Err(e.into())
                }
                _ => self.update_failed(&format!("Update call failed: {}", e)).await,
            },
        }
    }

    async fn finish_update(&mut self, dashboard_url: Option<String>) -> Result<Action> {
        info!("Instance {} updated", self.key());
        self.complete_operation();
        let status = self.status();
        if let Some(properties) = status.in_progress_properties.take() {
            status.external_properties = Some(properties);
        }
        if dashboard_url.is_some() {
            status.dashboard_url = dashboard_url;
        }
        self.clear_failed();
        self.set_ready(
            CONDITION_TRUE,
            REASON_INSTANCE_UPDATED_SUCCESSFULLY,
            "The instance was updated successfully",
        );
        self.mark_observed();
        self.save_status().await?;
        Ok(Action::await_change())
    }

    async fn update_failed(&mut self, message: &str) -> Result<Action> {
        self.status().in_progress_properties = None;
        self.fail(REASON_UPDATE_INSTANCE_CALL_FAILED, message).await
    }

    // Polling

    async fn poll(&mut self, kind: OperationKind) -> Result<Action> {
        let endpoint = match self.endpoint_for_applied().await? {
            Ok(endpoint) => endpoint,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&endpoint).await?;
        let properties = self.broker_properties().unwrap_or_default();
        let operation_key = self
            .status_ref()
            .and_then(|s| s.last_operation.as_ref())
            .and_then(|op| op.operation_key.clone());
        let request = LastOperationRequest {
            instance_id: self.external_id(),
            service_id: Some(properties.class_external_id.clone()).filter(|s| !s.is_empty()),
            plan_id: Some(properties.plan_external_id.clone()).filter(|s| !s.is_empty()),
            operation_key,
        };
        debug!("Polling last operation {:?} of instance {}", kind, self.key());

        let response = match client.poll_last_operation(&request).await {
            Ok(response) => response,
            Err(e) => return self.poll_failed(kind, e).await,
        };
        if let Some(op) = self.status().last_operation.as_mut() {
            op.description = response.description.clone();
        }

        match (response.state, kind) {
            (LastOperationState::InProgress, _) => {
                self.save_status().await?;
                Ok(Action::requeue(self.poll_delay(&response)))
            }
            (LastOperationState::Succeeded, OperationKind::Provision) => self.finish_provision(None).await,
            (LastOperationState::Succeeded, OperationKind::Update) => self.finish_update(None).await,
            (LastOperationState::Succeeded, _) => self.finish_deprovision().await,
            (LastOperationState::Failed, OperationKind::Provision) => {
                let message = format!(
                    "Asynchronous provision failed: {}",
                    response.description.unwrap_or_default()
                );
                self.start_orphan_mitigation(REASON_STARTING_ORPHAN_MITIGATION, &message).await
            }
            (LastOperationState::Failed, OperationKind::Update) => {
                let message = format!("Asynchronous update failed: {}", response.description.unwrap_or_default());
                self.update_failed(&message).await
            }
            (LastOperationState::Failed, _) => {
                let message = format!(
                    "Asynchronous deprovision failed: {}",
                    response.description.unwrap_or_default()
                );
                self.deprovision_failed(&message).await
            }
        }
    }

    async fn poll_failed(&mut self, kind: OperationKind, err: BrokerError) -> Result<Action> {
        if err.read_disposition() == ErrorDisposition::Transient {
            warn!("Polling instance {} will be retried: {}", self.key(), err);
            return Err(err.into());
        }
        match kind {
            OperationKind::Deprovision if err == BrokerError::Gone => self.finish_deprovision().await,
            OperationKind::Provision => {
                let message = format!("Polling provision failed: {}", err);
                self.start_orphan_mitigation(REASON_STARTING_ORPHAN_MITIGATION, &message).await
            }
            OperationKind::Update => self.update_failed(&format!("Polling update failed: {}", err)).await,
            _ => self.deprovision_failed(&format!("Polling deprovision failed: {}", err)).await,
        }
    }

    // Orphan mitigation

    async fn start_orphan_mitigation(&mut self, reason: &str, message: &str) -> Result<Action> {
        warn!("Instance {} needs orphan mitigation: {}", self.key(), message);
        let status = self.status();
        status.orphan_mitigation_in_progress = true;
        status.async_op_in_progress = false;
        set_condition(
            &mut status.conditions,
            build_condition(CONDITION_ORPHAN_MITIGATION, CONDITION_TRUE, reason, message),
        );
        self.set_ready(CONDITION_FALSE, reason, message);
        self.save_status().await?;
        Ok(Action::requeue(Duration::ZERO))
    }

    async fn orphan_mitigation(&mut self) -> Result<Action> {
        let polling = self.status_ref().is_some_and(|s| {
            s.async_op_in_progress
                && s.last_operation
                    .as_ref()
                    .is_some_and(|op| op.is_in_progress(OperationKind::Deprovision))
        });
        if polling {
            return self.poll_orphan_mitigation().await;
        }

        let endpoint = match self.endpoint_for_applied().await? {
            Ok(endpoint) => endpoint,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&endpoint).await?;
        let properties = self.broker_properties().unwrap_or_default();
        self.begin_operation(OperationKind::Deprovision, None);
        self.save_status().await?;

        let request = DeprovisionRequest {
            instance_id: self.external_id(),
            accepts_incomplete: true,
            service_id: properties.class_external_id,
            plan_id: properties.plan_external_id,
        };
        info!("Orphan mitigation: deprovisioning instance {}", self.key());
        match client.deprovision_instance(&request).await {
            Ok(response) if response.operation_key.is_some() => {
                self.begin_async(response.operation_key);
                self.save_status().await?;
                Ok(Action::requeue(self.ctx.config.poll_interval(None)))
            }
            Ok(_) => self.finish_orphan_mitigation().await,
            Err(e) if e.destructive_disposition() == ErrorDisposition::Success => self.finish_orphan_mitigation().await,
            Err(e) => self.orphan_mitigation_failed(e).await,
        }
    }

    async fn poll_orphan_mitigation(&mut self) -> Result<Action> {
        let endpoint = match self.endpoint_for_applied().await? {
            Ok(endpoint) => endpoint,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&endpoint).await?;
        let properties = self.broker_properties().unwrap_or_default();
        let operation_key = self
            .status_ref()
            .and_then(|s| s.last_operation.as_ref())
            .and_then(|op| op.operation_key.clone());
        let request = LastOperationRequest {
            instance_id: self.external_id(),
            service_id: Some(properties.class_external_id),
            plan_id: Some(properties.plan_external_id),
            operation_key,
        };
        match client.poll_last_operation(&request).await {
            Ok(response) => match response.state {
                LastOperationState::InProgress => Ok(Action::requeue(self.poll_delay(&response))),
                LastOperationState::Succeeded => self.finish_orphan_mitigation().await,
                LastOperationState::Failed => {
                    // Resend the deprovision on the next pass.
                    self.status().async_op_in_progress = false;
                    let err = BrokerError::Reported {
                        status: 200,
                        error: None,
                        description: response.description,
                    };
                    self.orphan_mitigation_failed(err).await
                }
            },
            Err(BrokerError::Gone) => self.finish_orphan_mitigation().await,
            Err(e) => self.orphan_mitigation_failed(e).await,
        }
    }

    async fn orphan_mitigation_failed(&mut self, err: BrokerError) -> Result<Action> {
        warn!("Orphan mitigation of instance {} failed, retrying: {}", self.key(), err);
        let message = format!("Orphan mitigation failed: {}", err);
        self.set_ready(CONDITION_FALSE, REASON_ORPHAN_MITIGATION_FAILED, &message);
        self.save_status().await?;
        Err(err.into())
    }

    async fn finish_orphan_mitigation(&mut self) -> Result<Action> {
        info!("Orphan mitigation of instance {} complete", self.key());
        let status = self.status();
        status.orphan_mitigation_in_progress = false;
        status.async_op_in_progress = false;
        status.operation_start_time = None;
        status.provision_status = ProvisionStatus::NotProvisioned;
        status.deprovision_status = DeprovisionStatus::NotRequired;
        status.in_progress_properties = None;
        if let Some(op) = status.last_operation.as_mut() {
            op.operation = OperationKind::Provision;
            op.state = OperationState::Failed;
            op.operation_key = None;
        }
        remove_condition(&mut status.conditions, CONDITION_ORPHAN_MITIGATION);
        let message = "Orphan mitigation was completed successfully";
        self.set_ready(CONDITION_FALSE, REASON_ORPHAN_MITIGATION_SUCCESSFUL, message);
        self.set_failed(REASON_ORPHAN_MITIGATION_SUCCESSFUL, message);
        self.mark_observed();
        self.save_status().await?;
        Ok(Action::await_change())
    }

    // Deletion

    async fn delete(&mut self) -> Result<Action> {
        if !has_finalizer(&self.instance) {
            return Ok(Action::await_change());
        }
        info!("Handling deletion of instance {}", self.key());

        let remaining = self.delete_bindings().await?;
        if remaining > 0 {
            let message = format!("Waiting for {} bindings to be deleted", remaining);
            self.set_ready(CONDITION_FALSE, REASON_SERVICE_BINDINGS_DELETION, &message);
            self.save_status().await?;
            return Ok(Action::requeue(self.ctx.config.pending_retry_interval));
        }

        let (in_flight, orphan) = match self.status_ref() {
            Some(s) => (
                s.async_op_in_progress
                    .then(|| s.last_operation.as_ref().map(|op| op.operation))
                    .flatten(),
                s.orphan_mitigation_in_progress,
            ),
            None => (None, false),
        };
        if orphan {
            return self.orphan_mitigation().await.map(continue_deletion);
        }
        match in_flight {
            Some(OperationKind::Deprovision) => return self.poll(OperationKind::Deprovision).await,
            Some(kind) => return self.poll(kind).await.map(continue_deletion),
            None => {}
        }

        let deprovision_status = self.status_ref().map(|s| s.deprovision_status).unwrap_or_default();
        if matches!(
            deprovision_status,
            DeprovisionStatus::NotRequired | DeprovisionStatus::Succeeded
        ) {
            debug!("Instance {} needs no deprovision", self.key());
            return self.release().await;
        }
        self.deprovision().await
    }

    /// Delete bindings that reference this instance; returns how many remain.
    async fn delete_bindings(&mut self) -> Result<usize> {
        let namespace = self.namespace();
        let options = ListOptions::in_namespace(namespace.clone()).field("spec.instanceRef.name", self.instance.name_any());
        let bindings: Vec<ServiceBinding> = typed::list(self.ctx.store(), &options).await?;
        for binding in &bindings {
            if binding.meta().deletion_timestamp.is_none() {
                info!("Deleting binding {}/{} of deleted instance", namespace, binding.name_any());
                typed::delete_if_exists::<ServiceBinding>(self.ctx.store(), Some(&namespace), &binding.name_any()).await?;
            }
        }
        Ok(bindings.len())
    }

    async fn deprovision(&mut self) -> Result<Action> {
        let endpoint = match self.endpoint_for_applied().await? {
            Ok(endpoint) => endpoint,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&endpoint).await?;
        let properties = self.broker_properties().unwrap_or_default();

        self.begin_operation(OperationKind::Deprovision, None);
        self.status().deprovision_status = DeprovisionStatus::Required;
        self.set_ready(CONDITION_FALSE, REASON_DEPROVISIONING, "The instance is being deprovisioned");
        self.save_status().await?;

        let request = DeprovisionRequest {
            instance_id: self.external_id(),
            accepts_incomplete: true,
            service_id: properties.class_external_id,
            plan_id: properties.plan_external_id,
        };
        info!("Deprovisioning instance {} at broker {}", self.key(), endpoint.name);
        match client.deprovision_instance(&request).await {
            Ok(response) if response.operation_key.is_some() => {
                self.begin_async(response.operation_key);
                self.save_status().await?;
                Ok(Action::requeue(self.ctx.config.poll_interval(None)))
            }
            Ok(_) => self.finish_deprovision().await,
            Err(e) => match e.destructive_disposition() {
                ErrorDisposition::Success => self.finish_deprovision().await,
                ErrorDisposition::Transient => {
                    warn!("Deprovision of instance {} will be retried: {}", self.key(), e);
                    self.set_ready(CONDITION_FALSE, e.reason(), &format!("Error deprovisioning: {}", e));
                    self.save_status().await?;
                    Err(e.into())
                }
                _ => self.deprovision_failed(&format!("Deprovision call failed: {}", e)).await,
            },
        }
    }

    async fn deprovision_failed(&mut self, message: &str) -> Result<Action> {
        warn!("Deprovision of instance {} failed: {}", self.key(), message);
        let status = self.status();
        status.deprovision_status = DeprovisionStatus::Failed;
        status.async_op_in_progress = false;
        if let Some(op) = status.last_operation.as_mut() {
            op.state = OperationState::Failed;
        }
        self.set_ready(CONDITION_FALSE, REASON_DEPROVISION_CALL_FAILED, message);
        self.set_failed(REASON_DEPROVISION_CALL_FAILED, message);
        self.save_status().await?;
        Err(ControllerError::reconciliation(message.to_string()))
    }

    async fn finish_deprovision(&mut self) -> Result<Action> {
        info!("Instance {} deprovisioned", self.key());
        self.complete_operation();
        let status = self.status();
        status.deprovision_status = DeprovisionStatus::Succeeded;
        status.provision_status = ProvisionStatus::NotProvisioned;
        status.in_progress_properties = None;
        self.set_ready(
            CONDITION_FALSE,
            REASON_DEPROVISIONED_SUCCESSFULLY,
            "The instance was deprovisioned successfully",
        );
        self.save_status().await?;
        if self.instance.meta().deletion_timestamp.is_some() {
            return self.release().await;
        }
        Ok(Action::await_change())
    }

    async fn release(&mut self) -> Result<Action> {
        remove_finalizer(self.ctx.store(), &self.instance).await?;
        info!("Finalizer removed for instance {}", self.key());
        Ok(Action::await_change())
    }
}

/// An operation finished while the instance is being deleted; come back
/// to continue the deletion.
fn continue_deletion(action: Action) -> Action {
    match action {
        Action::AwaitChange => Action::requeue(Duration::ZERO),
        other => other,
    }
}

/// Reconcile one ServiceInstance.
pub async fn reconcile_instance(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let Some(instance) = typed::get::<ServiceInstance>(ctx.store(), Some(namespace), name).await? else {
        debug!("Instance {}/{} no longer exists", namespace, name);
        return Ok(Action::await_change());
    };
    info!("Reconciling ServiceInstance {}/{}", namespace, name);

    let mut pass = InstancePass::new(ctx, instance);
    let state = determine_state(&pass.instance);
    if state == InstanceState::Deleting {
        return pass.delete().await;
    }

    // First observation: finalizer and broker-facing id.
    let mut changed = add_finalizer(&mut pass.instance);
    if pass.instance.spec.external_id.is_empty() {
        pass.instance.spec.external_id = uuid::Uuid::new_v4().to_string();
        changed = true;
    }
    if changed {
        pass.save_spec().await?;
    }
    if pass.instance.status.is_none() {
        pass.set_ready(CONDITION_FALSE, REASON_PROVISIONING, "The instance is being provisioned");
        pass.save_status().await?;
    }

    match state {
        InstanceState::Deleting => pass.delete().await,
        InstanceState::OrphanMitigation => pass.orphan_mitigation().await,
        InstanceState::PollingProvision => pass.poll(OperationKind::Provision).await,
        InstanceState::PollingUpdate => pass.poll(OperationKind::Update).await,
        InstanceState::Provisioning | InstanceState::Updating => {
            if let Err(e) = validate_plan_reference(&pass.instance.spec.plan_reference) {
                return pass.fail(REASON_INVALID_SPEC_CHANGE, &e.to_string()).await;
            }
            // Spec writes above may have moved the generation.
            match determine_state(&pass.instance) {
                InstanceState::Provisioning => pass.provision().await,
                InstanceState::Updating => pass.update().await,
                _ => Ok(Action::await_change()),
            }
        }
        InstanceState::NoOp => Ok(Action::await_change()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::test_support::*;
    use crate::osb::{DeprovisionResponse, ProvisionResponse, UpdateInstanceResponse};
    use crate::store::{Kind, MemoryStore, Store};
    use std::sync::Arc;

    async fn setup() -> (Context, Arc<FakeBroker>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(FakeBroker::new());
        let ctx = test_context(store.clone(), broker.clone());
        seed_catalog(&ctx).await;
        (ctx, broker, store)
    }

    fn status(instance: &ServiceInstance) -> &ServiceInstanceStatus {
        instance.status.as_ref().unwrap()
    }

    #[tokio::test]
    async fn test_sync_provision() {
        let (ctx, broker, _) = setup().await;
        create_instance(&ctx, "i1", "p1-free").await;

        let action = reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert_eq!(action, Action::AwaitChange);

        let instance = get_instance(&ctx, "i1").await.unwrap();
        let s = status(&instance);
        assert!(is_condition_true(&s.conditions, CONDITION_READY));
        assert_eq!(s.provision_status, ProvisionStatus::Provisioned);
        assert_eq!(s.observed_generation, instance.metadata.generation.unwrap());
        assert_eq!(s.last_condition_state, "Ready");
        assert_eq!(s.user_specified_class_name, "ClusterServiceClass/s1");
        assert!(has_finalizer(&instance));
        assert!(!instance.spec.external_id.is_empty());
        assert_eq!(instance.spec.cluster_service_plan_ref.as_ref().unwrap().name, "p1-id");

        assert_eq!(broker.calls_to("provision"), 1);
        let request = &broker.provision_requests()[0];
        assert_eq!(request.instance_id, instance.spec.external_id);
        assert_eq!(request.service_id, "s1-id");
        assert_eq!(request.plan_id, "p1-id");
        assert_eq!(request.space_guid, "default");

        // Settled: another pass does nothing.
        reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert_eq!(broker.calls_to("provision"), 1);
    }

    #[tokio::test]
    async fn test_async_provision_polls_until_done() {
        let (ctx, broker, _) = setup().await;
        broker.script_provision(
            true,
            Ok(ProvisionResponse {
                dashboard_url: None,
                operation_key: Some("op-42".to_string()),
            }),
        );
        broker.script_last_operation(Ok(in_progress(Some(3))));
        create_instance(&ctx, "i1", "p1-free").await;

        let action = reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert_eq!(action, Action::Requeue(ctx.config.default_poll_interval));
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert_eq!(determine_state(&instance), InstanceState::PollingProvision);
        assert_eq!(
            status(&instance).last_operation.as_ref().unwrap().operation_key.as_deref(),
            Some("op-42")
        );

        let action = reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert_eq!(action, Action::Requeue(Duration::from_secs(3)));

        let action = reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert_eq!(action, Action::AwaitChange);
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert!(is_condition_true(&status(&instance).conditions, CONDITION_READY));
        assert_eq!(broker.calls_to("provision"), 1);
        assert_eq!(broker.calls_to("poll"), 2);
    }

    #[tokio::test]
    async fn test_ambiguous_provision_runs_orphan_mitigation() {
        let (ctx, broker, _) = setup().await;
        broker.script_provision(true, Err(BrokerError::ambiguous("timed out after 30s")));
        create_instance(&ctx, "i1", "p1-free").await;

        settle_instance(&ctx, "i1", 5).await;

        let instance = get_instance(&ctx, "i1").await.unwrap();
        let s = status(&instance);
        assert!(is_condition_true(&s.conditions, CONDITION_FAILED));
        assert_eq!(condition_reason(&s.conditions, CONDITION_FAILED), Some(REASON_ORPHAN_MITIGATION_SUCCESSFUL));
        assert!(!s.orphan_mitigation_in_progress);
        assert_eq!(s.provision_status, ProvisionStatus::NotProvisioned);
        assert_eq!(s.observed_generation, instance.metadata.generation.unwrap());
        assert_eq!(broker.calls_to("deprovision"), 1);
        assert!(broker.allocated_instances().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_mitigation_retries_until_gone() {
        let (ctx, broker, _) = setup().await;
        broker.script_provision(true, Err(BrokerError::ambiguous("502")));
        broker.script_deprovision(Err(BrokerError::unreachable("refused")));
        create_instance(&ctx, "i1", "p1-free").await;

        settle_instance(&ctx, "i1", 6).await;
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert!(!status(&instance).orphan_mitigation_in_progress);
        assert_eq!(broker.calls_to("deprovision"), 2);
        assert!(broker.allocated_instances().is_empty());
    }

    #[tokio::test]
    async fn test_transient_provision_error_keeps_retrying() {
        let (ctx, broker, _) = setup().await;
        broker.script_provision(false, Err(BrokerError::unreachable("connection refused")));
        create_instance(&ctx, "i1", "p1-free").await;

        assert!(reconcile_instance(&ctx, "default", "i1").await.is_err());
        let instance = get_instance(&ctx, "i1").await.unwrap();
        let s = status(&instance);
        assert!(!is_condition_true(&s.conditions, CONDITION_FAILED));
        assert_eq!(condition_reason(&s.conditions, CONDITION_READY), Some(REASON_BROKER_UNREACHABLE));
        let started = s.operation_start_time.clone();

        assert_eq!(reconcile_instance(&ctx, "default", "i1").await.unwrap(), Action::AwaitChange);
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert!(is_condition_true(&status(&instance).conditions, CONDITION_READY));
        assert!(started.is_some());
        assert_eq!(broker.calls_to("provision"), 2);
    }

    #[tokio::test]
    async fn test_conflict_on_resend_counts_as_provisioned() {
        let (ctx, broker, _) = setup().await;
        broker.script_provision(false, Err(BrokerError::unreachable("reset")));
        broker.script_provision(true, Err(BrokerError::Conflict { message: "exists".to_string() }));
        create_instance(&ctx, "i1", "p1-free").await;

        assert!(reconcile_instance(&ctx, "default", "i1").await.is_err());
        reconcile_instance(&ctx, "default", "i1").await.unwrap();
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert!(is_condition_true(&status(&instance).conditions, CONDITION_READY));
    }

    #[tokio::test]
    async fn test_terminal_provision_error_fails() {
        let (ctx, broker, _) = setup().await;
        broker.script_provision(
            false,
            Err(BrokerError::Reported {
                status: 400,
                error: Some("BadRequest".to_string()),
                description: Some("size too large".to_string()),
            }),
        );
        create_instance(&ctx, "i1", "p1-free").await;

        assert_eq!(reconcile_instance(&ctx, "default", "i1").await.unwrap(), Action::AwaitChange);
        let instance = get_instance(&ctx, "i1").await.unwrap();
        let s = status(&instance);
        assert_eq!(condition_reason(&s.conditions, CONDITION_FAILED), Some(REASON_PROVISION_CALL_FAILED));
        assert!(find_condition(&s.conditions, CONDITION_FAILED)
            .unwrap()
            .message
            .as_deref()
            .unwrap()
            .contains("size too large"));
        assert_eq!(s.deprovision_status, DeprovisionStatus::NotRequired);
        assert_eq!(determine_state(&instance), InstanceState::NoOp);
    }

    #[tokio::test]
    async fn test_unknown_plan_waits() {
        let (ctx, broker, _) = setup().await;
        create_instance(&ctx, "i1", "no-such-plan").await;

        let action = reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert_eq!(action, Action::Requeue(ctx.config.pending_retry_interval));
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert_eq!(
            condition_reason(&status(&instance).conditions, CONDITION_READY),
            Some(REASON_REFERENCES_NONEXISTENT_SERVICE_PLAN)
        );
        assert_eq!(broker.calls_to("provision"), 0);
    }

    #[tokio::test]
    async fn test_removed_plan_cannot_be_provisioned() {
        let (ctx, broker, store) = setup().await;
        let mut plan: ClusterServicePlan = typed::get(store.as_ref(), None, "p2-id").await.unwrap().unwrap();
        plan.entry_status_mut().removed_from_broker_catalog = true;
        typed::update_status(store.as_ref(), &plan).await.unwrap();
        create_instance(&ctx, "i1", "p2").await;

        reconcile_instance(&ctx, "default", "i1").await.unwrap();
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert_eq!(
            condition_reason(&status(&instance).conditions, CONDITION_FAILED),
            Some(REASON_REFERENCES_DELETED_SERVICE_PLAN)
        );
        assert_eq!(broker.calls_to("provision"), 0);
    }

    #[tokio::test]
    async fn test_plan_change_sends_update() {
        let (ctx, broker, store) = setup().await;
        create_instance(&ctx, "i1", "p1-free").await;
        settle_instance(&ctx, "i1", 3).await;

        let mut instance = get_instance(&ctx, "i1").await.unwrap();
        instance.spec.plan_reference.cluster_service_plan_external_name = Some("p2".to_string());
        typed::update(store.as_ref(), &instance).await.unwrap();

        settle_instance(&ctx, "i1", 3).await;
        let instance = get_instance(&ctx, "i1").await.unwrap();
        let s = status(&instance);
        assert_eq!(condition_reason(&s.conditions, CONDITION_READY), Some(REASON_INSTANCE_UPDATED_SUCCESSFULLY));
        assert_eq!(s.external_properties.as_ref().unwrap().plan_external_id, "p2-id");
        assert_eq!(s.observed_generation, instance.metadata.generation.unwrap());

        let request = &broker.update_requests()[0];
        assert_eq!(request.plan_id.as_deref(), Some("p2-id"));
        assert_eq!(request.previous_values.as_ref().unwrap().plan_id.as_deref(), Some("p1-id"));
        assert!(request.parameters.is_none());
    }

    #[tokio::test]
    async fn test_update_requests_forces_update() {
        let (ctx, broker, store) = setup().await;
        broker.script_update(Ok(UpdateInstanceResponse::default()));
        create_instance(&ctx, "i1", "p1-free").await;
        settle_instance(&ctx, "i1", 3).await;

        let mut instance = get_instance(&ctx, "i1").await.unwrap();
        instance.spec.update_requests = 1;
        typed::update(store.as_ref(), &instance).await.unwrap();
        settle_instance(&ctx, "i1", 3).await;

        assert_eq!(broker.calls_to("update"), 1);
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert_eq!(status(&instance).external_properties.as_ref().unwrap().update_requests, 1);
    }

    #[tokio::test]
    async fn test_class_change_is_invalid() {
        let (ctx, broker, store) = setup().await;
        create_instance(&ctx, "i1", "p1-free").await;
        settle_instance(&ctx, "i1", 3).await;

        let mut instance = get_instance(&ctx, "i1").await.unwrap();
        let mut status = instance.status.clone().unwrap();
        status.external_properties.as_mut().unwrap().class_external_id = "other-id".to_string();
        instance.status = Some(status);
        let mut instance = typed::update_status(store.as_ref(), &instance).await.unwrap();
        instance.spec.update_requests = 1;
        typed::update(store.as_ref(), &instance).await.unwrap();

        reconcile_instance(&ctx, "default", "i1").await.unwrap();
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert_eq!(
            condition_reason(&instance.status.as_ref().unwrap().conditions, CONDITION_FAILED),
            Some(REASON_INVALID_SPEC_CHANGE)
        );
        assert_eq!(broker.calls_to("update"), 0);
    }

    #[tokio::test]
    async fn test_deletion_deprovisions_and_releases() {
        let (ctx, broker, store) = setup().await;
        create_instance(&ctx, "i1", "p1-free").await;
        settle_instance(&ctx, "i1", 3).await;

        store.delete(Kind::ServiceInstance, Some("default"), "i1").await.unwrap();
        settle_instance(&ctx, "i1", 3).await;

        assert!(get_instance(&ctx, "i1").await.is_none());
        assert_eq!(broker.calls_to("deprovision"), 1);
        assert!(broker.allocated_instances().is_empty());
    }

    #[tokio::test]
    async fn test_async_deprovision() {
        let (ctx, broker, store) = setup().await;
        create_instance(&ctx, "i1", "p1-free").await;
        settle_instance(&ctx, "i1", 3).await;
        broker.script_deprovision(Ok(DeprovisionResponse {
            operation_key: Some("del-1".to_string()),
        }));
        broker.script_last_operation(Ok(in_progress(None)));

        store.delete(Kind::ServiceInstance, Some("default"), "i1").await.unwrap();
        let action = reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert!(matches!(action, Action::Requeue(_)));
        reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert!(get_instance(&ctx, "i1").await.is_some());
        reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert!(get_instance(&ctx, "i1").await.is_none());
        assert_eq!(broker.calls_to("deprovision"), 1);
    }

    #[tokio::test]
    async fn test_never_provisioned_instance_skips_deprovision() {
        let (ctx, broker, store) = setup().await;
        create_instance(&ctx, "i1", "no-such-plan").await;
        reconcile_instance(&ctx, "default", "i1").await.unwrap();

        store.delete(Kind::ServiceInstance, Some("default"), "i1").await.unwrap();
        reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert!(get_instance(&ctx, "i1").await.is_none());
        assert_eq!(broker.calls_to("deprovision"), 0);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_bindings() {
        let (ctx, _broker, store) = setup().await;
        create_instance(&ctx, "i1", "p1-free").await;
        settle_instance(&ctx, "i1", 3).await;
        create_binding(&ctx, "b1", "i1", None).await;
        settle_binding(&ctx, "b1", 3).await;

        store.delete(Kind::ServiceInstance, Some("default"), "i1").await.unwrap();
        let action = reconcile_instance(&ctx, "default", "i1").await.unwrap();
        assert_eq!(action, Action::Requeue(ctx.config.pending_retry_interval));
        let instance = get_instance(&ctx, "i1").await.unwrap();
        assert_eq!(
            condition_reason(&status(&instance).conditions, CONDITION_READY),
            Some(REASON_SERVICE_BINDINGS_DELETION)
        );
        let binding = get_binding(&ctx, "b1").await.unwrap();
        assert!(binding.metadata.deletion_timestamp.is_some());

        settle_binding(&ctx, "b1", 3).await;
        assert!(get_binding(&ctx, "b1").await.is_none());
        settle_instance(&ctx, "i1", 3).await;
        assert!(get_instance(&ctx, "i1").await.is_none());
    }

    #[test]
    fn test_determine_state_priorities() {
        let spec = serde_json::from_value(serde_json::json!({
            "clusterServiceClassExternalName": "s1",
            "clusterServicePlanExternalName": "p1"
        }))
        .unwrap();
        let mut instance = ServiceInstance::new("i1", spec);
        instance.metadata.generation = Some(1);
        assert_eq!(determine_state(&instance), InstanceState::Provisioning);

        let mut s = ServiceInstanceStatus {
            provision_status: ProvisionStatus::Provisioned,
            observed_generation: 1,
            ..Default::default()
        };
        instance.status = Some(s.clone());
        assert_eq!(determine_state(&instance), InstanceState::NoOp);

        instance.metadata.generation = Some(2);
        assert_eq!(determine_state(&instance), InstanceState::Updating);

        s.async_op_in_progress = true;
        s.last_operation = Some(LastOperation::in_progress(OperationKind::Update));
        instance.status = Some(s.clone());
        assert_eq!(determine_state(&instance), InstanceState::PollingUpdate);

        s.orphan_mitigation_in_progress = true;
        instance.status = Some(s);
        assert_eq!(determine_state(&instance), InstanceState::OrphanMitigation);
    }
}

//! Binding reconciler
//!
//! Binds a ServiceBinding at the broker of its instance and hands the
//! returned credentials to the injector. A secret write failure leaves the
//! bind incomplete and is retried by re-sending the bind; it never triggers
//! an unbind. Asynchronous binds take three passes: bind, poll until done,
//! then fetch the credentials.

use std::time::Duration;

use kube::{Resource, ResourceExt};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::injector::{inject, InjectError};
use super::{
    add_finalizer, build_parameters, elapsed_since, has_finalizer, now_rfc3339, parameters_checksum,
    remove_finalizer, Action, BrokerEndpoint, Context,
};
use crate::conditions::*;
use crate::crd::{
    BindingProperties, BrokerResource, ClassResource, ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan,
    LastOperation, OperationKind, OperationState, PlanResource, ServiceBinding, ServiceBindingStatus, ServiceBroker,
    ServiceClass, ServiceInstance, ServicePlan, UnbindStatus,
};
use crate::error::{ControllerError, Result};
use crate::osb::{
    parameters_to_wire, BindRequest, BindingLastOperationRequest, BrokerClient, BrokerError, ErrorDisposition,
    GetBindingRequest, LastOperationState, PlatformContext, UnbindRequest,
};
use crate::store::{typed, StoreKind};
use crate::validation::{validate_binding_create, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Deleting,
    OrphanMitigation,
    PollingBind,
    /// The broker finished an asynchronous bind; credentials still to fetch
    FetchingCredentials,
    Binding,
    NoOp,
}

pub fn determine_state(binding: &ServiceBinding) -> BindingState {
    if binding.meta().deletion_timestamp.is_some() {
        return BindingState::Deleting;
    }
    let default_status = ServiceBindingStatus::default();
    let status = binding.status.as_ref().unwrap_or(&default_status);
    if status.orphan_mitigation_in_progress {
        return BindingState::OrphanMitigation;
    }
    if status.async_op_in_progress {
        if let Some(op) = status.last_operation.as_ref().filter(|op| op.operation == OperationKind::Bind) {
            return match op.state {
                OperationState::Succeeded => BindingState::FetchingCredentials,
                _ => BindingState::PollingBind,
            };
        }
    }
    let generation = binding.meta().generation.unwrap_or(0);
    if is_condition_true(&status.conditions, CONDITION_FAILED) && status.observed_generation == generation {
        return BindingState::NoOp;
    }
    if is_condition_true(&status.conditions, CONDITION_READY) {
        return BindingState::NoOp;
    }
    BindingState::Binding
}

/// Where the bind goes: the instance's broker and the ids it was provisioned with.
#[derive(Debug, Clone)]
struct BindTarget {
    endpoint: BrokerEndpoint,
    instance_id: String,
    service_id: String,
    plan_id: String,
    bindable: bool,
    class_external_name: String,
}

#[derive(Debug, Clone)]
struct Unresolved {
    reason: &'static str,
    message: String,
}

type Resolution = std::result::Result<BindTarget, Unresolved>;

async fn lookup<B, C, P>(
    ctx: &Context,
    namespace: Option<&str>,
    instance: &ServiceInstance,
    class_name: &str,
    plan_name: &str,
) -> Result<Resolution>
where
    B: StoreKind + BrokerResource,
    C: StoreKind + ClassResource,
    P: StoreKind + PlanResource,
{
    let store = ctx.store();
    let Some(class) = typed::get::<C>(store, namespace, class_name).await? else {
        return Ok(Err(Unresolved {
            reason: REASON_REFERENCES_NONEXISTENT_SERVICE_CLASS,
            message: format!("references a non-existent {} {}", C::KIND, class_name),
        }));
    };
    let Some(plan) = typed::get::<P>(store, namespace, plan_name).await? else {
        return Ok(Err(Unresolved {
            reason: REASON_REFERENCES_NONEXISTENT_SERVICE_PLAN,
            message: format!("references a non-existent {} {}", P::KIND, plan_name),
        }));
    };
    let Some(broker) = typed::get::<B>(store, namespace, class.broker_name()).await? else {
        return Ok(Err(Unresolved {
            reason: REASON_REFERENCES_NONEXISTENT_BROKER,
            message: format!("references a non-existent {} {}", B::KIND, class.broker_name()),
        }));
    };

    let class_spec = class.class_spec();
    let plan_spec = plan.plan_spec();
    let applied = instance.status.as_ref().and_then(|s| s.external_properties.as_ref());
    Ok(Ok(BindTarget {
        endpoint: BrokerEndpoint::from_broker(&broker),
        instance_id: instance.spec.external_id.clone(),
        service_id: applied
            .map(|p| p.class_external_id.clone())
            .unwrap_or_else(|| class_spec.external_id.clone()),
        plan_id: applied
            .map(|p| p.plan_external_id.clone())
            .unwrap_or_else(|| plan_spec.external_id.clone()),
        bindable: plan_spec.bindable.unwrap_or(class_spec.bindable),
        class_external_name: class_spec.external_name.clone(),
    }))
}

async fn resolve_target(ctx: &Context, namespace: &str, instance: &ServiceInstance) -> Result<Resolution> {
    let spec = &instance.spec;
    if let (Some(class), Some(plan)) = (&spec.cluster_service_class_ref, &spec.cluster_service_plan_ref) {
        return lookup::<ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan>(
            ctx, None, instance, &class.name, &plan.name,
        )
        .await;
    }
    if let (Some(class), Some(plan)) = (&spec.service_class_ref, &spec.service_plan_ref) {
        return lookup::<ServiceBroker, ServiceClass, ServicePlan>(ctx, Some(namespace), instance, &class.name, &plan.name)
            .await;
    }
    Ok(Err(Unresolved {
        reason: REASON_INSTANCE_NOT_READY,
        message: format!("instance {} has no resolved class and plan", instance.name_any()),
    }))
}

struct BindingPass<'a> {
    ctx: &'a Context,
    binding: ServiceBinding,
    persisted: Option<ServiceBindingStatus>,
}

impl<'a> BindingPass<'a> {
    fn new(ctx: &'a Context, binding: ServiceBinding) -> Self {
        let persisted = binding.status.clone();
        Self {
            ctx,
            binding,
            persisted,
        }
    }

    fn namespace(&self) -> String {
        self.binding.namespace().unwrap_or_default()
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.binding.name_any())
    }

    fn generation(&self) -> i64 {
        self.binding.meta().generation.unwrap_or(0)
    }

    fn status(&mut self) -> &mut ServiceBindingStatus {
        self.binding.status.get_or_insert_with(ServiceBindingStatus::default)
    }

    fn status_ref(&self) -> Option<&ServiceBindingStatus> {
        self.binding.status.as_ref()
    }

    fn set_ready(&mut self, status: &str, reason: &str, message: &str) {
        let condition = build_condition(CONDITION_READY, status, reason, message);
        set_condition(&mut self.status().conditions, condition);
    }

    fn set_failed(&mut self, reason: &str, message: &str) {
        let condition = build_condition(CONDITION_FAILED, CONDITION_TRUE, reason, message);
        set_condition(&mut self.status().conditions, condition);
    }

    fn mark_observed(&mut self) {
        let generation = self.generation();
        self.status().observed_generation = generation;
    }

    fn operation_key(&self) -> Option<String> {
        self.status_ref()
            .and_then(|s| s.last_operation.as_ref())
            .and_then(|op| op.operation_key.clone())
    }

    async fn save_status(&mut self) -> Result<()> {
        self.binding.recalculate_printer_columns();
        if self.binding.status == self.persisted {
            return Ok(());
        }
        self.binding = typed::update_status(self.ctx.store(), &self.binding).await?;
        self.persisted = self.binding.status.clone();
        Ok(())
    }

    async fn save_spec(&mut self) -> Result<()> {
        let local_status = self.binding.status.clone();
        self.binding = typed::update(self.ctx.store(), &self.binding).await?;
        self.binding.status = local_status;
        Ok(())
    }

    async fn fail(&mut self, reason: &str, message: &str) -> Result<Action> {
        warn!("Binding {} failed: {}: {}", self.key(), reason, message);
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

    async fn pending(&mut self, unresolved: Unresolved) -> Result<Action> {
        info!("Binding {} waiting: {}", self.key(), unresolved.message);
        self.set_ready(CONDITION_FALSE, unresolved.reason, &unresolved.message);
        self.save_status().await?;
        Ok(Action::requeue(self.ctx.config.pending_retry_interval))
    }

    async fn instance(&self) -> Result<Option<ServiceInstance>> {
        typed::get(self.ctx.store(), Some(&self.namespace()), &self.binding.spec.instance_ref.name).await
    }

    /// Broker target of an existing instance, without readiness checks.
    async fn target(&mut self) -> Result<Resolution> {
        let name = self.binding.spec.instance_ref.name.clone();
        let Some(instance) = self.instance().await? else {
            return Ok(Err(Unresolved {
                reason: REASON_REFERENCES_NONEXISTENT_INSTANCE,
                message: ValidationError::InstanceMissing(name).to_string(),
            }));
        };
        resolve_target(self.ctx, &self.namespace(), &instance).await
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

    fn begin_operation(&mut self, kind: OperationKind) {
        let status = self.status();
        let resend = status.last_operation.as_ref().is_some_and(|op| op.is_in_progress(kind));
        if !resend || status.operation_start_time.is_none() {
            status.operation_start_time = Some(now_rfc3339());
        }
        status.last_operation = Some(LastOperation::in_progress(kind));
        status.async_op_in_progress = false;
    }

    fn begin_async(&mut self, operation_key: Option<String>) {
        let status = self.status();
        status.async_op_in_progress = true;
        if let Some(op) = status.last_operation.as_mut() {
            op.operation_key = operation_key.filter(|k| !k.is_empty());
        }
    }

    fn retry_window_exceeded(&self) -> bool {
        let started = self.status_ref().and_then(|s| s.operation_start_time.as_deref());
        elapsed_since(started).is_some_and(|elapsed| elapsed > self.ctx.config.reconciliation_retry_duration)
    }

    fn poll_request(&self, target: &BindTarget) -> BindingLastOperationRequest {
        BindingLastOperationRequest {
            instance_id: target.instance_id.clone(),
            binding_id: self.binding.spec.external_id.clone(),
            service_id: Some(target.service_id.clone()),
            plan_id: Some(target.plan_id.clone()),
            operation_key: self.operation_key(),
        }
    }

    // Bind

    async fn bind(&mut self) -> Result<Action> {
        let instance_name = self.binding.spec.instance_ref.name.clone();
        let instance = self.instance().await?;
        if let Err(e) = validate_binding_create(&instance_name, instance.as_ref()) {
            let reason = match e {
                ValidationError::InstanceMissing(_) => REASON_REFERENCES_NONEXISTENT_INSTANCE,
                _ => REASON_INSTANCE_NOT_READY,
            };
            return self
                .pending(Unresolved {
                    reason,
                    message: e.to_string(),
                })
                .await;
        }
        let Some(instance) = instance else {
            return Ok(Action::await_change());
        };
        let target = match resolve_target(self.ctx, &self.namespace(), &instance).await? {
            Ok(target) => target,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        if !target.bindable {
            let message = format!("Class {} and its plan are not bindable", target.class_external_name);
            return self.fail(REASON_NONBINDABLE_SERVICE_CLASS, &message).await;
        }

        let namespace = self.namespace();
        let parameters = match build_parameters(
            self.ctx.store(),
            &namespace,
            self.binding.spec.parameters.as_ref(),
            &self.binding.spec.parameters_from,
        )
        .await?
        {
            Ok(parameters) => parameters,
            Err(e) => return self.fail(REASON_ERROR_WITH_PARAMETERS, &e.to_string()).await,
        };
        let wire_parameters = match parameters_to_wire(parameters.as_ref()) {
            Ok(p) => p,
            Err(e) => return self.fail(REASON_ERROR_WITH_PARAMETERS, &e.to_string()).await,
        };

        let resend = self.status_ref().is_some_and(|s| {
            s.last_operation
                .as_ref()
                .is_some_and(|op| op.is_in_progress(OperationKind::Bind))
        });
        let client = self.client(&target.endpoint).await?;

        remove_condition(&mut self.status().conditions, CONDITION_FAILED);
        self.begin_operation(OperationKind::Bind);
        let checksum = parameters_checksum(parameters.as_ref());
        let status = self.status();
        status.unbind_status = UnbindStatus::Required;
        status.external_properties = Some(BindingProperties {
            parameters_checksum: checksum,
        });
        self.set_ready(CONDITION_FALSE, REASON_BINDING, "Bind request for ServiceBinding in-flight to Broker");
        self.save_status().await?;

        let request = BindRequest {
            instance_id: target.instance_id.clone(),
            binding_id: self.binding.spec.external_id.clone(),
            accepts_incomplete: self.ctx.config.async_binding_operations,
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
            parameters: wire_parameters,
            context: Some(PlatformContext::kubernetes(&namespace, &self.ctx.config.cluster_id)),
        };
        info!(
            "Binding {} to instance {} at broker {}",
            self.key(),
            instance_name,
            target.endpoint.name
        );

        match client.bind(&request).await {
            Ok(response) if response.is_async() => {
                info!("Binding {} proceeding asynchronously", self.key());
                self.begin_async(response.operation_key);
                self.save_status().await?;
                Ok(Action::requeue(self.ctx.config.poll_interval(None)))
            }
            Ok(response) => match response.credentials {
                Some(credentials) => self.inject_credentials(&credentials).await,
                None => {
                    let err = BrokerError::invalid_response(200, "bind response carries no credentials");
                    self.start_orphan_mitigation(&err.to_string()).await
                }
            },
            Err(BrokerError::Conflict { .. }) if resend => {
                info!("Binding {} already exists at the broker; fetching credentials", self.key());
                self.credentials_ready().await
            }
            Err(e) => self.bind_failed(e).await,
        }
    }

    async fn bind_failed(&mut self, err: BrokerError) -> Result<Action> {
        match err.allocation_disposition() {
            ErrorDisposition::Transient if self.retry_window_exceeded() => {
                let message = format!("Stopped retrying bind after the reconciliation retry duration: {}", err);
                self.start_orphan_mitigation(&message).await
            }
            ErrorDisposition::Transient => {
                warn!("Bind of {} will be retried: {}", self.key(), err);
                self.set_ready(CONDITION_FALSE, err.reason(), &format!("Error binding: {}", err));
                self.save_status().await?;
                Err(err.into())
            }
            ErrorDisposition::OrphanMitigation => {
                self.start_orphan_mitigation(&format!("Bind call failed and may have left a binding: {}", err))
                    .await
            }
            ErrorDisposition::Terminal | ErrorDisposition::Success => {
                self.status().unbind_status = UnbindStatus::NotRequired;
                self.fail(REASON_BIND_CALL_FAILED, &format!("Bind call failed: {}", err)).await
            }
        }
    }

    /// The broker holds the binding; the next pass fetches its credentials.
    async fn credentials_ready(&mut self) -> Result<Action> {
        let status = self.status();
        status.async_op_in_progress = true;
        if let Some(op) = status.last_operation.as_mut() {
            op.state = OperationState::Succeeded;
        }
        self.save_status().await?;
        Ok(Action::requeue(Duration::ZERO))
    }

    async fn inject_credentials(&mut self, credentials: &Map<String, Value>) -> Result<Action> {
        match inject(self.ctx.store(), &self.binding, credentials).await {
            Ok(secret) => {
                info!("Binding {} injected into secret {}", self.key(), secret.name_any());
                let status = self.status();
                status.async_op_in_progress = false;
                status.operation_start_time = None;
                if let Some(op) = status.last_operation.as_mut() {
                    op.state = OperationState::Succeeded;
                    op.operation_key = None;
                }
                remove_condition(&mut status.conditions, CONDITION_FAILED);
                self.set_ready(CONDITION_TRUE, REASON_INJECTED_BIND_RESULT, "Injected bind result");
                self.mark_observed();
                self.save_status().await?;
                Ok(Action::await_change())
            }
            Err(e) => {
                let reason = match e {
                    InjectError::Conflict { .. } => REASON_SECRET_CONFLICT,
                    _ => REASON_ERROR_INJECTING_BIND_RESULT,
                };
                warn!("Binding {} could not inject its credentials: {}", self.key(), e);
                // Re-sent on the next pass; the broker answers an identical bind idempotently.
                let status = self.status();
                status.async_op_in_progress = false;
                status.last_operation = Some(LastOperation::in_progress(OperationKind::Bind));
                self.set_ready(CONDITION_FALSE, reason, &e.to_string());
                self.save_status().await?;
                Err(ControllerError::reconciliation(format!("binding {}: {}", self.key(), e)))
            }
        }
    }

    async fn poll_bind(&mut self) -> Result<Action> {
        let target = match self.target().await? {
            Ok(target) => target,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&target.endpoint).await?;
        debug!("Polling last operation of binding {}", self.key());
        match client.poll_binding_last_operation(&self.poll_request(&target)).await {
            Ok(response) => match response.state {
                LastOperationState::InProgress => Ok(Action::requeue(self.ctx.config.poll_interval(response.poll_delay))),
                LastOperationState::Succeeded => self.credentials_ready().await,
                LastOperationState::Failed => {
                    let message = format!("Asynchronous bind failed: {}", response.description.unwrap_or_default());
                    self.start_orphan_mitigation(&message).await
                }
            },
            Err(e) if e.read_disposition() == ErrorDisposition::Transient => Err(e.into()),
            Err(e) => self.start_orphan_mitigation(&format!("Polling bind failed: {}", e)).await,
        }
    }

    async fn fetch_credentials(&mut self) -> Result<Action> {
        let target = match self.target().await? {
            Ok(target) => target,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&target.endpoint).await?;
        let request = GetBindingRequest {
            instance_id: target.instance_id,
            binding_id: self.binding.spec.external_id.clone(),
        };
        match client.get_binding(&request).await {
            Ok(response) => match response.credentials {
                Some(credentials) => self.inject_credentials(&credentials).await,
                None => self.start_orphan_mitigation("Fetched binding carries no credentials").await,
            },
            Err(e) if e.read_disposition() == ErrorDisposition::Transient => Err(e.into()),
            Err(e) => self.start_orphan_mitigation(&format!("Fetching binding failed: {}", e)).await,
        }
    }

    // Orphan mitigation

    async fn start_orphan_mitigation(&mut self, message: &str) -> Result<Action> {
        warn!("Binding {} needs orphan mitigation: {}", self.key(), message);
        let status = self.status();
        status.orphan_mitigation_in_progress = true;
        status.async_op_in_progress = false;
        set_condition(
            &mut status.conditions,
            build_condition(
                CONDITION_ORPHAN_MITIGATION,
                CONDITION_TRUE,
                REASON_BINDING_NEEDS_ORPHAN_MITIGATION,
                message,
            ),
        );
        self.set_ready(CONDITION_FALSE, REASON_BINDING_NEEDS_ORPHAN_MITIGATION, message);
        self.save_status().await?;
        Ok(Action::requeue(Duration::ZERO))
    }

    async fn orphan_mitigation(&mut self) -> Result<Action> {
        let target = match self.target().await? {
            Ok(target) => target,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&target.endpoint).await?;

        let polling = self.status_ref().is_some_and(|s| {
            s.async_op_in_progress
                && s.last_operation
                    .as_ref()
                    .is_some_and(|op| op.is_in_progress(OperationKind::Unbind))
        });
        if polling {
            return match client.poll_binding_last_operation(&self.poll_request(&target)).await {
                Ok(response) => match response.state {
                    LastOperationState::InProgress => {
                        Ok(Action::requeue(self.ctx.config.poll_interval(response.poll_delay)))
                    }
                    LastOperationState::Succeeded => self.finish_orphan_mitigation().await,
                    LastOperationState::Failed => {
                        self.status().async_op_in_progress = false;
                        let message = response.description.unwrap_or_default();
                        self.orphan_mitigation_failed(&message).await
                    }
                },
                Err(BrokerError::Gone) => self.finish_orphan_mitigation().await,
                Err(e) => self.orphan_mitigation_failed(&e.to_string()).await,
            };
        }

        self.begin_operation(OperationKind::Unbind);
        self.save_status().await?;
        info!("Orphan mitigation: unbinding {}", self.key());
        match client.unbind(&self.unbind_request(&target)).await {
            Ok(response) if response.operation_key.is_some() => {
                self.begin_async(response.operation_key);
                self.save_status().await?;
                Ok(Action::requeue(self.ctx.config.poll_interval(None)))
            }
            Ok(_) => self.finish_orphan_mitigation().await,
            Err(e) if e.destructive_disposition() == ErrorDisposition::Success => self.finish_orphan_mitigation().await,
            Err(e) => self.orphan_mitigation_failed(&e.to_string()).await,
        }
    }

    async fn orphan_mitigation_failed(&mut self, message: &str) -> Result<Action> {
        warn!("Orphan mitigation of binding {} failed, retrying: {}", self.key(), message);
        let message = format!("Orphan mitigation failed: {}", message);
        self.set_ready(CONDITION_FALSE, REASON_ORPHAN_MITIGATION_FAILED, &message);
        self.save_status().await?;
        Err(ControllerError::reconciliation(format!("binding {}: {}", self.key(), message)))
    }

    async fn finish_orphan_mitigation(&mut self) -> Result<Action> {
        info!("Orphan mitigation of binding {} complete", self.key());
        let status = self.status();
        status.orphan_mitigation_in_progress = false;
        status.async_op_in_progress = false;
        status.operation_start_time = None;
        status.unbind_status = UnbindStatus::NotRequired;
        if let Some(op) = status.last_operation.as_mut() {
            op.operation = OperationKind::Bind;
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

    fn unbind_request(&self, target: &BindTarget) -> UnbindRequest {
        UnbindRequest {
            instance_id: target.instance_id.clone(),
            binding_id: self.binding.spec.external_id.clone(),
            accepts_incomplete: self.ctx.config.async_binding_operations,
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
        }
    }

    async fn delete(&mut self) -> Result<Action> {
        if !has_finalizer(&self.binding) {
            return Ok(Action::await_change());
        }
        info!("Handling deletion of binding {}", self.key());

        if self.status_ref().is_some_and(|s| s.orphan_mitigation_in_progress) {
            return self.orphan_mitigation().await.map(continue_deletion);
        }
        let in_flight = self
            .status_ref()
            .filter(|s| s.async_op_in_progress)
            .and_then(|s| s.last_operation.clone());
        match in_flight {
            Some(op) if op.is_in_progress(OperationKind::Unbind) => return self.poll_unbind().await,
            Some(op) if op.is_in_progress(OperationKind::Bind) => return self.poll_bind().await.map(continue_deletion),
            Some(_) => self.status().async_op_in_progress = false,
            None => {}
        }

        let unbind_status = self.status_ref().map(|s| s.unbind_status).unwrap_or_default();
        if matches!(unbind_status, UnbindStatus::NotRequired | UnbindStatus::Succeeded) {
            debug!("Binding {} needs no unbind", self.key());
            return self.release().await;
        }
        self.unbind().await
    }

    async fn unbind(&mut self) -> Result<Action> {
        let target = match self.target().await? {
            Ok(target) => target,
            Err(unresolved) if unresolved.reason == REASON_REFERENCES_NONEXISTENT_INSTANCE => {
                warn!("Binding {} outlived its instance; releasing without unbind", self.key());
                return self.release().await;
            }
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&target.endpoint).await?;

        self.begin_operation(OperationKind::Unbind);
        self.status().unbind_status = UnbindStatus::Required;
        self.set_ready(CONDITION_FALSE, REASON_UNBINDING, "Unbind request for ServiceBinding in-flight to Broker");
        self.save_status().await?;

        info!("Unbinding {} at broker {}", self.key(), target.endpoint.name);
        match client.unbind(&self.unbind_request(&target)).await {
            Ok(response) if response.operation_key.is_some() => {
                self.begin_async(response.operation_key);
                self.save_status().await?;
                Ok(Action::requeue(self.ctx.config.poll_interval(None)))
            }
            Ok(_) => self.finish_unbind().await,
            Err(e) => match e.destructive_disposition() {
                ErrorDisposition::Success => self.finish_unbind().await,
                ErrorDisposition::Transient => {
                    warn!("Unbind of {} will be retried: {}", self.key(), e);
                    self.set_ready(CONDITION_FALSE, e.reason(), &format!("Error unbinding: {}", e));
                    self.save_status().await?;
                    Err(e.into())
                }
                _ => self.unbind_failed(&format!("Unbind call failed: {}", e)).await,
            },
        }
    }

    async fn poll_unbind(&mut self) -> Result<Action> {
        let target = match self.target().await? {
            Ok(target) => target,
            Err(unresolved) => return self.pending(unresolved).await,
        };
        let client = self.client(&target.endpoint).await?;
        match client.poll_binding_last_operation(&self.poll_request(&target)).await {
            Ok(response) => match response.state {
                LastOperationState::InProgress => Ok(Action::requeue(self.ctx.config.poll_interval(response.poll_delay))),
                LastOperationState::Succeeded => self.finish_unbind().await,
                LastOperationState::Failed => {
                    let message = format!("Asynchronous unbind failed: {}", response.description.unwrap_or_default());
                    self.unbind_failed(&message).await
                }
            },
            Err(BrokerError::Gone) => self.finish_unbind().await,
            Err(e) if e.read_disposition() == ErrorDisposition::Transient => Err(e.into()),
            Err(e) => self.unbind_failed(&format!("Polling unbind failed: {}", e)).await,
        }
    }

    async fn unbind_failed(&mut self, message: &str) -> Result<Action> {
        warn!("Unbind of {} failed: {}", self.key(), message);
        let status = self.status();
        status.unbind_status = UnbindStatus::Failed;
        status.async_op_in_progress = false;
        if let Some(op) = status.last_operation.as_mut() {
            op.state = OperationState::Failed;
        }
        self.set_ready(CONDITION_FALSE, REASON_UNBIND_CALL_FAILED, message);
        self.set_failed(REASON_UNBIND_CALL_FAILED, message);
        self.save_status().await?;
        Err(ControllerError::reconciliation(format!("binding {}: {}", self.key(), message)))
    }

    async fn finish_unbind(&mut self) -> Result<Action> {
        info!("Binding {} unbound", self.key());
        let status = self.status();
        status.unbind_status = UnbindStatus::Succeeded;
        status.async_op_in_progress = false;
        status.operation_start_time = None;
        if let Some(op) = status.last_operation.as_mut() {
            op.state = OperationState::Succeeded;
            op.operation_key = None;
        }
        self.set_ready(CONDITION_FALSE, REASON_UNBOUND_SUCCESSFULLY, "The binding was deleted successfully");
        self.save_status().await?;
        self.release().await
    }

    /// Drop the finalizer. The Secret follows through its owner reference.
    async fn release(&mut self) -> Result<Action> {
        remove_finalizer(self.ctx.store(), &self.binding).await?;
        info!("Finalizer removed for binding {}", self.key());
        Ok(Action::await_change())
    }
}

fn continue_deletion(action: Action) -> Action {
    match action {
        Action::AwaitChange => Action::requeue(Duration::ZERO),
        other => other,
    }
}

/// Reconcile one ServiceBinding.
pub async fn reconcile_binding(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let Some(binding) = typed::get::<ServiceBinding>(ctx.store(), Some(namespace), name).await? else {
        debug!("Binding {}/{} no longer exists", namespace, name);
        return Ok(Action::await_change());
    };
    info!("Reconciling ServiceBinding {}/{}", namespace, name);

    let mut pass = BindingPass::new(ctx, binding);
    let state = determine_state(&pass.binding);
    if state == BindingState::Deleting {
        return pass.delete().await;
    }

    let mut changed = add_finalizer(&mut pass.binding);
    if pass.binding.spec.external_id.is_empty() {
        pass.binding.spec.external_id = uuid::Uuid::new_v4().to_string();
        changed = true;
    }
    if changed {
        pass.save_spec().await?;
    }

    match state {
        BindingState::Deleting => pass.delete().await,
        BindingState::OrphanMitigation => pass.orphan_mitigation().await,
        BindingState::PollingBind => pass.poll_bind().await,
        BindingState::FetchingCredentials => pass.fetch_credentials().await,
        BindingState::Binding => pass.bind().await,
        BindingState::NoOp => {
            // Spec edits to a bound binding are not sent to the broker.
            if pass.status_ref().is_some_and(|s| s.observed_generation != pass.generation()) {
                pass.mark_observed();
                pass.save_status().await?;
            }
            Ok(Action::await_change())
        }
    }
}

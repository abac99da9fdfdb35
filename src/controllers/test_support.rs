//! Scripted broker and fixtures for reconciler tests

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{BrokerClientFactory, BrokerEndpoint, Context};
use crate::config::ControllerConfig;
use crate::crd::{ClusterServiceBroker, ServiceBinding, ServiceInstance};
use crate::error::Result;
use crate::osb::*;
use crate::store::{typed, MemoryStore};

type Reply<T> = std::result::Result<T, BrokerError>;

#[derive(Default)]
struct FakeState {
    catalog: Option<Reply<CatalogResponse>>,
    provision: VecDeque<(bool, Reply<ProvisionResponse>)>,
    update: VecDeque<Reply<UpdateInstanceResponse>>,
    deprovision: VecDeque<Reply<DeprovisionResponse>>,
    last_operation: VecDeque<Reply<LastOperationResponse>>,
    bind: VecDeque<(bool, Reply<BindResponse>)>,
    unbind: VecDeque<Reply<UnbindResponse>>,
    calls: Vec<String>,
    instances: HashSet<String>,
    bindings: HashSet<String>,
    provision_requests: Vec<ProvisionRequest>,
    update_requests: Vec<UpdateInstanceRequest>,
}

/// In-process broker. Unscripted calls succeed synchronously; scripted
/// replies are consumed in order. A provision or bind scripted with
/// `allocate = true` leaves the resource allocated whatever it replies.
#[derive(Default)]
pub(crate) struct FakeBroker {
    state: Mutex<FakeState>,
}

pub(crate) fn credentials() -> Map<String, Value> {
    json!({"username": "u", "password": "p", "hostname": "h", "port": "5432"})
        .as_object()
        .cloned()
        .unwrap_or_default()
}

pub(crate) fn in_progress(delay_secs: Option<u64>) -> LastOperationResponse {
    LastOperationResponse {
        state: LastOperationState::InProgress,
        description: None,
        poll_delay: delay_secs.map(std::time::Duration::from_secs),
    }
}

pub(crate) fn operation(state: LastOperationState) -> LastOperationResponse {
    LastOperationResponse {
        state,
        description: None,
        poll_delay: None,
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_catalog(&self, reply: Reply<CatalogResponse>) {
        self.lock().catalog = Some(reply);
    }

    pub fn script_provision(&self, allocate: bool, reply: Reply<ProvisionResponse>) {
        self.lock().provision.push_back((allocate, reply));
    }

    pub fn script_update(&self, reply: Reply<UpdateInstanceResponse>) {
        self.lock().update.push_back(reply);
    }

    pub fn script_deprovision(&self, reply: Reply<DeprovisionResponse>) {
        self.lock().deprovision.push_back(reply);
    }

    pub fn script_last_operation(&self, reply: Reply<LastOperationResponse>) {
        self.lock().last_operation.push_back(reply);
    }

    pub fn script_bind(&self, allocate: bool, reply: Reply<BindResponse>) {
        self.lock().bind.push_back((allocate, reply));
    }

    pub fn script_unbind(&self, reply: Reply<UnbindResponse>) {
        self.lock().unbind.push_back(reply);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls of one operation, e.g. `provision`.
    pub fn calls_to(&self, op: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .count()
    }

    pub fn allocated_instances(&self) -> HashSet<String> {
        self.lock().instances.clone()
    }

    pub fn allocated_bindings(&self) -> HashSet<String> {
        self.lock().bindings.clone()
    }

    pub fn provision_requests(&self) -> Vec<ProvisionRequest> {
        self.lock().provision_requests.clone()
    }

    pub fn update_requests(&self) -> Vec<UpdateInstanceRequest> {
        self.lock().update_requests.clone()
    }

    fn record(state: &mut FakeState, call: String) {
        state.calls.push(call);
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    fn name(&self) -> &str {
        "fake"
    }

    async fn get_catalog(&self) -> Reply<CatalogResponse> {
        let mut state = self.lock();
        Self::record(&mut state, "get_catalog".to_string());
        state.catalog.clone().unwrap_or_else(|| Ok(sample_catalog()))
    }

    async fn provision_instance(&self, request: &ProvisionRequest) -> Reply<ProvisionResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("provision:{}", request.instance_id));
        state.provision_requests.push(request.clone());
        let (allocate, reply) = state
            .provision
            .pop_front()
            .unwrap_or((true, Ok(ProvisionResponse::default())));
        if allocate {
            state.instances.insert(request.instance_id.clone());
        }
        reply
    }

    async fn update_instance(&self, request: &UpdateInstanceRequest) -> Reply<UpdateInstanceResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("update:{}", request.instance_id));
        state.update_requests.push(request.clone());
        state
            .update
            .pop_front()
            .unwrap_or(Ok(UpdateInstanceResponse::default()))
    }

    async fn deprovision_instance(&self, request: &DeprovisionRequest) -> Reply<DeprovisionResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("deprovision:{}", request.instance_id));
        match state.deprovision.pop_front() {
            Some(Ok(response)) => {
                state.instances.remove(&request.instance_id);
                Ok(response)
            }
            Some(Err(e)) => Err(e),
            None if state.instances.remove(&request.instance_id) => Ok(DeprovisionResponse::default()),
            None => Err(BrokerError::Gone),
        }
    }

    async fn poll_last_operation(&self, request: &LastOperationRequest) -> Reply<LastOperationResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("poll:{}", request.instance_id));
        state
            .last_operation
            .pop_front()
            .unwrap_or(Ok(operation(LastOperationState::Succeeded)))
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Reply<LastOperationResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("poll_binding:{}", request.binding_id));
        state
            .last_operation
            .pop_front()
            .unwrap_or(Ok(operation(LastOperationState::Succeeded)))
    }

    async fn bind(&self, request: &BindRequest) -> Reply<BindResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("bind:{}", request.binding_id));
        let (allocate, reply) = state.bind.pop_front().unwrap_or((
            true,
            Ok(BindResponse {
                credentials: Some(credentials()),
                ..Default::default()
            }),
        ));
        if allocate {
            state.bindings.insert(request.binding_id.clone());
        }
        reply
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Reply<BindResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("get_binding:{}", request.binding_id));
        Ok(BindResponse {
            credentials: Some(credentials()),
            ..Default::default()
        })
    }

    async fn unbind(&self, request: &UnbindRequest) -> Reply<UnbindResponse> {
        let mut state = self.lock();
        Self::record(&mut state, format!("unbind:{}", request.binding_id));
        match state.unbind.pop_front() {
            Some(Ok(response)) => {
                state.bindings.remove(&request.binding_id);
                Ok(response)
            }
            Some(Err(e)) => Err(e),
            None if state.bindings.remove(&request.binding_id) => Ok(UnbindResponse::default()),
            None => Err(BrokerError::Gone),
        }
    }
}

/// Hands out the same fake broker for every endpoint.
pub(crate) struct FakeFactory {
    pub broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerClientFactory for FakeFactory {
    async fn client_for(&self, _endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerClient>> {
        Ok(self.broker.clone())
    }
}

pub(crate) fn test_context(store: Arc<MemoryStore>, broker: Arc<FakeBroker>) -> Context {
    Context::new(store, Arc::new(FakeFactory { broker }), ControllerConfig::default())
}

/// One bindable, plan-updatable service `s1` with plans `p1-free` and `p2`.
pub(crate) fn sample_catalog() -> CatalogResponse {
    serde_json::from_value(json!({
        "services": [{
            "id": "s1-id",
            "name": "s1",
            "description": "a sample service",
            "bindable": true,
            "plan_updateable": true,
            "plans": [
                {"id": "p1-id", "name": "p1-free", "description": "free plan", "free": true},
                {"id": "p2-id", "name": "p2", "description": "paid plan", "free": false}
            ]
        }]
    }))
    .unwrap()
}

/// Create cluster broker `ups` and materialize its catalog.
pub(crate) async fn seed_catalog(ctx: &Context) {
    let broker: ClusterServiceBroker = serde_json::from_value(json!({
        "apiVersion": "servicecatalog.k8s.io/v1beta1",
        "kind": "ClusterServiceBroker",
        "metadata": {"name": "ups"},
        "spec": {"url": "http://ups.example", "relistBehavior": "Manual"}
    }))
    .unwrap();
    typed::create(ctx.store(), &broker).await.unwrap();
    super::catalog::reconcile_broker::<
        ClusterServiceBroker,
        crate::crd::ClusterServiceClass,
        crate::crd::ClusterServicePlan,
    >(ctx, None, "ups")
    .await
    .unwrap();
}

pub(crate) async fn create_instance(ctx: &Context, name: &str, plan: &str) -> ServiceInstance {
    let instance: ServiceInstance = serde_json::from_value(json!({
        "apiVersion": "servicecatalog.k8s.io/v1beta1",
        "kind": "ServiceInstance",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {
            "clusterServiceClassExternalName": "s1",
            "clusterServicePlanExternalName": plan
        }
    }))
    .unwrap();
    typed::create(ctx.store(), &instance).await.unwrap()
}

pub(crate) async fn create_binding(ctx: &Context, name: &str, instance: &str, secret: Option<&str>) -> ServiceBinding {
    let binding: ServiceBinding = serde_json::from_value(json!({
        "apiVersion": "servicecatalog.k8s.io/v1beta1",
        "kind": "ServiceBinding",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {"instanceRef": {"name": instance}, "secretName": secret}
    }))
    .unwrap();
    typed::create(ctx.store(), &binding).await.unwrap()
}

pub(crate) async fn get_instance(ctx: &Context, name: &str) -> Option<ServiceInstance> {
    typed::get(ctx.store(), Some("default"), name).await.unwrap()
}

pub(crate) async fn get_binding(ctx: &Context, name: &str) -> Option<ServiceBinding> {
    typed::get(ctx.store(), Some("default"), name).await.unwrap()
}

/// Run the instance reconciler until it settles or `passes` runs out.
/// Errors are swallowed the way the work queue would retry them.
pub(crate) async fn settle_instance(ctx: &Context, name: &str, passes: usize) {
    for _ in 0..passes {
        match super::instance::reconcile_instance(ctx, "default", name).await {
            Ok(super::Action::AwaitChange) => return,
            _ => continue,
        }
    }
}

pub(crate) async fn settle_binding(ctx: &Context, name: &str, passes: usize) {
    for _ in 0..passes {
        match super::binding::reconcile_binding(ctx, "default", name).await {
            Ok(super::Action::AwaitChange) => return,
            _ => continue,
        }
    }
}

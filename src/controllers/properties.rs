//! Reconciler properties over random broker behavior
//!
//! The model broker answers every mutating call from a random script, tracks
//! which instances and bindings it holds and flags any mutating call on a
//! resource whose asynchronous operation is still running.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use proptest::prelude::*;
use serde_json::{json, Map, Value};

use super::binding::reconcile_binding;
use super::catalog::reconcile_broker;
use super::injector::credentials_to_data;
use super::instance::reconcile_instance;
use super::test_support::{create_binding, create_instance, get_binding, get_instance, sample_catalog, seed_catalog};
use super::{Action, BrokerClientFactory, BrokerEndpoint, Context};
use crate::conditions::{is_condition_true, CONDITION_FAILED, CONDITION_READY};
use crate::config::ControllerConfig;
use crate::crd::{ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceInstance};
use crate::error::Result;
use crate::osb::*;
use crate::store::{typed, ListOptions, MemoryStore};

type Reply<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone)]
enum ProvisionOutcome {
    Sync,
    Async { polls: usize, succeed: bool, leaves_allocation: bool },
    Timeout { allocated: bool },
    Unreachable,
    Rejected,
}

#[derive(Debug, Clone)]
enum DeprovisionOutcome {
    Sync,
    Async { polls: usize },
    Unreachable,
}

#[derive(Debug, Clone)]
enum BindOutcome {
    Sync,
    MissingCredentials,
    Async { polls: usize, succeed: bool, leaves_allocation: bool },
    Timeout { allocated: bool },
    Unreachable,
    Rejected,
}

#[derive(Debug, Clone)]
enum UnbindOutcome {
    Sync,
    Async { polls: usize },
    Unreachable,
}

#[derive(Debug)]
enum OperationEnd {
    Provisioned,
    ProvisionFailed { leaves_allocation: bool },
    Deprovisioned,
    Bound(Map<String, Value>),
    BindFailed { credentials: Map<String, Value>, leaves_allocation: bool },
    Unbound,
}

#[derive(Debug)]
struct Running {
    polls_left: usize,
    end: OperationEnd,
}

#[derive(Default)]
struct ModelState {
    provision: VecDeque<ProvisionOutcome>,
    deprovision: VecDeque<DeprovisionOutcome>,
    bind: VecDeque<BindOutcome>,
    unbind: VecDeque<UnbindOutcome>,
    allocated: HashSet<String>,
    /// Bindings the broker holds, with the credentials it issued for each.
    bound: HashMap<String, Map<String, Value>>,
    /// Credentials last handed to the controller, per binding.
    delivered: HashMap<String, Map<String, Value>>,
    issued: u64,
    running: HashMap<String, Running>,
    violations: Vec<String>,
}

impl ModelState {
    fn check_idle(&mut self, id: &str, call: &str) {
        if self.running.contains_key(id) {
            self.violations
                .push(format!("{} of {} while its operation was in flight", call, id));
        }
    }

    fn issue_credentials(&mut self) -> Map<String, Value> {
        self.issued += 1;
        let n = self.issued;
        json!({"username": format!("user-{}", n), "password": format!("secret-{}", n), "port": 5432 + n})
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    fn poll(&mut self, id: &str) -> Reply<LastOperationResponse> {
        let Some(mut running) = self.running.remove(id) else {
            self.violations.push(format!("poll of {} with no operation running", id));
            return Err(BrokerError::Gone);
        };
        if running.polls_left > 0 {
            running.polls_left -= 1;
            self.running.insert(id.to_string(), running);
            return Ok(LastOperationResponse {
                state: LastOperationState::InProgress,
                description: None,
                poll_delay: None,
            });
        }
        let finished = match running.end {
            OperationEnd::Provisioned => {
                self.allocated.insert(id.to_string());
                LastOperationState::Succeeded
            }
            OperationEnd::ProvisionFailed { leaves_allocation } => {
                if leaves_allocation {
                    self.allocated.insert(id.to_string());
                }
                LastOperationState::Failed
            }
            OperationEnd::Deprovisioned => {
                self.allocated.remove(id);
                LastOperationState::Succeeded
            }
            OperationEnd::Bound(credentials) => {
                self.bound.insert(id.to_string(), credentials);
                LastOperationState::Succeeded
            }
            OperationEnd::BindFailed {
                credentials,
                leaves_allocation,
            } => {
                if leaves_allocation {
                    self.bound.insert(id.to_string(), credentials);
                }
                LastOperationState::Failed
            }
            OperationEnd::Unbound => {
                self.bound.remove(id);
                LastOperationState::Succeeded
            }
        };
        Ok(LastOperationResponse {
            state: finished,
            description: None,
            poll_delay: None,
        })
    }
}

#[derive(Default)]
struct ModelBroker {
    state: Mutex<ModelState>,
}

impl ModelBroker {
    fn new(provision: Vec<ProvisionOutcome>, deprovision: Vec<DeprovisionOutcome>) -> Self {
        Self::scripted(provision, deprovision, Vec::new(), Vec::new())
    }

    fn scripted(
        provision: Vec<ProvisionOutcome>,
        deprovision: Vec<DeprovisionOutcome>,
        bind: Vec<BindOutcome>,
        unbind: Vec<UnbindOutcome>,
    ) -> Self {
        Self {
            state: Mutex::new(ModelState {
                provision: provision.into(),
                deprovision: deprovision.into(),
                bind: bind.into(),
                unbind: unbind.into(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap()
    }

    fn holds(&self, instance_id: &str) -> bool {
        self.lock().allocated.contains(instance_id)
    }

    fn holds_binding(&self, binding_id: &str) -> bool {
        self.lock().bound.contains_key(binding_id)
    }

    fn holds_nothing(&self) -> bool {
        let state = self.lock();
        state.allocated.is_empty() && state.bound.is_empty()
    }

    fn delivered(&self, binding_id: &str) -> Option<Map<String, Value>> {
        self.lock().delivered.get(binding_id).cloned()
    }

    fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }
}

fn rejected(description: &str) -> BrokerError {
    BrokerError::Reported {
        status: 400,
        error: Some("BadRequest".to_string()),
        description: Some(description.to_string()),
    }
}

#[async_trait]
impl BrokerClient for ModelBroker {
    fn name(&self) -> &str {
        "model"
    }

    async fn get_catalog(&self) -> Reply<CatalogResponse> {
        Ok(sample_catalog())
    }

    async fn provision_instance(&self, request: &ProvisionRequest) -> Reply<ProvisionResponse> {
        let mut state = self.lock();
        let id = request.instance_id.clone();
        state.check_idle(&id, "provision");
        match state.provision.pop_front().unwrap_or(ProvisionOutcome::Sync) {
            ProvisionOutcome::Sync => {
                state.allocated.insert(id);
                Ok(ProvisionResponse::default())
            }
            ProvisionOutcome::Async {
                polls,
                succeed,
                leaves_allocation,
            } => {
                let end = if succeed {
                    OperationEnd::Provisioned
                } else {
                    OperationEnd::ProvisionFailed { leaves_allocation }
                };
                state.running.insert(id, Running { polls_left: polls, end });
                Ok(ProvisionResponse {
                    dashboard_url: None,
                    operation_key: Some("provision-op".to_string()),
                })
            }
            ProvisionOutcome::Timeout { allocated } => {
                if allocated {
                    state.allocated.insert(id);
                }
                Err(BrokerError::ambiguous("request timed out"))
            }
            ProvisionOutcome::Unreachable => Err(BrokerError::unreachable("connection refused")),
            ProvisionOutcome::Rejected => Err(rejected("plan is not available")),
        }
    }

    async fn update_instance(&self, _request: &UpdateInstanceRequest) -> Reply<UpdateInstanceResponse> {
        Ok(UpdateInstanceResponse::default())
    }

    async fn deprovision_instance(&self, request: &DeprovisionRequest) -> Reply<DeprovisionResponse> {
        let mut state = self.lock();
        let id = request.instance_id.clone();
        state.check_idle(&id, "deprovision");
        match state.deprovision.pop_front().unwrap_or(DeprovisionOutcome::Sync) {
            DeprovisionOutcome::Unreachable => Err(BrokerError::unreachable("connection refused")),
            _ if !state.allocated.contains(&id) => Err(BrokerError::Gone),
            DeprovisionOutcome::Sync => {
                state.allocated.remove(&id);
                Ok(DeprovisionResponse::default())
            }
            DeprovisionOutcome::Async { polls } => {
                state.running.insert(
                    id,
                    Running {
                        polls_left: polls,
                        end: OperationEnd::Deprovisioned,
                    },
                );
                Ok(DeprovisionResponse {
                    operation_key: Some("deprovision-op".to_string()),
                })
            }
        }
    }

    async fn poll_last_operation(&self, request: &LastOperationRequest) -> Reply<LastOperationResponse> {
        self.lock().poll(&request.instance_id)
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Reply<LastOperationResponse> {
        self.lock().poll(&request.binding_id)
    }

    async fn bind(&self, request: &BindRequest) -> Reply<BindResponse> {
        let mut state = self.lock();
        let id = request.binding_id.clone();
        state.check_idle(&id, "bind");
        if !state.allocated.contains(&request.instance_id) {
            state.violations.push(format!("bind of {} to an instance the broker does not hold", id));
        }
        match state.bind.pop_front().unwrap_or(BindOutcome::Sync) {
            BindOutcome::Sync => {
                let credentials = state.issue_credentials();
                state.bound.insert(id.clone(), credentials.clone());
                state.delivered.insert(id, credentials.clone());
                Ok(BindResponse {
                    credentials: Some(credentials),
                    ..Default::default()
                })
            }
            BindOutcome::MissingCredentials => {
                let credentials = state.issue_credentials();
                state.bound.insert(id, credentials);
                Ok(BindResponse::default())
            }
            BindOutcome::Async {
                polls,
                succeed,
                leaves_allocation,
            } => {
                let credentials = state.issue_credentials();
                let end = if succeed {
                    OperationEnd::Bound(credentials)
                } else {
                    OperationEnd::BindFailed {
                        credentials,
                        leaves_allocation,
                    }
                };
                state.running.insert(id, Running { polls_left: polls, end });
                Ok(BindResponse {
                    operation_key: Some("bind-op".to_string()),
                    ..Default::default()
                })
            }
            BindOutcome::Timeout { allocated } => {
                if allocated {
                    let credentials = state.issue_credentials();
                    state.bound.insert(id, credentials);
                }
                Err(BrokerError::ambiguous("request timed out"))
            }
            BindOutcome::Unreachable => Err(BrokerError::unreachable("connection refused")),
            BindOutcome::Rejected => Err(rejected("binding parameters refused")),
        }
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Reply<BindResponse> {
        let mut state = self.lock();
        let Some(credentials) = state.bound.get(&request.binding_id).cloned() else {
            return Err(BrokerError::Gone);
        };
        state.delivered.insert(request.binding_id.clone(), credentials.clone());
        Ok(BindResponse {
            credentials: Some(credentials),
            ..Default::default()
        })
    }

    async fn unbind(&self, request: &UnbindRequest) -> Reply<UnbindResponse> {
        let mut state = self.lock();
        let id = request.binding_id.clone();
        state.check_idle(&id, "unbind");
        match state.unbind.pop_front().unwrap_or(UnbindOutcome::Sync) {
            UnbindOutcome::Unreachable => Err(BrokerError::unreachable("connection refused")),
            _ if !state.bound.contains_key(&id) => Err(BrokerError::Gone),
            UnbindOutcome::Sync => {
                state.bound.remove(&id);
                Ok(UnbindResponse::default())
            }
            UnbindOutcome::Async { polls } => {
                state.running.insert(
                    id,
                    Running {
                        polls_left: polls,
                        end: OperationEnd::Unbound,
                    },
                );
                Ok(UnbindResponse {
                    operation_key: Some("unbind-op".to_string()),
                })
            }
        }
    }
}

struct ModelFactory {
    broker: Arc<ModelBroker>,
}

#[async_trait]
impl BrokerClientFactory for ModelFactory {
    async fn client_for(&self, _endpoint: &BrokerEndpoint) -> Result<Arc<dyn BrokerClient>> {
        Ok(self.broker.clone())
    }
}

fn model_context(broker: &Arc<ModelBroker>, config: ControllerConfig) -> Context {
    Context::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ModelFactory { broker: broker.clone() }),
        config,
    )
}

fn provision_outcome() -> impl Strategy<Value = ProvisionOutcome> {
    prop_oneof![
        Just(ProvisionOutcome::Sync),
        (0usize..4, any::<bool>(), any::<bool>()).prop_map(|(polls, succeed, leaves_allocation)| {
            ProvisionOutcome::Async {
                polls,
                succeed,
                leaves_allocation,
            }
        }),
        any::<bool>().prop_map(|allocated| ProvisionOutcome::Timeout { allocated }),
        Just(ProvisionOutcome::Unreachable),
        Just(ProvisionOutcome::Rejected),
    ]
}

fn deprovision_outcome() -> impl Strategy<Value = DeprovisionOutcome> {
    prop_oneof![
        Just(DeprovisionOutcome::Sync),
        (0usize..4).prop_map(|polls| DeprovisionOutcome::Async { polls }),
        Just(DeprovisionOutcome::Unreachable),
    ]
}

fn bind_outcome() -> impl Strategy<Value = BindOutcome> {
    prop_oneof![
        Just(BindOutcome::Sync),
        Just(BindOutcome::MissingCredentials),
        (0usize..4, any::<bool>(), any::<bool>()).prop_map(|(polls, succeed, leaves_allocation)| {
            BindOutcome::Async {
                polls,
                succeed,
                leaves_allocation,
            }
        }),
        any::<bool>().prop_map(|allocated| BindOutcome::Timeout { allocated }),
        Just(BindOutcome::Unreachable),
        Just(BindOutcome::Rejected),
    ]
}

fn unbind_outcome() -> impl Strategy<Value = UnbindOutcome> {
    prop_oneof![
        Just(UnbindOutcome::Sync),
        (0usize..4).prop_map(|polls| UnbindOutcome::Async { polls }),
        Just(UnbindOutcome::Unreachable),
    ]
}

/// Reconcile until the instance asks for nothing more. Errors count as a
/// retry, the way the work queue treats them.
async fn converge(ctx: &Context, name: &str, passes: usize) -> bool {
    for _ in 0..passes {
        if let Ok(Action::AwaitChange) = reconcile_instance(ctx, "default", name).await {
            return true;
        }
    }
    false
}

async fn converge_binding(ctx: &Context, name: &str, passes: usize) -> bool {
    for _ in 0..passes {
        if let Ok(Action::AwaitChange) = reconcile_binding(ctx, "default", name).await {
            return true;
        }
    }
    false
}

async fn run_scenario(provision: Vec<ProvisionOutcome>, deprovision: Vec<DeprovisionOutcome>) {
    let broker = Arc::new(ModelBroker::new(provision.clone(), deprovision.clone()));
    let ctx = model_context(&broker, ControllerConfig::default());
    seed_catalog(&ctx).await;
    create_instance(&ctx, "i1", "p1-free").await;

    let settled = converge(&ctx, "i1", 200).await;
    assert!(settled, "instance never settled for {:?} / {:?}", provision, deprovision);

    let instance = get_instance(&ctx, "i1").await.unwrap();
    let status = instance.status.clone().unwrap_or_default();
    let ready = is_condition_true(&status.conditions, CONDITION_READY);
    let failed = is_condition_true(&status.conditions, CONDITION_FAILED);

    assert_eq!(Some(status.observed_generation), instance.metadata.generation);
    assert!(ready != failed, "ready={} failed={} for {:?}", ready, failed, provision);
    if failed {
        assert!(
            !broker.holds(&instance.spec.external_id),
            "failed instance still allocated at the broker for {:?} / {:?}",
            provision,
            deprovision
        );
    }
    if ready {
        assert!(broker.holds(&instance.spec.external_id));
    }
    assert_eq!(broker.violations(), Vec::<String>::new());
}

async fn secret(ctx: &Context, name: &str) -> Option<Secret> {
    typed::get(ctx.store(), Some("default"), name).await.unwrap()
}

async fn run_binding_scenario(bind: Vec<BindOutcome>, unbind: Vec<UnbindOutcome>) {
    let broker = Arc::new(ModelBroker::scripted(Vec::new(), Vec::new(), bind.clone(), unbind.clone()));
    let config = ControllerConfig {
        async_binding_operations: true,
        ..Default::default()
    };
    let ctx = model_context(&broker, config);
    seed_catalog(&ctx).await;
    create_instance(&ctx, "i1", "p1-free").await;
    assert!(converge(&ctx, "i1", 10).await);
    create_binding(&ctx, "b1", "i1", Some("b1-creds")).await;

    let settled = converge_binding(&ctx, "b1", 200).await;
    assert!(settled, "binding never settled for {:?} / {:?}", bind, unbind);

    let binding = get_binding(&ctx, "b1").await.unwrap();
    let status = binding.status.clone().unwrap_or_default();
    let ready = is_condition_true(&status.conditions, CONDITION_READY);
    let failed = is_condition_true(&status.conditions, CONDITION_FAILED);
    let id = binding.spec.external_id.clone();

    assert_eq!(Some(status.observed_generation), binding.metadata.generation);
    assert!(ready != failed, "ready={} failed={} for {:?} / {:?}", ready, failed, bind, unbind);
    if ready {
        assert!(broker.holds_binding(&id));
        let secret = secret(&ctx, "b1-creds").await.expect("ready binding has its secret");
        let owners = secret.metadata.owner_references.clone().unwrap_or_default();
        assert_eq!(owners.len(), 1, "secret owners {:?}", owners);
        assert_eq!(Some(owners[0].uid.clone()), binding.metadata.uid);
        let delivered = broker.delivered(&id).expect("credentials were delivered");
        let expected: BTreeMap<String, ByteString> = credentials_to_data(&delivered, None)
            .into_iter()
            .map(|(k, v)| (k, ByteString(v)))
            .collect();
        assert_eq!(secret.data, Some(expected));
    }
    if failed {
        assert!(
            !broker.holds_binding(&id),
            "failed binding still held at the broker for {:?} / {:?}",
            bind,
            unbind
        );
        assert!(secret(&ctx, "b1-creds").await.is_none());
    }

    typed::delete::<ServiceBinding>(ctx.store(), Some("default"), "b1").await.unwrap();
    assert!(converge_binding(&ctx, "b1", 200).await);
    assert!(get_binding(&ctx, "b1").await.is_none());
    assert!(secret(&ctx, "b1-creds").await.is_none());
    assert!(!broker.holds_binding(&id));
    assert_eq!(broker.violations(), Vec::<String>::new());
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    Broker,
    Instance,
    Binding(usize),
}

const BINDINGS: [&str; 2] = ["b1", "b2"];

fn target() -> impl Strategy<Value = Target> {
    prop_oneof![
        Just(Target::Broker),
        Just(Target::Instance),
        (0usize..2).prop_map(Target::Binding),
    ]
}

async fn reconcile_target(ctx: &Context, target: Target) {
    // Errors are retried by the next reconcile, as the work queue would.
    let _ = match target {
        Target::Broker => {
            reconcile_broker::<ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan>(ctx, None, "ups").await
        }
        Target::Instance => reconcile_instance(ctx, "default", "i1").await,
        Target::Binding(i) => reconcile_binding(ctx, "default", BINDINGS[i]).await,
    };
}

async fn delete_target(ctx: &Context, target: Target) {
    let store = ctx.store();
    let deleted = match target {
        Target::Broker => typed::delete_if_exists::<ClusterServiceBroker>(store, None, "ups").await,
        Target::Instance => typed::delete_if_exists::<ServiceInstance>(store, Some("default"), "i1").await,
        Target::Binding(i) => typed::delete_if_exists::<ServiceBinding>(store, Some("default"), BINDINGS[i]).await,
    };
    deleted.unwrap();
}

/// Dependents must leave the store before the record they hang off.
async fn check_release_order(ctx: &Context, history: &[String]) {
    let store = ctx.store();
    let everything = ListOptions::all();
    if get_instance(ctx, "i1").await.is_none() {
        let bindings: Vec<ServiceBinding> = typed::list(store, &everything).await.unwrap();
        let secrets: Vec<Secret> = typed::list(store, &everything).await.unwrap();
        assert!(
            bindings.iter().all(|b| b.spec.instance_ref.name != "i1"),
            "instance released before its bindings after {:?}",
            history
        );
        assert!(secrets.is_empty(), "instance released before its secrets after {:?}", history);
    }
    if typed::get::<ClusterServiceBroker>(store, None, "ups").await.unwrap().is_none() {
        let classes: Vec<ClusterServiceClass> = typed::list(store, &everything).await.unwrap();
        let plans: Vec<ClusterServicePlan> = typed::list(store, &everything).await.unwrap();
        assert!(
            classes.is_empty() && plans.is_empty(),
            "broker released before its catalog after {:?}",
            history
        );
    }
}

async fn run_deletion_scenario(
    order: Vec<Target>,
    bursts: Vec<Vec<Target>>,
    deprovision: Vec<DeprovisionOutcome>,
    unbind: Vec<UnbindOutcome>,
) {
    let broker = Arc::new(ModelBroker::scripted(Vec::new(), deprovision, Vec::new(), unbind));
    let config = ControllerConfig {
        async_binding_operations: true,
        ..Default::default()
    };
    let ctx = model_context(&broker, config);
    seed_catalog(&ctx).await;
    create_instance(&ctx, "i1", "p1-free").await;
    assert!(converge(&ctx, "i1", 10).await);
    for name in BINDINGS {
        create_binding(&ctx, name, "i1", Some(&format!("{}-creds", name))).await;
        assert!(converge_binding(&ctx, name, 10).await);
    }

    let mut history = Vec::new();
    for (target, burst) in order.iter().zip(bursts) {
        for step in burst {
            reconcile_target(&ctx, step).await;
            history.push(format!("reconcile {:?}", step));
            check_release_order(&ctx, &history).await;
        }
        delete_target(&ctx, *target).await;
        history.push(format!("delete {:?}", target));
        check_release_order(&ctx, &history).await;
    }

    // Dependents first, then the broker.
    for _ in 0..40 {
        for step in [Target::Binding(0), Target::Binding(1), Target::Instance] {
            reconcile_target(&ctx, step).await;
            history.push(format!("reconcile {:?}", step));
            check_release_order(&ctx, &history).await;
        }
    }
    for _ in 0..3 {
        reconcile_target(&ctx, Target::Broker).await;
        history.push("reconcile Broker".to_string());
        check_release_order(&ctx, &history).await;
    }

    let store = ctx.store();
    assert!(typed::get::<ClusterServiceBroker>(store, None, "ups").await.unwrap().is_none());
    if order.last() == Some(&Target::Broker) {
        assert!(get_instance(&ctx, "i1").await.is_none(), "instance left after {:?}", history);
        for name in BINDINGS {
            assert!(get_binding(&ctx, name).await.is_none(), "{} left after {:?}", name, history);
        }
        assert!(broker.holds_nothing());
    }
    assert_eq!(broker.violations(), Vec::<String>::new());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_instance_settles_without_leaking_allocations(
        provision in prop::collection::vec(provision_outcome(), 0..5),
        deprovision in prop::collection::vec(deprovision_outcome(), 0..4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_scenario(provision, deprovision));
    }

    #[test]
    fn prop_binding_settles_with_owned_secret(
        bind in prop::collection::vec(bind_outcome(), 0..5),
        unbind in prop::collection::vec(unbind_outcome(), 0..4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_binding_scenario(bind, unbind));
    }

    #[test]
    fn prop_dependents_are_released_first(
        order in Just(vec![Target::Broker, Target::Instance, Target::Binding(0)]).prop_shuffle(),
        bursts in prop::collection::vec(prop::collection::vec(target(), 0..6), 3),
        deprovision in prop::collection::vec(deprovision_outcome(), 0..3),
        unbind in prop::collection::vec(unbind_outcome(), 0..4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_deletion_scenario(order, bursts, deprovision, unbind));
    }
}

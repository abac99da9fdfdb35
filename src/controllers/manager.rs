//! Controller loop
//!
//! One watch task per reconciled kind feeds a rate-limited work queue per
//! reconciler group; a pool of workers drains each queue. The queue
//! guarantees a key is reconciled by one worker at a time.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::ResourceExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{binding, catalog, instance, Action, Context, ObjectKey, WorkQueue};
use crate::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBroker, ServiceClass, ServicePlan,
};
use crate::error::Result;
use crate::store::{Kind, ListOptions, Store, WatchEvent};

/// Kinds with a reconciler
pub const WATCHED_KINDS: [Kind; 4] = [
    Kind::ClusterServiceBroker,
    Kind::ServiceBroker,
    Kind::ServiceInstance,
    Kind::ServiceBinding,
];

const WATCH_RESTART_DELAY: Duration = Duration::from_secs(5);

pub struct Manager {
    ctx: Arc<Context>,
    brokers: WorkQueue<ObjectKey>,
    instances: WorkQueue<ObjectKey>,
    bindings: WorkQueue<ObjectKey>,
}

impl Manager {
    pub fn new(ctx: Context) -> Self {
        let config = &ctx.config;
        let queue = |kind| WorkQueue::new(config.backoff_base, config.backoff_max(kind));
        let brokers = queue(Kind::ClusterServiceBroker);
        let instances = queue(Kind::ServiceInstance);
        let bindings = queue(Kind::ServiceBinding);
        Self {
            ctx: Arc::new(ctx),
            brokers,
            instances,
            bindings,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn queue_for(&self, kind: Kind) -> &WorkQueue<ObjectKey> {
        match kind {
            Kind::ServiceInstance => &self.instances,
            Kind::ServiceBinding => &self.bindings,
            _ => &self.brokers,
        }
    }

    pub fn enqueue(&self, key: ObjectKey) {
        self.queue_for(key.kind).add(key);
    }

    /// Run one reconciliation for a key.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let ctx = self.ctx.as_ref();
        let namespace = key.namespace.as_deref().unwrap_or_default();
        match key.kind {
            Kind::ClusterServiceBroker => {
                catalog::reconcile_broker::<ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan>(
                    ctx, None, &key.name,
                )
                .await
            }
            Kind::ServiceBroker => {
                catalog::reconcile_broker::<ServiceBroker, ServiceClass, ServicePlan>(ctx, key.namespace.as_deref(), &key.name)
                    .await
            }
            Kind::ServiceInstance => instance::reconcile_instance(ctx, namespace, &key.name).await,
            Kind::ServiceBinding => binding::reconcile_binding(ctx, namespace, &key.name).await,
            other => {
                debug!("No reconciler for {}", other);
                Ok(Action::await_change())
            }
        }
    }

    /// Feed the outcome of a reconciliation back into the key's queue.
    fn requeue(&self, key: ObjectKey, result: Result<Action>) {
        let queue = self.queue_for(key.kind);
        match result {
            Ok(Action::Requeue(delay)) => {
                queue.forget(&key);
                queue.add_after(key, delay);
            }
            Ok(Action::AwaitChange) => queue.forget(&key),
            Err(e) => {
                let attempts = queue.num_requeues(&key) + 1;
                if e.is_conflict() {
                    debug!("Conflict reconciling {}, retrying (attempt {})", key, attempts);
                } else {
                    warn!("Error reconciling {} (attempt {}): {}", key, attempts, e);
                }
                queue.add_rate_limited(key);
            }
        }
    }

    /// React to one watch event.
    async fn dispatch(&self, kind: Kind, event: WatchEvent) {
        let obj = event.object();
        let key = ObjectKey::new(kind, obj.namespace().as_deref(), &obj.name_any());
        if kind == Kind::ServiceInstance {
            self.enqueue_bindings_of(&key).await;
        }
        self.enqueue(key);
    }

    /// Bindings wait on their instance; wake them when it changes.
    async fn enqueue_bindings_of(&self, instance: &ObjectKey) {
        let Some(namespace) = instance.namespace.as_deref() else {
            return;
        };
        let options = ListOptions::in_namespace(namespace).field("spec.instanceRef.name", instance.name.as_str());
        match self.ctx.store().list(Kind::ServiceBinding, &options).await {
            Ok(bindings) => {
                for b in bindings {
                    self.enqueue(ObjectKey::new(Kind::ServiceBinding, Some(namespace), &b.name_any()));
                }
            }
            Err(e) => warn!("Could not list bindings of {}: {}", instance, e),
        }
    }

    async fn watch_kind(self: Arc<Self>, kind: Kind, shutdown: CancellationToken) {
        loop {
            let mut events = match self.ctx.store().watch(kind).await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to watch {}: {}", kind, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_RESTART_DELAY) => continue,
                    }
                }
            };
            info!("Watching {}", kind);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = events.next() => match next {
                        Some(Ok(event)) => self.dispatch(kind, event).await,
                        Some(Err(e)) => {
                            warn!("Watch of {} failed: {}", kind, e);
                            break;
                        }
                        None => {
                            warn!("Watch of {} ended", kind);
                            break;
                        }
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RESTART_DELAY) => {}
            }
        }
    }

    async fn worker(self: Arc<Self>, kind: Kind, id: usize) {
        let queue = self.queue_for(kind).clone();
        debug!("Worker {} for {} started", id, kind);
        while let Some(key) = queue.get().await {
            let result = self.reconcile(&key).await;
            self.requeue(key.clone(), result);
            queue.done(&key);
        }
        debug!("Worker {} for {} stopped", id, kind);
    }

    /// Run until `shutdown` is cancelled. In-flight reconciliations finish;
    /// queued keys are abandoned.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting controllers ({} broker, {} instance, {} binding workers)",
            self.ctx.config.broker_workers, self.ctx.config.instance_workers, self.ctx.config.binding_workers
        );

        let mut watchers = JoinSet::new();
        for kind in WATCHED_KINDS {
            watchers.spawn(Arc::clone(&self).watch_kind(kind, shutdown.clone()));
        }

        let mut workers = JoinSet::new();
        for kind in [Kind::ClusterServiceBroker, Kind::ServiceInstance, Kind::ServiceBinding] {
            for id in 0..self.ctx.config.workers(kind).max(1) {
                workers.spawn(Arc::clone(&self).worker(kind, id));
            }
        }

        shutdown.cancelled().await;
        info!("Shutting down controllers");
        self.brokers.shutdown();
        self.instances.shutdown();
        self.bindings.shutdown();

        while let Some(joined) = watchers.join_next().await {
            if let Err(e) = joined {
                error!("Watch task failed: {}", e);
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Controllers stopped");
        Ok(())
    }
}

//! Controller configuration
//!
//! [`ControllerConfig`] is what the reconcilers read. Binaries fill it from
//! [`ControllerArgs`], a clap argument group that can also be set through
//! environment variables.

use std::time::Duration;

use clap::Args;

use crate::osb::DEFAULT_API_VERSION;
use crate::store::Kind;

/// Tunables shared by every reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Sent to brokers as the platform context's cluster id
    pub cluster_id: String,
    pub broker_workers: usize,
    pub instance_workers: usize,
    pub binding_workers: usize,
    pub broker_timeout: Duration,
    pub api_version: String,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub default_poll_interval: Duration,
    pub backoff_base: Duration,
    pub broker_backoff_max: Duration,
    pub instance_backoff_max: Duration,
    pub binding_backoff_max: Duration,
    /// How long an unreachable broker is retried during provision or bind
    /// before the operation is given up
    pub reconciliation_retry_duration: Duration,
    /// Recheck interval for records waiting on a dependency
    pub pending_retry_interval: Duration,
    /// Allow brokers to complete bind and unbind asynchronously
    pub async_binding_operations: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "service-catalog".to_string(),
            broker_workers: 5,
            instance_workers: 5,
            binding_workers: 5,
            broker_timeout: Duration::from_secs(60),
            api_version: DEFAULT_API_VERSION.to_string(),
            min_poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(10 * 60),
            default_poll_interval: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            broker_backoff_max: Duration::from_secs(5 * 60),
            instance_backoff_max: Duration::from_secs(20 * 60),
            binding_backoff_max: Duration::from_secs(20 * 60),
            reconciliation_retry_duration: Duration::from_secs(7 * 24 * 60 * 60),
            pending_retry_interval: Duration::from_secs(10),
            async_binding_operations: false,
        }
    }
}

impl ControllerConfig {
    /// Interval before the next last-operation poll. A broker-supplied
    /// delay is clamped to the configured bounds.
    pub fn poll_interval(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_poll_interval)
            .clamp(self.min_poll_interval, self.max_poll_interval)
    }

    /// Upper bound of the failure backoff for a kind.
    pub fn backoff_max(&self, kind: Kind) -> Duration {
        match kind {
            Kind::ClusterServiceBroker | Kind::ServiceBroker => self.broker_backoff_max,
            Kind::ServiceBinding => self.binding_backoff_max,
            _ => self.instance_backoff_max,
        }
    }

    pub fn workers(&self, kind: Kind) -> usize {
        match kind {
            Kind::ClusterServiceBroker | Kind::ServiceBroker => self.broker_workers,
            Kind::ServiceBinding => self.binding_workers,
            _ => self.instance_workers,
        }
    }
}

/// Command-line form of [`ControllerConfig`]
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Cluster id sent to brokers in the platform context
    #[arg(long, env = "CLUSTER_ID", default_value = "service-catalog")]
    pub cluster_id: String,

    /// Concurrent broker reconciliations
    #[arg(long, env = "BROKER_WORKERS", default_value = "5")]
    pub broker_workers: usize,

    /// Concurrent instance reconciliations
    #[arg(long, env = "INSTANCE_WORKERS", default_value = "5")]
    pub instance_workers: usize,

    /// Concurrent binding reconciliations
    #[arg(long, env = "BINDING_WORKERS", default_value = "5")]
    pub binding_workers: usize,

    /// Per-call broker timeout in seconds
    #[arg(long, env = "BROKER_TIMEOUT_SECS", default_value = "60")]
    pub broker_timeout_secs: u64,

    /// X-Broker-API-Version sent on every broker request
    #[arg(long, env = "OSB_API_VERSION", default_value = DEFAULT_API_VERSION)]
    pub osb_api_version: String,

    /// Default poll interval for asynchronous operations, in seconds
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "5")]
    pub poll_interval_secs: u64,

    /// Give up retrying an unreachable broker after this many seconds
    #[arg(long, env = "RECONCILIATION_RETRY_DURATION_SECS", default_value = "604800")]
    pub reconciliation_retry_duration_secs: u64,

    /// Allow asynchronous bind and unbind
    #[arg(long, env = "ASYNC_BINDING_OPERATIONS", default_value = "false")]
    pub async_binding_operations: bool,
}

impl From<ControllerArgs> for ControllerConfig {
    fn from(args: ControllerArgs) -> Self {
        Self {
            cluster_id: args.cluster_id,
            broker_workers: args.broker_workers.max(1),
            instance_workers: args.instance_workers.max(1),
            binding_workers: args.binding_workers.max(1),
            broker_timeout: Duration::from_secs(args.broker_timeout_secs),
            api_version: args.osb_api_version,
            default_poll_interval: Duration::from_secs(args.poll_interval_secs),
            reconciliation_retry_duration: Duration::from_secs(args.reconciliation_retry_duration_secs),
            async_binding_operations: args.async_binding_operations,
            ..Default::default()
        }
    }
}

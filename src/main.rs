//! Service Catalog Controller
//!
//! Runs the broker, instance and binding reconcilers until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Run against the current kubeconfig (or in-cluster credentials)
//! catalog-controller --install-crds
//!
//! # Run with custom log level
//! RUST_LOG=debug catalog-controller
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kube::Client;
use service_catalog::retry::{retry_with_backoff, RetryConfig};
use service_catalog::store::install_crds;
use service_catalog::{
    ControllerArgs, ControllerConfig, Context, KubeStore, Manager, MemoryStore, OsbClientFactory, Store,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    /// In-process store; records vanish on exit
    Memory,
    /// Custom resources on the Kubernetes API server
    Kube,
}

/// Service Catalog Controller
#[derive(Parser, Debug)]
#[command(name = "catalog-controller")]
#[command(version, about = "Open Service Broker catalog controller")]
struct Args {
    /// Record store backend
    #[arg(long, value_enum, env = "CATALOG_STORE", default_value = "kube")]
    store: StoreBackend,

    /// Register the catalog CRDs before starting (kube store only)
    #[arg(long, default_value = "false")]
    install_crds: bool,

    /// How long to wait for installed CRDs to become established, in seconds
    #[arg(long, default_value = "60")]
    crd_timeout_secs: u64,

    #[command(flatten)]
    controller: ControllerArgs,
}

async fn kube_store(args: &Args) -> anyhow::Result<Arc<dyn Store>> {
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    if args.install_crds {
        let timeout = Duration::from_secs(args.crd_timeout_secs);
        retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crds", || {
            install_crds(client.clone(), timeout)
        })
        .await?;
        info!("Catalog CRDs installed");
    }
    Ok(Arc::new(KubeStore::new(client)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = ControllerConfig::from(args.controller.clone());

    info!("Starting Service Catalog Controller");
    info!("Store backend: {:?}, cluster id: {}", args.store, config.cluster_id);

    let store: Arc<dyn Store> = match args.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Kube => kube_store(&args).await?,
    };

    let brokers = Arc::new(OsbClientFactory::new(
        store.clone(),
        config.broker_timeout,
        config.api_version.clone(),
    ));
    let manager = Arc::new(Manager::new(Context::new(store, brokers, config)));

    let shutdown = CancellationToken::new();
    let mut controllers = tokio::spawn(Arc::clone(&manager).run(shutdown.clone()));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controllers => {
            match result {
                Ok(Ok(())) => info!("Controllers exited"),
                Ok(Err(e)) => error!("Controllers failed: {}", e),
                Err(e) => error!("Controller task failed: {}", e),
            }
            return Ok(());
        }
    }

    shutdown.cancel();
    match controllers.await {
        Ok(result) => result?,
        Err(e) => error!("Controller task failed: {}", e),
    }

    info!("Service Catalog Controller shut down");
    Ok(())
}

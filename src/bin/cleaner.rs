//! Catalog cleaner
//!
//! Uninstalls the catalog from a cluster: scales the controller down, removes
//! the named webhook configurations and the catalog CRDs, and releases any
//! records the catalog finalizer still holds.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use service_catalog::migration::KubeCluster;
use service_catalog::{Cleaner, KubeStore};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Service Catalog cleaner
#[derive(Parser, Debug)]
#[command(name = "cleaner")]
#[command(version, about = "Remove the service catalog from a cluster")]
struct Args {
    /// Controller deployment to scale down
    #[arg(long, env = "CONTROLLER_MANAGER_DEPLOYMENT")]
    controller_manager_deployment: String,

    /// Namespace the catalog is deployed in
    #[arg(long, env = "SERVICE_CATALOG_NAMESPACE")]
    service_catalog_namespace: String,

    /// Webhook configurations to delete (mutating or validating)
    #[arg(long, value_delimiter = ',')]
    webhook_configurations: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let client = Client::try_default().await?;

    let cleaner = Cleaner::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeCluster::new(client)),
    );
    info!("Removing the service catalog");
    cleaner
        .run(
            &args.service_catalog_namespace,
            &args.controller_manager_deployment,
            &args.webhook_configurations,
        )
        .await?;
    info!("Service catalog removed");
    Ok(())
}

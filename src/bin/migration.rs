//! Catalog migration
//!
//! Moves catalog records between record stores through a backup directory.
//!
//! ```bash
//! migration --action backup --storage-path /tmp/catalog \
//!     --service-catalog-namespace catalog --controller-manager-deployment catalog-controller
//! migration --action restore --storage-path /tmp/catalog \
//!     --service-catalog-namespace catalog --controller-manager-deployment catalog-controller
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use service_catalog::migration::KubeCluster;
use service_catalog::{KubeStore, Migration, MigrationAction, MigrationOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Service Catalog migration tool
#[derive(Parser, Debug)]
#[command(name = "migration")]
#[command(version, about = "Back up and restore service catalog records")]
struct Args {
    /// Step to run
    #[arg(long, value_enum)]
    action: MigrationAction,

    /// Backup directory
    #[arg(long, env = "STORAGE_PATH", default_value = "/data")]
    storage_path: PathBuf,

    /// Namespace the catalog is deployed in
    #[arg(long, env = "SERVICE_CATALOG_NAMESPACE")]
    service_catalog_namespace: String,

    /// Controller deployment to scale down while records move
    #[arg(long, env = "CONTROLLER_MANAGER_DEPLOYMENT")]
    controller_manager_deployment: String,

    /// Deployment of the source store; backup is skipped when it is absent
    #[arg(long, env = "APISERVER_DEPLOYMENT")]
    apiserver_deployment: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let client = Client::try_default().await?;

    let options = MigrationOptions {
        storage_path: args.storage_path,
        namespace: args.service_catalog_namespace,
        controller_manager: args.controller_manager_deployment,
        apiserver: args.apiserver_deployment,
    };
    let migration = Migration::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeCluster::new(client)),
        options,
    );

    info!("Running migration action {:?}", args.action);
    migration.run(args.action).await?;
    info!("Migration action {:?} finished", args.action);
    Ok(())
}

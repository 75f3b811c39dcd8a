//! Berth operator - reconciles ChartRelease resources against the cluster

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_engine::Engine;
use berth_kube::{
    CompressionMethod, KubeCluster, MemoryDriver, ReleaseClient, SecretsDriver, StorageConfig,
    StorageDriver,
};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use kube::runtime::{Controller, watcher};
use kube::{Api, Client, CustomResourceExt};
use miette::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod controller;
mod crd;
mod error;
mod factory;

use controller::{Context, ControllerConfig, error_policy, reconcile};
use crd::ChartRelease;
use error::OperatorError;
use factory::ManagerFactory;

#[derive(Parser, Debug)]
#[command(name = "berth-operator")]
#[command(version)]
#[command(about = "Reconciles ChartRelease resources against the cluster", long_about = None)]
struct Cli {
    /// Print the ChartRelease CRD and exit
    #[arg(long)]
    crd: bool,

    /// Directory holding one sub-directory per chart
    #[arg(long, env = "BERTH_CHARTS_DIR", default_value = "/charts")]
    charts_dir: PathBuf,

    /// Where release records are kept
    #[arg(long, env = "BERTH_STORAGE", value_enum, default_value_t = StorageKind::Secrets)]
    storage: StorageKind,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "BERTH_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Seconds before a failed reconcile is retried
    #[arg(long, env = "BERTH_REQUEUE_SECS", default_value_t = 30)]
    requeue_secs: u64,

    /// Seconds between drift checks of a healthy release
    #[arg(long, env = "BERTH_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Compression of stored release records: none, gzip or zstd
    #[arg(long, env = "BERTH_COMPRESSION", default_value = "zstd")]
    compression: CompressionMethod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StorageKind {
    /// One Secret per release version
    Secrets,
    /// Process memory; records are lost on restart
    Memory,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", serde_yaml::to_string(&ChartRelease::crd()).map_err(OperatorError::from)?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    run(cli).await?;
    Ok(())
}

async fn run(cli: Cli) -> std::result::Result<(), OperatorError> {
    if cli.requeue_secs == 0 || cli.resync_secs == 0 {
        return Err(OperatorError::Config(
            "requeue and resync intervals must be positive".to_string(),
        ));
    }
    if !cli.charts_dir.is_dir() {
        return Err(OperatorError::Config(format!(
            "charts directory {} does not exist",
            cli.charts_dir.display()
        )));
    }

    let client = Client::try_default().await?;

    let storage: Arc<dyn StorageDriver> = match cli.storage {
        StorageKind::Secrets => Arc::new(SecretsDriver::with_client(
            client.clone(),
            StorageConfig {
                compression: cli.compression,
                ..Default::default()
            },
        )),
        StorageKind::Memory => {
            tracing::warn!("release records are kept in memory and lost on restart");
            Arc::new(MemoryDriver::new())
        }
    };
    let cluster = KubeCluster::new(client.clone()).await?;
    let releases = ReleaseClient::new(storage, Arc::new(Engine::default()), Arc::new(cluster));

    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context {
        client: client.clone(),
        factory: ManagerFactory::new(releases, &cli.charts_dir),
        config: ControllerConfig {
            requeue: Duration::from_secs(cli.requeue_secs),
            resync: Duration::from_secs(cli.resync_secs),
        },
        cancel: cancel.clone(),
    });

    let api: Api<ChartRelease> = match &cli.watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, cancelling in-flight releases");
            cancel.cancel();
        }
    });

    tracing::info!(
        charts_dir = %cli.charts_dir.display(),
        storage = ?cli.storage,
        namespace = cli.watch_namespace.as_deref().unwrap_or("*"),
        "starting ChartRelease controller"
    );

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(object = %object, "reconciled"),
                Err(e) => tracing::warn!(error = %e, "reconcile error"),
            }
        })
        .await;

    tracing::info!("controller stopped");
    Ok(())
}

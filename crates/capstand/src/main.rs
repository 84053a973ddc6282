//! capstand - the capstan cluster node autoscaler controller.
//!
//! A single long-running process: it loads declarative resources from a
//! state directory, keeps the in-memory cluster stores in sync with it,
//! and runs the reconcilers that drive every autoscaling group toward its
//! bounds and policies through the configured cloud engines.
//!
//! Configuration is environment-only: `CAPSTAN_STATE_DIR` names the
//! manifest directory (default `/var/lib/capstan`) and
//! `CAPSTAN_RESYNC_SECS` the resync interval (default 30).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capstan_cluster::{EventRecorder, Registry, Store};
use capstan_controller::{
    backend_controller, engine_controller, GroupController, MetricsController, ScaleManager,
    METRICS_CONTROLLER_NAME, SCALE_MANAGER_NAME,
};
use capstan_engines::Engine;
use capstan_metrics::Backend;

mod manifest;

use manifest::{Manifest, Stores};

const DEFAULT_STATE_DIR: &str = "/var/lib/capstan";
const DEFAULT_RESYNC_SECS: u64 = 30;

/// Cluster node autoscaler controller.
#[derive(Parser)]
#[command(name = "capstand", version, about)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("capstan=info,capstand=info")),
        )
        .init();

    let Cli {} = Cli::parse();

    let state_dir = PathBuf::from(
        std::env::var("CAPSTAN_STATE_DIR").unwrap_or_else(|_| DEFAULT_STATE_DIR.to_string()),
    );
    let resync_interval = Duration::from_secs(
        std::env::var("CAPSTAN_RESYNC_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_RESYNC_SECS)
            .max(1),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        state_dir = %state_dir.display(),
        resync_secs = resync_interval.as_secs(),
        "starting capstand"
    );

    let stores = Stores {
        groups: Arc::new(Store::new()),
        policies: Arc::new(Store::new()),
        engines: Arc::new(Store::new()),
        backends: Arc::new(Store::new()),
        nodes: Arc::new(Store::new()),
        pods: Arc::new(Store::new()),
    };

    // The process-wide plugin registries exist before any reconciler starts
    // and live until exit.
    let engines: Arc<Registry<dyn Engine>> = Arc::new(Registry::new("engine"));
    let backends: Arc<Registry<dyn Backend>> = Arc::new(Registry::new("metrics backend"));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut tasks = JoinSet::new();

    // Plugin reconcilers first so engines and backends are registered
    // before the first scale decision needs them.
    tasks.spawn(
        engine_controller(
            Arc::clone(&stores.engines),
            Arc::clone(&engines),
            Arc::clone(&stores.nodes),
        )
        .run(shutdown.clone()),
    );
    tasks.spawn(
        backend_controller(
            Arc::clone(&stores.backends),
            Arc::clone(&backends),
            Arc::clone(&stores.nodes),
            Arc::clone(&stores.pods),
        )
        .run(shutdown.clone()),
    );

    let recorder = EventRecorder::new(SCALE_MANAGER_NAME);
    let (scale_manager, scale_requests) = ScaleManager::new(
        Arc::clone(&stores.groups),
        Arc::clone(&stores.nodes),
        Arc::clone(&engines),
        recorder.clone(),
    );
    tasks.spawn(scale_manager.run(shutdown.clone()));

    tasks.spawn(
        GroupController::new(
            Arc::clone(&stores.groups),
            Arc::clone(&stores.nodes),
            scale_requests.clone(),
        )
        .run(shutdown.clone()),
    );

    tasks.spawn(
        MetricsController::new(
            Arc::clone(&stores.groups),
            Arc::clone(&stores.policies),
            Arc::clone(&backends),
            recorder.for_component(METRICS_CONTROLLER_NAME),
            scale_requests,
        )
        .run(shutdown.clone()),
    );

    // A broken state directory at startup is fatal; later reload failures
    // only log and retry.
    Manifest::load(&state_dir)
        .with_context(|| format!("loading state directory {}", state_dir.display()))?
        .sync(&stores);

    let resync = manifest::spawn_resync(
        state_dir,
        resync_interval,
        stores,
        shutdown.clone(),
    );

    info!("all controllers started");

    while tasks.join_next().await.is_some() {}
    let _ = resync.await;

    info!("shut down cleanly");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    shutdown.cancel();
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received interrupt"),
                _ = terminate.recv() => info!("received terminate"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt");
        }

        shutdown.cancel();
    });
}

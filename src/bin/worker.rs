//! Worker process entry point: loads `WorkerConfig` from the environment,
//! builds the scenario registry, and serves the `Worker` gRPC surface
//! (Setup/Run/ListCounters) until the process exits.

use std::sync::Arc;

use libmimalloc_sys::mi_collect;
use mimalloc::MiMalloc;
use tracing::{error, info};

use loadmesh::config::WorkerConfig;
use loadmesh::grpc::serve_worker;
use loadmesh::metrics::{register_metrics, start_metrics_server};
use loadmesh::percentiles::rotate_all_histograms;
use loadmesh::scenarios::build_registry;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = WorkerConfig::from_env()?;
    info!(bind_addr = %config.bind_addr, metrics_port = config.metrics_port, "worker starting");

    register_metrics()?;
    tokio::spawn(start_metrics_server(config.metrics_port));
    tokio::spawn(periodic_arena_collection());

    let registry = Arc::new(build_registry());
    if let Err(err) = serve_worker(&config.bind_addr, registry).await {
        error!(%err, "worker RPC server exited with error");
        return Err(Box::new(err));
    }

    Ok(())
}

/// Returns idle mimalloc arena pages to the OS periodically, and rotates the
/// self-observability percentile trackers alongside it. A worker's
/// steady-state load is tens of thousands of short-lived virtual-user
/// tasks; without the arena return the allocator's per-thread arenas tend to
/// stay resident at their peak high-water mark between phases, and without
/// the rotation the RPC/scenario HdrHistograms would grow without bound
/// across a long-running worker.
async fn periodic_arena_collection() {
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(60));
    loop {
        ticker.tick().await;
        unsafe {
            mi_collect(false);
        }
        rotate_all_histograms();
    }
}

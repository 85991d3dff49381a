//! Coordinator process entry point: loads `CoordinatorConfig` and a Job
//! description from the environment, drives one Job's full lifecycle
//! (registration, config persistence, Setup fan-out, Run fan-out with a
//! concurrent counter watcher, final collection), then exits.

use std::time::Instant;

use mimalloc::MiMalloc;
use tracing::{error, info};

use loadmesh::config::CoordinatorConfig;
use loadmesh::coordinator::{register_workers, run_fleet, setup_fleet};
use loadmesh::job::Job;
use loadmesh::metrics::{register_metrics, start_metrics_server};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        error!(%err, "job failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = CoordinatorConfig::from_env()?;

    if let Err(err) = register_metrics() {
        error!(%err, "failed to register harness metrics; continuing without /metrics");
    } else {
        tokio::spawn(start_metrics_server(config.metrics_port));
    }

    std::fs::create_dir_all(&config.output_dir)?;

    let job = Job::load(&config.job_path)?;
    info!(
        workers = config.worker_addresses.len(),
        phases = job.phases.len(),
        scenarios = ?job.session_names,
        "job loaded"
    );

    let config_out_ext = config
        .job_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("json");
    let config_out_path = config.output_dir.join(format!("config.{config_out_ext}"));
    job.persist(&config_out_path)?;

    let mut delegates = register_workers(&config.worker_addresses).await?;
    info!(workers = delegates.len(), "all workers registered");

    setup_fleet(&mut delegates, job.session_params.clone()).await?;
    info!("setup complete on every worker");

    let snapshot_path = config.output_dir.join("counters.txt");
    let start = Instant::now();
    let final_counters = run_fleet(&mut delegates, &job, &snapshot_path).await?;

    let mut keys: Vec<_> = final_counters.keys().collect();
    keys.sort();
    for key in keys {
        info!(counter = %key, value = final_counters[key], "final counter");
    }

    info!(elapsed_secs = start.elapsed().as_secs_f64(), "job complete");
    Ok(())
}

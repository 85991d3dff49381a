//! The coordinator's Job lifecycle: registration, Setup fan-out, Run fan-out
//! with a concurrent counter watcher, and final collection.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::errors::{RegistrationError, RpcError};
use crate::grpc::{unix_now, AgentDelegate};
use crate::job::Job;
use crate::metrics::{CONNECTED_WORKERS, JOBS_COMPLETED_TOTAL, RPC_ERRORS_TOTAL};
use crate::snapshot::{write_counters_lenient, SnapshotWriter};

/// Dials every address in order. Any dial failure is fatal — the coordinator
/// has no partial-fleet mode.
pub async fn register_workers(addresses: &[String]) -> Result<Vec<AgentDelegate>, RegistrationError> {
    let mut delegates = Vec::with_capacity(addresses.len());
    for address in addresses {
        let delegate = AgentDelegate::connect(address)
            .await
            .map_err(|source| RegistrationError::Dial {
                address: address.clone(),
                source,
            })?;
        info!(%address, "worker registered");
        delegates.push(delegate);
    }
    CONNECTED_WORKERS.set(delegates.len() as f64);
    Ok(delegates)
}

/// Calls `Setup` on every worker concurrently. Per §4.4, any single failure
/// is fatal to the whole Job.
pub async fn setup_fleet(delegates: &mut [AgentDelegate], params: HashMap<String, String>) -> Result<(), RpcError> {
    let futures = delegates.iter_mut().map(|delegate| {
        let params = params.clone();
        async move {
            delegate
                .setup(params)
                .await
                .map_err(|status| RpcError::Setup {
                    worker: delegate.address.clone(),
                    status,
                })
        }
    });

    for result in futures::future::join_all(futures).await {
        if let Err(err) = result {
            RPC_ERRORS_TOTAL.with_label_values(&["setup"]).inc();
            return Err(err);
        }
    }
    Ok(())
}

/// Calls `Run` on every worker concurrently, each with its own distinct
/// worker index (0..worker_count), while a separate task polls
/// `ListCounters` at 1Hz and appends merged snapshots until every Run
/// returns. Fatal on any worker's Run failure.
pub async fn run_fleet(
    delegates: &mut [AgentDelegate],
    job: &Job,
    snapshot_path: &Path,
) -> Result<HashMap<String, i64>, RpcError> {
    let worker_count = delegates.len() as i32;
    let (stop_tx, stop_rx) = watch::channel(false);

    let watcher_delegates = delegates.to_vec();
    let scenario_names = job.session_names.clone();
    let snapshot_path_owned = snapshot_path.to_path_buf();
    let watcher = tokio::spawn(async move {
        watch_counters(watcher_delegates, scenario_names, snapshot_path_owned, stop_rx).await
    });

    let run_futures = delegates.iter_mut().enumerate().map(|(idx, delegate)| {
        let worker_idx = idx as i32;
        async move {
            delegate
                .run(job, worker_count, worker_idx)
                .await
                .map_err(|status| RpcError::Run {
                    worker: delegate.address.clone(),
                    status,
                })
        }
    });

    let results = futures::future::join_all(run_futures).await;

    let _ = stop_tx.send(true);
    let _ = watcher.await;

    for result in results {
        if let Err(err) = result {
            RPC_ERRORS_TOTAL.with_label_values(&["run"]).inc();
            return Err(err);
        }
    }

    let final_counters = collect_counters(delegates, &job.session_names).await?;

    match SnapshotWriter::open(snapshot_path) {
        Ok(mut writer) => write_counters_lenient(&mut writer, unix_now(), final_counters.clone()),
        Err(err) => {
            error!(%err, "could not open snapshot file for final collection");
        }
    }

    JOBS_COMPLETED_TOTAL.inc();
    Ok(final_counters)
}

/// Polls every worker's `ListCounters` once a second, merges keywise, and
/// appends a snapshot line, until told to stop via `stop_rx`. A poll failure
/// on one worker is logged and that worker's counters are treated as absent
/// for this tick — the watcher itself never ends the Job.
async fn watch_counters(
    mut delegates: Vec<AgentDelegate>,
    scenario_names: Vec<String>,
    snapshot_path: std::path::PathBuf,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut writer = match SnapshotWriter::open(&snapshot_path) {
        Ok(w) => w,
        Err(err) => {
            error!(%err, "could not open snapshot file; counter watcher disabled");
            return;
        }
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let merged = poll_once(&mut delegates, &scenario_names).await;
                write_counters_lenient(&mut writer, unix_now(), merged);
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn poll_once(delegates: &mut [AgentDelegate], scenario_names: &[String]) -> HashMap<String, i64> {
    let mut merged = HashMap::new();
    for delegate in delegates.iter_mut() {
        match delegate.list_counters(scenario_names.to_vec()).await {
            Ok(counters) => {
                for (key, value) in counters {
                    *merged.entry(key).or_insert(0) += value;
                }
            }
            Err(status) => {
                warn!(worker = %delegate.address, %status, "ListCounters poll failed");
                RPC_ERRORS_TOTAL.with_label_values(&["list_counters"]).inc();
            }
        }
    }
    merged
}

/// Final post-Run collection: one last `ListCounters` round, merged keywise,
/// missing keys defaulting to 0 across the fleet.
async fn collect_counters(
    delegates: &mut [AgentDelegate],
    scenario_names: &[String],
) -> Result<HashMap<String, i64>, RpcError> {
    let mut merged = HashMap::new();
    for delegate in delegates.iter_mut() {
        let counters = delegate
            .list_counters(scenario_names.to_vec())
            .await
            .map_err(|status| RpcError::ListCounters {
                worker: delegate.address.clone(),
                status,
            })?;
        for (key, value) in counters {
            *merged.entry(key).or_insert(0) += value;
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_keywise_with_missing_keys_as_zero() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), 3i64);
        let mut b = HashMap::new();
        b.insert("x".to_string(), 4i64);
        b.insert("y".to_string(), 1i64);

        let mut merged: HashMap<String, i64> = HashMap::new();
        for counters in [a, b] {
            for (k, v) in counters {
                *merged.entry(k).or_insert(0) += v;
            }
        }

        assert_eq!(merged.get("x"), Some(&7));
        assert_eq!(merged.get("y"), Some(&1));
    }
}

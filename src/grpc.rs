//! The coordinator↔worker control protocol: generated protobuf/gRPC types,
//! the worker-side `Worker` service implementation, and the coordinator-side
//! `AgentDelegate` dialing helpers.
//!
//! Transport is tonic/gRPC over TCP — the concrete realisation of the
//! "length-prefixed RPC" requirement; gRPC's own framing already is one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::job::Job as DomainJob;
use crate::percentiles::GLOBAL_RPC_PERCENTILES;
use crate::scenario::ScenarioRegistry;
use crate::worker::run_job;

/// Generated protobuf types and gRPC service stubs for `Worker`.
pub mod proto {
    tonic::include_proto!("loadmesh");
}

use proto::worker_client::WorkerClient;
use proto::worker_server::{Worker, WorkerServer};
use proto::{
    Job as ProtoJob, JobPhase as ProtoJobPhase, ListCountersRequest, ListCountersResponse,
    RunRequest, RunResponse, SetupRequest, SetupResponse,
};

impl From<&DomainJob> for ProtoJob {
    fn from(job: &DomainJob) -> Self {
        ProtoJob {
            phases: job
                .phases
                .iter()
                .map(|p| ProtoJobPhase {
                    name: p.name.clone(),
                    users_per_second: p.users_per_second,
                    duration_secs: p.duration_secs,
                })
                .collect(),
            session_names: job.session_names.clone(),
            session_percentages: job.session_percentages.clone(),
            session_params: job.session_params.clone(),
        }
    }
}

impl From<ProtoJob> for DomainJob {
    fn from(job: ProtoJob) -> Self {
        DomainJob {
            phases: job
                .phases
                .into_iter()
                .map(|p| crate::job::JobPhase {
                    name: p.name,
                    users_per_second: p.users_per_second,
                    duration_secs: p.duration_secs,
                })
                .collect(),
            session_names: job.session_names,
            session_percentages: job.session_percentages,
            session_params: job.session_params,
        }
    }
}

/// Worker-side implementation of the `Worker` gRPC service.
pub struct WorkerService {
    registry: Arc<ScenarioRegistry>,
    /// Guards against overlapping `Run` calls on one worker — the spec
    /// leaves concurrent Run invocations undefined; we reject the second one
    /// outright rather than silently racing schedulers.
    run_lock: AsyncMutex<()>,
}

impl WorkerService {
    pub fn new(registry: Arc<ScenarioRegistry>) -> Self {
        Self {
            registry,
            run_lock: AsyncMutex::new(()),
        }
    }
}

#[tonic::async_trait]
impl Worker for WorkerService {
    async fn setup(&self, request: Request<SetupRequest>) -> Result<Response<SetupResponse>, Status> {
        let params = request.into_inner().params;
        info!(count = params.len(), "Setup invoked");

        self.registry
            .setup_all(&params)
            .await
            .map_err(|err| Status::failed_precondition(err.to_string()))?;

        Ok(Response::new(SetupResponse {}))
    }

    async fn run(&self, request: Request<RunRequest>) -> Result<Response<RunResponse>, Status> {
        let guard = self.run_lock.try_lock();
        let _guard = match guard {
            Ok(g) => g,
            Err(_) => return Err(Status::already_exists("a Run is already in flight on this worker")),
        };

        let req = request.into_inner();
        let job: DomainJob = req
            .job
            .ok_or_else(|| Status::invalid_argument("missing job"))?
            .into();

        info!(worker_idx = req.worker_idx, worker_count = req.worker_count, "Run invoked");

        run_job(self.registry.clone(), job, req.worker_count, req.worker_idx)
            .await
            .map_err(|err| Status::not_found(err.to_string()))?;

        Ok(Response::new(RunResponse {}))
    }

    async fn list_counters(
        &self,
        request: Request<ListCountersRequest>,
    ) -> Result<Response<ListCountersResponse>, Status> {
        let names = request.into_inner().scenario_names;
        let counters = self.registry.list_counters(&names);
        Ok(Response::new(ListCountersResponse { counters }))
    }

    // unreachable — kept for symmetry with the generated trait if additional
    // server-streaming methods are ever added.
}

/// Starts the worker's gRPC server; runs until the process exits.
pub async fn serve_worker(bind_addr: &str, registry: Arc<ScenarioRegistry>) -> Result<(), tonic::transport::Error> {
    let addr = bind_addr.parse().expect("valid socket address");
    let service = WorkerService::new(registry);

    info!(%addr, "worker RPC server listening");
    tonic::transport::Server::builder()
        .add_service(WorkerServer::new(service))
        .serve(addr)
        .await
}

/// One coordinator-owned connection to a worker. The coordinator exclusively
/// owns the ordered list of these for the lifetime of one Job.
#[derive(Clone)]
pub struct AgentDelegate {
    pub address: String,
    pub client: WorkerClient<Channel>,
}

impl AgentDelegate {
    /// Dials `address`. Per the registration step, any dial failure here is
    /// fatal to the coordinator — there is no retry/backoff at this layer.
    pub async fn connect(address: &str) -> Result<Self, tonic::transport::Error> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let endpoint = Endpoint::from_shared(uri)?;
        let channel = endpoint.connect().await?;
        Ok(Self {
            address: address.to_string(),
            client: WorkerClient::new(channel),
        })
    }

    pub async fn setup(&mut self, params: HashMap<String, String>) -> Result<(), Status> {
        let start = std::time::Instant::now();
        let result = self
            .client
            .setup(SetupRequest { params })
            .await
            .map(|_| ())
            .map_err(|status| {
                warn!(worker = %self.address, %status, "Setup RPC failed");
                status
            });
        GLOBAL_RPC_PERCENTILES.record("setup", start.elapsed().as_millis() as u64);
        result
    }

    pub async fn run(&mut self, job: &DomainJob, worker_count: i32, worker_idx: i32) -> Result<(), Status> {
        let start = std::time::Instant::now();
        let result = self
            .client
            .run(RunRequest {
                job: Some(ProtoJob::from(job)),
                worker_count,
                worker_idx,
            })
            .await
            .map(|_| ());
        GLOBAL_RPC_PERCENTILES.record("run", start.elapsed().as_millis() as u64);
        result
    }

    pub async fn list_counters(&mut self, scenario_names: Vec<String>) -> Result<HashMap<String, i64>, Status> {
        let start = std::time::Instant::now();
        let result = self
            .client
            .list_counters(ListCountersRequest { scenario_names })
            .await
            .map(|resp| resp.into_inner().counters);
        GLOBAL_RPC_PERCENTILES.record("list_counters", start.elapsed().as_millis() as u64);
        result
    }
}

/// Unix-epoch seconds for a snapshot timestamp.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobPhase};

    #[test]
    fn domain_job_round_trips_through_proto() {
        let job = Job {
            phases: vec![JobPhase {
                name: "ramp".to_string(),
                users_per_second: 10,
                duration_secs: 30,
            }],
            session_names: vec!["redis:pubsub".to_string()],
            session_percentages: vec![1.0],
            session_params: HashMap::new(),
        };

        let proto = ProtoJob::from(&job);
        let back: Job = proto.into();
        assert_eq!(back.phases.len(), 1);
        assert_eq!(back.phases[0].users_per_second, 10);
        assert_eq!(back.session_names, vec!["redis:pubsub".to_string()]);
    }
}

//! Error taxonomy for the coordinator and worker processes.
//!
//! Mirrors the failure semantics laid out for the harness: config/registration/
//! setup failures are fatal to the coordinator before a Job is dispatched,
//! scenario-not-found is fatal to a worker, and everything else is either
//! counted (user-level) or logged and retried (transient collection/snapshot).

use thiserror::Error;

/// Errors that prevent a Job from ever being dispatched.
#[derive(Debug, Error)]
pub enum JobConfigError {
    #[error("failed to read job config from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode job config from {path} as JSON or YAML: {source}")]
    Decode {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("job config invalid: {0}")]
    Invalid(String),
}

/// Errors dialing or registering a worker address.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to connect to worker at {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Errors surfaced from the Setup/Run/ListCounters RPC surface.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("worker {worker} rejected Setup: {status}")]
    Setup { worker: String, status: tonic::Status },

    #[error("worker {worker} Run call failed: {status}")]
    Run { worker: String, status: tonic::Status },

    #[error("worker {worker} ListCounters call failed: {status}")]
    ListCounters { worker: String, status: tonic::Status },
}

/// Worker-side error: a Job references a scenario name the worker's registry
/// does not have. This is fatal to the worker process (see design note on
/// scenario-not-found).
#[derive(Debug, Error)]
#[error("unknown scenario {0:?} requested by job; worker registry has no such scenario")]
pub struct ScenarioNotFoundError(pub String);

/// Errors returned from a single virtual user's `execute`. These are counted
/// by the caller (`<tag>:error`), never propagated to the RPC layer.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Snapshot write errors are logged and never abort the Job.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to open snapshot file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write snapshot line: {source}")]
    Write {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize snapshot: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_not_found_message_carries_name() {
        let err = ScenarioNotFoundError("redis:pubsub".to_string());
        assert!(err.to_string().contains("redis:pubsub"));
    }

    #[test]
    fn config_invalid_message_roundtrips() {
        let err = JobConfigError::Invalid("session percentages do not sum to 1".to_string());
        assert_eq!(
            err.to_string(),
            "job config invalid: session percentages do not sum to 1"
        );
    }
}

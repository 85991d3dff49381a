//! Distributed SignalR/Redis load-generation harness.
//!
//! A coordinator dials a fleet of workers over gRPC, dispatches a Job
//! (phased user-arrival schedule plus a weighted mix of scenarios), and
//! aggregates per-second counter snapshots until every worker's run
//! completes. Workers meter virtual users into one of the scenarios
//! registered in [`scenario::ScenarioRegistry`].

pub mod config;
pub mod connection_pool;
pub mod coordinator;
pub mod counters;
pub mod errors;
pub mod grpc;
pub mod job;
pub mod metrics;
pub mod percentiles;
pub mod scenario;
pub mod scenarios;
pub mod snapshot;
pub mod worker;

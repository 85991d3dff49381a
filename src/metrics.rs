//! Ambient Prometheus self-observability for the harness process itself —
//! uptime, connected worker count, RPC error counts. This is deliberately
//! separate from the Job's own counter bag (see `counters.rs`), which is
//! shipped through the RPC/snapshot pipeline, not this endpoint.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, TextEncoder};
use std::env;
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "loadmesh".to_string());

    pub static ref CONNECTED_WORKERS: Gauge =
        Gauge::with_opts(
            Opts::new("connected_workers", "Number of workers currently registered with the coordinator")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref RPC_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("rpc_errors_total", "RPC failures by procedure")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["procedure"]
        ).unwrap();

    pub static ref SNAPSHOT_WRITE_ERRORS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("snapshot_write_errors_total", "Snapshot writes that failed and were logged")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref JOBS_COMPLETED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("jobs_completed_total", "Jobs that reached final counter collection")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref HISTOGRAM_LABELS_EVICTED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("histogram_labels_evicted_total", "Percentile tracker labels evicted under the LRU cap")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all harness metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(CONNECTED_WORKERS.clone()))?;
    prometheus::default_registry().register(Box::new(RPC_ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(SNAPSHOT_WRITE_ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(JOBS_COMPLETED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(HISTOGRAM_LABELS_EVICTED_TOTAL.clone()))?;
    Ok(())
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server. Runs until the process exits;
/// callers typically `tokio::spawn` this alongside the main control loop.
pub async fn start_metrics_server(port: u16) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, hyper::Error>(service_fn(metrics_handler))
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port = port, addr = %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

/// Gathers and encodes metrics as a string, e.g. for a one-shot CLI dump.
pub fn gather_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        eprintln!("error encoding metrics to utf8: {}", e);
        String::from("# error encoding metrics to utf8")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_string_is_not_empty_after_registration() {
        let _ = register_metrics();
        CONNECTED_WORKERS.set(3.0);
        let text = gather_metrics_string();
        assert!(text.contains("connected_workers"));
    }
}

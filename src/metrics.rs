//! Operation Metrics
//!
//! Per-process prometheus registry with one counter and one histogram shared
//! by the agent, controller and node services, labelled by component and
//! operation. Served on `/metrics` by [`serve_metrics`].

use crate::error::{Error, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome label for a successful operation
pub const OUTCOME_OK: &str = "ok";

// =============================================================================
// Operation Metrics
// =============================================================================

/// Counters and latency histograms for driver operations
#[derive(Clone)]
pub struct OperationMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
}

impl std::fmt::Debug for OperationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationMetrics").finish_non_exhaustive()
    }
}

impl OperationMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("kvm_csi_operations_total", "Driver operations by outcome"),
            &["component", "operation", "outcome"],
        )
        .map_err(metrics_error)?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "kvm_csi_operation_duration_seconds",
                "Duration of driver operations",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.25, 1.0, 2.5, 10.0, 30.0, 120.0]),
            &["component", "operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of operations recorded with the given labels
    pub fn count(&self, component: &str, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[component, operation, outcome])
            .get()
    }

    /// Record one finished operation, labelling failures by their gRPC code
    pub fn observe<T>(&self, component: &str, operation: &str, elapsed: Duration, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => OUTCOME_OK.to_string(),
            Err(e) => format!("{:?}", e.code()),
        };
        self.operations
            .with_label_values(&[component, operation, &outcome])
            .inc();
        self.duration
            .with_label_values(&[component, operation])
            .observe(elapsed.as_secs_f64());
    }
}

/// Shared handle to the process metrics
pub type MetricsRef = Arc<OperationMetrics>;

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics registration failed: {}", e))
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Serve the registry on `GET /metrics` until `shutdown` fires
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: MetricsRef,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            if let Err(e) =
                                encoder.encode(&metrics.registry().gather(), &mut buffer)
                            {
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                *response.body_mut() = Body::from(e.to_string());
                            } else if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                                *response.body_mut() = Body::from(buffer);
                            }
                        }
                        "/healthz" => *response.body_mut() = Body::from("ok"),
                        _ => {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Body::from("not found");
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Configuration(format!("Cannot bind metrics address {}: {}", addr, e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_outcomes_by_code() {
        let metrics = OperationMetrics::new().unwrap();

        let ok: Result<()> = Ok(());
        metrics.observe("agent", "create_image", Duration::from_millis(3), &ok);

        let missing: Result<()> = Err(Error::not_found("image", "pvc-1"));
        metrics.observe("agent", "delete_image", Duration::from_millis(1), &missing);

        assert_eq!(metrics.count("agent", "create_image", OUTCOME_OK), 1);
        assert_eq!(metrics.count("agent", "delete_image", "NotFound"), 1);
        assert_eq!(metrics.count("agent", "delete_image", OUTCOME_OK), 0);
    }

    #[test]
    fn test_registry_exposes_families() {
        let metrics = OperationMetrics::new().unwrap();
        let ok: Result<()> = Ok(());
        metrics.observe("node", "node_publish_volume", Duration::from_millis(8), &ok);

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"kvm_csi_operations_total".to_string()));
        assert!(names.contains(&"kvm_csi_operation_duration_seconds".to_string()));
    }
}

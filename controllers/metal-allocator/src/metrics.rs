//! Prometheus metrics and the health endpoint.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

/// Allocator metrics. Clones share the underlying counters.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    /// Bindings created by the allocation protocol
    pub allocations: IntCounter,
    /// Binding creates that lost to a concurrent claim
    pub claim_conflicts: IntCounter,
    /// Allocation passes that found no eligible server
    pub no_eligible_servers: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("allocations", &self.allocations.get())
            .field("claim_conflicts", &self.claim_conflicts.get())
            .field("no_eligible_servers", &self.no_eligible_servers.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register all metrics in a fresh registry
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let reconciliations = IntCounterVec::new(
            Opts::new("metal_allocator_reconciliations_total", "Reconciliations by kind and result"),
            &["kind", "result"],
        )?;
        let allocations = IntCounter::new(
            "metal_allocator_allocations_total",
            "Server bindings created by the allocator",
        )?;
        let claim_conflicts = IntCounter::new(
            "metal_allocator_claim_conflicts_total",
            "Binding creates rejected because the server was already claimed",
        )?;
        let no_eligible_servers = IntCounter::new(
            "metal_allocator_no_eligible_servers_total",
            "Allocation attempts that found no eligible server",
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(claim_conflicts.clone()))?;
        registry.register(Box::new(no_eligible_servers.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            allocations,
            claim_conflicts,
            no_eligible_servers,
        })
    }

    /// Count one reconciliation of `kind` ending with `result`
    pub fn record_reconcile(&self, kind: &str, result: &str) {
        self.reconciliations.with_label_values(&[kind, result]).inc();
    }

    fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Metrics(e.to_string()))
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> (StatusCode, String) {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Router serving `/metrics` and `/healthz`
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .with_state(metrics)
}

/// Serve metrics until the process exits
pub async fn serve(addr: SocketAddr, metrics: Metrics) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Metrics(format!("failed to bind {addr}: {e}")))?;
    info!("Serving metrics on {}", addr);
    axum::serve(listener, router(metrics))
        .await
        .map_err(|e| ControllerError::Metrics(e.to_string()))
}

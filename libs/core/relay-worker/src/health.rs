//! Health, readiness, stats and metrics endpoints.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Pipeline stats (`/stats`)
//! - Prometheus metrics (`/metrics`)
//! - The subscriber WebSocket (`/ws`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::TransportConfig;
use crate::hub::{HubHandle, HubStats};
use crate::metrics::{self, MetricsSnapshot, PipelineCounters};
use crate::resilience::{BreakerSnapshot, CircuitBreaker};
use crate::ws;

/// Readiness flags flipped by startup gating and the dependency monitor.
#[derive(Debug, Default)]
pub struct Readiness {
    source: AtomicBool,
    dependency: AtomicBool,
}

impl Readiness {
    /// Returns the previous value.
    pub fn set_source(&self, ready: bool) -> bool {
        self.source.swap(ready, Ordering::AcqRel)
    }

    /// Returns the previous value.
    pub fn set_dependency(&self, ready: bool) -> bool {
        self.dependency.swap(ready, Ordering::AcqRel)
    }

    pub fn source_ready(&self) -> bool {
        self.source.load(Ordering::Acquire)
    }

    pub fn dependency_ready(&self) -> bool {
        self.dependency.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.source_ready() && self.dependency_ready()
    }
}

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    pub counters: Arc<PipelineCounters>,
    pub readiness: Arc<Readiness>,
    pub hub: HubHandle,
    /// Breakers reported by `/stats`.
    pub breakers: Vec<Arc<CircuitBreaker>>,
    pub transport: TransportConfig,
}

impl HealthState {
    /// Create a new health state.
    pub fn new(
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        counters: Arc<PipelineCounters>,
        readiness: Arc<Readiness>,
        hub: HubHandle,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            counters,
            readiness,
            hub,
            breakers: Vec::new(),
            transport: TransportConfig::default(),
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breakers.push(breaker);
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Connected subscribers.
    pub clients: usize,
}

/// Readiness probe body.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub source_ready: bool,
    pub liquidity_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Everything `/stats` reports.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pipeline: MetricsSnapshot,
    pub hub: HubStats,
    pub breakers: Vec<BreakerSnapshot>,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
        clients: state.hub.subscriber_count(),
    })
}

/// Readiness probe handler.
///
/// 200 once both the source and the dependency are ready, 503 before.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<ReadinessResponse>) {
    let source_ready = state.readiness.source_ready();
    let liquidity_ready = state.readiness.dependency_ready();
    let ready = source_ready && liquidity_ready;

    let message = match (source_ready, liquidity_ready) {
        (true, true) => None,
        (false, true) => Some("source not ready".to_string()),
        (true, false) => Some("liquidity service not ready".to_string()),
        (false, false) => Some("source and liquidity service not ready".to_string()),
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            source_ready,
            liquidity_ready,
            message,
        }),
    )
}

/// Counters, hub figures and breaker states as JSON.
pub async fn stats_handler(State(state): State<HealthState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pipeline: state.counters.snapshot(),
        hub: state.hub.stats(),
        breakers: state.breakers.iter().map(|b| b.snapshot()).collect(),
    })
}

/// Prometheus metrics endpoint handler.
///
/// Returns metrics in Prometheus text format for scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the standard router.
///
/// - `/health` - Liveness probe
/// - `/healthz` - Liveness probe (K8s style)
/// - `/ready` - Readiness probe
/// - `/readyz` - Readiness probe (K8s style)
/// - `/stats` - Pipeline counters and breaker states
/// - `/metrics` - Prometheus metrics
/// - `/ws` - Subscriber WebSocket
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::BroadcastHub;
    use crate::resilience::CircuitBreakerConfig;

    fn state() -> HealthState {
        let (hub, _hub_task) = BroadcastHub::channel(&HubConfig::default());
        HealthState::new(
            "test-consumer",
            "1.0.0",
            Arc::new(PipelineCounters::new()),
            Arc::new(Readiness::default()),
            hub,
        )
        .with_breaker(Arc::new(CircuitBreaker::new("liquidity", CircuitBreakerConfig::default())))
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            name: "test-consumer".to_string(),
            version: "1.0.0".to_string(),
            clients: 2,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"clients\":2"));
    }

    #[tokio::test]
    async fn test_ready_reflects_flags() {
        let state = state();

        let (status, Json(body)) = ready_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.ready);

        state.readiness.set_source(true);
        let (status, Json(body)) = ready_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.message.as_deref(), Some("liquidity service not ready"));

        state.readiness.set_dependency(true);
        let (status, Json(body)) = ready_handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            ReadinessResponse {
                ready: true,
                source_ready: true,
                liquidity_ready: true,
                message: None,
            }
        );
    }

    #[tokio::test]
    async fn test_stats_include_breakers() {
        let Json(stats) = stats_handler(State(state())).await;
        assert_eq!(stats.breakers.len(), 1);
        assert_eq!(stats.breakers[0].name, "liquidity");
        assert_eq!(stats.pipeline.processed, 0);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["breakers"][0]["state"], "closed");
        assert_eq!(json["hub"]["subscribers"], 0);
    }

    #[tokio::test]
    async fn test_health_reports_clients() {
        let Json(body) = health_handler(State(state())).await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.clients, 0);
    }
}

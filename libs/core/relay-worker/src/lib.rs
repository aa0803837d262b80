//! Relay Worker
//!
//! A resilient work-item pipeline with real-time fan-out.
//!
//! ## Features
//!
//! - **Circuit breaker**: lock-free, one per dependency, shared by all workers
//! - **Retry**: exponential backoff gated by the breaker, cancellable by shutdown
//! - **Pipeline**: bounded queue, fixed worker pool, results drain
//! - **Fail-open**: an unreachable dependency degrades to approve (or rejects, if configured)
//! - **Broadcast hub**: actor-owned subscriber set with slow-consumer eviction
//! - **Health endpoints**: liveness, readiness, stats, Prometheus metrics and `/ws`
//!
//! ## Example
//!
//! ```ignore
//! use relay_worker::{shutdown, BroadcastHub, LiquidityGuard, Pipeline, PipelineConfig};
//!
//! let (trigger, signal) = shutdown::channel();
//! let (hub_trigger, hub_signal) = shutdown::channel();
//! let config = PipelineConfig::default();
//! let (hub, hub_task) = BroadcastHub::spawn(&HubConfig::default(), hub_signal);
//! let guard = Arc::new(LiquidityGuard::new(Some(service), &config));
//!
//! let report = Pipeline::new(config, source, Arc::new(MyRules), guard)
//!     .with_hub(hub)
//!     .run(signal)
//!     .await?;
//!
//! // Results drained after shutdown are broadcast before the hub stops.
//! hub_trigger.trigger();
//! hub_task.await?;
//! ```

mod config;
mod dependency;
mod error;
mod event;
mod health;
mod hub;
pub mod metrics;
mod probe;
mod resilience;
pub mod retry;
pub mod shutdown;
mod source;
mod validate;
mod worker;
mod ws;

// Re-export main types
pub use config::{FailurePolicy, HubConfig, PipelineConfig, TransportConfig};
pub use dependency::{
    DependencyError, LiquidityGuard, LiquidityService, ReserveOutcome, TransferRequest, Verdict,
};
pub use error::{
    CODE_CANCELLED, CODE_CIRCUIT_OPEN, CODE_DEPENDENCY_ERROR, ErrorCategory, RelayError,
};
pub use event::{HubEvent, MetricsUpdate, Payload, ProcessingResult, StatusUpdate, WorkItem};
pub use health::{HealthState, Readiness, health_router};
pub use hub::{BroadcastHub, HubHandle, HubStats, SubscriberId, Subscription};
pub use metrics::{MetricsSnapshot, PipelineCounters, init_metrics};
pub use probe::{StartupGate, monitor_dependency};
pub use resilience::{Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryError, RetryPolicy};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use source::{ChannelSource, ItemSource, VecSource};
pub use validate::{Inspection, Validation, Validator};
pub use worker::{Pipeline, ResultSink};
pub use ws::{serve_subscriber, ws_handler};

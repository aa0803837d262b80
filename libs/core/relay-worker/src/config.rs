//! Pipeline, hub and transport configuration
//!
//! Plain values with `with_*` builders. Defaults match the production
//! deployment.

use crate::resilience::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use std::time::Duration;

/// What the dependency check does when the dependency cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Approve and let validation decide. Counted as degraded.
    #[default]
    FailOpen,
    /// Reject with `DEPENDENCY_ERROR` or `CIRCUIT_OPEN`.
    FailClosed,
}

impl FailurePolicy {
    pub fn from_fail_closed(fail_closed: bool) -> Self {
        if fail_closed {
            FailurePolicy::FailClosed
        } else {
            FailurePolicy::FailOpen
        }
    }
}

/// Configuration for the worker-pool pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of concurrent workers
    pub workers: usize,

    /// Capacity of the ingestion queue
    pub queue_capacity: usize,

    /// Capacity of the results channel
    pub results_capacity: usize,

    /// Bound on every single dependency call
    pub dependency_timeout: Duration,

    /// Behaviour when the dependency is unavailable
    pub failure_policy: FailurePolicy,

    /// Pause after a source error before pulling again
    pub source_error_backoff: Duration,

    /// Breaker guarding the dependency
    pub breaker: CircuitBreakerConfig,

    /// Retry shape for dependency calls (breaker is bound by the pipeline)
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 1000,
            results_capacity: 1000,
            dependency_timeout: Duration::from_millis(100),
            failure_policy: FailurePolicy::FailOpen,
            source_error_backoff: Duration::from_secs(1),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the results channel capacity
    pub fn with_results_capacity(mut self, capacity: usize) -> Self {
        self.results_capacity = capacity.max(1);
        self
    }

    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_source_error_backoff(mut self, backoff: Duration) -> Self {
        self.source_error_backoff = backoff;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for the broadcast hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the inbound broadcast queue
    pub broadcast_capacity: usize,
    /// Default outbound buffer per subscriber
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            subscriber_buffer: 256,
        }
    }
}

impl HubConfig {
    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity.max(1);
        self
    }
}

/// Timing for WebSocket subscriber pumps
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How often the send pump pings
    pub ping_interval: Duration,
    /// Bound on a single outbound write
    pub write_timeout: Duration,
    /// Disconnect if nothing is read for this long
    pub liveness_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

impl TransportConfig {
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.workers, 5);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.results_capacity, 1000);
        assert_eq!(config.dependency_timeout, Duration::from_millis(100));
        assert_eq!(config.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);

        let hub = HubConfig::default();
        assert_eq!(hub.broadcast_capacity, 256);
        assert_eq!(hub.subscriber_buffer, 256);

        let transport = TransportConfig::default();
        assert!(transport.ping_interval < transport.liveness_timeout);
    }

    #[test]
    fn test_builder_pattern() {
        let config = PipelineConfig::new()
            .with_workers(0)
            .with_queue_capacity(10)
            .with_failure_policy(FailurePolicy::from_fail_closed(true))
            .with_dependency_timeout(Duration::from_millis(250));

        assert_eq!(config.workers, 1);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.dependency_timeout, Duration::from_millis(250));
    }
}

//! Retry with exponential backoff, optionally gated by a circuit breaker.
//!
//! [`execute`] decorates any `FnMut() -> Future<Output = Result<T, E>>`.
//! Before each attempt a bound breaker is consulted; a rejection ends the
//! loop right away and still counts as an attempt. Backoff sleeps race the
//! shutdown signal so a stopping worker never waits out a delay.

use crate::error::ErrorCategory;
use crate::resilience::CircuitBreaker;
use crate::shutdown::ShutdownSignal;
use metrics::counter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// How an operation is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub breaker: Option<Arc<CircuitBreaker>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            breaker: None,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts including the first. Clamped to at least one.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Delay to wait after a failure when `current` was the previous delay.
    fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_delay)
    }
}

/// Why [`execute`] gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The bound breaker refused the attempt.
    #[error("circuit breaker open: {breaker}")]
    CircuitOpen { breaker: String, attempts: u32 },

    /// Shutdown interrupted a backoff sleep.
    #[error("retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// Every attempt failed.
    #[error("max retries ({attempts}) exceeded: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Attempts consumed, short-circuited ones included.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::CircuitOpen { attempts, .. }
            | RetryError::Cancelled { attempts }
            | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RetryError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            RetryError::Cancelled { .. } => ErrorCategory::Cancelled,
            RetryError::Exhausted { .. } => ErrorCategory::Transient,
        }
    }
}

/// Run `operation` under `policy`.
pub async fn execute<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &mut ShutdownSignal,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;

        if let Some(breaker) = &policy.breaker {
            if !breaker.allow_request() {
                counter!("relay_retry_short_circuits_total", "breaker" => breaker.name().to_string())
                    .increment(1);
                return Err(RetryError::CircuitOpen {
                    breaker: breaker.name().to_string(),
                    attempts: attempt,
                });
            }
        }

        match operation().await {
            Ok(value) => {
                if let Some(breaker) = &policy.breaker {
                    breaker.record_success();
                }
                return Ok(value);
            }
            Err(err) => {
                if let Some(breaker) = &policy.breaker {
                    breaker.record_failure();
                }

                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }

                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, backing off"
                );
                counter!("relay_retry_attempts_total").increment(1);

                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => {
                        return Err(RetryError::Cancelled { attempts: attempt });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                delay = policy.next_delay(delay);
            }
        }
    }
}

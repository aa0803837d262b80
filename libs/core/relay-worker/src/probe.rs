//! Startup gating and periodic dependency health polling.

use crate::dependency::LiquidityGuard;
use crate::error::RelayError;
use crate::health::Readiness;
use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Linear backoff for waiting on collaborators at startup.
#[derive(Debug, Clone)]
pub struct StartupGate {
    pub attempts: u32,
    /// Wait after the n-th failed probe is `n * step`
    pub step: Duration,
}

impl Default for StartupGate {
    fn default() -> Self {
        Self {
            attempts: 15,
            step: Duration::from_secs(2),
        }
    }
}

impl StartupGate {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Probe `name` until it reports ready.
    ///
    /// Fails with [`RelayError::Shutdown`] if shutdown interrupts a wait, or
    /// with a dependency error once every attempt is spent.
    pub async fn wait_for<F, Fut>(
        &self,
        name: &str,
        shutdown: &mut ShutdownSignal,
        mut probe: F,
    ) -> Result<(), RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 1..=self.attempts {
            if probe().await {
                info!(dependency = %name, attempt, "Dependency ready");
                return Ok(());
            }

            if attempt == self.attempts {
                break;
            }

            let wait = self.step * attempt;
            warn!(
                dependency = %name,
                attempt,
                max_attempts = self.attempts,
                retry_in_ms = wait.as_millis() as u64,
                "Dependency not ready"
            );
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(RelayError::Shutdown),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        Err(RelayError::dependency(format!(
            "{name} not ready after {} attempts",
            self.attempts
        )))
    }
}

/// Poll the dependency every `every` and keep `readiness` current.
pub async fn monitor_dependency(
    guard: Arc<LiquidityGuard>,
    readiness: Arc<Readiness>,
    every: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            _ = tick.tick() => {
                let ready = guard.ready().await;
                let was = readiness.set_dependency(ready);
                if was != ready {
                    if ready {
                        info!(breaker = %guard.breaker().name(), "Dependency became ready");
                    } else {
                        warn!(breaker = %guard.breaker().name(), "Dependency became unavailable");
                    }
                }
            }
        }
    }
}

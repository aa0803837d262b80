//! Dependency check-and-reserve behind retry and a circuit breaker.
//!
//! [`LiquidityGuard`] owns the breaker for one [`LiquidityService`] and turns
//! every possible outcome of a check into a [`Verdict`]. Whether an
//! unreachable dependency approves or rejects is decided by
//! [`FailurePolicy`].

use crate::config::{FailurePolicy, PipelineConfig};
use crate::error::{CODE_CIRCUIT_OPEN, CODE_DEPENDENCY_ERROR, ErrorCategory};
use crate::resilience::CircuitBreaker;
use crate::retry::{self, RetryError, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Funds movement a work item asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Party whose funds are checked and reserved
    pub debtor: String,
    /// Party credited once the reservation succeeds
    pub creditor: Option<String>,
    pub amount: f64,
    pub currency: String,
}

/// Answer to a check-and-reserve call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveOutcome {
    pub approved: bool,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub code: String,
}

/// Dependency call failures
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Remote liquidity ledger.
#[async_trait]
pub trait LiquidityService: Send + Sync {
    /// Short name used for the breaker and in logs
    fn name(&self) -> &str;

    /// Check that `subject` can cover `amount` and reserve it.
    async fn check_and_reserve(
        &self,
        subject: &str,
        amount: f64,
        currency: &str,
    ) -> Result<ReserveOutcome, DependencyError>;

    /// Credit `amount` to `subject`.
    async fn credit(&self, subject: &str, amount: f64, currency: &str)
    -> Result<(), DependencyError>;

    /// Readiness probe
    async fn ready(&self) -> bool;
}

/// How the dependency step ended for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved,
    /// The dependency said no, or it is unreachable under fail-closed.
    Denied { code: String, message: String },
    /// Unreachable under fail-open; validation alone decides.
    Degraded { reason: String },
    /// Shutdown interrupted the check under fail-closed. Under fail-open an
    /// interrupted check degrades like any other unreachable dependency.
    Cancelled,
}

/// Applies timeout, retry, breaker and failure policy to dependency calls.
pub struct LiquidityGuard {
    service: Option<Arc<dyn LiquidityService>>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
    failure_policy: FailurePolicy,
}

impl LiquidityGuard {
    /// `None` means the dependency is configured absent.
    pub fn new(service: Option<Arc<dyn LiquidityService>>, config: &PipelineConfig) -> Self {
        let name = service
            .as_ref()
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| "liquidity".to_string());
        let breaker = Arc::new(CircuitBreaker::new(name, config.breaker.clone()));
        let retry = config.retry.clone().with_breaker(Arc::clone(&breaker));

        Self {
            service,
            breaker,
            retry,
            timeout: config.dependency_timeout,
            failure_policy: config.failure_policy,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_configured(&self) -> bool {
        self.service.is_some()
    }

    /// Readiness of the dependency; an absent one is never ready.
    pub async fn ready(&self) -> bool {
        match &self.service {
            Some(service) => service.ready().await,
            None => false,
        }
    }

    /// Check-and-reserve for `request`, then credit the creditor if approved.
    pub async fn check(&self, request: &TransferRequest, shutdown: &mut ShutdownSignal) -> Verdict {
        let Some(service) = &self.service else {
            return self.degrade("dependency not configured");
        };

        let timeout = self.timeout;
        let outcome = retry::execute(&self.retry, shutdown, || {
            let service = Arc::clone(service);
            async move {
                tokio::time::timeout(
                    timeout,
                    service.check_and_reserve(&request.debtor, request.amount, &request.currency),
                )
                .await
                .unwrap_or(Err(DependencyError::Timeout(timeout)))
            }
        })
        .await;

        match outcome {
            Ok(reserve) if reserve.approved => {
                if let Some(creditor) = &request.creditor {
                    self.credit(service.as_ref(), creditor, request).await;
                }
                Verdict::Approved
            }
            Ok(reserve) => {
                let code = if reserve.code.is_empty() {
                    "INSUFFICIENT_FUNDS".to_string()
                } else {
                    reserve.code
                };
                debug!(debtor = %request.debtor, code = %code, balance = reserve.balance, "Reservation denied");
                Verdict::Denied {
                    message: format!("Liquidity check rejected: {code}"),
                    code,
                }
            }
            Err(RetryError::Cancelled { .. })
                if self.failure_policy == FailurePolicy::FailClosed =>
            {
                Verdict::Cancelled
            }
            Err(err) => self.unavailable(&err),
        }
    }

    async fn credit(&self, service: &dyn LiquidityService, creditor: &str, request: &TransferRequest) {
        let call = service.credit(creditor, request.amount, &request.currency);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => info!(
                creditor = %creditor,
                amount = request.amount,
                currency = %request.currency,
                "Credited creditor"
            ),
            Ok(Err(err)) => warn!(creditor = %creditor, error = %err, "Credit failed (continuing anyway)"),
            Err(_) => warn!(creditor = %creditor, timeout_ms = self.timeout.as_millis() as u64, "Credit timed out (continuing anyway)"),
        }
    }

    fn unavailable(&self, err: &RetryError<DependencyError>) -> Verdict {
        match self.failure_policy {
            FailurePolicy::FailOpen => self.degrade(&err.to_string()),
            FailurePolicy::FailClosed => {
                let code = match err.category() {
                    ErrorCategory::CircuitOpen => CODE_CIRCUIT_OPEN,
                    _ => CODE_DEPENDENCY_ERROR,
                };
                Verdict::Denied {
                    code: code.to_string(),
                    message: format!("Liquidity check unavailable: {err}"),
                }
            }
        }
    }

    fn degrade(&self, reason: &str) -> Verdict {
        warn!(
            breaker = %self.breaker.name(),
            reason = %reason,
            "Dependency unavailable, failing open"
        );
        counter!("relay_degraded_total", "dependency" => self.breaker.name().to_string()).increment(1);
        Verdict::Degraded {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod stubs {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Configurable in-memory liquidity service.
    pub struct StubLiquidity {
        pub approve: bool,
        pub fail: bool,
        pub delay: Option<Duration>,
        pub checks: AtomicU32,
        pub credits: Mutex<Vec<String>>,
    }

    impl StubLiquidity {
        pub fn approving() -> Self {
            Self {
                approve: true,
                fail: false,
                delay: None,
                checks: AtomicU32::new(0),
                credits: Mutex::new(Vec::new()),
            }
        }

        pub fn denying() -> Self {
            Self {
                approve: false,
                ..Self::approving()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::approving()
            }
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::approving()
            }
        }

        pub fn check_count(&self) -> u32 {
            self.checks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LiquidityService for StubLiquidity {
        fn name(&self) -> &str {
            "stub-liquidity"
        }

        async fn check_and_reserve(
            &self,
            _subject: &str,
            _amount: f64,
            _currency: &str,
        ) -> Result<ReserveOutcome, DependencyError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(DependencyError::Transport("connection refused".into()));
            }
            Ok(ReserveOutcome {
                approved: self.approve,
                balance: 100.0,
                code: if self.approve { String::new() } else { "INSUFFICIENT_FUNDS".into() },
            })
        }

        async fn credit(&self, subject: &str, _amount: f64, _currency: &str) -> Result<(), DependencyError> {
            self.credits.lock().unwrap().push(subject.to_string());
            Ok(())
        }

        async fn ready(&self) -> bool {
            !self.fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stubs::StubLiquidity;
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use crate::shutdown;

    fn request() -> TransferRequest {
        TransferRequest {
            debtor: "bank-a".into(),
            creditor: Some("bank-b".into()),
            amount: 150.0,
            currency: "EUR".into(),
        }
    }

    fn guard_for(stub: &Arc<StubLiquidity>, config: &PipelineConfig) -> LiquidityGuard {
        let service: Arc<dyn LiquidityService> = stub.clone();
        LiquidityGuard::new(Some(service), config)
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig::default().with_retry(
            RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_approved_credits_creditor() {
        let stub = Arc::new(StubLiquidity::approving());
        let guard = guard_for(&stub, &fast_config());

        let verdict = guard.check(&request(), &mut ShutdownSignal::never()).await;

        assert_eq!(verdict, Verdict::Approved);
        assert_eq!(*stub.credits.lock().unwrap(), vec!["bank-b".to_string()]);
    }

    #[tokio::test]
    async fn test_denial_carries_service_code() {
        let stub = Arc::new(StubLiquidity::denying());
        let guard = guard_for(&stub, &fast_config());

        let verdict = guard.check(&request(), &mut ShutdownSignal::never()).await;

        assert_eq!(
            verdict,
            Verdict::Denied {
                code: "INSUFFICIENT_FUNDS".into(),
                message: "Liquidity check rejected: INSUFFICIENT_FUNDS".into(),
            }
        );
        assert!(stub.credits.lock().unwrap().is_empty());
        // A denial is a healthy answer.
        assert_eq!(guard.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_absent_service_degrades() {
        let guard = LiquidityGuard::new(None, &fast_config());
        assert!(!guard.is_configured());
        assert!(!guard.ready().await);

        let verdict = guard.check(&request(), &mut ShutdownSignal::never()).await;
        assert!(matches!(verdict, Verdict::Degraded { .. }));
    }

    #[tokio::test]
    async fn test_transport_errors_fail_open() {
        let stub = Arc::new(StubLiquidity::failing());
        let guard = guard_for(&stub, &fast_config());

        let verdict = guard.check(&request(), &mut ShutdownSignal::never()).await;

        match verdict {
            Verdict::Degraded { reason } => assert!(reason.contains("max retries (3) exceeded")),
            other => panic!("expected degraded, got {other:?}"),
        }
        assert_eq!(stub.check_count(), 3);
    }

    #[tokio::test]
    async fn test_fail_closed_maps_codes() {
        let stub = Arc::new(StubLiquidity::failing());
        let config = fast_config()
            .with_failure_policy(FailurePolicy::FailClosed)
            .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(3));
        let guard = guard_for(&stub, &config);

        let first = guard.check(&request(), &mut ShutdownSignal::never()).await;
        assert!(matches!(first, Verdict::Denied { ref code, .. } if code == CODE_DEPENDENCY_ERROR));
        assert_eq!(guard.breaker().state(), CircuitState::Open);

        let second = guard.check(&request(), &mut ShutdownSignal::never()).await;
        assert!(matches!(second, Verdict::Denied { ref code, .. } if code == CODE_CIRCUIT_OPEN));
        assert_eq!(stub.check_count(), 3);
    }

    #[tokio::test]
    async fn test_slow_dependency_times_out() {
        let stub = Arc::new(StubLiquidity::slow(Duration::from_millis(200)));
        let config = fast_config()
            .with_dependency_timeout(Duration::from_millis(10))
            .with_retry(RetryPolicy::default().with_max_attempts(1));
        let guard = guard_for(&stub, &config);

        let verdict = guard.check(&request(), &mut ShutdownSignal::never()).await;
        match verdict {
            Verdict::Degraded { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected degraded, got {other:?}"),
        }
    }

    async fn check_interrupted_by_shutdown(policy: FailurePolicy) -> Verdict {
        let stub = Arc::new(StubLiquidity::failing());
        let config = PipelineConfig::default()
            .with_failure_policy(policy)
            .with_retry(RetryPolicy::default().with_initial_delay(Duration::from_secs(30)));
        let guard = guard_for(&stub, &config);
        let (trigger, mut signal) = shutdown::channel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let verdict = tokio::time::timeout(Duration::from_secs(5), guard.check(&request(), &mut signal))
            .await
            .unwrap();
        assert_eq!(stub.check_count(), 1);
        verdict
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_degrades_under_fail_open() {
        let verdict = check_interrupted_by_shutdown(FailurePolicy::FailOpen).await;
        match verdict {
            Verdict::Degraded { reason } => assert!(reason.contains("cancelled")),
            other => panic!("expected degraded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_cancels_under_fail_closed() {
        let verdict = check_interrupted_by_shutdown(FailurePolicy::FailClosed).await;
        assert_eq!(verdict, Verdict::Cancelled);
    }
}

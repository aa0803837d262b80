//! Pipeline counters and Prometheus metrics
//!
//! [`PipelineCounters`] are plain atomics readable without blocking; they feed
//! `/stats`, the periodic metrics event and the periodic log line. The same
//! events are mirrored into the `metrics` facade for Prometheus scraping.

use crate::error::{CODE_CANCELLED, RelayError};
use crate::event::{HubEvent, MetricsUpdate, ProcessingResult};
use crate::hub::HubHandle;
use crate::shutdown::ShutdownSignal;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), RelayError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| RelayError::Internal(format!("failed to install Prometheus recorder: {e}")))?;
        info!("Prometheus metrics initialized");
        Ok::<_, RelayError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Totals since startup.
#[derive(Debug)]
pub struct PipelineCounters {
    received: AtomicU64,
    processed: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    degraded: AtomicU64,
    started: Instant,
}

impl Default for PipelineCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// An item was handed to the queue.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!("relay_items_received_total").increment(1);
    }

    /// A dependency check degraded to approve.
    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    /// A result left the pipeline. Cancelled items count as errors, not rejections.
    pub fn record_result(&self, result: &ProcessingResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let status = if result.accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            "accepted"
        } else if result.code == CODE_CANCELLED {
            self.errors.fetch_add(1, Ordering::Relaxed);
            "error"
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            "rejected"
        };

        counter!("relay_items_processed_total", "status" => status).increment(1);
        histogram!("relay_item_duration_seconds").record(result.latency.as_secs_f64());
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let accepted = self.accepted.load(Ordering::Relaxed);
        let uptime = self.uptime();
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed,
            accepted,
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            uptime_secs: uptime.as_secs(),
            messages_per_second: rate(processed, uptime),
            success_rate: percentage(accepted, processed),
        }
    }
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub errors: u64,
    pub degraded: u64,
    pub uptime_secs: u64,
    pub messages_per_second: f64,
    pub success_rate: f64,
}

fn rate(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Hub-side metrics helpers
pub(crate) fn subscriber_gauge(count: usize) {
    gauge!("relay_hub_subscribers").set(count as f64);
}

pub(crate) fn subscriber_evicted() {
    counter!("relay_hub_evictions_total").increment(1);
}

pub(crate) fn broadcast_dropped() {
    counter!("relay_hub_broadcast_dropped_total").increment(1);
}

/// Periodically push a metrics event to subscribers and log a summary.
pub async fn report_loop(
    counters: std::sync::Arc<PipelineCounters>,
    hub: HubHandle,
    broadcast_every: Duration,
    log_every: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut broadcast_tick = tokio::time::interval(broadcast_every);
    let mut log_tick = tokio::time::interval(log_every);
    broadcast_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    log_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Both fire immediately otherwise.
    broadcast_tick.tick().await;
    log_tick.tick().await;

    let mut last_processed = counters.processed();
    let mut last_log = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            _ = broadcast_tick.tick() => {
                let snapshot = counters.snapshot();
                let update = MetricsUpdate {
                    total_processed: snapshot.processed,
                    messages_per_second: snapshot.messages_per_second,
                    success_rate: snapshot.success_rate,
                    active_connections: hub.subscriber_count(),
                };
                if let Err(e) = hub.broadcast_event(&HubEvent::Metrics(update)) {
                    warn!(error = %e, "Failed to publish metrics event");
                }
            }
            _ = log_tick.tick() => {
                let snapshot = counters.snapshot();
                let window = last_log.elapsed();
                let window_rate = rate(snapshot.processed.saturating_sub(last_processed), window);
                last_processed = snapshot.processed;
                last_log = Instant::now();

                info!(
                    window_rate = %format!("{window_rate:.1}"),
                    processed = snapshot.processed,
                    accepted = snapshot.accepted,
                    rejected = snapshot.rejected,
                    errors = snapshot.errors,
                    degraded = snapshot.degraded,
                    success_rate = %format!("{:.1}", snapshot.success_rate),
                    uptime_secs = snapshot.uptime_secs,
                    "Pipeline metrics"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WorkItem;

    #[test]
    fn test_counters_classify_results() {
        let counters = PipelineCounters::new();
        let item = WorkItem::new("1", Vec::new());

        counters.record_received();
        counters.record_received();
        counters.record_received();
        counters.record_result(&ProcessingResult::accepted(&item, "ok", Duration::from_millis(3)));
        counters.record_result(&ProcessingResult::rejected(&item, "INVALID_BIC", "bad", Duration::ZERO));
        counters.record_result(&ProcessingResult::rejected(&item, CODE_CANCELLED, "stop", Duration::ZERO));
        counters.record_degraded();

        let snap = counters.snapshot();
        assert_eq!(snap.received, 3);
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.degraded, 1);
        assert!((snap.success_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let snap = PipelineCounters::new().snapshot();
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(rate(10, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_render_without_init_is_empty() {
        if prometheus_handle().is_none() {
            assert!(render_metrics().is_empty());
        }
    }
}

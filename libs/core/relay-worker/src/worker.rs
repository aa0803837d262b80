//! Bounded worker-pool pipeline.
//!
//! ```text
//! ItemSource ─> ingestion ─> [queue] ─> worker 0..N ─> [results] ─> drain ─> sinks
//!                                            │
//!                                            └─> hub (transaction event)
//! ```
//!
//! This module provides:
//! - `ResultSink` trait for local consumers of results
//! - `Pipeline` struct for running ingestion, workers and the results drain
//!
//! Every item that makes it into the queue yields exactly one
//! [`ProcessingResult`]. Shutdown stops ingestion and closes the queue; the
//! workers drain what is left and `run` returns only after the results drain
//! has seen every result.

use crate::config::PipelineConfig;
use crate::dependency::{LiquidityGuard, Verdict};
use crate::error::{CODE_CANCELLED, ErrorCategory, RelayError};
use crate::event::{HubEvent, ProcessingResult, WorkItem};
use crate::hub::HubHandle;
use crate::metrics::{MetricsSnapshot, PipelineCounters};
use crate::shutdown::ShutdownSignal;
use crate::source::ItemSource;
use crate::validate::{Inspection, Validator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Local consumer of every result, called from the results drain.
///
/// Implementations must be quick; a slow sink backs up the results channel.
pub trait ResultSink: Send + Sync {
    fn record(&self, result: &ProcessingResult);
}

/// Per-item logic shared by every worker.
struct ItemProcessor {
    validator: Arc<dyn Validator>,
    guard: Arc<LiquidityGuard>,
    counters: Arc<PipelineCounters>,
    hub: Option<HubHandle>,
}

impl ItemProcessor {
    async fn process(
        &self,
        item: &WorkItem,
        inspection: &dyn Inspection,
        shutdown: &mut ShutdownSignal,
    ) -> ProcessingResult {
        let started = Instant::now();

        let verdict = match inspection.transfer() {
            Ok(Some(request)) => Some(self.guard.check(&request, shutdown).await),
            Ok(None) => None,
            Err(rejection) => {
                return ProcessingResult::rejected(item, rejection.code, rejection.message, started.elapsed())
                    .with_reference(rejection.reference);
            }
        };

        let mut degraded = None;
        match verdict {
            Some(Verdict::Denied { code, message }) => {
                return ProcessingResult::rejected(item, code, message, started.elapsed());
            }
            Some(Verdict::Cancelled) => {
                return ProcessingResult::rejected(
                    item,
                    CODE_CANCELLED,
                    "Processing cancelled by shutdown",
                    started.elapsed(),
                );
            }
            Some(Verdict::Degraded { reason }) => {
                self.counters.record_degraded();
                degraded = Some(reason);
            }
            Some(Verdict::Approved) | None => {}
        }

        let validation = inspection.validate();
        let latency = started.elapsed();
        let mut result = if validation.valid {
            ProcessingResult::accepted(item, validation.message, latency)
        } else {
            ProcessingResult::rejected(item, validation.code, validation.message, latency)
        }
        .with_reference(validation.reference);

        if let Some(reason) = degraded {
            result.message = format!("{} (liquidity check degraded: {reason})", result.message);
        }
        result
    }

    fn publish(&self, item: &WorkItem, inspection: &dyn Inspection, result: &ProcessingResult) {
        let Some(hub) = &self.hub else {
            return;
        };

        let data = match inspection.summarize(result) {
            Some(summary) => summary,
            None => match serde_json::to_value(result) {
                Ok(value) => value,
                Err(e) => {
                    warn!(item_id = %item.id, error = %e, "Failed to serialize result");
                    return;
                }
            },
        };

        if let Err(e) = hub.broadcast_event(&HubEvent::Transaction(data)) {
            warn!(item_id = %item.id, error = %e, "Failed to publish transaction event");
        }
    }
}

/// Ingestion, worker pool and results drain over one [`ItemSource`].
pub struct Pipeline<S: ItemSource> {
    config: PipelineConfig,
    source: S,
    processor: ItemProcessor,
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl<S: ItemSource> Pipeline<S> {
    pub fn new(
        config: PipelineConfig,
        source: S,
        validator: Arc<dyn Validator>,
        guard: Arc<LiquidityGuard>,
    ) -> Self {
        Self {
            config,
            source,
            processor: ItemProcessor {
                validator,
                guard,
                counters: Arc::new(PipelineCounters::new()),
                hub: None,
            },
            sinks: Vec::new(),
        }
    }

    /// Broadcast a transaction event per result.
    pub fn with_hub(mut self, hub: HubHandle) -> Self {
        self.processor.hub = Some(hub);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Share counters with reporters created before the pipeline.
    pub fn with_counters(mut self, counters: Arc<PipelineCounters>) -> Self {
        self.processor.counters = counters;
        self
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.processor.counters)
    }

    /// Run until the source is exhausted or shutdown is triggered, then drain.
    ///
    /// Returns the final counters. A permanent source error also ends the
    /// run, after draining, and is returned.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<MetricsSnapshot, RelayError> {
        let Pipeline {
            config,
            source,
            processor,
            sinks,
        } = self;

        let processor = Arc::new(processor);
        let counters = Arc::clone(&processor.counters);

        let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(config.queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (results_tx, results_rx) = mpsc::channel::<ProcessingResult>(config.results_capacity.max(1));

        info!(
            source = %source.name(),
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Pipeline starting"
        );

        let drain = tokio::spawn(drain_results(results_rx, Arc::clone(&counters), sinks));

        let mut workers = JoinSet::new();
        for worker_id in 0..config.workers.max(1) {
            workers.spawn(run_worker(
                worker_id,
                Arc::clone(&queue_rx),
                Arc::clone(&processor),
                results_tx.clone(),
                shutdown.clone(),
            ));
        }
        drop(results_tx);
        drop(queue_rx);

        let ingestion = tokio::spawn(ingest(
            source,
            queue_tx,
            Arc::clone(&counters),
            shutdown,
            config.source_error_backoff,
        ));

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        let ingested = ingestion
            .await
            .unwrap_or_else(|e| Err(RelayError::Internal(format!("ingestion task failed: {e}"))));

        if let Err(e) = drain.await {
            error!(error = %e, "Results drain failed");
        }

        let snapshot = counters.snapshot();
        info!(
            processed = snapshot.processed,
            accepted = snapshot.accepted,
            rejected = snapshot.rejected,
            errors = snapshot.errors,
            degraded = snapshot.degraded,
            "Pipeline stopped"
        );

        ingested.map(|()| snapshot)
    }
}

/// Pull from the source into the queue until exhaustion, shutdown or a
/// permanent source error. Dropping `queue` on return closes it.
async fn ingest<S: ItemSource>(
    mut source: S,
    queue: mpsc::Sender<WorkItem>,
    counters: Arc<PipelineCounters>,
    mut shutdown: ShutdownSignal,
    error_backoff: Duration,
) -> Result<(), RelayError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.triggered() => {
                info!("Ingestion stopping (shutdown)");
                return Ok(());
            }
            next = source.next_item() => next,
        };

        match next {
            Ok(Some(item)) => {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.triggered() => {
                        warn!(item_id = %item.id, "Shutdown while queue full, item not queued");
                        return Ok(());
                    }
                    permit = queue.reserve() => permit,
                };
                match permit {
                    Ok(permit) => {
                        permit.send(item);
                        counters.record_received();
                    }
                    Err(_) => {
                        warn!("All workers gone, ingestion stopping");
                        return Ok(());
                    }
                }
            }
            Ok(None) => {
                info!("Source exhausted, ingestion stopping");
                return Ok(());
            }
            Err(e) if e.category() == ErrorCategory::Transient => {
                warn!(error = %e, backoff_ms = error_backoff.as_millis() as u64, "Source error, backing off");
                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => return Ok(()),
                    _ = tokio::time::sleep(error_backoff) => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Source failed, ingestion stopping");
                return Err(e);
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    processor: Arc<ItemProcessor>,
    results: mpsc::Sender<ProcessingResult>,
    mut shutdown: ShutdownSignal,
) {
    debug!(worker_id, "Worker started");

    loop {
        let next = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };
        let Some(item) = next else {
            break;
        };

        let inspection = processor.validator.inspect(&item);
        let result = processor.process(&item, inspection.as_ref(), &mut shutdown).await;
        debug!(
            worker_id,
            item_id = %item.id,
            age_ms = (Utc::now() - item.received_at).num_milliseconds(),
            accepted = result.accepted,
            code = %result.code,
            latency_ms = result.latency_ms(),
            "Item processed"
        );

        processor.publish(&item, inspection.as_ref(), &result);
        if results.send(result).await.is_err() {
            warn!(worker_id, item_id = %item.id, "Results channel closed, result not recorded");
        }
    }

    debug!(worker_id, "Worker stopped (queue drained)");
}

async fn drain_results(
    mut results: mpsc::Receiver<ProcessingResult>,
    counters: Arc<PipelineCounters>,
    sinks: Vec<Arc<dyn ResultSink>>,
) {
    while let Some(result) = results.recv().await {
        counters.record_result(&result);
        for sink in &sinks {
            sink.record(&result);
        }
    }
}

//! Tick-based orchestrator.
//!
//! Every tick runs all registered processors concurrently. Each processor
//! walks its candidates one at a time: lock, reload, re-check, process under a
//! timeout, then persist according to the outcome. A failure on one document
//! never stops the others.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::document::{DocumentId, DocumentStore};
use crate::processor::{ProcessFailure, ProcessOutcome, Processor, ProcessorRegistry};

/// Per-processor counts for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    pub candidates: usize,
    pub completed: usize,
    pub not_ready: usize,
    pub failed: usize,
    /// Locked by another processor, or no longer eligible after reload.
    pub skipped: usize,
    /// The processor was still running from an earlier call and did not run.
    pub busy: bool,
}

impl ProcessorReport {
    fn record(&mut self, result: DocumentResult) {
        match result {
            DocumentResult::Completed => self.completed += 1,
            DocumentResult::NotReady => self.not_ready += 1,
            DocumentResult::Failed => self.failed += 1,
            DocumentResult::Skipped => self.skipped += 1,
        }
    }

    fn is_idle(&self) -> bool {
        self.candidates == 0 && !self.busy
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub processors: BTreeMap<String, ProcessorReport>,
    pub elapsed: Duration,
}

impl TickReport {
    pub fn get(&self, key: &str) -> Option<&ProcessorReport> {
        self.processors.get(key)
    }

    pub fn total(&self) -> ProcessorReport {
        self.processors
            .values()
            .fold(ProcessorReport::default(), |mut acc, r| {
                acc.candidates += r.candidates;
                acc.completed += r.completed;
                acc.not_ready += r.not_ready;
                acc.failed += r.failed;
                acc.skipped += r.skipped;
                acc.busy |= r.busy;
                acc
            })
    }
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total();
        write!(
            f,
            "{} completed, {} not ready, {} failed, {} skipped in {:?}",
            total.completed, total.not_ready, total.failed, total.skipped, self.elapsed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentResult {
    Completed,
    NotReady,
    Failed,
    Skipped,
}

/// Clears a processor's running flag when dropped.
struct RunningGuard(Arc<AtomicBool>);

impl RunningGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    registry: ProcessorRegistry,
    store: Arc<DocumentStore>,
    config: SchedulerConfig,
    running: HashMap<String, Arc<AtomicBool>>,
}

impl Scheduler {
    pub fn new(registry: ProcessorRegistry, store: Arc<DocumentStore>, config: SchedulerConfig) -> Self {
        let running = registry
            .iter()
            .map(|p| (p.spec().key.clone(), Arc::new(AtomicBool::new(false))))
            .collect();
        Self {
            registry,
            store,
            config,
            running,
        }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every processor once.
    pub async fn run_tick(&self) -> TickReport {
        let started = Instant::now();
        let runs = self.registry.iter().map(|processor| async move {
            let report = self.run_processor(processor.as_ref()).await;
            (processor.spec().key.clone(), report)
        });
        let processors: BTreeMap<String, ProcessorReport> = join_all(runs).await.into_iter().collect();

        let report = TickReport {
            processors,
            elapsed: started.elapsed(),
        };
        for (key, processor) in &report.processors {
            if !processor.is_idle() {
                info!(
                    processor = %key,
                    candidates = processor.candidates,
                    completed = processor.completed,
                    not_ready = processor.not_ready,
                    failed = processor.failed,
                    skipped = processor.skipped,
                    busy = processor.busy,
                    "Processor run finished"
                );
            }
        }
        info!(summary = %report, "Tick complete");
        report
    }

    async fn run_processor(&self, processor: &dyn Processor) -> ProcessorReport {
        let key = &processor.spec().key;
        let mut report = ProcessorReport::default();

        let Some(flag) = self.running.get(key) else {
            warn!(processor = %key, "Processor has no running flag, skipping");
            return report;
        };
        let Some(_running) = RunningGuard::acquire(flag) else {
            debug!(processor = %key, "Previous run still active, skipping");
            report.busy = true;
            return report;
        };

        let candidates = processor.select_candidates(&self.store).await;
        report.candidates = candidates.len();
        for id in candidates {
            let result = self.run_document(processor, &id).await;
            report.record(result);
        }
        report
    }

    async fn run_document(&self, processor: &dyn Processor, id: &DocumentId) -> DocumentResult {
        let spec = processor.spec();
        let Some(_lock) = self.store.locks().try_lock(id).await else {
            debug!(processor = %spec.key, doc = %id, "Document locked, skipping");
            return DocumentResult::Skipped;
        };

        let mut doc = match self.store.load(id).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(processor = %spec.key, doc = %id, error = %e, "Failed to reload document");
                return DocumentResult::Failed;
            }
        };
        if !processor.accepts(&doc) {
            debug!(processor = %spec.key, doc = %id, "No longer eligible, skipping");
            return DocumentResult::Skipped;
        }

        let timeout = self.config.invocation_timeout;
        let invocation = AssertUnwindSafe(processor.process(&mut doc)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_panic)) => ProcessOutcome::permanent("processor panicked"),
            Err(_) => ProcessOutcome::transient(format!("timed out after {}s", timeout.as_secs_f64())),
        };

        if let ProcessOutcome::Completed = outcome {
            doc.add_stage(&spec.stage);
        }
        if outcome.keeps_edits()
            && let Err(e) = doc.save().await
        {
            error!(processor = %spec.key, doc = %id, error = %e, "Failed to save document");
            return DocumentResult::Failed;
        }

        match outcome {
            ProcessOutcome::Completed => {
                info!(processor = %spec.key, doc = %id, stage = %spec.stage, "Stage completed");
                DocumentResult::Completed
            }
            ProcessOutcome::NotReady { reason } => {
                debug!(processor = %spec.key, doc = %id, reason = %reason, "Not ready");
                DocumentResult::NotReady
            }
            ProcessOutcome::Failed(ProcessFailure::Validation(errors)) => {
                info!(processor = %spec.key, doc = %id, errors = ?errors, "Validation failed, waiting for corrections");
                DocumentResult::NotReady
            }
            ProcessOutcome::Failed(ProcessFailure::Transient(reason)) => {
                warn!(processor = %spec.key, doc = %id, reason = %reason, "Transient failure, will retry");
                DocumentResult::Failed
            }
            ProcessOutcome::Failed(ProcessFailure::Permanent(reason)) => {
                error!(processor = %spec.key, doc = %id, reason = %reason, "Permanent failure");
                DocumentResult::Failed
            }
        }
    }
}

/// Random delay in `0..=max`.
fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Spawn the tick loop. Set the returned flag to stop it after the current tick.
pub fn spawn_scheduler(scheduler: Arc<Scheduler>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let config = scheduler.config().clone();
        info!(
            interval_secs = config.tick_interval.as_secs(),
            jitter_secs = config.tick_jitter.as_secs(),
            processors = scheduler.registry().len(),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // First tick fires immediately
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Scheduler shutting down");
                return;
            }

            let delay = jitter(config.tick_jitter);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            scheduler.run_tick().await;
        }
    });

    (handle, shutdown_flag)
}

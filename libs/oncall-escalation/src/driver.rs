//! Escalation Driver - periodic batch processing
//!
//! Each tick:
//! - one-shot mode: drain ids handed over by the scheduler, then claim due
//!   rows in batches and process them concurrently
//! - recurring mode: walk alerts with recurring escalations, `batch_size` at
//!   a time, resuming after the last alert of the previous tick
//!
//! One `ResolutionCache` is shared per tick. Errors of single escalations are
//! logged and counted; they never stop the loop.

use crate::dispatch::WorkQueueReceiver;
use crate::error::{EscalationError, Result};
use crate::processor::{EscalationProcessor, Outcome};
use crate::recurring::RecurringEscalationProcessor;
use crate::rotation::ResolutionCache;
use crate::traits::RecurringEscalationStore;
use crate::types::EscalationMode;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Default driver tick interval (10s)
pub const DEFAULT_TICK_MS: u64 = 10_000;

/// Driver tuning
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub tick_ms: u64,
    /// Maximum rows claimed per tick
    pub batch_size: usize,
    /// Escalations processed at once
    pub concurrency: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            batch_size: 100,
            concurrency: 8,
        }
    }
}

/// Cumulative outcome counters
#[derive(Debug, Default)]
pub struct DriverStats {
    ticks: AtomicU64,
    escalated: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of `DriverStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStatsSnapshot {
    pub ticks: u64,
    pub escalated: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl DriverStats {
    fn record(&self, result: &Result<Outcome>) {
        let counter = match result {
            Ok(Outcome::Escalated { .. }) => &self.escalated,
            Ok(Outcome::Skipped { .. }) => &self.skipped,
            Ok(Outcome::Dropped { .. }) => &self.dropped,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DriverStatsSnapshot {
        DriverStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Outcome counts of a single tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub escalated: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub failed: usize,
}

impl TickSummary {
    fn record(&mut self, result: &Result<Outcome>) {
        match result {
            Ok(Outcome::Escalated { .. }) => self.escalated += 1,
            Ok(Outcome::Skipped { .. }) => self.skipped += 1,
            Ok(Outcome::Dropped { .. }) => self.dropped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.escalated + self.skipped + self.dropped + self.failed
    }
}

fn log_failure(what: std::fmt::Arguments<'_>, e: &EscalationError) {
    if e.is_transient() {
        warn!("{} failed, will retry: {}", what, e);
    } else {
        error!("{} failed: {}", what, e);
    }
}

/// Driver status information
#[derive(Debug, Clone, Serialize)]
pub struct DriverStatus {
    pub running: bool,
    pub mode: EscalationMode,
    pub tick_interval_ms: u64,
    pub stats: DriverStatsSnapshot,
}

enum Engine {
    OneShot(Arc<EscalationProcessor>),
    Recurring(Arc<RecurringEscalationProcessor>),
}

/// Periodic escalation driver
pub struct EscalationDriver {
    engine: Engine,
    config: DriverConfig,
    queue: Mutex<Option<WorkQueueReceiver>>,
    stats: Arc<DriverStats>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    /// Last alert id walked by the previous recurring tick
    recurring_cursor: AtomicI64,
}

impl EscalationDriver {
    /// Driver for one-shot pending escalations
    pub fn one_shot(processor: Arc<EscalationProcessor>, config: DriverConfig) -> Self {
        Self::with_engine(Engine::OneShot(processor), config)
    }

    /// Driver for recurring escalations
    pub fn recurring(processor: Arc<RecurringEscalationProcessor>, config: DriverConfig) -> Self {
        Self::with_engine(Engine::Recurring(processor), config)
    }

    fn with_engine(engine: Engine, config: DriverConfig) -> Self {
        Self {
            engine,
            config,
            queue: Mutex::new(None),
            stats: Arc::new(DriverStats::default()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            recurring_cursor: AtomicI64::new(0),
        }
    }

    /// Also process ids handed over by the scheduler
    pub fn with_queue(self, receiver: WorkQueueReceiver) -> Self {
        *self.queue.lock() = Some(receiver);
        self
    }

    pub fn mode(&self) -> EscalationMode {
        match self.engine {
            Engine::OneShot(_) => EscalationMode::OneShot,
            Engine::Recurring(_) => EscalationMode::Recurring,
        }
    }

    /// Run the tick loop until `stop` is called
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Escalation driver already running");
            return;
        }
        info!(
            "Starting escalation driver ({:?}) with {}ms tick",
            self.mode(),
            self.config.tick_ms
        );

        let mut tick_interval = interval(Duration::from_millis(self.config.tick_ms.max(1)));

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Escalation driver tick error: {}", e);
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Escalation driver received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Escalation driver stopped");
    }

    /// Stop the tick loop
    pub fn stop(&self) {
        info!("Stopping escalation driver...");
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DriverStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            running: self.is_running(),
            mode: self.mode(),
            tick_interval_ms: self.config.tick_ms,
            stats: self.stats.snapshot(),
        }
    }

    /// Single pass at the processor clock's current time
    pub async fn tick(&self) -> Result<TickSummary> {
        let now = match &self.engine {
            Engine::OneShot(processor) => processor.clock().now(),
            Engine::Recurring(processor) => processor.clock().now(),
        };
        self.tick_at(now).await
    }

    /// Single pass at `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        let cache = ResolutionCache::new();

        let summary = match &self.engine {
            Engine::OneShot(processor) => self.tick_one_shot(processor, now, &cache).await?,
            Engine::Recurring(processor) => self.tick_recurring(processor, now, &cache).await?,
        };

        if summary.total() > 0 {
            info!(
                "Escalation tick: {} escalated, {} skipped, {} dropped, {} failed",
                summary.escalated, summary.skipped, summary.dropped, summary.failed
            );
        }
        debug!("Tick resolved {} schedules, {} cache hits", cache.len(), cache.hits());
        Ok(summary)
    }

    async fn tick_one_shot(
        &self,
        processor: &EscalationProcessor,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<TickSummary> {
        let summary = Mutex::new(TickSummary::default());
        let record = |result: Result<Outcome>, id: i64| {
            if let Err(e) = &result {
                log_failure(format_args!("Escalation {}", id), e);
            }
            self.stats.record(&result);
            summary.lock().record(&result);
        };

        // Queued ids first; claim_due would otherwise hold them
        let queued = self
            .queue
            .lock()
            .as_mut()
            .map(|queue| queue.drain(self.config.batch_size))
            .unwrap_or_default();
        for id in queued {
            match processor.store().find(id).await {
                Ok(Some(escalation)) => {
                    record(processor.process_at(&escalation, now, cache).await, id);
                },
                Ok(None) => debug!("Queued escalation {} already consumed", id),
                Err(e) => record(Err(e), id),
            }
        }

        let claimed = processor
            .store()
            .claim_due(now, processor.lease(), self.config.batch_size)
            .await?;
        if !claimed.is_empty() {
            debug!("Claimed {} due escalations", claimed.len());
        }

        stream::iter(claimed)
            .for_each_concurrent(self.config.concurrency.max(1), |claimed| {
                let id = claimed.escalation.id;
                let record = &record;
                async move {
                    record(processor.process_claimed(claimed, now, cache).await, id);
                }
            })
            .await;

        Ok(summary.into_inner())
    }

    async fn tick_recurring(
        &self,
        processor: &RecurringEscalationProcessor,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<TickSummary> {
        let targets = self.next_recurring_batch(processor.store().as_ref()).await?;
        let summary = Mutex::new(TickSummary::default());
        let record = |result: &Result<Outcome>| {
            self.stats.record(result);
            summary.lock().record(result);
        };

        stream::iter(targets)
            .for_each_concurrent(self.config.concurrency.max(1), |target_id| {
                let record = &record;
                async move {
                    match processor.process_target(target_id, now, cache).await {
                        Ok(results) => results.iter().for_each(record),
                        Err(e) => {
                            log_failure(
                                format_args!("Recurring escalations of alert {}", target_id),
                                &e,
                            );
                            record(&Err(e));
                        },
                    }
                }
            })
            .await;

        Ok(summary.into_inner())
    }

    /// Next `batch_size` alerts after the cursor, wrapping around to the
    /// lowest ids once the end is reached
    async fn next_recurring_batch(
        &self,
        store: &dyn RecurringEscalationStore,
    ) -> Result<Vec<i64>> {
        let limit = self.config.batch_size;
        let cursor = self.recurring_cursor.load(Ordering::Relaxed);

        let mut targets = store.active_recurring_targets(cursor, limit).await?;
        if targets.len() < limit && cursor > 0 {
            let wrapped = store
                .active_recurring_targets(0, limit - targets.len())
                .await?;
            targets.extend(wrapped.into_iter().filter(|id| *id <= cursor));
        }

        self.recurring_cursor
            .store(targets.last().copied().unwrap_or(0), Ordering::Relaxed);
        Ok(targets)
    }
}

impl std::fmt::Debug for EscalationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationDriver")
            .field("mode", &self.mode())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Reject driver settings that would stall the loop
pub fn validate_config(config: &DriverConfig) -> Result<()> {
    if config.batch_size == 0 {
        return Err(EscalationError::InvalidConfiguration(
            "batch_size must be greater than 0".into(),
        ));
    }
    if config.concurrency == 0 {
        return Err(EscalationError::InvalidConfiguration(
            "concurrency must be greater than 0".into(),
        ));
    }
    if config.tick_ms == 0 {
        return Err(EscalationError::InvalidConfiguration(
            "tick_ms must be greater than 0".into(),
        ));
    }
    Ok(())
}

//! Service wiring: SQLite store, schedulers and the batch driver

use crate::config::{AuditSink, Config};
use anyhow::{Context, Result};
use common::{SqliteClient, SqliteSettings};
use oncall_escalation::{
    init_schema, AuditLog, ChannelWorkQueue, Clock, DedupDispatcher, DriverStatus,
    EscalationDirectory, EscalationDriver, EscalationMode, EscalationProcessor, FileAuditLog,
    PendingEscalationScheduler, RecurringEscalationProcessor, RecurringScheduler,
    SqliteEscalationStore, SystemClock, TickSummary, TracingAuditLog, TracingDispatcher,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

enum Scheduler {
    OneShot(PendingEscalationScheduler),
    Recurring(RecurringScheduler),
}

/// Fully wired escalation worker
pub struct App {
    client: SqliteClient,
    store: Arc<SqliteEscalationStore>,
    scheduler: Scheduler,
    driver: Arc<EscalationDriver>,
}

impl App {
    /// Open the configured database and wire the engine
    pub async fn open(config: &Config) -> Result<Self> {
        let settings = SqliteSettings {
            path: config.database.path.clone(),
            max_connections: config.database.max_connections,
            busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
        };
        let client = SqliteClient::with_settings(settings).await?;
        Self::with_client(config, client, Arc::new(SystemClock)).await
    }

    /// Wire the engine on an existing database client
    pub async fn with_client(
        config: &Config,
        client: SqliteClient,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        init_schema(client.pool())
            .await
            .context("Failed to initialize escalation schema")?;

        let store = Arc::new(SqliteEscalationStore::new(client.pool().clone()));
        let gate = Arc::new(config.features.gate());
        let dispatcher = Arc::new(DedupDispatcher::new(
            Arc::new(TracingDispatcher),
            chrono::Duration::hours(config.engine.dedup_retention_hours),
            clock.clone(),
        ));
        let audit: Arc<dyn AuditLog> = match config.audit.sink {
            AuditSink::Tracing => Arc::new(TracingAuditLog),
            AuditSink::File => Arc::new(FileAuditLog::new(&config.audit.dir)),
        };
        let driver_config = config.engine.driver_config();

        let (scheduler, driver) = match config.engine.mode {
            EscalationMode::OneShot => {
                let (queue, receiver) = ChannelWorkQueue::new(config.engine.queue_capacity);
                let scheduler = PendingEscalationScheduler::new(
                    store.clone(),
                    store.clone(),
                    gate.clone(),
                    clock.clone(),
                )
                .with_queue(Arc::new(queue));
                let processor = EscalationProcessor::new(
                    store.clone(),
                    store.clone(),
                    dispatcher,
                    audit,
                    gate,
                    clock,
                )
                .with_lease(chrono::Duration::seconds(config.engine.claim_lease_secs));
                let driver = EscalationDriver::one_shot(Arc::new(processor), driver_config)
                    .with_queue(receiver);
                (Scheduler::OneShot(scheduler), driver)
            },
            EscalationMode::Recurring => {
                let scheduler =
                    RecurringScheduler::new(store.clone(), store.clone(), gate.clone(), clock.clone());
                let processor = RecurringEscalationProcessor::new(
                    store.clone(),
                    store.clone(),
                    dispatcher,
                    audit,
                    gate,
                    clock,
                );
                let driver = EscalationDriver::recurring(Arc::new(processor), driver_config);
                (Scheduler::Recurring(scheduler), driver)
            },
        };

        info!(
            "Escalation engine ready ({:?}) on {}",
            config.engine.mode,
            client.path()
        );

        Ok(Self {
            client,
            store,
            scheduler,
            driver: Arc::new(driver),
        })
    }

    pub fn store(&self) -> &Arc<SqliteEscalationStore> {
        &self.store
    }

    pub fn status(&self) -> DriverStatus {
        self.driver.status()
    }

    /// Run the scheduler for one alert; returns the number of escalations
    pub async fn schedule(&self, alert_id: i64) -> Result<usize> {
        let target = self
            .store
            .find_target(alert_id)
            .await?
            .with_context(|| format!("Alert {} not found", alert_id))?;

        let count = match &self.scheduler {
            Scheduler::OneShot(scheduler) => scheduler.schedule(&target).await?.len(),
            Scheduler::Recurring(scheduler) => scheduler.schedule(&target).await?.len(),
        };
        Ok(count)
    }

    /// One driver pass
    pub async fn tick(&self) -> Result<TickSummary> {
        Ok(self.driver.tick().await?)
    }

    /// Drive escalations until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        let driver = self.driver.clone();
        let handle = tokio::spawn(async move { driver.start().await });

        let signal = common::wait_for_shutdown().await;
        info!("Received {}, shutting down", signal);

        self.driver.stop();
        handle.await.context("Escalation driver task failed")?;

        let stats = self.driver.stats();
        info!(
            "Escalation totals: {} escalated, {} dropped, {} failed over {} ticks",
            stats.escalated, stats.dropped, stats.failed, stats.ticks
        );
        self.client.close().await;
        Ok(())
    }
}

//! End-to-end escalation scenarios over SQLite
//!
//! Scheduler, processors and driver run against a real schema with a
//! manual clock and recording collaborators.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use oncall_escalation::{
    init_schema, insert_policy, insert_schedule, set_target_status, upsert_target, AlertStatus,
    AuditLog, ChannelWorkQueue, DriverConfig, DropReason, EscalationDriver, EscalationError,
    EscalationPolicy, EscalationProcessor, EscalationRule, EscalationRuleStatus, LengthUnit,
    ManualClock, NotificationDispatcher, NotificationKey, OncallParticipant, OncallRotation,
    OncallSchedule, Outcome, PendingEscalation, PendingEscalationScheduler,
    PendingEscalationStore, RecurringEscalationProcessor, RecurringScheduler, ResolutionCache,
    SkipReason, SqliteEscalationStore, StaticFeatureGate, Target, UserRef,
};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;

// ============================================================================
// Recording collaborators
// ============================================================================

#[derive(Default)]
struct RecordingDispatcher {
    pages: Mutex<Vec<(i64, Vec<String>)>>,
}

impl RecordingDispatcher {
    fn pages(&self) -> Vec<(i64, Vec<String>)> {
        self.pages.lock().clone()
    }

    fn count(&self) -> usize {
        self.pages.lock().len()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn notify_oncall(
        &self,
        users: &[UserRef],
        target: &Target,
        _key: NotificationKey,
    ) -> Result<(), EscalationError> {
        let names = users.iter().map(|u| u.username.clone()).collect();
        self.pages.lock().push((target.id, names));
        Ok(())
    }
}

#[derive(Default)]
struct CountingAudit {
    notes: Mutex<usize>,
}

#[async_trait]
impl AuditLog for CountingAudit {
    async fn record_escalation(
        &self,
        _target: &Target,
        _policy: Option<&EscalationPolicy>,
        _users: &[UserRef],
        _schedule: &OncallSchedule,
    ) -> Result<(), EscalationError> {
        *self.notes.lock() += 1;
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

fn minutes(n: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(n)
}

fn schedule(id: i64, users: &[UserRef]) -> OncallSchedule {
    OncallSchedule {
        id,
        project_id: 1,
        name: format!("schedule-{}", id),
        timezone_offset_seconds: 0,
        rotations: vec![OncallRotation {
            id: id * 10,
            schedule_id: id,
            name: "weekly".into(),
            starts_at: t0() - Duration::days(2),
            ends_at: None,
            length: 1,
            length_unit: LengthUnit::Weeks,
            active_period: None,
            participants: users
                .iter()
                .enumerate()
                .map(|(i, user)| OncallParticipant {
                    id: id * 10 + i as i64,
                    user: user.clone(),
                    removed: false,
                })
                .collect(),
        }],
    }
}

fn rule(id: i64, schedule_id: i64, status: EscalationRuleStatus, elapsed: i64) -> EscalationRule {
    EscalationRule {
        id,
        policy_id: 1,
        oncall_schedule_id: schedule_id,
        status,
        elapsed_time_seconds: elapsed,
    }
}

fn alert() -> Target {
    Target {
        id: 1,
        project_id: 1,
        title: "api latency".into(),
        status: AlertStatus::Triggered,
        created_at: t0(),
    }
}

struct Harness {
    pool: sqlx::SqlitePool,
    store: Arc<SqliteEscalationStore>,
    dispatcher: Arc<RecordingDispatcher>,
    audit: Arc<CountingAudit>,
    gate: Arc<StaticFeatureGate>,
    clock: Arc<ManualClock>,
}

impl Harness {
    /// Schedule 1 has ana on call, schedule 2 bo, schedule 3 nobody
    async fn new(rules: Vec<EscalationRule>) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        init_schema(&pool).await.unwrap();

        insert_schedule(&pool, &schedule(1, &[UserRef::new(100, "ana")]))
            .await
            .unwrap();
        insert_schedule(&pool, &schedule(2, &[UserRef::new(200, "bo")]))
            .await
            .unwrap();
        insert_schedule(&pool, &schedule(3, &[])).await.unwrap();
        insert_policy(
            &pool,
            &EscalationPolicy {
                id: 1,
                project_id: 1,
                name: "default".into(),
                rules,
            },
        )
        .await
        .unwrap();
        upsert_target(&pool, &alert()).await.unwrap();

        Self {
            store: Arc::new(SqliteEscalationStore::new(pool.clone())),
            pool,
            dispatcher: Arc::new(RecordingDispatcher::default()),
            audit: Arc::new(CountingAudit::default()),
            gate: Arc::new(StaticFeatureGate::all_enabled()),
            clock: Arc::new(ManualClock::new(t0())),
        }
    }

    fn processor(&self) -> Arc<EscalationProcessor> {
        Arc::new(EscalationProcessor::new(
            self.store.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.audit.clone(),
            self.gate.clone(),
            self.clock.clone(),
        ))
    }

    fn recurring_processor(&self) -> Arc<RecurringEscalationProcessor> {
        Arc::new(RecurringEscalationProcessor::new(
            self.store.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.audit.clone(),
            self.gate.clone(),
            self.clock.clone(),
        ))
    }

    fn scheduler(&self) -> PendingEscalationScheduler {
        PendingEscalationScheduler::new(
            self.store.clone(),
            self.store.clone(),
            self.gate.clone(),
            self.clock.clone(),
        )
    }

    async fn schedule_alert(&self) -> Vec<PendingEscalation> {
        self.scheduler().schedule(&alert()).await.unwrap()
    }

    async fn set_status(&self, status: AlertStatus) {
        set_target_status(&self.pool, 1, status).await.unwrap();
    }

    async fn process(
        &self,
        pending: &[PendingEscalation],
        rule_id: i64,
        now: DateTime<Utc>,
    ) -> Outcome {
        let escalation = pending.iter().find(|p| p.rule_id == rule_id).unwrap();
        self.processor()
            .process_at(escalation, now, &ResolutionCache::new())
            .await
            .unwrap()
    }
}

fn paged(outcome: &Outcome) -> Vec<String> {
    match outcome {
        Outcome::Escalated { users, .. } => users.iter().map(|u| u.username.clone()).collect(),
        other => panic!("expected escalation, got {:?}", other),
    }
}

/// Rule A pages schedule 1 after 5 minutes until acknowledged,
/// rule B pages schedule 2 after 10 minutes until resolved
fn two_rule_chain() -> Vec<EscalationRule> {
    vec![
        rule(1, 1, EscalationRuleStatus::Acknowledged, 300),
        rule(2, 2, EscalationRuleStatus::Resolved, 600),
    ]
}

// ============================================================================
// One-shot escalation
// ============================================================================

#[tokio::test]
async fn test_two_rule_chain_escalates_in_sequence() {
    let h = Harness::new(two_rule_chain()).await;
    let pending = h.schedule_alert().await;
    assert_eq!(pending.len(), 2);

    // T0+4m: nothing due yet
    let early = h.process(&pending, 1, minutes(4)).await;
    assert_eq!(early, Outcome::skipped(SkipReason::NotDue));
    assert_eq!(h.dispatcher.count(), 0);

    let a = h.process(&pending, 1, minutes(5)).await;
    assert_eq!(paged(&a), vec!["ana"]);

    let b = h.process(&pending, 2, minutes(10)).await;
    assert_eq!(paged(&b), vec!["bo"]);

    assert_eq!(
        h.dispatcher.pages(),
        vec![(1, vec!["ana".to_string()]), (1, vec!["bo".to_string()])]
    );
    assert_eq!(*h.audit.notes.lock(), 2);
    assert!(h.store.list_for_target(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_acknowledged_alert_still_pending_for_resolve_rule() {
    let h = Harness::new(two_rule_chain()).await;
    let pending = h.schedule_alert().await;

    assert_eq!(paged(&h.process(&pending, 1, minutes(5)).await), vec!["ana"]);

    // Acknowledged at T0+6m; rule B waits for resolution so it still fires
    h.set_status(AlertStatus::Acknowledged).await;
    let b = h.process(&pending, 2, minutes(10)).await;
    assert_eq!(paged(&b), vec!["bo"]);
}

#[tokio::test]
async fn test_acknowledged_alert_satisfies_ack_rule() {
    let h = Harness::new(two_rule_chain()).await;
    let pending = h.schedule_alert().await;

    // Acknowledged at T0+3m, before rule A is due
    h.set_status(AlertStatus::Acknowledged).await;
    let a = h.process(&pending, 1, minutes(5)).await;
    assert_eq!(a, Outcome::dropped(DropReason::RuleSatisfied));

    let b = h.process(&pending, 2, minutes(10)).await;
    assert_eq!(paged(&b), vec!["bo"]);
    assert_eq!(h.dispatcher.count(), 1);
}

#[tokio::test]
async fn test_resolved_alert_drops_remaining_escalations() {
    let h = Harness::new(two_rule_chain()).await;
    let pending = h.schedule_alert().await;

    assert_eq!(paged(&h.process(&pending, 1, minutes(5)).await), vec!["ana"]);

    h.set_status(AlertStatus::Resolved).await;
    let b = h.process(&pending, 2, minutes(10)).await;
    assert_eq!(b, Outcome::dropped(DropReason::TargetResolved));
    assert_eq!(h.dispatcher.count(), 1);
}

#[tokio::test]
async fn test_stale_escalations_drop_in_any_order() {
    let h = Harness::new(two_rule_chain()).await;
    let pending = h.schedule_alert().await;
    h.set_status(AlertStatus::Resolved).await;

    for rule_id in [2, 1, 2, 1] {
        let outcome = h.process(&pending, rule_id, minutes(15)).await;
        assert!(outcome.is_dropped(), "rule {} gave {:?}", rule_id, outcome);
    }
    assert_eq!(h.dispatcher.count(), 0);
    assert!(h.store.list_for_target(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_processing_pages_once() {
    let h = Harness::new(two_rule_chain()).await;
    let pending = h.schedule_alert().await;
    let escalation = pending.iter().find(|p| p.rule_id == 1).unwrap().clone();
    let processor = h.processor();
    let cache = ResolutionCache::new();

    let outcomes = join_all(
        (0..8).map(|_| processor.process_at(&escalation, minutes(5), &cache)),
    )
    .await;

    let escalated = outcomes
        .iter()
        .filter(|o| o.as_ref().unwrap().is_escalated())
        .count();
    assert_eq!(escalated, 1);
    assert_eq!(h.dispatcher.count(), 1);
}

#[tokio::test]
async fn test_empty_rotation_consumes_without_paging() {
    let h = Harness::new(vec![rule(1, 3, EscalationRuleStatus::Acknowledged, 0)]).await;
    let pending = h.schedule_alert().await;

    let outcome = h.process(&pending, 1, t0()).await;
    assert!(paged(&outcome).is_empty());
    assert_eq!(h.dispatcher.count(), 0);
    assert_eq!(*h.audit.notes.lock(), 0);
    assert!(h.store.list_for_target(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_driver_ticks_through_chain() {
    let h = Harness::new(vec![
        rule(1, 1, EscalationRuleStatus::Acknowledged, 0),
        rule(2, 2, EscalationRuleStatus::Resolved, 300),
    ])
    .await;
    let (queue, receiver) = ChannelWorkQueue::new(16);
    h.scheduler()
        .with_queue(Arc::new(queue))
        .schedule(&alert())
        .await
        .unwrap();

    let driver = EscalationDriver::one_shot(h.processor(), DriverConfig::default())
        .with_queue(receiver);

    let first = driver.tick().await.unwrap();
    assert_eq!(first.escalated, 1);
    assert_eq!(h.dispatcher.pages(), vec![(1, vec!["ana".to_string()])]);

    h.clock.set(minutes(3));
    assert_eq!(driver.tick().await.unwrap().total(), 0);

    h.clock.set(minutes(5));
    let second = driver.tick().await.unwrap();
    assert_eq!(second.escalated, 1);
    assert_eq!(h.dispatcher.count(), 2);
    assert_eq!(driver.stats().escalated, 2);
    assert!(h.store.list_for_target(1).await.unwrap().is_empty());
}

// ============================================================================
// Recurring escalation
// ============================================================================

async fn recurring_pass(processor: &RecurringEscalationProcessor, at: DateTime<Utc>) -> Vec<Outcome> {
    processor
        .process_target(1, at, &ResolutionCache::new())
        .await
        .unwrap()
        .into_iter()
        .map(Result::unwrap)
        .collect()
}

#[tokio::test]
async fn test_zero_minute_recurring_rule_fires_once_per_cycle() {
    let h = Harness::new(vec![
        rule(1, 1, EscalationRuleStatus::Acknowledged, 0),
        rule(2, 2, EscalationRuleStatus::Acknowledged, 300),
    ])
    .await;
    RecurringScheduler::new(
        h.store.clone(),
        h.store.clone(),
        h.gate.clone(),
        h.clock.clone(),
    )
    .schedule(&alert())
    .await
    .unwrap();
    let processor = h.recurring_processor();

    // First cycle opens at creation
    let outcomes = recurring_pass(&processor, t0()).await;
    assert_eq!(outcomes.iter().filter(|o| o.is_escalated()).count(), 1);
    assert_eq!(h.dispatcher.pages(), vec![(1, vec!["ana".to_string()])]);

    // Repeated checks inside the cycle stay quiet
    for at in [1, 2, 4] {
        let outcomes = recurring_pass(&processor, minutes(at)).await;
        assert!(outcomes.iter().all(|o| !o.is_escalated()));
    }
    assert_eq!(h.dispatcher.count(), 1);

    // Delayed sibling fires at T0+5m and opens a new cycle
    let outcomes = recurring_pass(&processor, minutes(5)).await;
    assert_eq!(outcomes.iter().filter(|o| o.is_escalated()).count(), 2);
    assert_eq!(
        h.dispatcher.pages()[1..],
        [(1, vec!["bo".to_string()]), (1, vec!["ana".to_string()])]
    );

    let outcomes = recurring_pass(&processor, minutes(6)).await;
    assert!(outcomes.iter().all(|o| !o.is_escalated()));

    // Acknowledging satisfies both rules
    h.set_status(AlertStatus::Acknowledged).await;
    let outcomes = recurring_pass(&processor, minutes(10)).await;
    assert!(outcomes
        .iter()
        .all(|o| *o == Outcome::dropped(DropReason::RuleSatisfied)));
    assert_eq!(h.dispatcher.count(), 3);
}

#[tokio::test]
async fn test_recurring_driver_skips_resolved_alerts() {
    let h = Harness::new(vec![rule(1, 1, EscalationRuleStatus::Resolved, 0)]).await;
    RecurringScheduler::new(
        h.store.clone(),
        h.store.clone(),
        h.gate.clone(),
        h.clock.clone(),
    )
    .schedule(&alert())
    .await
    .unwrap();

    let driver = EscalationDriver::recurring(h.recurring_processor(), DriverConfig::default());
    assert_eq!(driver.tick().await.unwrap().escalated, 1);

    h.set_status(AlertStatus::Resolved).await;
    h.clock.set(minutes(30));
    assert_eq!(driver.tick().await.unwrap().total(), 0);
    assert_eq!(h.dispatcher.count(), 1);
}

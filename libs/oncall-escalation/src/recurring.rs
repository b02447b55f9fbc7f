//! Recurring escalations - re-firing records per (alert, rule)
//!
//! Records are never deleted by processing; firing only advances
//! `last_notified_at`:
//! - a delayed rule fires every `elapsed_time_seconds` after its previous
//!   firing (or after the alert was created)
//! - a zero-delay rule fires once per cycle, where a cycle starts at the
//!   latest firing of any delayed sibling (or at alert creation)
//!
//! `last_notified_at` is advanced by compare-and-swap before paging, so a
//! firing is claimed by exactly one worker. A failed page reverts it.

use crate::error::Result;
use crate::processor::{DropReason, Outcome, SkipReason};
use crate::rotation::{OncallResolver, ResolutionCache};
use crate::traits::{
    escalation_available, AuditLog, Clock, EscalationDirectory, FeatureGate,
    NotificationDispatcher, NotificationKey, RecurringEscalationStore,
};
use crate::types::{RecurringEscalation, Target, UserRef};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Start of the current cycle for a target's zero-delay rules
pub fn cycle_start(target: &Target, records: &[RecurringEscalation]) -> DateTime<Utc> {
    records
        .iter()
        .filter(|record| !record.is_zero_delay())
        .filter_map(|record| record.last_notified_at)
        .max()
        .map_or(target.created_at, |latest| latest.max(target.created_at))
}

/// Whether `record` should fire at `now`
pub fn is_due(
    record: &RecurringEscalation,
    target: &Target,
    cycle_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if record.is_zero_delay() {
        return record
            .last_notified_at
            .map_or(true, |last| last < cycle_start);
    }
    let since = record.last_notified_at.unwrap_or(target.created_at);
    (now - since).num_seconds() >= record.elapsed_time_seconds
}

/// Processes recurring escalations
pub struct RecurringEscalationProcessor {
    directory: Arc<dyn EscalationDirectory>,
    store: Arc<dyn RecurringEscalationStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    audit: Arc<dyn AuditLog>,
    gate: Arc<dyn FeatureGate>,
    clock: Arc<dyn Clock>,
    resolver: OncallResolver,
}

impl RecurringEscalationProcessor {
    pub fn new(
        directory: Arc<dyn EscalationDirectory>,
        store: Arc<dyn RecurringEscalationStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        audit: Arc<dyn AuditLog>,
        gate: Arc<dyn FeatureGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resolver = OncallResolver::new(directory.clone(), gate.clone());
        Self {
            directory,
            store,
            dispatcher,
            audit,
            gate,
            clock,
            resolver,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecurringEscalationStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Process every recurring escalation of one alert at the current time
    pub async fn process(&self, target_id: i64) -> Result<Vec<Result<Outcome>>> {
        let cache = ResolutionCache::new();
        self.process_target(target_id, self.clock.now(), &cache).await
    }

    /// Process every recurring escalation of one alert at `now`
    ///
    /// Delayed rules are evaluated first so a zero-delay rule sees the cycle
    /// they open in the same pass. One result per record; a failing record
    /// does not stop the others. The outer error covers loading the alert.
    pub async fn process_target(
        &self,
        target_id: i64,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<Vec<Result<Outcome>>> {
        let mut records = self.store.list_recurring_for_target(target_id).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let Some(target) = self.directory.find_target(target_id).await? else {
            debug!("Alert {} is gone, skipping its recurring escalations", target_id);
            return Ok(records
                .iter()
                .map(|_| Ok(Outcome::dropped(DropReason::TargetMissing)))
                .collect());
        };

        records.sort_by_key(|record| (record.is_zero_delay(), record.elapsed_time_seconds, record.id));

        let mut results = Vec::with_capacity(records.len());
        for index in 0..records.len() {
            let start = cycle_start(&target, &records);
            let result = self
                .evaluate(&mut records[index], &target, start, now, cache)
                .await;
            if let Err(e) = &result {
                warn!(
                    "Recurring escalation {} of alert {} failed: {}",
                    records[index].id, target.id, e
                );
            }
            results.push(result);
        }
        Ok(results)
    }

    async fn evaluate(
        &self,
        record: &mut RecurringEscalation,
        target: &Target,
        cycle_start: DateTime<Utc>,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<Outcome> {
        if target.is_terminal() {
            return Ok(Outcome::dropped(DropReason::TargetResolved));
        }
        if record.status.is_satisfied_by(target.status) {
            return Ok(Outcome::dropped(DropReason::RuleSatisfied));
        }
        if self.directory.find_rule(record.rule_id).await?.is_none() {
            return Ok(Outcome::dropped(DropReason::RuleMissing));
        }
        if !escalation_available(self.gate.as_ref(), target.project_id) {
            return Ok(Outcome::skipped(SkipReason::FeatureDisabled));
        }
        if !is_due(record, target, cycle_start, now) {
            return Ok(Outcome::skipped(SkipReason::NotDue));
        }

        let previous = record.last_notified_at;
        if !self
            .store
            .compare_and_touch(record.id, previous, Some(now))
            .await?
        {
            debug!("Recurring escalation {} fired by another worker", record.id);
            return Ok(Outcome::skipped(SkipReason::AlreadyClaimed));
        }
        record.last_notified_at = Some(now);

        let users = match self.page(record, target, now, cache).await {
            Ok(users) => users,
            Err(e) => {
                if let Err(revert) = self
                    .store
                    .compare_and_touch(record.id, Some(now), previous)
                    .await
                {
                    warn!(
                        "Failed to revert recurring escalation {}: {}",
                        record.id, revert
                    );
                }
                record.last_notified_at = previous;
                return Err(e);
            },
        };

        info!(
            "Recurring escalation of alert {} by rule {} paged {} users",
            target.id,
            record.rule_id,
            users.len()
        );
        Ok(Outcome::Escalated {
            target_id: target.id,
            rule_id: record.rule_id,
            users,
        })
    }

    async fn page(
        &self,
        record: &RecurringEscalation,
        target: &Target,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<Vec<UserRef>> {
        let users = self
            .resolver
            .on_call_users(record.schedule_id, now, cache)
            .await?;
        if users.is_empty() {
            warn!(
                "No one on call for schedule {}, recurring escalation {} fired without paging",
                record.schedule_id, record.id
            );
            return Ok(users);
        }

        let key = NotificationKey::at(record.rule_id, target.id, now);
        self.dispatcher.notify_oncall(&users, target, key).await?;

        let policy = self.directory.find_policy(record.policy_id).await.ok().flatten();
        match self.directory.find_schedule(record.schedule_id).await {
            Ok(Some(schedule)) => {
                if let Err(e) = self
                    .audit
                    .record_escalation(target, policy.as_ref(), &users, &schedule)
                    .await
                {
                    warn!("Audit note for alert {} failed: {}", target.id, e);
                }
            },
            Ok(None) => {},
            Err(e) => warn!("Schedule {} lookup for audit failed: {}", record.schedule_id, e),
        }

        Ok(users)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::memory::MemoryEscalationStore;
    use crate::scheduler::RecurringScheduler;
    use crate::test_utils::{
        ana, bo, rule, seeded_store, t0, target, RecordingAudit, RecordingDispatcher,
    };
    use crate::traits::{ManualClock, StaticFeatureGate};
    use crate::types::{AlertStatus, EscalationRule, EscalationRuleStatus};
    use chrono::Duration;

    struct Fixture {
        store: Arc<MemoryEscalationStore>,
        dispatcher: Arc<RecordingDispatcher>,
        clock: Arc<ManualClock>,
        processor: RecurringEscalationProcessor,
    }

    async fn fixture(rules: Vec<EscalationRule>) -> Fixture {
        let store = Arc::new(seeded_store(rules));
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let gate = Arc::new(StaticFeatureGate::all_enabled());

        RecurringScheduler::new(store.clone(), store.clone(), gate.clone(), clock.clone())
            .schedule(&target(1, AlertStatus::Triggered))
            .await
            .unwrap();

        let processor = RecurringEscalationProcessor::new(
            store.clone(),
            store.clone(),
            dispatcher.clone(),
            Arc::new(RecordingAudit::new()),
            gate,
            clock.clone(),
        );
        Fixture {
            store,
            dispatcher,
            clock,
            processor,
        }
    }

    fn paged(f: &Fixture) -> Vec<Vec<UserRef>> {
        f.dispatcher.calls().into_iter().map(|c| c.users).collect()
    }

    async fn pass(f: &Fixture) -> Vec<Outcome> {
        f.processor
            .process(1)
            .await
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect()
    }

    #[tokio::test]
    async fn test_zero_delay_rule_fires_once_per_cycle() {
        let f = fixture(vec![
            rule(1, 1, EscalationRuleStatus::Acknowledged, 0),
            rule(2, 2, EscalationRuleStatus::Acknowledged, 300),
        ])
        .await;

        // Cycle opens at creation: only the zero-delay rule fires
        pass(&f).await;
        assert_eq!(paged(&f), vec![vec![ana()]]);

        // Nothing new within the cycle
        f.clock.advance(Duration::minutes(2));
        pass(&f).await;
        assert_eq!(f.dispatcher.count(), 1);

        // Delayed sibling fires and re-arms the zero-delay rule
        f.clock.advance(Duration::minutes(3));
        let outcomes = pass(&f).await;
        assert!(outcomes.iter().all(Outcome::is_escalated));
        assert_eq!(paged(&f), vec![vec![ana()], vec![bo()], vec![ana()]]);

        // And again only after the next delayed firing
        f.clock.advance(Duration::minutes(4));
        pass(&f).await;
        assert_eq!(f.dispatcher.count(), 3);
        f.clock.advance(Duration::minutes(1));
        pass(&f).await;
        assert_eq!(f.dispatcher.count(), 5);
    }

    #[tokio::test]
    async fn test_delayed_rule_repeats_on_its_cadence() {
        let f = fixture(vec![rule(1, 1, EscalationRuleStatus::Resolved, 600)]).await;

        f.clock.advance(Duration::minutes(9));
        pass(&f).await;
        assert_eq!(f.dispatcher.count(), 0);

        f.clock.advance(Duration::minutes(1));
        pass(&f).await;
        f.clock.advance(Duration::minutes(10));
        pass(&f).await;
        assert_eq!(f.dispatcher.count(), 2);

        let keys: Vec<i64> = f.dispatcher.calls().iter().map(|c| c.key.bucket).collect();
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_satisfied_rule_is_dropped_but_kept() {
        let f = fixture(vec![
            rule(1, 1, EscalationRuleStatus::Acknowledged, 0),
            rule(2, 2, EscalationRuleStatus::Resolved, 0),
        ])
        .await;
        f.store.set_target_status(1, AlertStatus::Acknowledged);

        let outcomes = pass(&f).await;
        assert!(outcomes.contains(&Outcome::dropped(DropReason::RuleSatisfied)));
        assert_eq!(paged(&f), vec![vec![bo()]]);
        assert_eq!(
            f.store.list_recurring_for_target(1).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_dispatch_failure_reverts_notification_time() {
        let f = fixture(vec![rule(1, 1, EscalationRuleStatus::Acknowledged, 0)]).await;
        f.dispatcher.set_failing(true);

        let results = f.processor.process(1).await.unwrap();
        assert!(results[0].is_err());
        let records = f.store.list_recurring_for_target(1).await.unwrap();
        assert_eq!(records[0].last_notified_at, None);

        f.dispatcher.set_failing(false);
        pass(&f).await;
        assert_eq!(f.dispatcher.count(), 1);
    }

    #[tokio::test]
    async fn test_failing_rule_does_not_block_siblings() {
        let f = fixture(vec![
            rule(1, 1, EscalationRuleStatus::Acknowledged, 0),
            rule(2, 2, EscalationRuleStatus::Acknowledged, 300),
        ])
        .await;
        // Schedule 2 (bo) cannot be paged
        f.dispatcher.fail_for_user(bo().id);

        f.clock.advance(Duration::minutes(5));
        let results = f.processor.process(1).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].as_ref().unwrap().is_escalated());
        assert_eq!(paged(&f), vec![vec![ana()]]);

        // The failed delayed rule keeps retrying; the zero-delay rule stays quiet
        f.clock.advance(Duration::minutes(1));
        let results = f.processor.process(1).await.unwrap();
        assert!(results[0].is_err());
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Outcome::skipped(SkipReason::NotDue)
        );
        assert_eq!(f.dispatcher.count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_touch_fires_once() {
        let f = fixture(vec![rule(1, 1, EscalationRuleStatus::Acknowledged, 0)]).await;
        let record = f.store.list_recurring_for_target(1).await.unwrap().remove(0);

        // Another worker fires first
        assert!(f
            .store
            .compare_and_touch(record.id, None, Some(t0()))
            .await
            .unwrap());

        let mut stale = record.clone();
        let outcome = f
            .processor
            .evaluate(
                &mut stale,
                &target(1, AlertStatus::Triggered),
                t0(),
                t0(),
                &ResolutionCache::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skipped(SkipReason::AlreadyClaimed));
        assert_eq!(f.dispatcher.count(), 0);
    }

    #[test]
    fn test_cycle_start_ignores_zero_delay_siblings() {
        let alert = target(1, AlertStatus::Triggered);
        let record = |rule_id, elapsed, last: Option<DateTime<Utc>>| RecurringEscalation {
            id: rule_id,
            policy_id: 1,
            rule_id,
            target_id: 1,
            schedule_id: 1,
            status: EscalationRuleStatus::Acknowledged,
            elapsed_time_seconds: elapsed,
            last_notified_at: last,
            created_at: t0(),
        };

        let records = vec![
            record(1, 0, Some(t0() + Duration::minutes(30))),
            record(2, 300, Some(t0() + Duration::minutes(5))),
            record(3, 600, None),
        ];
        assert_eq!(cycle_start(&alert, &records), t0() + Duration::minutes(5));
        assert_eq!(cycle_start(&alert, &records[..1]), t0());
    }
}

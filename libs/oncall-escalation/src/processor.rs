//! Escalation Processor - consumes due pending escalations
//!
//! Each escalation is claimed before it is evaluated, so concurrent workers
//! never page twice for the same row. Decision order:
//! 1. Alert missing or terminal -> dropped
//! 2. Alert at or past the rule threshold, or rule deleted -> dropped
//! 3. Feature disabled -> skipped, claim held until the lease runs out
//! 4. Not yet due -> skipped, claim released
//! 5. Otherwise page the on-call users, write the audit note, delete the row
//!
//! Dropped rows are deleted. Skipped and failed rows stay for a later pass.
//! A held claim keeps the row out of `claim_due` for one lease, so rows that
//! cannot make progress do not crowd out the rest of the due batch.

use crate::error::Result;
use crate::rotation::{OncallResolver, ResolutionCache};
use crate::traits::{
    escalation_available, AuditLog, Clock, EscalationDirectory, FeatureGate,
    NotificationDispatcher, NotificationKey, PendingEscalationStore,
};
use crate::types::{ClaimAttempt, ClaimedEscalation, PendingEscalation, Target, UserRef};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default claim lease
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 300;

/// Why an escalation was left in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotDue,
    AlreadyClaimed,
    FeatureDisabled,
}

/// Why an escalation was discarded without paging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    TargetMissing,
    TargetResolved,
    RuleSatisfied,
    RuleMissing,
    /// Another worker already processed the row
    Consumed,
}

/// Result of processing one escalation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Escalated {
        target_id: i64,
        rule_id: i64,
        users: Vec<UserRef>,
    },
    Skipped {
        reason: SkipReason,
    },
    Dropped {
        reason: DropReason,
    },
}

impl Outcome {
    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    pub fn dropped(reason: DropReason) -> Self {
        Self::Dropped { reason }
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self, Self::Escalated { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escalated { .. } => "escalated",
            Self::Skipped { .. } => "skipped",
            Self::Dropped { .. } => "dropped",
        }
    }
}

/// Processes one-shot pending escalations
pub struct EscalationProcessor {
    directory: Arc<dyn EscalationDirectory>,
    store: Arc<dyn PendingEscalationStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    audit: Arc<dyn AuditLog>,
    gate: Arc<dyn FeatureGate>,
    clock: Arc<dyn Clock>,
    resolver: OncallResolver,
    lease: Duration,
}

impl EscalationProcessor {
    pub fn new(
        directory: Arc<dyn EscalationDirectory>,
        store: Arc<dyn PendingEscalationStore>,
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
            lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn store(&self) -> &Arc<dyn PendingEscalationStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Claim and process an escalation at the current time
    pub async fn process(&self, escalation: &PendingEscalation) -> Result<Outcome> {
        let cache = ResolutionCache::new();
        self.process_at(escalation, self.clock.now(), &cache).await
    }

    /// Claim and process an escalation at `now`
    pub async fn process_at(
        &self,
        escalation: &PendingEscalation,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<Outcome> {
        match self.store.claim(escalation.id, now, self.lease).await? {
            ClaimAttempt::Claimed(claimed) => self.process_claimed(claimed, now, cache).await,
            ClaimAttempt::Busy => {
                debug!("Escalation {} claimed by another worker", escalation.id);
                Ok(Outcome::skipped(SkipReason::AlreadyClaimed))
            },
            ClaimAttempt::Missing => {
                debug!("Escalation {} already consumed", escalation.id);
                Ok(Outcome::dropped(DropReason::Consumed))
            },
        }
    }

    /// Process an escalation this worker already holds a claim on
    ///
    /// On error the row is kept and the claim left to expire, so the retry
    /// happens one lease later.
    pub async fn process_claimed(
        &self,
        claimed: ClaimedEscalation,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<Outcome> {
        let result = self.evaluate(&claimed, now, cache).await;
        if let Err(e) = &result {
            debug!(
                "Escalation {} held until {} after failure: {}",
                claimed.escalation.id, claimed.claimed_until, e
            );
        }
        result
    }

    async fn evaluate(
        &self,
        claimed: &ClaimedEscalation,
        now: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<Outcome> {
        let escalation = &claimed.escalation;

        let Some(target) = self.directory.find_target(escalation.target_id).await? else {
            return self.consume(claimed, DropReason::TargetMissing).await;
        };
        if target.is_terminal() {
            return self.consume(claimed, DropReason::TargetResolved).await;
        }
        if escalation.status.is_satisfied_by(target.status) {
            return self.consume(claimed, DropReason::RuleSatisfied).await;
        }
        if self.directory.find_rule(escalation.rule_id).await?.is_none() {
            return self.consume(claimed, DropReason::RuleMissing).await;
        }

        if !escalation_available(self.gate.as_ref(), target.project_id) {
            debug!(
                "Escalation disabled for project {}, holding escalation {} until {}",
                target.project_id, escalation.id, claimed.claimed_until
            );
            return Ok(Outcome::skipped(SkipReason::FeatureDisabled));
        }
        if !escalation.is_due(now) {
            self.release(claimed).await;
            return Ok(Outcome::skipped(SkipReason::NotDue));
        }

        let users = self
            .resolver
            .on_call_users(escalation.schedule_id, now, cache)
            .await?;

        if users.is_empty() {
            warn!(
                "No one on call for schedule {}, escalation {} of alert {} consumed without paging",
                escalation.schedule_id, escalation.id, target.id
            );
        } else {
            let key = NotificationKey::daily(escalation.rule_id, target.id, now);
            self.dispatcher.notify_oncall(&users, &target, key).await?;
            self.record_audit(escalation, &target, &users).await;
        }

        if !self.store.delete(escalation.id, claimed.token).await? {
            warn!(
                "Claim on escalation {} expired before it was consumed",
                escalation.id
            );
        }

        info!(
            "Escalated alert {} by rule {} to {} users",
            target.id,
            escalation.rule_id,
            users.len()
        );
        Ok(Outcome::Escalated {
            target_id: target.id,
            rule_id: escalation.rule_id,
            users,
        })
    }

    async fn record_audit(
        &self,
        escalation: &PendingEscalation,
        target: &Target,
        users: &[UserRef],
    ) {
        let policy = match self.directory.find_policy(escalation.policy_id).await {
            Ok(policy) => policy,
            Err(e) => {
                warn!("Policy {} lookup for audit failed: {}", escalation.policy_id, e);
                None
            },
        };
        let schedule = match self.directory.find_schedule(escalation.schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return,
            Err(e) => {
                warn!("Schedule {} lookup for audit failed: {}", escalation.schedule_id, e);
                return;
            },
        };

        if let Err(e) = self
            .audit
            .record_escalation(target, policy.as_ref(), users, &schedule)
            .await
        {
            warn!("Audit note for alert {} failed: {}", target.id, e);
        }
    }

    async fn consume(&self, claimed: &ClaimedEscalation, reason: DropReason) -> Result<Outcome> {
        let escalation = &claimed.escalation;
        debug!(
            "Dropping escalation {} of alert {}: {:?}",
            escalation.id, escalation.target_id, reason
        );
        self.store.delete(escalation.id, claimed.token).await?;
        Ok(Outcome::dropped(reason))
    }

    async fn release(&self, claimed: &ClaimedEscalation) {
        if let Err(e) = self
            .store
            .release(claimed.escalation.id, claimed.token)
            .await
        {
            warn!(
                "Failed to release claim on escalation {}: {}",
                claimed.escalation.id, e
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::memory::MemoryEscalationStore;
    use crate::test_utils::{
        ana, empty_schedule, rule, seeded_store, t0, RecordingAudit, RecordingDispatcher,
    };
    use crate::traits::{ManualClock, StaticFeatureGate};
    use crate::types::{AlertStatus, EscalationRuleStatus, NewPendingEscalation};
    use tracing_test::traced_test;

    struct Fixture {
        store: Arc<MemoryEscalationStore>,
        dispatcher: Arc<RecordingDispatcher>,
        audit: Arc<RecordingAudit>,
        clock: Arc<ManualClock>,
        processor: EscalationProcessor,
    }

    fn fixture_with(store: MemoryEscalationStore, gate: StaticFeatureGate) -> Fixture {
        let store = Arc::new(store);
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let audit = Arc::new(RecordingAudit::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let processor = EscalationProcessor::new(
            store.clone(),
            store.clone(),
            dispatcher.clone(),
            audit.clone(),
            Arc::new(gate),
            clock.clone(),
        );
        Fixture {
            store,
            dispatcher,
            audit,
            clock,
            processor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            seeded_store(vec![rule(1, 1, EscalationRuleStatus::Acknowledged, 300)]),
            StaticFeatureGate::all_enabled(),
        )
    }

    async fn pending(store: &MemoryEscalationStore, rule_id: i64, delay: i64) -> PendingEscalation {
        pending_on(store, rule_id, 1, delay).await
    }

    async fn pending_on(
        store: &MemoryEscalationStore,
        rule_id: i64,
        schedule_id: i64,
        delay: i64,
    ) -> PendingEscalation {
        let rows = store
            .insert_many(&[NewPendingEscalation {
                policy_id: 1,
                rule_id,
                target_id: 1,
                schedule_id,
                status: EscalationRuleStatus::Acknowledged,
                process_at: t0() + Duration::seconds(delay),
                created_at: t0(),
            }])
            .await
            .unwrap();
        rows[0].clone()
    }

    #[tokio::test]
    async fn test_not_due_is_skipped_and_kept() {
        let f = fixture();
        let escalation = pending(&f.store, 1, 300).await;

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(outcome, Outcome::skipped(SkipReason::NotDue));
        assert_eq!(f.dispatcher.count(), 0);
        assert_eq!(f.store.pending_count(), 1);

        // Claim was released, so a later pass can take it
        f.clock.advance(Duration::minutes(5));
        let outcome = f.processor.process(&escalation).await.unwrap();
        assert!(outcome.is_escalated());
    }

    #[tokio::test]
    async fn test_due_escalation_pages_and_deletes() {
        let f = fixture();
        let escalation = pending(&f.store, 1, 300).await;
        f.clock.advance(Duration::minutes(5));

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Escalated {
                target_id: 1,
                rule_id: 1,
                users: vec![ana()],
            }
        );
        assert_eq!(f.audit.count(), 1);
        assert_eq!(f.store.pending_count(), 0);

        let calls = f.dispatcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].key, NotificationKey::daily(1, 1, f.clock.now()));

        // Processing the consumed row again is a no-op
        let again = f.processor.process(&escalation).await.unwrap();
        assert_eq!(again, Outcome::dropped(DropReason::Consumed));
        assert_eq!(f.dispatcher.count(), 1);
    }

    #[tokio::test]
    async fn test_stale_alert_is_dropped() {
        let f = fixture();
        let escalation = pending(&f.store, 1, 0).await;
        f.store.set_target_status(1, AlertStatus::Acknowledged);

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(outcome, Outcome::dropped(DropReason::RuleSatisfied));
        assert_eq!(f.store.pending_count(), 0);
        assert_eq!(f.dispatcher.count(), 0);

        let f = fixture();
        let escalation = pending(&f.store, 1, 0).await;
        f.store.set_target_status(1, AlertStatus::Resolved);
        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(outcome, Outcome::dropped(DropReason::TargetResolved));
    }

    #[tokio::test]
    async fn test_deleted_rule_is_dropped() {
        let f = fixture();
        let escalation = pending(&f.store, 1, 0).await;
        f.store.remove_rule(1);

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(outcome, Outcome::dropped(DropReason::RuleMissing));
        assert_eq!(f.store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_feature_disabled_is_skipped() {
        let f = fixture_with(
            seeded_store(vec![rule(1, 1, EscalationRuleStatus::Acknowledged, 0)]),
            StaticFeatureGate::new(true, false),
        );
        let escalation = pending(&f.store, 1, 0).await;

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(outcome, Outcome::skipped(SkipReason::FeatureDisabled));
        assert_eq!(f.store.pending_count(), 1);

        // Claim is held for the lease, the row is not re-evaluated right away
        let again = f.processor.process(&escalation).await.unwrap();
        assert_eq!(again, Outcome::skipped(SkipReason::AlreadyClaimed));
        assert!(f
            .store
            .claim_due(f.clock.now(), f.processor.lease(), 10)
            .await
            .unwrap()
            .is_empty());

        f.clock.advance(f.processor.lease());
        let later = f.processor.process(&escalation).await.unwrap();
        assert_eq!(later, Outcome::skipped(SkipReason::FeatureDisabled));
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_row() {
        let f = fixture();
        let escalation = pending(&f.store, 1, 0).await;
        f.dispatcher.set_failing(true);

        assert!(f.processor.process(&escalation).await.is_err());
        assert_eq!(f.store.pending_count(), 1);

        // Retry waits for the claim to lapse
        f.dispatcher.set_failing(false);
        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(outcome, Outcome::skipped(SkipReason::AlreadyClaimed));
        assert_eq!(f.dispatcher.count(), 0);

        f.clock.advance(f.processor.lease());
        let outcome = f.processor.process(&escalation).await.unwrap();
        assert!(outcome.is_escalated());
    }

    #[tokio::test]
    async fn test_audit_failure_is_not_fatal() {
        let f = fixture();
        let escalation = pending(&f.store, 1, 0).await;
        f.audit.set_failing(true);

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert!(outcome.is_escalated());
        assert_eq!(f.store.pending_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_rotation_consumes_without_paging() {
        let store = seeded_store(vec![rule(1, 3, EscalationRuleStatus::Acknowledged, 0)]);
        store.add_schedule(empty_schedule(3));
        let f = fixture_with(store, StaticFeatureGate::all_enabled());
        let escalation = pending_on(&f.store, 1, 3, 0).await;

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Escalated {
                target_id: 1,
                rule_id: 1,
                users: vec![],
            }
        );
        assert_eq!(f.dispatcher.count(), 0);
        assert_eq!(f.audit.count(), 0);
        assert_eq!(f.store.pending_count(), 0);
        assert!(logs_contain("No one on call for schedule 3"));
    }

    #[tokio::test]
    async fn test_already_claimed_is_skipped() {
        let f = fixture();
        let escalation = pending(&f.store, 1, 0).await;
        let lease = f.processor.lease();
        let ClaimAttempt::Claimed(_) = f.store.claim(escalation.id, t0(), lease).await.unwrap()
        else {
            panic!("expected claim");
        };

        let outcome = f.processor.process(&escalation).await.unwrap();
        assert_eq!(outcome, Outcome::skipped(SkipReason::AlreadyClaimed));
        assert_eq!(f.dispatcher.count(), 0);
    }
}

//! Collaborator interfaces consumed by the engine
//!
//! Persistence, delivery and licensing live outside the engine and are
//! reached only through these traits. `SqliteEscalationStore` and
//! `MemoryEscalationStore` implement every storage trait.

use crate::error::Result;
use crate::types::{
    ClaimAttempt, ClaimToken, ClaimedEscalation, EscalationPolicy, EscalationRule,
    NewPendingEscalation, NewRecurringEscalation, OncallSchedule, OncallShift,
    PendingEscalation, RecurringEscalation, Target, UserRef,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// Clock
// ============================================================================

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic runs
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Feature gate
// ============================================================================

/// Licensed features the engine depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    OncallSchedules,
    EscalationPolicies,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OncallSchedules => "oncall_schedules",
            Self::EscalationPolicies => "escalation_policies",
        }
    }
}

/// Licensing / feature-flag check
pub trait FeatureGate: Send + Sync {
    fn enabled(&self, feature: Feature, project_id: i64) -> bool;
}

/// Feature gate with fixed answers, optionally disabled per project
#[derive(Debug, Clone)]
pub struct StaticFeatureGate {
    oncall_schedules: bool,
    escalation_policies: bool,
    disabled_projects: HashSet<i64>,
}

impl StaticFeatureGate {
    pub fn new(oncall_schedules: bool, escalation_policies: bool) -> Self {
        Self {
            oncall_schedules,
            escalation_policies,
            disabled_projects: HashSet::new(),
        }
    }

    pub fn all_enabled() -> Self {
        Self::new(true, true)
    }

    pub fn with_disabled_project(mut self, project_id: i64) -> Self {
        self.disabled_projects.insert(project_id);
        self
    }
}

impl Default for StaticFeatureGate {
    fn default() -> Self {
        Self::all_enabled()
    }
}

impl FeatureGate for StaticFeatureGate {
    fn enabled(&self, feature: Feature, project_id: i64) -> bool {
        if self.disabled_projects.contains(&project_id) {
            return false;
        }
        match feature {
            Feature::OncallSchedules => self.oncall_schedules,
            Feature::EscalationPolicies => self.escalation_policies,
        }
    }
}

/// Both features escalation needs
pub fn escalation_available(gate: &dyn FeatureGate, project_id: i64) -> bool {
    gate.enabled(Feature::OncallSchedules, project_id)
        && gate.enabled(Feature::EscalationPolicies, project_id)
}

// ============================================================================
// Read-only lookups
// ============================================================================

/// Explicit lookups replacing object-graph traversal
#[async_trait]
pub trait EscalationDirectory: Send + Sync {
    async fn find_target(&self, target_id: i64) -> Result<Option<Target>>;

    async fn policy_for_project(&self, project_id: i64) -> Result<Option<EscalationPolicy>>;

    async fn find_policy(&self, policy_id: i64) -> Result<Option<EscalationPolicy>>;

    async fn find_rule(&self, rule_id: i64) -> Result<Option<EscalationRule>>;

    /// Schedule with its rotations and participants loaded
    async fn find_schedule(&self, schedule_id: i64) -> Result<Option<OncallSchedule>>;

    /// Persisted shift of a rotation covering `at`
    async fn persisted_shift(
        &self,
        rotation_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<OncallShift>>;
}

// ============================================================================
// Storage
// ============================================================================

/// Storage for one-shot pending escalations
///
/// Claims are leases: a claimed row cannot be claimed again until
/// `claimed_until` has passed or the owner releases it.
#[async_trait]
pub trait PendingEscalationStore: Send + Sync {
    /// Insert rows, skipping any (target, rule) pair that already exists.
    /// Returns every row for the given pairs, new or existing.
    async fn insert_many(&self, rows: &[NewPendingEscalation]) -> Result<Vec<PendingEscalation>>;

    async fn find(&self, id: i64) -> Result<Option<PendingEscalation>>;

    async fn claim(&self, id: i64, now: DateTime<Utc>, lease: Duration) -> Result<ClaimAttempt>;

    /// Claim up to `limit` unclaimed rows with `process_at <= before`
    async fn claim_due(
        &self,
        before: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedEscalation>>;

    /// Give a claim back without consuming the row
    async fn release(&self, id: i64, token: ClaimToken) -> Result<()>;

    /// Delete a claimed row; returns false when the claim was lost
    async fn delete(&self, id: i64, token: ClaimToken) -> Result<bool>;

    async fn list_for_target(&self, target_id: i64) -> Result<Vec<PendingEscalation>>;

    /// Cascade for a deleted target
    async fn delete_for_target(&self, target_id: i64) -> Result<u64>;
}

/// Storage for recurring escalations
#[async_trait]
pub trait RecurringEscalationStore: Send + Sync {
    async fn insert_recurring(
        &self,
        rows: &[NewRecurringEscalation],
    ) -> Result<Vec<RecurringEscalation>>;

    async fn list_recurring_for_target(&self, target_id: i64) -> Result<Vec<RecurringEscalation>>;

    /// Ids of non-terminal targets with recurring escalations, greater than
    /// `after`, ascending
    async fn active_recurring_targets(&self, after: i64, limit: usize) -> Result<Vec<i64>>;

    /// Set `last_notified_at` to `new` only if it still equals `expected`
    async fn compare_and_touch(
        &self,
        id: i64,
        expected: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn delete_recurring_for_target(&self, target_id: i64) -> Result<u64>;
}

// ============================================================================
// Side effects
// ============================================================================

/// Deduplication key for a page
///
/// One-shot escalations bucket by UTC day; recurring escalations bucket by
/// the claimed notification timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationKey {
    pub rule_id: i64,
    pub target_id: i64,
    pub bucket: i64,
}

impl NotificationKey {
    pub fn daily(rule_id: i64, target_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            rule_id,
            target_id,
            bucket: now.timestamp().div_euclid(86_400),
        }
    }

    pub fn at(rule_id: i64, target_id: i64, notified_at: DateTime<Utc>) -> Self {
        Self {
            rule_id,
            target_id,
            bucket: notified_at.timestamp(),
        }
    }
}

impl std::fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.rule_id, self.target_id, self.bucket)
    }
}

/// Delivery of on-call pages (email, chat, push)
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify_oncall(
        &self,
        users: &[UserRef],
        target: &Target,
        key: NotificationKey,
    ) -> Result<()>;
}

/// System-note / audit trail
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_escalation(
        &self,
        target: &Target,
        policy: Option<&EscalationPolicy>,
        users: &[UserRef],
        schedule: &OncallSchedule,
    ) -> Result<()>;
}

/// Hand-off of escalation ids to the batch driver
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, escalation_ids: &[i64]) -> Result<()>;
}

/// Work queue that drops everything, for callers relying on polling only
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorkQueue;

#[async_trait]
impl WorkQueue for NoopWorkQueue {
    async fn enqueue(&self, _escalation_ids: &[i64]) -> Result<()> {
        Ok(())
    }
}

//! Escalation data model
//!
//! Core types shared by every component:
//! - Target: the escalatable alert and its status
//! - EscalationPolicy / EscalationRule: per-project escalation chain
//! - OncallSchedule / OncallRotation / OncallParticipant / OncallShift
//! - PendingEscalation: one-shot work item, deleted once processed
//! - RecurringEscalation: per (target, rule) record tracking `last_notified_at`

use chrono::{DateTime, Duration, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Reference to a user who can be paged
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserRef {
    pub id: i64,
    pub username: String,
}

impl UserRef {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

impl std::fmt::Display for UserRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.username)
    }
}

// ============================================================================
// Statuses
// ============================================================================

/// Alert status, ordered by progression
///
/// The integer codes are persisted and must stay stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    Triggered = 0,
    Acknowledged = 1,
    Resolved = 2,
    Ignored = 3,
}

impl AlertStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Triggered),
            1 => Some(Self::Acknowledged),
            2 => Some(Self::Resolved),
            3 => Some(Self::Ignored),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "triggered" => Some(Self::Triggered),
            "acknowledged" | "ack" => Some(Self::Acknowledged),
            "resolved" => Some(Self::Resolved),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }

    /// No further escalation is possible once an alert is resolved or ignored
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Ignored)
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold status of an escalation rule
///
/// A rule keeps paging while the alert status is below the threshold:
/// an `Acknowledged` rule stops once someone acknowledges, a `Resolved`
/// rule keeps paging acknowledged alerts until they are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationRuleStatus {
    Acknowledged = 1,
    Resolved = 2,
}

impl EscalationRuleStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Acknowledged),
            2 => Some(Self::Resolved),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "acknowledged" | "ack" => Some(Self::Acknowledged),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    /// Whether an alert in `status` has already reached this threshold
    pub fn is_satisfied_by(self, status: AlertStatus) -> bool {
        status.code() >= self.code()
    }
}

impl std::fmt::Display for EscalationRuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence shape used for escalations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMode {
    /// One pending escalation per rule, deleted once processed
    #[default]
    OneShot,
    /// One record per (target, rule) re-firing on `last_notified_at`
    Recurring,
}

// ============================================================================
// Target
// ============================================================================

/// The escalatable entity (an alert)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

impl Target {
    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// Policy
// ============================================================================

/// One threshold of an escalation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub id: i64,
    pub policy_id: i64,
    pub oncall_schedule_id: i64,
    pub status: EscalationRuleStatus,
    /// Delay after escalation start before this rule fires
    pub elapsed_time_seconds: i64,
}

impl EscalationRule {
    /// `None` when the delay does not fit a `Duration`
    pub fn delay(&self) -> Option<Duration> {
        Duration::try_seconds(self.elapsed_time_seconds)
    }

    pub fn is_valid(&self) -> bool {
        self.elapsed_time_seconds >= 0 && self.delay().is_some()
    }
}

/// Ordered set of rules notifying on-call staff about an unresolved alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<EscalationRule>,
}

// ============================================================================
// On-call schedules
// ============================================================================

/// Rotation cadence unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    Hours,
    Days,
    Weeks,
}

impl LengthUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hours" | "hour" => Some(Self::Hours),
            "days" | "day" => Some(Self::Days),
            "weeks" | "week" => Some(Self::Weeks),
            _ => None,
        }
    }

    pub fn duration(&self, length: u32) -> Duration {
        let length = i64::from(length);
        match self {
            Self::Hours => Duration::hours(length),
            Self::Days => Duration::days(length),
            Self::Weeks => Duration::weeks(length),
        }
    }
}

/// Daily hand-off window in schedule-local time
///
/// `start > end` is an overnight window (e.g. 22:00 - 06:00).
/// `start == end` covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePeriod {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActivePeriod {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// A user taking part in a rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OncallParticipant {
    pub id: i64,
    pub user: UserRef,
    /// Removed participants keep their row for history but never go on call
    #[serde(default)]
    pub removed: bool,
}

/// Time-bounded round-robin over an ordered participant list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OncallRotation {
    pub id: i64,
    pub schedule_id: i64,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub length: u32,
    pub length_unit: LengthUnit,
    #[serde(default)]
    pub active_period: Option<ActivePeriod>,
    #[serde(default)]
    pub participants: Vec<OncallParticipant>,
}

impl OncallRotation {
    pub fn shift_duration(&self) -> Duration {
        self.length_unit.duration(self.length)
    }

    pub fn active_participants(&self) -> Vec<&OncallParticipant> {
        self.participants.iter().filter(|p| !p.removed).collect()
    }
}

/// Owner of one or more rotations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OncallSchedule {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    /// Fixed UTC offset for active periods
    #[serde(default)]
    pub timezone_offset_seconds: i32,
    #[serde(default)]
    pub rotations: Vec<OncallRotation>,
}

impl OncallSchedule {
    pub fn offset(&self) -> chrono::FixedOffset {
        chrono::FixedOffset::east_opt(self.timezone_offset_seconds).unwrap_or_else(|| Utc.fix())
    }
}

/// A concrete on-call interval `[starts_at, ends_at)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OncallShift {
    pub rotation_id: i64,
    pub participant_id: i64,
    pub user: UserRef,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl OncallShift {
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at < self.ends_at
    }
}

// ============================================================================
// One-shot pending escalations
// ============================================================================

/// Scheduled, not yet processed unit of escalation work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub id: i64,
    pub policy_id: i64,
    pub rule_id: i64,
    pub target_id: i64,
    /// Denormalized from the rule
    pub schedule_id: i64,
    /// Denormalized rule threshold
    pub status: EscalationRuleStatus,
    pub process_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PendingEscalation {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.process_at <= now
    }
}

/// Insert payload for a pending escalation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingEscalation {
    pub policy_id: i64,
    pub rule_id: i64,
    pub target_id: i64,
    pub schedule_id: i64,
    pub status: EscalationRuleStatus,
    pub process_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewPendingEscalation {
    /// `process_at` is the target's creation time plus the rule delay
    ///
    /// `None` when that instant is out of range.
    pub fn for_rule(target: &Target, rule: &EscalationRule, now: DateTime<Utc>) -> Option<Self> {
        let process_at = target.created_at.checked_add_signed(rule.delay()?)?;
        Some(Self {
            policy_id: rule.policy_id,
            rule_id: rule.id,
            target_id: target.id,
            schedule_id: rule.oncall_schedule_id,
            status: rule.status,
            process_at,
            created_at: now,
        })
    }
}

/// Opaque token proving ownership of a claimed row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pending escalation held exclusively by one worker until `claimed_until`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedEscalation {
    pub escalation: PendingEscalation,
    pub token: ClaimToken,
    pub claimed_until: DateTime<Utc>,
}

/// Result of trying to claim a single row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    Claimed(ClaimedEscalation),
    /// Another worker holds an unexpired claim
    Busy,
    /// The row no longer exists
    Missing,
}

// ============================================================================
// Recurring escalations
// ============================================================================

/// Escalation record persisting across firing cycles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringEscalation {
    pub id: i64,
    pub policy_id: i64,
    pub rule_id: i64,
    pub target_id: i64,
    pub schedule_id: i64,
    pub status: EscalationRuleStatus,
    pub elapsed_time_seconds: i64,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RecurringEscalation {
    pub fn is_zero_delay(&self) -> bool {
        self.elapsed_time_seconds == 0
    }
}

/// Insert payload for a recurring escalation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecurringEscalation {
    pub policy_id: i64,
    pub rule_id: i64,
    pub target_id: i64,
    pub schedule_id: i64,
    pub status: EscalationRuleStatus,
    pub elapsed_time_seconds: i64,
    pub created_at: DateTime<Utc>,
}

impl NewRecurringEscalation {
    pub fn for_rule(target: &Target, rule: &EscalationRule, now: DateTime<Utc>) -> Self {
        Self {
            policy_id: rule.policy_id,
            rule_id: rule.id,
            target_id: target.id,
            schedule_id: rule.oncall_schedule_id,
            status: rule.status,
            elapsed_time_seconds: rule.elapsed_time_seconds,
            created_at: now,
        }
    }
}

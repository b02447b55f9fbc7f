//! Shared fixtures and recording collaborators for unit tests

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use crate::error::{EscalationError, Result};
use crate::memory::MemoryEscalationStore;
use crate::traits::{AuditLog, NotificationDispatcher, NotificationKey, WorkQueue};
use crate::types::{
    AlertStatus, EscalationPolicy, EscalationRule, EscalationRuleStatus, LengthUnit,
    OncallParticipant, OncallRotation, OncallSchedule, Target, UserRef,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub const PROJECT_ID: i64 = 1;
pub const POLICY_ID: i64 = 1;

/// Alert creation time used across tests
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

pub fn ana() -> UserRef {
    UserRef::new(100, "ana")
}

pub fn bo() -> UserRef {
    UserRef::new(200, "bo")
}

pub fn target(id: i64, status: AlertStatus) -> Target {
    Target {
        id,
        project_id: PROJECT_ID,
        title: format!("alert {}", id),
        status,
        created_at: t0(),
    }
}

pub fn rule(
    id: i64,
    schedule_id: i64,
    status: EscalationRuleStatus,
    elapsed_secs: i64,
) -> EscalationRule {
    EscalationRule {
        id,
        policy_id: POLICY_ID,
        oncall_schedule_id: schedule_id,
        status,
        elapsed_time_seconds: elapsed_secs,
    }
}

pub fn policy(rules: Vec<EscalationRule>) -> EscalationPolicy {
    EscalationPolicy {
        id: POLICY_ID,
        project_id: PROJECT_ID,
        name: "default".into(),
        rules,
    }
}

/// Schedule with one weekly rotation where `user` is always on call
pub fn single_user_schedule(id: i64, user: UserRef) -> OncallSchedule {
    OncallSchedule {
        id,
        project_id: PROJECT_ID,
        name: format!("schedule {}", id),
        timezone_offset_seconds: 0,
        rotations: vec![OncallRotation {
            id: id * 10,
            schedule_id: id,
            name: "weekly".into(),
            starts_at: t0() - Duration::days(1),
            ends_at: None,
            length: 1,
            length_unit: LengthUnit::Weeks,
            active_period: None,
            participants: vec![OncallParticipant {
                id: id * 10,
                user,
                removed: false,
            }],
        }],
    }
}

/// Schedule whose only rotation has no participants
pub fn empty_schedule(id: i64) -> OncallSchedule {
    let mut schedule = single_user_schedule(id, ana());
    schedule.rotations[0].participants.clear();
    schedule
}

/// Store with schedule 1 (ana), schedule 2 (bo), the given rules and alert 1
pub fn seeded_store(rules: Vec<EscalationRule>) -> MemoryEscalationStore {
    let store = MemoryEscalationStore::new();
    store.add_schedule(single_user_schedule(1, ana()));
    store.add_schedule(single_user_schedule(2, bo()));
    store.add_policy(policy(rules));
    store.add_target(target(1, AlertStatus::Triggered));
    store
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub users: Vec<UserRef>,
    pub target_id: i64,
    pub key: NotificationKey,
}

/// Dispatcher remembering every call
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    calls: Mutex<Vec<Notification>>,
    failing: AtomicBool,
    failing_users: Mutex<Vec<i64>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail every page addressed to `user_id`
    pub fn fail_for_user(&self, user_id: i64) {
        self.failing_users.lock().push(user_id);
    }

    pub fn calls(&self) -> Vec<Notification> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn notify_oncall(
        &self,
        users: &[UserRef],
        target: &Target,
        key: NotificationKey,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EscalationError::Dispatch("smtp unavailable".into()));
        }
        let failing_users = self.failing_users.lock();
        if users.iter().any(|user| failing_users.contains(&user.id)) {
            return Err(EscalationError::Dispatch("pager rejected recipient".into()));
        }
        drop(failing_users);
        self.calls.lock().push(Notification {
            users: users.to_vec(),
            target_id: target.id,
            key,
        });
        Ok(())
    }
}

/// Audit log remembering every note
#[derive(Debug, Default)]
pub struct RecordingAudit {
    notes: Mutex<Vec<(i64, Vec<UserRef>)>>,
    failing: AtomicBool,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.notes.lock().len()
    }
}

#[async_trait]
impl AuditLog for RecordingAudit {
    async fn record_escalation(
        &self,
        target: &Target,
        _policy: Option<&EscalationPolicy>,
        users: &[UserRef],
        _schedule: &OncallSchedule,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EscalationError::Audit("disk full".into()));
        }
        self.notes.lock().push((target.id, users.to_vec()));
        Ok(())
    }
}

/// Work queue remembering enqueued ids
#[derive(Debug, Default)]
pub struct RecordingQueue {
    ids: Mutex<Vec<i64>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.ids.lock().clone()
    }
}

#[async_trait]
impl WorkQueue for RecordingQueue {
    async fn enqueue(&self, escalation_ids: &[i64]) -> Result<()> {
        self.ids.lock().extend_from_slice(escalation_ids);
        Ok(())
    }
}

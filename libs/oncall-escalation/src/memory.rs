//! In-memory escalation store
//!
//! Implements the directory and both escalation stores behind a single
//! mutex. Claims are compare-and-swap under that mutex, which gives the same
//! per-row exclusion as the SQLite store.

use crate::error::Result;
use crate::traits::{EscalationDirectory, PendingEscalationStore, RecurringEscalationStore};
use crate::types::{
    AlertStatus, ClaimAttempt, ClaimToken, ClaimedEscalation, EscalationPolicy, EscalationRule,
    NewPendingEscalation, NewRecurringEscalation, OncallSchedule, OncallShift,
    PendingEscalation, RecurringEscalation, Target,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct PendingRow {
    escalation: PendingEscalation,
    claim: Option<(ClaimToken, DateTime<Utc>)>,
}

impl PendingRow {
    fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.claim.is_some_and(|(_, until)| until > now)
    }
}

#[derive(Debug, Default)]
struct State {
    targets: HashMap<i64, Target>,
    policies: HashMap<i64, EscalationPolicy>,
    schedules: HashMap<i64, OncallSchedule>,
    shifts: Vec<OncallShift>,
    pending: BTreeMap<i64, PendingRow>,
    recurring: BTreeMap<i64, RecurringEscalation>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn claim_row(
        &mut self,
        id: i64,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> ClaimAttempt {
        let Some(row) = self.pending.get_mut(&id) else {
            return ClaimAttempt::Missing;
        };
        if row.is_claimed_at(now) {
            return ClaimAttempt::Busy;
        }

        let token = ClaimToken::new();
        let claimed_until = now + lease;
        row.claim = Some((token, claimed_until));
        ClaimAttempt::Claimed(ClaimedEscalation {
            escalation: row.escalation.clone(),
            token,
            claimed_until,
        })
    }
}

/// Escalation store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryEscalationStore {
    state: Mutex<State>,
}

impl MemoryEscalationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_target(&self, target: Target) {
        self.state.lock().targets.insert(target.id, target);
    }

    /// Update an alert status; returns false for unknown targets
    pub fn set_target_status(&self, target_id: i64, status: AlertStatus) -> bool {
        match self.state.lock().targets.get_mut(&target_id) {
            Some(target) => {
                target.status = status;
                true
            },
            None => false,
        }
    }

    /// Delete a target and cascade to its escalations
    pub fn remove_target(&self, target_id: i64) -> Option<Target> {
        let mut state = self.state.lock();
        state.pending.retain(|_, row| row.escalation.target_id != target_id);
        state.recurring.retain(|_, row| row.target_id != target_id);
        state.targets.remove(&target_id)
    }

    pub fn add_policy(&self, policy: EscalationPolicy) {
        self.state.lock().policies.insert(policy.id, policy);
    }

    /// Delete a single rule from whichever policy owns it
    pub fn remove_rule(&self, rule_id: i64) {
        for policy in self.state.lock().policies.values_mut() {
            policy.rules.retain(|rule| rule.id != rule_id);
        }
    }

    pub fn add_schedule(&self, schedule: OncallSchedule) {
        self.state.lock().schedules.insert(schedule.id, schedule);
    }

    pub fn add_shift(&self, shift: OncallShift) {
        self.state.lock().shifts.push(shift);
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[async_trait]
impl EscalationDirectory for MemoryEscalationStore {
    async fn find_target(&self, target_id: i64) -> Result<Option<Target>> {
        Ok(self.state.lock().targets.get(&target_id).cloned())
    }

    async fn policy_for_project(&self, project_id: i64) -> Result<Option<EscalationPolicy>> {
        let state = self.state.lock();
        Ok(state
            .policies
            .values()
            .filter(|policy| policy.project_id == project_id)
            .min_by_key(|policy| policy.id)
            .cloned())
    }

    async fn find_policy(&self, policy_id: i64) -> Result<Option<EscalationPolicy>> {
        Ok(self.state.lock().policies.get(&policy_id).cloned())
    }

    async fn find_rule(&self, rule_id: i64) -> Result<Option<EscalationRule>> {
        let state = self.state.lock();
        Ok(state
            .policies
            .values()
            .flat_map(|policy| policy.rules.iter())
            .find(|rule| rule.id == rule_id)
            .cloned())
    }

    async fn find_schedule(&self, schedule_id: i64) -> Result<Option<OncallSchedule>> {
        Ok(self.state.lock().schedules.get(&schedule_id).cloned())
    }

    async fn persisted_shift(
        &self,
        rotation_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<OncallShift>> {
        let state = self.state.lock();
        Ok(state
            .shifts
            .iter()
            .find(|shift| shift.rotation_id == rotation_id && shift.covers(at))
            .cloned())
    }
}

#[async_trait]
impl PendingEscalationStore for MemoryEscalationStore {
    async fn insert_many(&self, rows: &[NewPendingEscalation]) -> Result<Vec<PendingEscalation>> {
        let mut state = self.state.lock();
        let mut result = Vec::with_capacity(rows.len());

        for new in rows {
            let existing = state
                .pending
                .values()
                .find(|row| {
                    row.escalation.target_id == new.target_id
                        && row.escalation.rule_id == new.rule_id
                })
                .map(|row| row.escalation.clone());
            if let Some(existing) = existing {
                result.push(existing);
                continue;
            }

            let escalation = PendingEscalation {
                id: state.next_id(),
                policy_id: new.policy_id,
                rule_id: new.rule_id,
                target_id: new.target_id,
                schedule_id: new.schedule_id,
                status: new.status,
                process_at: new.process_at,
                created_at: new.created_at,
            };
            state.pending.insert(
                escalation.id,
                PendingRow {
                    escalation: escalation.clone(),
                    claim: None,
                },
            );
            result.push(escalation);
        }

        Ok(result)
    }

    async fn find(&self, id: i64) -> Result<Option<PendingEscalation>> {
        Ok(self
            .state
            .lock()
            .pending
            .get(&id)
            .map(|row| row.escalation.clone()))
    }

    async fn claim(&self, id: i64, now: DateTime<Utc>, lease: Duration) -> Result<ClaimAttempt> {
        Ok(self.state.lock().claim_row(id, now, lease))
    }

    async fn claim_due(
        &self,
        before: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedEscalation>> {
        let mut state = self.state.lock();

        let mut due: Vec<(DateTime<Utc>, i64)> = state
            .pending
            .values()
            .filter(|row| row.escalation.is_due(before) && !row.is_claimed_at(before))
            .map(|row| (row.escalation.process_at, row.escalation.id))
            .collect();
        due.sort();
        due.truncate(limit);

        Ok(due
            .into_iter()
            .filter_map(|(_, id)| match state.claim_row(id, before, lease) {
                ClaimAttempt::Claimed(claimed) => Some(claimed),
                _ => None,
            })
            .collect())
    }

    async fn release(&self, id: i64, token: ClaimToken) -> Result<()> {
        if let Some(row) = self.state.lock().pending.get_mut(&id) {
            if row.claim.is_some_and(|(owner, _)| owner == token) {
                row.claim = None;
            }
        }
        Ok(())
    }

    async fn delete(&self, id: i64, token: ClaimToken) -> Result<bool> {
        let mut state = self.state.lock();
        let owned = state
            .pending
            .get(&id)
            .is_some_and(|row| row.claim.is_some_and(|(owner, _)| owner == token));
        if owned {
            state.pending.remove(&id);
        }
        Ok(owned)
    }

    async fn list_for_target(&self, target_id: i64) -> Result<Vec<PendingEscalation>> {
        let state = self.state.lock();
        let mut rows: Vec<PendingEscalation> = state
            .pending
            .values()
            .filter(|row| row.escalation.target_id == target_id)
            .map(|row| row.escalation.clone())
            .collect();
        rows.sort_by_key(|row| (row.process_at, row.id));
        Ok(rows)
    }

    async fn delete_for_target(&self, target_id: i64) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|_, row| row.escalation.target_id != target_id);
        Ok((before - state.pending.len()) as u64)
    }
}

#[async_trait]
impl RecurringEscalationStore for MemoryEscalationStore {
    async fn insert_recurring(
        &self,
        rows: &[NewRecurringEscalation],
    ) -> Result<Vec<RecurringEscalation>> {
        let mut state = self.state.lock();
        let mut result = Vec::with_capacity(rows.len());

        for new in rows {
            let existing = state
                .recurring
                .values()
                .find(|row| row.target_id == new.target_id && row.rule_id == new.rule_id)
                .cloned();
            if let Some(existing) = existing {
                result.push(existing);
                continue;
            }

            let escalation = RecurringEscalation {
                id: state.next_id(),
                policy_id: new.policy_id,
                rule_id: new.rule_id,
                target_id: new.target_id,
                schedule_id: new.schedule_id,
                status: new.status,
                elapsed_time_seconds: new.elapsed_time_seconds,
                last_notified_at: None,
                created_at: new.created_at,
            };
            state.recurring.insert(escalation.id, escalation.clone());
            result.push(escalation);
        }

        Ok(result)
    }

    async fn list_recurring_for_target(&self, target_id: i64) -> Result<Vec<RecurringEscalation>> {
        let state = self.state.lock();
        Ok(state
            .recurring
            .values()
            .filter(|row| row.target_id == target_id)
            .cloned()
            .collect())
    }

    async fn active_recurring_targets(&self, after: i64, limit: usize) -> Result<Vec<i64>> {
        let state = self.state.lock();
        let targets: BTreeSet<i64> = state
            .recurring
            .values()
            .map(|row| row.target_id)
            .filter(|id| *id > after)
            .filter(|id| !state.targets.get(id).is_some_and(Target::is_terminal))
            .collect();
        Ok(targets.into_iter().take(limit).collect())
    }

    async fn compare_and_touch(
        &self,
        id: i64,
        expected: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.recurring.get_mut(&id) {
            Some(row) if row.last_notified_at == expected => {
                row.last_notified_at = new;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn delete_recurring_for_target(&self, target_id: i64) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.recurring.len();
        state.recurring.retain(|_, row| row.target_id != target_id);
        Ok((before - state.recurring.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::EscalationRuleStatus;
    use chrono::TimeZone;

    fn new_row(target_id: i64, rule_id: i64, process_at: DateTime<Utc>) -> NewPendingEscalation {
        NewPendingEscalation {
            policy_id: 1,
            rule_id,
            target_id,
            schedule_id: 1,
            status: EscalationRuleStatus::Acknowledged,
            process_at,
            created_at: process_at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_unique_per_target_rule() {
        let store = MemoryEscalationStore::new();
        let first = store.insert_many(&[new_row(1, 1, t0())]).await.unwrap();
        let again = store.insert_many(&[new_row(1, 1, t0())]).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_lease_and_release() {
        let store = MemoryEscalationStore::new();
        let rows = store.insert_many(&[new_row(1, 1, t0())]).await.unwrap();
        let id = rows[0].id;
        let lease = Duration::minutes(5);

        let ClaimAttempt::Claimed(claimed) = store.claim(id, t0(), lease).await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(store.claim(id, t0(), lease).await.unwrap(), ClaimAttempt::Busy);

        // Expired lease can be taken over
        let later = t0() + Duration::minutes(6);
        assert!(matches!(
            store.claim(id, later, lease).await.unwrap(),
            ClaimAttempt::Claimed(_)
        ));

        // Stale token cannot delete
        assert!(!store.delete(id, claimed.token).await.unwrap());
        assert_eq!(store.claim(999, t0(), lease).await.unwrap(), ClaimAttempt::Missing);
    }

    #[tokio::test]
    async fn test_claim_due_orders_and_limits() {
        let store = MemoryEscalationStore::new();
        store
            .insert_many(&[
                new_row(1, 2, t0() + Duration::minutes(10)),
                new_row(1, 1, t0()),
                new_row(1, 3, t0() + Duration::hours(1)),
            ])
            .await
            .unwrap();

        let now = t0() + Duration::minutes(30);
        let claimed = store.claim_due(now, Duration::minutes(5), 10).await.unwrap();
        let rules: Vec<i64> = claimed.iter().map(|c| c.escalation.rule_id).collect();
        assert_eq!(rules, vec![1, 2]);

        // Already claimed rows are not handed out twice
        assert!(store
            .claim_due(now, Duration::minutes(5), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_remove_target_cascades() {
        let store = MemoryEscalationStore::new();
        store.add_target(Target {
            id: 1,
            project_id: 1,
            title: "cpu".into(),
            status: AlertStatus::Triggered,
            created_at: t0(),
        });
        store.insert_many(&[new_row(1, 1, t0())]).await.unwrap();
        store.remove_target(1);
        assert_eq!(store.pending_count(), 0);
    }
}

//! Escalation rule set - validated, ordered rules of one policy

use crate::types::{AlertStatus, EscalationPolicy, EscalationRule};
use std::collections::HashSet;
use tracing::warn;

/// Rules of a policy in ascending elapsed-time order
///
/// Invalid rules (negative or oversized delay) are dropped with a warning and duplicate
/// rule ids are collapsed, so a policy never yields two escalations for
/// the same rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationRuleSet {
    rules: Vec<EscalationRule>,
}

impl EscalationRuleSet {
    pub fn from_rules(rules: impl IntoIterator<Item = EscalationRule>) -> Self {
        let mut seen = HashSet::new();
        let mut valid: Vec<EscalationRule> = rules
            .into_iter()
            .filter(|rule| {
                if !rule.is_valid() {
                    warn!(
                        "Skipping rule {} of policy {}: elapsed time {}s",
                        rule.id, rule.policy_id, rule.elapsed_time_seconds
                    );
                    return false;
                }
                seen.insert(rule.id)
            })
            .collect();

        valid.sort_by_key(|rule| (rule.elapsed_time_seconds, rule.id));
        Self { rules: valid }
    }

    pub fn for_policy(policy: &EscalationPolicy) -> Self {
        Self::from_rules(policy.rules.iter().cloned())
    }

    pub fn rules(&self) -> &[EscalationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, rule_id: i64) -> Option<&EscalationRule> {
        self.rules.iter().find(|rule| rule.id == rule_id)
    }

    /// Rules that still matter for an alert in `status`
    pub fn pending_for(&self, status: AlertStatus) -> impl Iterator<Item = &EscalationRule> {
        self.rules
            .iter()
            .filter(move |rule| !status.is_terminal() && !rule.status.is_satisfied_by(status))
    }

    /// Rules firing once per cycle
    pub fn zero_delay_rules(&self) -> impl Iterator<Item = &EscalationRule> {
        self.rules.iter().filter(|rule| rule.elapsed_time_seconds == 0)
    }

    /// Rules whose firing opens a new cycle
    pub fn delayed_rules(&self) -> impl Iterator<Item = &EscalationRule> {
        self.rules.iter().filter(|rule| rule.elapsed_time_seconds > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EscalationRuleStatus;

    fn rule(id: i64, status: EscalationRuleStatus, elapsed: i64) -> EscalationRule {
        EscalationRule {
            id,
            policy_id: 1,
            oncall_schedule_id: 1,
            status,
            elapsed_time_seconds: elapsed,
        }
    }

    #[test]
    fn test_sorted_by_elapsed_time() {
        let set = EscalationRuleSet::from_rules(vec![
            rule(3, EscalationRuleStatus::Resolved, 600),
            rule(1, EscalationRuleStatus::Acknowledged, 0),
            rule(2, EscalationRuleStatus::Acknowledged, 300),
        ]);
        let ids: Vec<i64> = set.rules().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_and_duplicate_rules_dropped() {
        let set = EscalationRuleSet::from_rules(vec![
            rule(1, EscalationRuleStatus::Acknowledged, -5),
            rule(2, EscalationRuleStatus::Acknowledged, 60),
            rule(2, EscalationRuleStatus::Acknowledged, 60),
            rule(3, EscalationRuleStatus::Resolved, i64::MAX),
        ]);
        assert_eq!(set.len(), 1);
        assert!(set.get(1).is_none());
        assert!(set.get(3).is_none());
    }

    #[test]
    fn test_pending_for_status() {
        let set = EscalationRuleSet::from_rules(vec![
            rule(1, EscalationRuleStatus::Acknowledged, 300),
            rule(2, EscalationRuleStatus::Resolved, 600),
        ]);

        assert_eq!(set.pending_for(AlertStatus::Triggered).count(), 2);
        let ack: Vec<i64> = set
            .pending_for(AlertStatus::Acknowledged)
            .map(|r| r.id)
            .collect();
        assert_eq!(ack, vec![2]);
        assert_eq!(set.pending_for(AlertStatus::Ignored).count(), 0);
    }

    #[test]
    fn test_cycle_partitions() {
        let set = EscalationRuleSet::from_rules(vec![
            rule(1, EscalationRuleStatus::Acknowledged, 0),
            rule(2, EscalationRuleStatus::Acknowledged, 300),
        ]);
        assert_eq!(set.zero_delay_rules().count(), 1);
        assert_eq!(set.delayed_rules().next().map(|r| r.id), Some(2));
    }
}

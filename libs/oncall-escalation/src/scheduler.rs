//! Escalation Scheduler - creates escalation work for a newly triggered alert
//!
//! One entry per rule of the project's policy:
//! - `PendingEscalationScheduler`: one-shot rows due at `created_at + elapsed`
//! - `RecurringScheduler`: per (alert, rule) records re-firing on a cadence
//!
//! Both are no-ops when a feature is disabled, the project has no policy,
//! or the alert already meets every rule's threshold.

use crate::error::Result;
use crate::rule_set::EscalationRuleSet;
use crate::traits::{
    escalation_available, Clock, EscalationDirectory, FeatureGate, NoopWorkQueue,
    PendingEscalationStore, RecurringEscalationStore, WorkQueue,
};
use crate::types::{
    EscalationRule, NewPendingEscalation, NewRecurringEscalation, PendingEscalation,
    RecurringEscalation, Target,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rules that should produce escalation work for `target`
async fn rules_to_schedule(
    directory: &dyn EscalationDirectory,
    gate: &dyn FeatureGate,
    target: &Target,
) -> Result<Vec<EscalationRule>> {
    if !escalation_available(gate, target.project_id) {
        debug!(
            "Escalation features disabled for project {}, alert {} not scheduled",
            target.project_id, target.id
        );
        return Ok(Vec::new());
    }

    if target.is_terminal() {
        debug!("Alert {} is {}, nothing to schedule", target.id, target.status);
        return Ok(Vec::new());
    }

    let Some(policy) = directory.policy_for_project(target.project_id).await? else {
        debug!("No escalation policy for project {}", target.project_id);
        return Ok(Vec::new());
    };

    let rules = EscalationRuleSet::for_policy(&policy);
    Ok(rules.pending_for(target.status).cloned().collect())
}

/// Creates one-shot pending escalations
pub struct PendingEscalationScheduler {
    directory: Arc<dyn EscalationDirectory>,
    store: Arc<dyn PendingEscalationStore>,
    gate: Arc<dyn FeatureGate>,
    clock: Arc<dyn Clock>,
    queue: Arc<dyn WorkQueue>,
}

impl PendingEscalationScheduler {
    pub fn new(
        directory: Arc<dyn EscalationDirectory>,
        store: Arc<dyn PendingEscalationStore>,
        gate: Arc<dyn FeatureGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory,
            store,
            gate,
            clock,
            queue: Arc::new(NoopWorkQueue),
        }
    }

    /// Hand already-due escalations to `queue` after persisting them
    pub fn with_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Schedule every applicable rule of the project's policy for `target`
    ///
    /// Re-scheduling the same alert returns the existing rows.
    pub async fn schedule(&self, target: &Target) -> Result<Vec<PendingEscalation>> {
        let rules = rules_to_schedule(self.directory.as_ref(), self.gate.as_ref(), target).await?;
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let rows: Vec<NewPendingEscalation> = rules
            .iter()
            .filter_map(|rule| {
                let row = NewPendingEscalation::for_rule(target, rule, now);
                if row.is_none() {
                    warn!(
                        "Skipping rule {} for alert {}: elapsed time {}s is out of range",
                        rule.id, target.id, rule.elapsed_time_seconds
                    );
                }
                row
            })
            .collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let persisted = self.store.insert_many(&rows).await?;
        info!(
            "Scheduled {} escalations for alert {}",
            persisted.len(),
            target.id
        );

        let due: Vec<i64> = persisted
            .iter()
            .filter(|escalation| escalation.is_due(now))
            .map(|escalation| escalation.id)
            .collect();
        if !due.is_empty() {
            // The driver's poll still finds these rows if the hand-off fails
            if let Err(e) = self.queue.enqueue(&due).await {
                warn!("Failed to enqueue {} due escalations: {}", due.len(), e);
            }
        }

        Ok(persisted)
    }
}

/// Creates recurring escalation records
pub struct RecurringScheduler {
    directory: Arc<dyn EscalationDirectory>,
    store: Arc<dyn RecurringEscalationStore>,
    gate: Arc<dyn FeatureGate>,
    clock: Arc<dyn Clock>,
}

impl RecurringScheduler {
    pub fn new(
        directory: Arc<dyn EscalationDirectory>,
        store: Arc<dyn RecurringEscalationStore>,
        gate: Arc<dyn FeatureGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory,
            store,
            gate,
            clock,
        }
    }

    pub async fn schedule(&self, target: &Target) -> Result<Vec<RecurringEscalation>> {
        let rules = rules_to_schedule(self.directory.as_ref(), self.gate.as_ref(), target).await?;
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let rows: Vec<NewRecurringEscalation> = rules
            .iter()
            .map(|rule| NewRecurringEscalation::for_rule(target, rule, now))
            .collect();

        let persisted = self.store.insert_recurring(&rows).await?;
        info!(
            "Scheduled {} recurring escalations for alert {}",
            persisted.len(),
            target.id
        );
        Ok(persisted)
    }
}

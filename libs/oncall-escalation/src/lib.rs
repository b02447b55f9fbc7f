//! Oncall Escalation - Incident Escalation Engine
//!
//! Pages on-call responders when an alert stays unacknowledged:
//! - On-call resolution from rotations, shifts and active periods
//! - Escalation scheduling from a project's escalation policy
//! - One-shot processing with claim leases, or recurring re-paging
//! - Batch driver with concurrent processing per tick
//! - SQLite persistence and an in-memory store for tests and tools
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Scheduler  │────▶│   Storage    │◀────│    Driver    │
//! │ (per alert) │     │(pending rows)│     │ (tick/batch) │
//! └─────────────┘     └──────────────┘     └──────────────┘
//!        │ enqueue                                │
//!        └──────────────▶ WorkQueue ──────────────┤
//!                                                 ▼
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Dispatcher  │◀────│  Processor   │────▶│   Resolver   │
//! │  (pages)    │     │ (claim/eval) │     │  (on-call)   │
//! └─────────────┘     └──────────────┘     └──────────────┘
//!                            │
//!                            ▼
//!                     ┌──────────────┐
//!                     │  Audit log   │
//!                     └──────────────┘
//! ```

pub mod audit;
pub mod dispatch;
mod driver;
mod error;
mod memory;
mod processor;
mod recurring;
mod repository;
mod rotation;
mod rule_set;
mod scheduler;
pub mod schema;
pub mod traits;
pub mod types;

#[cfg(test)]
mod test_utils;

// Re-export public API
pub use audit::{format_note, FileAuditLog, TracingAuditLog};
pub use dispatch::{ChannelWorkQueue, DedupDispatcher, TracingDispatcher, WorkQueueReceiver};
pub use driver::{
    validate_config, DriverConfig, DriverStats, DriverStatsSnapshot, DriverStatus,
    EscalationDriver, TickSummary, DEFAULT_TICK_MS,
};
pub use error::{EscalationError, Result};
pub use memory::MemoryEscalationStore;
pub use processor::{
    DropReason, EscalationProcessor, Outcome, SkipReason, DEFAULT_CLAIM_LEASE_SECS,
};
pub use recurring::{cycle_start, is_due, RecurringEscalationProcessor};
pub use repository::{
    delete_rule, delete_target, insert_policy, insert_schedule, insert_shift,
    set_target_status, upsert_target, SqliteEscalationStore,
};
pub use rotation::{OncallResolver, ResolutionCache, ShiftGenerator};
pub use rule_set::EscalationRuleSet;
pub use scheduler::{PendingEscalationScheduler, RecurringScheduler};
pub use schema::init_schema;

// Re-export collaborator traits and domain types for convenience
pub use traits::{
    escalation_available, AuditLog, Clock, EscalationDirectory, Feature, FeatureGate,
    ManualClock, NoopWorkQueue, NotificationDispatcher, NotificationKey,
    PendingEscalationStore, RecurringEscalationStore, StaticFeatureGate, SystemClock, WorkQueue,
};
pub use types::{
    ActivePeriod, AlertStatus, ClaimAttempt, ClaimToken, ClaimedEscalation, EscalationMode,
    EscalationPolicy, EscalationRule, EscalationRuleStatus, LengthUnit, NewPendingEscalation,
    NewRecurringEscalation, OncallParticipant, OncallRotation, OncallSchedule, OncallShift,
    PendingEscalation, RecurringEscalation, Target, UserRef,
};

//! SQLite schema for escalation data
//!
//! Timestamps are stored as INTEGER unix seconds. Statuses are stored as
//! their integer codes.

use crate::error::Result;
use sqlx::SqlitePool;
use tracing::debug;

pub const USERS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL UNIQUE
    )
"#;

pub const ALERTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        status INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
"#;

pub const ESCALATION_POLICIES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS escalation_policies (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        UNIQUE (project_id, name)
    )
"#;

pub const ONCALL_SCHEDULES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS oncall_schedules (
        id INTEGER PRIMARY KEY,
        project_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        timezone_offset_seconds INTEGER NOT NULL DEFAULT 0
    )
"#;

pub const ESCALATION_RULES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS escalation_rules (
        id INTEGER PRIMARY KEY,
        policy_id INTEGER NOT NULL REFERENCES escalation_policies(id) ON DELETE CASCADE,
        oncall_schedule_id INTEGER NOT NULL REFERENCES oncall_schedules(id) ON DELETE CASCADE,
        status INTEGER NOT NULL,
        elapsed_time_seconds INTEGER NOT NULL,
        UNIQUE (policy_id, oncall_schedule_id, status, elapsed_time_seconds)
    )
"#;

pub const ONCALL_ROTATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS oncall_rotations (
        id INTEGER PRIMARY KEY,
        schedule_id INTEGER NOT NULL REFERENCES oncall_schedules(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        starts_at INTEGER NOT NULL,
        ends_at INTEGER,
        length INTEGER NOT NULL,
        length_unit TEXT NOT NULL,
        active_period_start TEXT,
        active_period_end TEXT
    )
"#;

pub const ONCALL_PARTICIPANTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS oncall_participants (
        id INTEGER PRIMARY KEY,
        rotation_id INTEGER NOT NULL REFERENCES oncall_rotations(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        position INTEGER NOT NULL DEFAULT 0,
        removed INTEGER NOT NULL DEFAULT 0
    )
"#;

pub const ONCALL_SHIFTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS oncall_shifts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rotation_id INTEGER NOT NULL REFERENCES oncall_rotations(id) ON DELETE CASCADE,
        participant_id INTEGER NOT NULL REFERENCES oncall_participants(id) ON DELETE CASCADE,
        starts_at INTEGER NOT NULL,
        ends_at INTEGER NOT NULL,
        UNIQUE (rotation_id, starts_at)
    )
"#;

pub const PENDING_ESCALATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS pending_escalations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        policy_id INTEGER NOT NULL,
        rule_id INTEGER NOT NULL REFERENCES escalation_rules(id) ON DELETE CASCADE,
        alert_id INTEGER NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
        schedule_id INTEGER NOT NULL,
        status INTEGER NOT NULL,
        process_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        claimed_until INTEGER,
        claim_token TEXT,
        UNIQUE (alert_id, rule_id)
    )
"#;

pub const PENDING_ESCALATIONS_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_pending_escalations_process_at
        ON pending_escalations (process_at)
"#;

pub const RECURRING_ESCALATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS recurring_escalations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        policy_id INTEGER NOT NULL,
        rule_id INTEGER NOT NULL REFERENCES escalation_rules(id) ON DELETE CASCADE,
        alert_id INTEGER NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
        schedule_id INTEGER NOT NULL,
        status INTEGER NOT NULL,
        elapsed_time_seconds INTEGER NOT NULL,
        last_notified_at INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE (alert_id, rule_id)
    )
"#;

/// All DDL in dependency order
pub const ALL_TABLES: &[&str] = &[
    USERS_TABLE,
    ALERTS_TABLE,
    ESCALATION_POLICIES_TABLE,
    ONCALL_SCHEDULES_TABLE,
    ESCALATION_RULES_TABLE,
    ONCALL_ROTATIONS_TABLE,
    ONCALL_PARTICIPANTS_TABLE,
    ONCALL_SHIFTS_TABLE,
    PENDING_ESCALATIONS_TABLE,
    PENDING_ESCALATIONS_INDEX,
    RECURRING_ESCALATIONS_TABLE,
];

/// Create every table and index if missing
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;
    for ddl in ALL_TABLES {
        sqlx::query(*ddl).execute(pool).await?;
    }
    debug!("Escalation schema ready ({} statements)", ALL_TABLES.len());
    Ok(())
}

//! Escalation Repository - SQLite persistence for escalation data
//!
//! `SqliteEscalationStore` implements the directory lookups and both
//! escalation stores. The free functions below write directory data
//! (alerts, policies, schedules, shifts) for hosts and fixtures.

use crate::error::{EscalationError, Result};
use crate::traits::{EscalationDirectory, PendingEscalationStore, RecurringEscalationStore};
use crate::types::{
    ActivePeriod, AlertStatus, ClaimAttempt, ClaimToken, ClaimedEscalation, EscalationPolicy,
    EscalationRule, EscalationRuleStatus, LengthUnit, NewPendingEscalation,
    NewRecurringEscalation, OncallParticipant, OncallRotation, OncallSchedule, OncallShift,
    PendingEscalation, RecurringEscalation, Target, UserRef,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

const TIME_FORMAT: &str = "%H:%M:%S";

const PENDING_COLUMNS: &str =
    "id, policy_id, rule_id, alert_id, schedule_id, status, process_at, created_at";

const RECURRING_COLUMNS: &str = "id, policy_id, rule_id, alert_id, schedule_id, status, \
     elapsed_time_seconds, last_notified_at, created_at";

/// SQLite-backed escalation store
#[derive(Debug, Clone)]
pub struct SqliteEscalationStore {
    pool: SqlitePool,
}

impl SqliteEscalationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_rules(&self, policy_id: i64) -> Result<Vec<EscalationRule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, policy_id, oncall_schedule_id, status, elapsed_time_seconds
            FROM escalation_rules
            WHERE policy_id = ?
            ORDER BY elapsed_time_seconds ASC, id ASC
            "#,
        )
        .bind(policy_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_rule).collect()
    }

    async fn load_policy(&self, row: Option<SqliteRow>) -> Result<Option<EscalationPolicy>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        let rules = self.load_rules(id).await?;

        Ok(Some(EscalationPolicy {
            id,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            rules,
        }))
    }

    async fn load_participants(&self, rotation_id: i64) -> Result<Vec<OncallParticipant>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.removed, u.id AS user_id, u.username
            FROM oncall_participants p
            JOIN users u ON u.id = p.user_id
            WHERE p.rotation_id = ?
            ORDER BY p.position ASC, p.id ASC
            "#,
        )
        .bind(rotation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut participants = Vec::with_capacity(rows.len());
        for row in rows {
            let removed: i64 = row.try_get("removed")?;
            participants.push(OncallParticipant {
                id: row.try_get("id")?,
                user: UserRef::new(row.try_get("user_id")?, row.try_get::<String, _>("username")?),
                removed: removed != 0,
            });
        }
        Ok(participants)
    }

    async fn find_pending_by_pair(
        &self,
        target_id: i64,
        rule_id: i64,
    ) -> Result<Option<PendingEscalation>> {
        let sql = format!(
            "SELECT {} FROM pending_escalations WHERE alert_id = ? AND rule_id = ?",
            PENDING_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(target_id)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(hydrate_pending).transpose()
    }
}

// ============================================================================
// Directory lookups
// ============================================================================

#[async_trait]
impl EscalationDirectory for SqliteEscalationStore {
    async fn find_target(&self, target_id: i64) -> Result<Option<Target>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, title, status, created_at
            FROM alerts
            WHERE id = ?
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(hydrate_target).transpose()
    }

    async fn policy_for_project(&self, project_id: i64) -> Result<Option<EscalationPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name
            FROM escalation_policies
            WHERE project_id = ?
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        self.load_policy(row).await
    }

    async fn find_policy(&self, policy_id: i64) -> Result<Option<EscalationPolicy>> {
        let row = sqlx::query("SELECT id, project_id, name FROM escalation_policies WHERE id = ?")
            .bind(policy_id)
            .fetch_optional(&self.pool)
            .await?;

        self.load_policy(row).await
    }

    async fn find_rule(&self, rule_id: i64) -> Result<Option<EscalationRule>> {
        let row = sqlx::query(
            r#"
            SELECT id, policy_id, oncall_schedule_id, status, elapsed_time_seconds
            FROM escalation_rules
            WHERE id = ?
            "#,
        )
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(hydrate_rule).transpose()
    }

    async fn find_schedule(&self, schedule_id: i64) -> Result<Option<OncallSchedule>> {
        let Some(row) = sqlx::query(
            r#"
            SELECT id, project_id, name, timezone_offset_seconds
            FROM oncall_schedules
            WHERE id = ?
            "#,
        )
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let rotation_rows = sqlx::query(
            r#"
            SELECT id, schedule_id, name, starts_at, ends_at, length, length_unit,
                   active_period_start, active_period_end
            FROM oncall_rotations
            WHERE schedule_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rotations = Vec::with_capacity(rotation_rows.len());
        for rotation_row in rotation_rows {
            let mut rotation = hydrate_rotation(rotation_row)?;
            rotation.participants = self.load_participants(rotation.id).await?;
            rotations.push(rotation);
        }

        let offset: i64 = row.try_get("timezone_offset_seconds")?;
        Ok(Some(OncallSchedule {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            timezone_offset_seconds: offset as i32,
            rotations,
        }))
    }

    async fn persisted_shift(
        &self,
        rotation_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<OncallShift>> {
        let row = sqlx::query(
            r#"
            SELECT s.rotation_id, s.participant_id, s.starts_at, s.ends_at,
                   u.id AS user_id, u.username
            FROM oncall_shifts s
            JOIN oncall_participants p ON p.id = s.participant_id
            JOIN users u ON u.id = p.user_id
            WHERE s.rotation_id = ? AND s.starts_at <= ? AND s.ends_at > ?
            ORDER BY s.starts_at DESC
            LIMIT 1
            "#,
        )
        .bind(rotation_id)
        .bind(at.timestamp())
        .bind(at.timestamp())
        .fetch_optional(&self.pool)
        .await?;

        row.map(hydrate_shift).transpose()
    }
}

// ============================================================================
// Pending escalations
// ============================================================================

#[async_trait]
impl PendingEscalationStore for SqliteEscalationStore {
    async fn insert_many(&self, rows: &[NewPendingEscalation]) -> Result<Vec<PendingEscalation>> {
        let mut tx = self.pool.begin().await?;
        for new in rows {
            sqlx::query(
                r#"
                INSERT INTO pending_escalations
                    (policy_id, rule_id, alert_id, schedule_id, status, process_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (alert_id, rule_id) DO NOTHING
                "#,
            )
            .bind(new.policy_id)
            .bind(new.rule_id)
            .bind(new.target_id)
            .bind(new.schedule_id)
            .bind(new.status.code())
            .bind(new.process_at.timestamp())
            .bind(new.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut persisted = Vec::with_capacity(rows.len());
        for new in rows {
            match self.find_pending_by_pair(new.target_id, new.rule_id).await? {
                Some(row) => persisted.push(row),
                None => {
                    return Err(EscalationError::NotFound(format!(
                        "pending escalation for alert {} rule {}",
                        new.target_id, new.rule_id
                    )))
                },
            }
        }
        Ok(persisted)
    }

    async fn find(&self, id: i64) -> Result<Option<PendingEscalation>> {
        let sql = format!("SELECT {} FROM pending_escalations WHERE id = ?", PENDING_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(hydrate_pending).transpose()
    }

    async fn claim(&self, id: i64, now: DateTime<Utc>, lease: Duration) -> Result<ClaimAttempt> {
        let token = ClaimToken::new();
        let claimed_until = now + lease;

        let sql = format!(
            r#"
            UPDATE pending_escalations
            SET claimed_until = ?, claim_token = ?
            WHERE id = ? AND (claimed_until IS NULL OR claimed_until <= ?)
            RETURNING {}
            "#,
            PENDING_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(claimed_until.timestamp())
            .bind(token.to_string())
            .bind(id)
            .bind(now.timestamp())
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Ok(ClaimAttempt::Claimed(ClaimedEscalation {
                escalation: hydrate_pending(row)?,
                token,
                claimed_until: truncate_to_seconds(claimed_until)?,
            }));
        }

        let exists = sqlx::query("SELECT 1 FROM pending_escalations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        Ok(if exists {
            ClaimAttempt::Busy
        } else {
            ClaimAttempt::Missing
        })
    }

    async fn claim_due(
        &self,
        before: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedEscalation>> {
        let token = ClaimToken::new();
        let claimed_until = truncate_to_seconds(before + lease)?;

        // Single statement so two workers never claim the same row
        let sql = format!(
            r#"
            UPDATE pending_escalations
            SET claimed_until = ?, claim_token = ?
            WHERE id IN (
                SELECT id FROM pending_escalations
                WHERE process_at <= ? AND (claimed_until IS NULL OR claimed_until <= ?)
                ORDER BY process_at ASC, id ASC
                LIMIT ?
            )
            RETURNING {}
            "#,
            PENDING_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(claimed_until.timestamp())
            .bind(token.to_string())
            .bind(before.timestamp())
            .bind(before.timestamp())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push(ClaimedEscalation {
                escalation: hydrate_pending(row)?,
                token,
                claimed_until,
            });
        }
        claimed.sort_by_key(|c| (c.escalation.process_at, c.escalation.id));
        Ok(claimed)
    }

    async fn release(&self, id: i64, token: ClaimToken) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_escalations
            SET claimed_until = NULL, claim_token = NULL
            WHERE id = ? AND claim_token = ?
            "#,
        )
        .bind(id)
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: i64, token: ClaimToken) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_escalations WHERE id = ? AND claim_token = ?")
            .bind(id)
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_target(&self, target_id: i64) -> Result<Vec<PendingEscalation>> {
        let sql = format!(
            "SELECT {} FROM pending_escalations WHERE alert_id = ? ORDER BY process_at ASC, id ASC",
            PENDING_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(target_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(hydrate_pending).collect()
    }

    async fn delete_for_target(&self, target_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pending_escalations WHERE alert_id = ?")
            .bind(target_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Recurring escalations
// ============================================================================

#[async_trait]
impl RecurringEscalationStore for SqliteEscalationStore {
    async fn insert_recurring(
        &self,
        rows: &[NewRecurringEscalation],
    ) -> Result<Vec<RecurringEscalation>> {
        let mut tx = self.pool.begin().await?;
        for new in rows {
            sqlx::query(
                r#"
                INSERT INTO recurring_escalations
                    (policy_id, rule_id, alert_id, schedule_id, status,
                     elapsed_time_seconds, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (alert_id, rule_id) DO NOTHING
                "#,
            )
            .bind(new.policy_id)
            .bind(new.rule_id)
            .bind(new.target_id)
            .bind(new.schedule_id)
            .bind(new.status.code())
            .bind(new.elapsed_time_seconds)
            .bind(new.created_at.timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let sql = format!(
            "SELECT {} FROM recurring_escalations WHERE alert_id = ? AND rule_id = ?",
            RECURRING_COLUMNS
        );
        let mut persisted = Vec::with_capacity(rows.len());
        for new in rows {
            let row = sqlx::query(&sql)
                .bind(new.target_id)
                .bind(new.rule_id)
                .fetch_one(&self.pool)
                .await?;
            persisted.push(hydrate_recurring(row)?);
        }
        Ok(persisted)
    }

    async fn list_recurring_for_target(&self, target_id: i64) -> Result<Vec<RecurringEscalation>> {
        let sql = format!(
            "SELECT {} FROM recurring_escalations WHERE alert_id = ? ORDER BY id ASC",
            RECURRING_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(target_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(hydrate_recurring).collect()
    }

    async fn active_recurring_targets(&self, after: i64, limit: usize) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT DISTINCT r.alert_id
            FROM recurring_escalations r
            JOIN alerts a ON a.id = r.alert_id
            WHERE r.alert_id > ? AND a.status NOT IN (?, ?)
            ORDER BY r.alert_id ASC
            LIMIT ?
            "#,
        )
        .bind(after)
        .bind(AlertStatus::Resolved.code())
        .bind(AlertStatus::Ignored.code())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn compare_and_touch(
        &self,
        id: i64,
        expected: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        // `IS` compares NULLs as equal
        let result = sqlx::query(
            r#"
            UPDATE recurring_escalations
            SET last_notified_at = ?
            WHERE id = ? AND last_notified_at IS ?
            "#,
        )
        .bind(new.map(|at| at.timestamp()))
        .bind(id)
        .bind(expected.map(|at| at.timestamp()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_recurring_for_target(&self, target_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM recurring_escalations WHERE alert_id = ?")
            .bind(target_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Directory writes
// ============================================================================

/// Insert or update an alert
pub async fn upsert_target(pool: &SqlitePool, target: &Target) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO alerts (id, project_id, title, status, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            title = excluded.title,
            status = excluded.status,
            created_at = excluded.created_at
        "#,
    )
    .bind(target.id)
    .bind(target.project_id)
    .bind(&target.title)
    .bind(target.status.code())
    .bind(target.created_at.timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

/// Change an alert's status
pub async fn set_target_status(pool: &SqlitePool, target_id: i64, status: AlertStatus) -> Result<()> {
    let result = sqlx::query("UPDATE alerts SET status = ? WHERE id = ?")
        .bind(status.code())
        .bind(target_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EscalationError::NotFound(format!("alert {}", target_id)));
    }

    Ok(())
}

/// Delete an alert together with its escalations
pub async fn delete_target(pool: &SqlitePool, target_id: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM pending_escalations WHERE alert_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM recurring_escalations WHERE alert_id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM alerts WHERE id = ?")
        .bind(target_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a policy and its rules
pub async fn insert_policy(pool: &SqlitePool, policy: &EscalationPolicy) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO escalation_policies (id, project_id, name) VALUES (?, ?, ?)")
        .bind(policy.id)
        .bind(policy.project_id)
        .bind(&policy.name)
        .execute(&mut *tx)
        .await?;

    for rule in &policy.rules {
        sqlx::query(
            r#"
            INSERT INTO escalation_rules
                (id, policy_id, oncall_schedule_id, status, elapsed_time_seconds)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.id)
        .bind(policy.id)
        .bind(rule.oncall_schedule_id)
        .bind(rule.status.code())
        .bind(rule.elapsed_time_seconds)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Delete a single rule; pending escalations for it cascade
pub async fn delete_rule(pool: &SqlitePool, rule_id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM escalation_rules WHERE id = ?")
        .bind(rule_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EscalationError::NotFound(format!("rule {}", rule_id)));
    }

    Ok(())
}

/// Insert a schedule with rotations, participants and their users
pub async fn insert_schedule(pool: &SqlitePool, schedule: &OncallSchedule) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO oncall_schedules (id, project_id, name, timezone_offset_seconds)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(schedule.id)
    .bind(schedule.project_id)
    .bind(&schedule.name)
    .bind(i64::from(schedule.timezone_offset_seconds))
    .execute(&mut *tx)
    .await?;

    for rotation in &schedule.rotations {
        sqlx::query(
            r#"
            INSERT INTO oncall_rotations
                (id, schedule_id, name, starts_at, ends_at, length, length_unit,
                 active_period_start, active_period_end)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rotation.id)
        .bind(schedule.id)
        .bind(&rotation.name)
        .bind(rotation.starts_at.timestamp())
        .bind(rotation.ends_at.map(|at| at.timestamp()))
        .bind(i64::from(rotation.length))
        .bind(rotation.length_unit.as_str())
        .bind(rotation.active_period.map(|p| p.start.format(TIME_FORMAT).to_string()))
        .bind(rotation.active_period.map(|p| p.end.format(TIME_FORMAT).to_string()))
        .execute(&mut *tx)
        .await?;

        for (position, participant) in rotation.participants.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO users (id, username) VALUES (?, ?)
                ON CONFLICT(id) DO UPDATE SET username = excluded.username
                "#,
            )
            .bind(participant.user.id)
            .bind(&participant.user.username)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO oncall_participants (id, rotation_id, user_id, position, removed)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(participant.id)
            .bind(rotation.id)
            .bind(participant.user.id)
            .bind(position as i64)
            .bind(participant.removed)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Persist a concrete shift
pub async fn insert_shift(pool: &SqlitePool, shift: &OncallShift) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO oncall_shifts (rotation_id, participant_id, starts_at, ends_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (rotation_id, starts_at) DO UPDATE SET
            participant_id = excluded.participant_id,
            ends_at = excluded.ends_at
        "#,
    )
    .bind(shift.rotation_id)
    .bind(shift.participant_id)
    .bind(shift.starts_at.timestamp())
    .bind(shift.ends_at.timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Row hydration
// ============================================================================

fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| EscalationError::Serialization(format!("timestamp out of range: {}", secs)))
}

fn truncate_to_seconds(at: DateTime<Utc>) -> Result<DateTime<Utc>> {
    from_unix(at.timestamp())
}

fn alert_status(code: i64) -> Result<AlertStatus> {
    AlertStatus::from_code(code)
        .ok_or_else(|| EscalationError::Serialization(format!("alert status code {}", code)))
}

fn rule_status(code: i64) -> Result<EscalationRuleStatus> {
    EscalationRuleStatus::from_code(code)
        .ok_or_else(|| EscalationError::Serialization(format!("rule status code {}", code)))
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|e| EscalationError::Serialization(format!("active period '{}': {}", value, e)))
}

fn hydrate_target(row: SqliteRow) -> Result<Target> {
    Ok(Target {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        title: row.try_get("title")?,
        status: alert_status(row.try_get("status")?)?,
        created_at: from_unix(row.try_get("created_at")?)?,
    })
}

fn hydrate_rule(row: SqliteRow) -> Result<EscalationRule> {
    Ok(EscalationRule {
        id: row.try_get("id")?,
        policy_id: row.try_get("policy_id")?,
        oncall_schedule_id: row.try_get("oncall_schedule_id")?,
        status: rule_status(row.try_get("status")?)?,
        elapsed_time_seconds: row.try_get("elapsed_time_seconds")?,
    })
}

fn hydrate_rotation(row: SqliteRow) -> Result<OncallRotation> {
    let length: i64 = row.try_get("length")?;
    let unit: String = row.try_get("length_unit")?;
    let ends_at: Option<i64> = row.try_get("ends_at")?;
    let period_start: Option<String> = row.try_get("active_period_start")?;
    let period_end: Option<String> = row.try_get("active_period_end")?;

    let active_period = match (period_start, period_end) {
        (Some(start), Some(end)) => Some(ActivePeriod {
            start: parse_time(&start)?,
            end: parse_time(&end)?,
        }),
        _ => None,
    };

    Ok(OncallRotation {
        id: row.try_get("id")?,
        schedule_id: row.try_get("schedule_id")?,
        name: row.try_get("name")?,
        starts_at: from_unix(row.try_get("starts_at")?)?,
        ends_at: ends_at.map(from_unix).transpose()?,
        length: u32::try_from(length)
            .map_err(|_| EscalationError::Serialization(format!("rotation length {}", length)))?,
        length_unit: LengthUnit::from_string(&unit)
            .ok_or_else(|| EscalationError::Serialization(format!("length unit '{}'", unit)))?,
        active_period,
        participants: Vec::new(),
    })
}

fn hydrate_shift(row: SqliteRow) -> Result<OncallShift> {
    Ok(OncallShift {
        rotation_id: row.try_get("rotation_id")?,
        participant_id: row.try_get("participant_id")?,
        user: UserRef::new(row.try_get("user_id")?, row.try_get::<String, _>("username")?),
        starts_at: from_unix(row.try_get("starts_at")?)?,
        ends_at: from_unix(row.try_get("ends_at")?)?,
    })
}

fn hydrate_pending(row: SqliteRow) -> Result<PendingEscalation> {
    Ok(PendingEscalation {
        id: row.try_get("id")?,
        policy_id: row.try_get("policy_id")?,
        rule_id: row.try_get("rule_id")?,
        target_id: row.try_get("alert_id")?,
        schedule_id: row.try_get("schedule_id")?,
        status: rule_status(row.try_get("status")?)?,
        process_at: from_unix(row.try_get("process_at")?)?,
        created_at: from_unix(row.try_get("created_at")?)?,
    })
}

fn hydrate_recurring(row: SqliteRow) -> Result<RecurringEscalation> {
    let last_notified_at: Option<i64> = row.try_get("last_notified_at")?;
    Ok(RecurringEscalation {
        id: row.try_get("id")?,
        policy_id: row.try_get("policy_id")?,
        rule_id: row.try_get("rule_id")?,
        target_id: row.try_get("alert_id")?,
        schedule_id: row.try_get("schedule_id")?,
        status: rule_status(row.try_get("status")?)?,
        elapsed_time_seconds: row.try_get("elapsed_time_seconds")?,
        last_notified_at: last_notified_at.map(from_unix).transpose()?,
        created_at: from_unix(row.try_get("created_at")?)?,
    })
}

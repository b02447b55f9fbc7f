//! On-call rotation resolution
//!
//! Determines who is on call for a schedule at a point in time:
//! 1. For each rotation, prefer a persisted shift covering the timestamp
//! 2. Otherwise generate the shift: round-robin over the active participants,
//!    one participant per elapsed whole cadence since the rotation start
//! 3. Union the users of every rotation
//!
//! Absent schedules, empty rotations and disabled features resolve to an
//! empty set rather than an error.

use crate::error::Result;
use crate::traits::{EscalationDirectory, Feature, FeatureGate};
use crate::types::{LengthUnit, OncallRotation, OncallSchedule, OncallShift, UserRef};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Synthetic shift generation
// ============================================================================

/// Computes shifts from rotation configuration alone
pub struct ShiftGenerator;

impl ShiftGenerator {
    /// Shift of `rotation` covering `at`, if any
    pub fn shift_at(
        rotation: &OncallRotation,
        offset: FixedOffset,
        at: DateTime<Utc>,
    ) -> Option<OncallShift> {
        if at < rotation.starts_at {
            return None;
        }
        if rotation.ends_at.is_some_and(|end| at >= end) {
            return None;
        }

        let cadence = rotation.shift_duration();
        let cadence_secs = cadence.num_seconds();
        if cadence_secs <= 0 {
            return None;
        }

        let participants = rotation.active_participants();
        if participants.is_empty() {
            return None;
        }

        let index = (at - rotation.starts_at).num_seconds() / cadence_secs;
        let participant = participants[(index % participants.len() as i64) as usize];

        let mut starts_at = rotation.starts_at + Duration::seconds(index * cadence_secs);
        let mut ends_at = starts_at + cadence;

        // Hourly rotations ignore the active period
        if let (Some(period), false) = (
            rotation.active_period,
            rotation.length_unit == LengthUnit::Hours,
        ) {
            if period.start != period.end {
                let (window_start, window_end) = active_window(period, offset, at)?;
                starts_at = starts_at.max(window_start);
                ends_at = ends_at.min(window_end);
            }
        }

        if let Some(end) = rotation.ends_at {
            ends_at = ends_at.min(end);
        }

        Some(OncallShift {
            rotation_id: rotation.id,
            participant_id: participant.id,
            user: participant.user.clone(),
            starts_at,
            ends_at,
        })
    }
}

/// Active window containing `at`, or None when `at` falls outside it
fn active_window(
    period: crate::types::ActivePeriod,
    offset: FixedOffset,
    at: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let local = at.with_timezone(&offset);
    let time = local.time();
    if !period.contains(time) {
        return None;
    }

    let date = local.date_naive();
    let (start_date, end_date) = if period.start < period.end {
        (date, date)
    } else if time >= period.start {
        (date, date.succ_opt()?)
    } else {
        (date.pred_opt()?, date)
    };

    let to_utc = |naive: NaiveDateTime| {
        offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    };

    Some((
        to_utc(start_date.and_time(period.start))?,
        to_utc(end_date.and_time(period.end))?,
    ))
}

// ============================================================================
// Resolution cache
// ============================================================================

/// Explicit memo of `(schedule, timestamp) -> users`, owned by the caller
///
/// The batch driver shares one cache per tick so escalations of the same
/// schedule resolve once.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: Mutex<HashMap<(i64, i64), Vec<UserRef>>>,
    hits: AtomicU64,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, schedule_id: i64, at: DateTime<Utc>) -> Option<Vec<UserRef>> {
        let found = self
            .entries
            .lock()
            .get(&(schedule_id, at.timestamp()))
            .cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn insert(&self, schedule_id: i64, at: DateTime<Utc>, users: Vec<UserRef>) {
        self.entries
            .lock()
            .insert((schedule_id, at.timestamp()), users);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves on-call users through persisted shifts with synthetic fallback
pub struct OncallResolver {
    directory: Arc<dyn EscalationDirectory>,
    gate: Arc<dyn FeatureGate>,
}

impl OncallResolver {
    pub fn new(directory: Arc<dyn EscalationDirectory>, gate: Arc<dyn FeatureGate>) -> Self {
        Self { directory, gate }
    }

    /// On-call users for a schedule id, sorted by user id
    pub async fn on_call_users(
        &self,
        schedule_id: i64,
        at: DateTime<Utc>,
        cache: &ResolutionCache,
    ) -> Result<Vec<UserRef>> {
        if let Some(users) = cache.get(schedule_id, at) {
            return Ok(users);
        }
        let schedule = self.directory.find_schedule(schedule_id).await?;
        let users = self.resolve(schedule.as_ref(), at).await?;
        cache.insert(schedule_id, at, users.clone());
        Ok(users)
    }

    /// On-call users for an already loaded schedule
    pub async fn resolve(
        &self,
        schedule: Option<&OncallSchedule>,
        at: DateTime<Utc>,
    ) -> Result<Vec<UserRef>> {
        let users: BTreeMap<i64, UserRef> = self
            .shifts_at(schedule, at)
            .await?
            .into_iter()
            .map(|shift| (shift.user.id, shift.user))
            .collect();
        Ok(users.into_values().collect())
    }

    /// One shift per rotation covering `at`
    pub async fn shifts_at(
        &self,
        schedule: Option<&OncallSchedule>,
        at: DateTime<Utc>,
    ) -> Result<Vec<OncallShift>> {
        let Some(schedule) = schedule else {
            return Ok(Vec::new());
        };
        if !self.gate.enabled(Feature::OncallSchedules, schedule.project_id) {
            debug!("On-call schedules disabled for project {}", schedule.project_id);
            return Ok(Vec::new());
        }

        let offset = schedule.offset();
        let mut shifts = Vec::with_capacity(schedule.rotations.len());

        for rotation in &schedule.rotations {
            match self.directory.persisted_shift(rotation.id, at).await? {
                Some(shift) if shift.covers(at) => shifts.push(shift),
                _ => {
                    if let Some(shift) = ShiftGenerator::shift_at(rotation, offset, at) {
                        shifts.push(shift);
                    }
                },
            }
        }

        Ok(shifts)
    }
}

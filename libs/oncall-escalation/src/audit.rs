//! Escalation audit trail
//!
//! `TracingAuditLog` emits one structured log line per escalation.
//! `FileAuditLog` appends notes to daily files per policy:
//! `{root}/escalations/{policy_id}/{YYYYMMDD}_{policy_id}.log`

use crate::error::{EscalationError, Result};
use crate::traits::AuditLog;
use crate::types::{EscalationPolicy, OncallSchedule, Target, UserRef};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Directory name used for alerts escalated without a known policy
const NO_POLICY_DIR: &str = "none";

/// Note body shared by every audit sink
///
/// Format: `alert 12 'disk full' | policy default | schedule primary | @ana, @bo`
pub fn format_note(
    target: &Target,
    policy: Option<&EscalationPolicy>,
    users: &[UserRef],
    schedule: &OncallSchedule,
) -> String {
    let recipients = users
        .iter()
        .map(|user| user.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "alert {} '{}' | policy {} | schedule {} | {}",
        target.id,
        target.title,
        policy.map_or("-", |p| p.name.as_str()),
        schedule.name,
        recipients
    )
}

/// Audit log writing to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record_escalation(
        &self,
        target: &Target,
        policy: Option<&EscalationPolicy>,
        users: &[UserRef],
        schedule: &OncallSchedule,
    ) -> Result<()> {
        info!(
            target: "escalation_audit",
            alert_id = target.id,
            schedule_id = schedule.id,
            "Escalated: {}",
            format_note(target, policy, users, schedule)
        );
        Ok(())
    }
}

/// Daily note file for one policy
struct PolicyNoteFile {
    dir: PathBuf,
    label: String,
    current_date: String,
    file: Option<File>,
}

impl PolicyNoteFile {
    fn new(root: &Path, label: String) -> Result<Self> {
        let dir = root.join("escalations").join(&label);
        fs::create_dir_all(&dir)
            .map_err(|e| EscalationError::Audit(format!("create {:?}: {}", dir, e)))?;
        Ok(Self {
            dir,
            label,
            current_date: String::new(),
            file: None,
        })
    }

    fn write_line(&mut self, message: &str) -> Result<()> {
        let now = Utc::now();
        let today = now.format("%Y%m%d").to_string();

        // New day, new file
        if self.current_date != today || self.file.is_none() {
            let path = self.dir.join(format!("{}_{}.log", today, self.label));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| EscalationError::Audit(format!("open {:?}: {}", path, e)))?;
            self.file = Some(file);
            self.current_date = today;
        }

        let line = format!(
            "{} [ESCALATION] {}\n",
            now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message
        );
        if let Some(file) = self.file.as_mut() {
            file.write_all(line.as_bytes())
                .map_err(|e| EscalationError::Audit(format!("write: {}", e)))?;
        }
        Ok(())
    }
}

/// Audit log appending to per-policy daily files
///
/// File I/O runs on the blocking pool.
pub struct FileAuditLog {
    notes: Arc<NoteFiles>,
}

struct NoteFiles {
    root: PathBuf,
    files: Mutex<HashMap<String, Arc<Mutex<PolicyNoteFile>>>>,
}

impl NoteFiles {
    fn note_file(&self, label: String) -> Result<Arc<Mutex<PolicyNoteFile>>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&label) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(Mutex::new(PolicyNoteFile::new(&self.root, label.clone())?));
        files.insert(label, Arc::clone(&file));
        Ok(file)
    }

    fn append(&self, label: String, message: &str) -> Result<()> {
        let file = self.note_file(label)?;
        let mut file = file.lock();
        file.write_line(message)
    }
}

impl FileAuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            notes: Arc::new(NoteFiles {
                root: root.into(),
                files: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.notes.root
    }
}

#[async_trait]
impl AuditLog for FileAuditLog {
    async fn record_escalation(
        &self,
        target: &Target,
        policy: Option<&EscalationPolicy>,
        users: &[UserRef],
        schedule: &OncallSchedule,
    ) -> Result<()> {
        let label = policy.map_or_else(|| NO_POLICY_DIR.to_string(), |p| p.id.to_string());
        let message = format_note(target, policy, users, schedule);
        let notes = Arc::clone(&self.notes);

        tokio::task::spawn_blocking(move || notes.append(label, &message))
            .await
            .map_err(|e| EscalationError::Audit(format!("audit writer task failed: {}", e)))?
    }
}

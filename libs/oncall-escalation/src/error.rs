//! Escalation Engine Error Types

use thiserror::Error;

/// Result type for escalation operations
pub type Result<T> = std::result::Result<T, EscalationError>;

/// Escalation engine errors
///
/// Stale state (resolved targets, satisfied rules, deleted rows) is not an
/// error; it surfaces as a dropped outcome instead.
#[derive(Debug, Error)]
pub enum EscalationError {
    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Notification dispatch failed
    #[error("Notification dispatch failed: {0}")]
    Dispatch(String),

    /// Audit trail write failed
    #[error("Audit log error: {0}")]
    Audit(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Work queue error
    #[error("Work queue error: {0}")]
    Queue(String),
}

impl From<sqlx::Error> for EscalationError {
    fn from(err: sqlx::Error) -> Self {
        EscalationError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for EscalationError {
    fn from(err: serde_json::Error) -> Self {
        EscalationError::Serialization(err.to_string())
    }
}

impl EscalationError {
    /// Whether a retry of the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EscalationError::Database(_) | EscalationError::Dispatch(_) | EscalationError::Queue(_)
        )
    }
}

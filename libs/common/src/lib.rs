//! Shared infrastructure for escalation services
//!
//! - logging: console + daily rolling files, separate audit file
//! - SQLite client with WAL and foreign keys
//! - shutdown signal handling

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig};
pub use shutdown::{wait_for_shutdown, ShutdownSignal};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteClient, SqlitePool, SqliteSettings};

// Re-export common dependencies
pub use anyhow;
pub use tokio;

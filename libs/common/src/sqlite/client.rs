use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool as SqlxSqlitePool,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub type SqlitePool = SqlxSqlitePool;

/// Connection tuning for a file database
#[derive(Debug, Clone)]
pub struct SqliteSettings {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl SqliteSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct SqliteClient {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteClient {
    /// Open (or create) a database file with WAL and foreign keys enabled
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_settings(SqliteSettings::new(db_path.as_ref())).await
    }

    pub async fn with_settings(settings: SqliteSettings) -> Result<Self> {
        let db_path_str = settings.path.to_string_lossy().to_string();

        if let Some(parent) = settings.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&settings.path)
            .journal_mode(SqliteJournalMode::Wal) // Concurrent readers while the driver claims
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(settings.busy_timeout)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("opening database {}", db_path_str))?;

        // 2MB page cache (negative value means KB)
        sqlx::query("PRAGMA cache_size = -2000")
            .execute(&pool)
            .await?;

        info!("SQLite database connected: {}", db_path_str);

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    /// Open an existing database without write access
    pub async fn new_readonly(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if !db_path.as_ref().exists() {
            warn!("Database file does not exist: {}", db_path_str);
            return Err(anyhow::anyhow!("Database file not found: {}", db_path_str));
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .journal_mode(SqliteJournalMode::Wal)
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("SQLite database connected (read-only): {}", db_path_str);

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            db_path: ":memory:".to_string(),
        })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            db_path: "from_pool".to_string(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Check if database is accessible
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Vacuum database to reclaim space
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("Database vacuumed: {}", self.db_path);
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

//! escsrv configuration
//!
//! Sources, lowest to highest priority: built-in defaults, YAML file,
//! `ESCSRV_` environment variables (`__` separates nesting, e.g.
//! `ESCSRV_ENGINE__BATCH_SIZE=50`), then CLI flags.

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use oncall_escalation::{DriverConfig, EscalationMode, StaticFeatureGate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file locations, first existing wins
const CONFIG_PATHS: &[&str] = &["config/escsrv.yaml", "escsrv.yaml"];

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub features: FeaturesConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "escsrv".to_string(),
        }
    }
}

/// SQLite database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/escalations.db"),
            max_connections: 10,
            busy_timeout_ms: 5000,
        }
    }
}

/// Escalation engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistence shape
    pub mode: EscalationMode,
    pub tick_ms: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub claim_lease_secs: i64,
    /// Capacity of the scheduler to driver hand-off channel
    pub queue_capacity: usize,
    /// How long delivered page keys are remembered
    pub dedup_retention_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let driver = DriverConfig::default();
        Self {
            mode: EscalationMode::OneShot,
            tick_ms: driver.tick_ms,
            batch_size: driver.batch_size,
            concurrency: driver.concurrency,
            claim_lease_secs: oncall_escalation::DEFAULT_CLAIM_LEASE_SECS,
            queue_capacity: 1024,
            dedup_retention_hours: 48,
        }
    }
}

impl EngineConfig {
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            tick_ms: self.tick_ms,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
        }
    }
}

/// Licensed features
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub oncall_schedules: bool,
    pub escalation_policies: bool,
    /// Projects with escalation switched off
    pub disabled_projects: Vec<i64>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            oncall_schedules: true,
            escalation_policies: true,
            disabled_projects: Vec::new(),
        }
    }
}

impl FeaturesConfig {
    pub fn gate(&self) -> StaticFeatureGate {
        self.disabled_projects.iter().fold(
            StaticFeatureGate::new(self.oncall_schedules, self.escalation_policies),
            |gate, project_id| gate.with_disabled_project(*project_id),
        )
    }
}

/// Where escalation notes go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSink {
    #[default]
    Tracing,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditSink,
    /// Root directory for the file sink
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSink::Tracing,
            dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Overridden by `ESCALATION_LOG_DIR`
    pub dir: Option<String>,
    pub json: bool,
    /// Separate file for `escalation_audit` events
    pub audit_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
            audit_file: true,
        }
    }
}

impl Config {
    /// Figment with defaults, the YAML file (if any) and environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        let file = path.map(Path::to_path_buf).or_else(|| {
            CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
        });
        if let Some(file) = file {
            figment = figment.merge(Yaml::file(file));
        }

        figment.merge(Env::prefixed("ESCSRV_").split("__"))
    }

    /// Load configuration
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
        }
        Self::figment(path)
            .extract()
            .context("Failed to load configuration")
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() {
            bail!("Service name cannot be empty");
        }
        if self.database.path.as_os_str().is_empty() {
            bail!("Database path cannot be empty");
        }
        if self.database.max_connections == 0 {
            bail!("database.max_connections must be greater than 0");
        }
        if self.engine.claim_lease_secs <= 0 {
            bail!("engine.claim_lease_secs must be greater than 0");
        }
        if self.engine.queue_capacity == 0 {
            bail!("engine.queue_capacity must be greater than 0");
        }
        if self.engine.dedup_retention_hours < 24 {
            // Daily keys must outlive their day bucket
            bail!("engine.dedup_retention_hours must be at least 24");
        }
        oncall_escalation::validate_config(&self.engine.driver_config())?;

        if self.audit.sink == AuditSink::File && self.audit.dir.as_os_str().is_empty() {
            bail!("audit.dir is required for the file audit sink");
        }
        Ok(())
    }
}

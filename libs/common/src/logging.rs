//! Logging setup for escalation services
//!
//! Console plus daily rolling file output. Events with the
//! `escalation_audit` target additionally go to a separate audit file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter,
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target used by the escalation audit trail
pub const AUDIT_TARGET: &str = "escalation_audit";

/// Environment variable overriding the log directory
pub const LOG_DIR_ENV: &str = "ESCALATION_LOG_DIR";

/// Default max file size: 100MB
const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2024-04-01T09:00:00.000000Z [INFO] Escalated alert 12 by rule 3 to 1 users`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Worker guards must outlive the subscriber
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();


fn keep_guard(guard: WorkerGuard) {
    let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
    match guards.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => poisoned.into_inner().push(guard),
    }
}

/// Log directory: `ESCALATION_LOG_DIR` env > configured value > "logs"
pub fn resolve_log_dir(configured: Option<&str>) -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            configured
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs"))
        })
}

// ============================================================================
// Daily rolling writer
// ============================================================================

/// Daily rolling file writer named `{YYYYMMDD}_{stem}.log`
///
/// Rotates to `{YYYYMMDD}_{stem}.{n}.log` once a file exceeds `max_file_size`.
#[derive(Clone)]
pub struct DailyRollingWriter {
    stem: String,
    log_dir: PathBuf,
    current_date: Arc<Mutex<String>>,
    current_file: Arc<Mutex<Option<File>>>,
    current_size: Arc<AtomicU64>,
    max_file_size: u64,
    rotation_count: Arc<AtomicU32>,
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> std::io::Error {
    std::io::Error::other(format!("Mutex poisoned: {}", e))
}

impl DailyRollingWriter {
    pub fn new(stem: impl Into<String>, log_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::with_max_size(stem, log_dir, DEFAULT_MAX_FILE_SIZE)
    }

    pub fn with_max_size(
        stem: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        max_file_size: u64,
    ) -> std::io::Result<Self> {
        let stem = stem.into();
        let log_dir = log_dir.into();
        let current_date = chrono::Local::now().format("%Y%m%d").to_string();

        fs::create_dir_all(&log_dir)?;
        let file = open_append(&log_dir.join(format!("{}_{}.log", current_date, stem)))?;
        let initial_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            stem,
            log_dir,
            current_date: Arc::new(Mutex::new(current_date)),
            current_file: Arc::new(Mutex::new(Some(file))),
            current_size: Arc::new(AtomicU64::new(initial_size)),
            max_file_size,
            rotation_count: Arc::new(AtomicU32::new(0)),
        })
    }

    fn rotate_by_size(&self) -> std::io::Result<()> {
        let current_date = self.current_date.lock().map_err(poisoned)?;
        let count = self.rotation_count.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self
            .log_dir
            .join(format!("{}_{}.{}.log", *current_date, self.stem, count));

        let file = open_append(&path)?;
        self.current_size.store(0, Ordering::SeqCst);
        *self.current_file.lock().map_err(poisoned)? = Some(file);
        Ok(())
    }

    fn get_writer(&self) -> std::io::Result<std::sync::MutexGuard<'_, Option<File>>> {
        let today = chrono::Local::now().format("%Y%m%d").to_string();
        let mut current_date = self.current_date.lock().map_err(poisoned)?;

        let current_path = self
            .log_dir
            .join(format!("{}_{}.log", *current_date, self.stem));

        // Date changed or file deleted underneath us
        if *current_date != today || !current_path.exists() {
            fs::create_dir_all(&self.log_dir)?;
            let file = open_append(&self.log_dir.join(format!("{}_{}.log", today, self.stem)))?;
            let initial_size = file.metadata().map(|m| m.len()).unwrap_or(0);

            if *current_date != today {
                *current_date = today;
                self.rotation_count.store(0, Ordering::SeqCst);
            }
            self.current_size.store(initial_size, Ordering::SeqCst);
            *self.current_file.lock().map_err(poisoned)? = Some(file);
        }

        self.current_file.lock().map_err(poisoned)
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl std::io::Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let current_size = self.current_size.load(Ordering::Relaxed);
        if current_size > 0 && current_size + buf.len() as u64 > self.max_file_size {
            self.rotate_by_size()?;
        }

        if let Some(ref mut file) = *self.get_writer()? {
            let written = file.write(buf)?;
            self.current_size
                .fetch_add(written as u64, Ordering::Relaxed);
            Ok(written)
        } else {
            Ok(0)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(ref mut file) = *self.get_writer()? {
            file.flush()
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as file stem and default filter target
    pub service_name: String,
    /// Base directory for log files
    pub log_dir: PathBuf,
    /// Filter spec used when `RUST_LOG` is unset (e.g. "info")
    pub level: String,
    /// JSON lines in the file layer
    pub enable_json: bool,
    /// Also write `escalation_audit` events to `{date}_{service}_audit.log`
    pub enable_audit_log: bool,
    /// Disable file output entirely (console only)
    pub console_only: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "escsrv".to_string(),
            log_dir: resolve_log_dir(None),
            level: "info".to_string(),
            enable_json: false,
            enable_audit_log: true,
            console_only: false,
        }
    }
}

impl LogConfig {
    /// Effective filter: `RUST_LOG` wins, otherwise the configured level
    /// with the service and engine crates at that level too
    pub fn filter_spec(&self) -> String {
        if let Ok(env) = std::env::var("RUST_LOG") {
            return env;
        }
        if self.level.contains('=') || self.level.contains(',') {
            return self.level.clone();
        }
        format!(
            "{level},{service}={level},oncall_escalation={level},{audit}=info",
            level = self.level,
            service = self.service_name,
            audit = AUDIT_TARGET
        )
    }
}

/// Initialize the global subscriber
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter_spec = config.filter_spec();
    let env_filter = EnvFilter::try_new(&filter_spec)?;

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, audit_layer) = if config.console_only {
        (None, None)
    } else {
        let writer = DailyRollingWriter::new(config.service_name.clone(), config.log_dir.clone())?;
        let (non_blocking, guard) = tracing_appender::non_blocking(writer);
        keep_guard(guard);

        let file_layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_level(true)
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };

        let audit_layer = if config.enable_audit_log {
            let audit_writer = DailyRollingWriter::new(
                format!("{}_audit", config.service_name),
                config.log_dir.clone(),
            )?;
            let (audit_non_blocking, audit_guard) = tracing_appender::non_blocking(audit_writer);
            keep_guard(audit_guard);

            Some(
                fmt::layer()
                    .with_writer(audit_non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .with_filter(filter::filter_fn(|metadata| {
                        metadata.target() == AUDIT_TARGET
                    }))
                    .boxed(),
            )
        } else {
            None
        };

        (Some(file_layer), audit_layer)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(audit_layer)
        .try_init()?;

    if config.console_only {
        tracing::info!("Logging: {} (console only)", config.service_name);
    } else {
        tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    }
    Ok(())
}

/// Console-only logging at `level`
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_with_config(LogConfig {
        level: level.to_string(),
        console_only: true,
        ..Default::default()
    })
}

mod app;
mod config;

use crate::app::App;
use crate::config::Config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::logging::{self, LogConfig};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Incident escalation worker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "ESCSRV_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Log level or filter spec (overrides config)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the escalation driver until Ctrl+C
    Run,

    /// Run a single driver pass and print the summary
    Tick,

    /// Create escalations for one alert
    Schedule {
        /// Alert ID
        alert_id: i64,
    },

    /// Check the configuration and exit
    Validate,

    /// Print the database schema, or apply it with --apply
    Schema {
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        config.database.path = db_path;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    let command = args.command.unwrap_or(Commands::Run);
    let log_config = LogConfig {
        service_name: config.service.name.clone(),
        log_dir: logging::resolve_log_dir(config.logging.dir.as_deref()),
        level: config.logging.level.clone(),
        enable_json: config.logging.json,
        enable_audit_log: config.logging.audit_file,
        // One-off commands only log to the console
        console_only: !matches!(command, Commands::Run),
    };
    logging::init_with_config(log_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return Err(e);
    }

    match command {
        Commands::Run => {
            info!("Starting {} ({:?} mode)", config.service.name, config.engine.mode);
            let app = App::open(&config).await?;
            app.run().await?;
        },
        Commands::Tick => {
            let app = App::open(&config).await?;
            let summary = app.tick().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Commands::Schedule { alert_id } => {
            let app = App::open(&config).await?;
            let count = app.schedule(alert_id).await?;
            println!("Scheduled {} escalations for alert {}", count, alert_id);
        },
        Commands::Validate => {
            println!(
                "{}",
                serde_yaml::to_string(&config).context("Failed to render configuration")?
            );
            println!("Configuration OK");
        },
        Commands::Schema { apply } => {
            if apply {
                let client = common::SqliteClient::new(&config.database.path).await?;
                oncall_escalation::init_schema(client.pool()).await?;
                println!("Schema applied to {}", client.path());
            } else {
                for ddl in oncall_escalation::schema::ALL_TABLES {
                    println!("{};", ddl.trim());
                }
            }
        },
    }

    Ok(())
}

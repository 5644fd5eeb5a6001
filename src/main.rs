//! # Nudge: routine reminder server
//!
//! Runs the reminder scheduler and the WebSocket/HTTP gateway devices connect to.
//!
//! Usage:
//!   nudge serve                          # Scheduler + gateway (default port 3077)
//!   nudge serve --port 8080              # Custom port
//!   nudge init-config                    # Write ~/.nudge/config.toml
//!   nudge status                         # Config and database summary

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nudge_core::NudgeConfig;
use nudge_core::traits::SystemClock;
use nudge_gateway::{AppState, PushHub};
use nudge_scheduler::{SchedulerDeps, SchedulerHandle, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nudge", version, about = "⏰ Nudge: routine reminders with adaptive timing")]
struct Cli {
    /// Config file (default: ~/.nudge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and gateway until Ctrl-C
    Serve {
        /// Gateway port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write a default config file and exit
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config plus routine and open notification counts
    Status,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
            .unwrap_or_else(NudgeConfig::default_path)
    }

    fn load_config(&self) -> Result<NudgeConfig> {
        let path = self.config_path();
        if path.exists() {
            NudgeConfig::load_from(&path).with_context(|| format!("loading {}", path.display()))
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(NudgeConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "nudge=debug,nudge_scheduler=debug,nudge_gateway=debug,tower_http=debug"
    } else {
        "nudge=info,nudge_scheduler=info,nudge_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Serve { port } => serve(&cli, *port).await,
        Commands::InitConfig { force } => init_config(&cli, *force),
        Commands::Status => status(&cli),
    }
}

fn open_store(config: &NudgeConfig) -> Result<SqliteStore> {
    let db_path = config.resolved_database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = SqliteStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    tracing::info!("💾 Database: {}", db_path.display());
    Ok(store)
}

async fn serve(cli: &Cli, port: Option<u16>) -> Result<()> {
    let mut config = cli.load_config()?;
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let store = Arc::new(open_store(&config)?);
    let hub = Arc::new(PushHub::default());
    let deps = SchedulerDeps {
        routines: store.clone(),
        notifications: store.clone(),
        transport: hub.clone(),
        metrics: store.clone(),
        clock: Arc::new(SystemClock),
    };
    let scheduler = Arc::new(SchedulerHandle::new(config.scheduler.clone(), deps)?);
    scheduler.start();

    let state = AppState::new(scheduler.clone(), hub);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Could not listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("👋 Shutdown requested");
    };

    let served = nudge_gateway::start(&config.gateway, state, shutdown).await;
    scheduler.stop().await;
    served
}

fn init_config(cli: &Cli, force: bool) -> Result<()> {
    let path = cli.config_path();
    if path.exists() && !force {
        println!("⚠️  Config already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    NudgeConfig::default().save_to(&path)?;
    println!("✅ Config written to {}", path.display());
    Ok(())
}

fn status(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    println!("⏰ Nudge {}\n", env!("CARGO_PKG_VERSION"));
    println!("Config:        {}", cli.config_path().display());
    println!("Database:      {}", config.resolved_database_path().display());
    println!("Gateway:       http://{}:{}", config.gateway.host, config.gateway.port);
    println!(
        "Scans:         due {}s, snooze {}s, retention {}s",
        config.scheduler.due_scan_interval_secs,
        config.scheduler.snooze_scan_interval_secs,
        config.scheduler.retention_sweep_interval_secs
    );
    println!(
        "Windows:       dedup ±{}m, retention {}d, UTC offset {:+}m",
        config.scheduler.dedup_window_minutes, config.scheduler.retention_days, config.scheduler.utc_offset_minutes
    );

    let store = open_store(&config)?;
    println!("\nRoutines:      {}", store.routine_count()?);
    println!("Open notifications: {}", store.open_notification_count()?);
    Ok(())
}

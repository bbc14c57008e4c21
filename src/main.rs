use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use shoal::config::{keys, Settings, DEFAULT_MAX_CONCURRENT_AGENTS};
use shoal::{
    AgentExecution, AgentRegistry, AgentScheduler, CachingAgent, CommandAgent, DrainFile,
    DynamicConfigSource, FileConfigSource, LockStore, NodeIdentity, NodeStatusProvider, WorkerPool,
};

#[derive(Parser)]
#[command(
    name = "shoald",
    about = "Fleet-coordinated caching agent scheduler",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for the lock database, config, and drain marker
    #[arg(long, env = "SHOAL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SHOAL_LOG")]
    log: Option<String>,

    /// Scheduler tick interval in milliseconds
    #[arg(long, env = "SHOAL_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "SHOAL_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler (default when no subcommand given).
    Serve,
    /// Inspect or repair the shared lock table.
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },
    /// Mark this node as draining: it stops claiming agents until `resume`.
    Drain,
    /// Return this node to service after a `drain`.
    Resume,
}

#[derive(Subcommand)]
enum LocksAction {
    /// List all lock rows.
    List {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Delete one agent's lock regardless of owner.
    Release { agent: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::new(args.data_dir, args.log, args.poll_interval_ms);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings, args.log_file).await,
        Command::Locks { action } => locks(settings, action).await,
        Command::Drain => {
            let drain = DrainFile::new(&settings.data_dir);
            std::fs::create_dir_all(&settings.data_dir)?;
            drain.drain()?;
            println!("node draining; scheduling paused ({})", drain.path().display());
            Ok(())
        }
        Command::Resume => {
            let drain = DrainFile::new(&settings.data_dir);
            drain.resume()?;
            println!("node resumed; scheduling active");
            Ok(())
        }
    }
}

async fn serve(settings: Settings, log_file: Option<PathBuf>) -> Result<()> {
    let _guard = init_logging(&settings.log, &settings.log_format, log_file);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %settings.data_dir.display(),
        "shoald starting"
    );

    let locks = Arc::new(
        LockStore::open(&settings.database, &settings.table_prefix)
            .await
            .context("opening lock store")?,
    );
    info!(table = locks.table(), db = %settings.database.display(), "lock store ready");

    let node_id = NodeIdentity::detect();
    info!(node = %node_id, "node identity ready");

    let registry = Arc::new(AgentRegistry::new());
    let interval_defaults = settings.intervals.defaults();
    for entry in &settings.agents {
        let agent = Arc::new(CommandAgent::from_entry(entry, interval_defaults));
        let execution: Arc<dyn AgentExecution> = agent.clone();
        let agent: Arc<dyn CachingAgent> = agent;
        registry.register(agent, execution);
    }
    if registry.is_empty() {
        warn!("no agents configured; scheduler will idle (add [[agents]] entries to config.toml)");
    } else {
        info!(count = registry.len(), "agents registered");
    }

    let dynamic: Arc<dyn DynamicConfigSource> =
        Arc::new(FileConfigSource::start(&settings.config_path()));
    let status = Arc::new(DrainFile::new(&settings.data_dir));
    if !status.is_enabled() {
        warn!(path = %status.path().display(), "drain marker present; node starts disabled");
    }

    // Sized once at startup so the pool accommodates a full tick's dispatch.
    let worker_capacity = settings.worker_capacity.unwrap_or_else(|| {
        dynamic
            .get_int(keys::MAX_CONCURRENT_AGENTS, DEFAULT_MAX_CONCURRENT_AGENTS)
            .max(1) as usize
    });

    let scheduler = Arc::new(AgentScheduler::new(
        node_id,
        registry,
        locks,
        dynamic,
        status,
        settings.intervals.resolver(),
        WorkerPool::new(worker_capacity),
        settings.poll_interval,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loop_handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;
    Ok(())
}

async fn locks(settings: Settings, action: LocksAction) -> Result<()> {
    let store = LockStore::open(&settings.database, &settings.table_prefix)
        .await
        .context("opening lock store")?;

    match action {
        LocksAction::List { json } => {
            let rows = store.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            if rows.is_empty() {
                println!("no locks held");
                return Ok(());
            }
            let now = shoal::storage::now_ms();
            println!("{:<50} {:<24} {:>8} {:>10}", "AGENT", "OWNER", "AGE", "LEASE");
            for row in rows {
                let age_secs = (now - row.acquired_at).max(0) / 1000;
                let lease = chrono::DateTime::from_timestamp_millis(row.expires_at)
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{:<50} {:<24} {:>7}s {:>10}",
                    row.agent_name, row.owner_node_id, age_secs, lease
                );
            }
            Ok(())
        }
        LocksAction::Release { agent } => {
            if store.force_release(&agent).await? {
                println!("released lock for {agent}");
            } else {
                println!("no lock held for {agent}");
            }
            Ok(())
        }
    }
}

/// Initialise tracing. Returns the appender guard when logging to a file;
/// the caller must keep it alive for the process lifetime.
fn init_logging(
    log_level: &str,
    log_format: &str,
    log_file: Option<PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("shoald.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e}; falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }
        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

//! drover
//!
//! Polls the task queue, runs one worker agent per claimed task under a
//! concurrency limit, and records outcomes and usage alerts as
//! notifications.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use drover_core::Config;
use drover_daemon::notify::{EmitterConfig, NotificationEmitter};
use drover_daemon::orchestration::{
    AgentRunner, ConcurrencyGate, OrchestratorContext, RunnerConfig, Scheduler, SchedulerConfig,
};
use drover_daemon::queue::{BeadsQueue, TaskQueue};
use drover_daemon::storage::Database;
use drover_daemon::usage::{ScriptReporter, UsageMonitor, UsageMonitorConfig};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version, about = "drover - autonomous task orchestrator")]
struct Args {
    /// JSON settings file (defaults to the user config dir, if present)
    #[arg(long, global = true, env = "DROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, global = true, env = "DROVER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "DROVER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "DROVER_LOG_JSON")]
    log_json: bool,

    /// Maximum concurrent worker agents
    #[arg(long, global = true, env = "DROVER_CONCURRENCY")]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator (default).
    Run,
    /// Run one usage check and exit.
    CheckUsage,
    /// Clear the alert watermark of a usage bucket.
    ResetUsage {
        /// Bucket key, e.g. `week_all`
        bucket: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    drover_core::tracing_init::init_tracing(
        &drover_core::tracing_init::default_filter(&args.log_level),
        args.log_json,
    );

    let mut config = drover_core::config::load_config(args.config.as_deref())?;
    if let Some(concurrency) = args.concurrency {
        config.orchestrator.concurrency = concurrency;
    }
    if let Some(path) = &args.db_path {
        config.orchestrator.database_path = Some(path.clone());
    }
    config.validate()?;

    let db_path = config.database_path();
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, db).await,
        Command::CheckUsage => check_usage(&config, db).await,
        Command::ResetUsage { bucket } => {
            let (emitter, _writer) = NotificationEmitter::spawn(Arc::new(db.clone()), EmitterConfig::default());
            let monitor = usage_monitor(&config, db, emitter);
            let cleared = monitor.reset(&bucket).await?;
            info!(bucket = %bucket, cleared, "Usage watermark reset");
            Ok(())
        }
    }
}

fn usage_monitor(config: &Config, db: Database, emitter: NotificationEmitter) -> UsageMonitor {
    let reporter = ScriptReporter::new(&config.usage.script_path, &config.orchestrator.working_dir);
    UsageMonitor::new(
        Arc::new(reporter),
        db,
        emitter,
        UsageMonitorConfig::from_config(config),
    )
}

async fn check_usage(config: &Config, db: Database) -> anyhow::Result<()> {
    let (emitter, writer) = NotificationEmitter::spawn(Arc::new(db.clone()), EmitterConfig::default());
    let monitor = usage_monitor(config, db, emitter.clone());
    let alerts = monitor.check().await?;
    for alert in &alerts {
        info!(bucket = %alert.bucket, threshold = alert.threshold, "{}", alert.line());
    }
    emitter.flush().await;
    drop(monitor);
    drop(emitter);
    let _ = writer.await;
    Ok(())
}

async fn run(config: Config, db: Database) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        concurrency = config.orchestrator.concurrency,
        working_dir = %config.orchestrator.working_dir.display(),
        "Starting drover"
    );

    for dir in [config.log_dir(), config.agent_working_dir()] {
        std::fs::create_dir_all(&dir)?;
    }

    let queue = BeadsQueue::new(&config.orchestrator.queue_bin, &config.orchestrator.working_dir);
    queue.ensure_initialized().await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(queue);

    let (emitter, writer) = NotificationEmitter::spawn(Arc::new(db.clone()), EmitterConfig::default());

    let ctx = OrchestratorContext {
        queue,
        runner: AgentRunner::new(RunnerConfig::from_config(&config)),
        gate: Arc::new(ConcurrencyGate::new(config.orchestrator.concurrency)),
        emitter: emitter.clone(),
        config: SchedulerConfig::from_config(&config),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let scheduler_handle = tokio::spawn(Scheduler::new(ctx).run(shutdown_tx.subscribe()));
    let monitor = usage_monitor(&config, db, emitter.clone());
    let monitor_handle = tokio::spawn(monitor.run(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so workers don't talk to systemd.
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "systemd readiness notification failed");
    }

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Scheduler task failed");
    }
    let _ = monitor_handle.await;

    emitter.flush().await;
    drop(emitter);
    let _ = writer.await;

    info!("drover stopped");
    Ok(())
}

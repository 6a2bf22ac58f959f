//! cadence-send - Scheduler daemon
//!
//! Runs the sweep pass (publish due posts) and the generation pass (create
//! upcoming posts for automated users) on independent intervals.

use clap::Parser;
use libcadence::config::UpstreamConfig;
use libcadence::error::ConfigError;
use libcadence::logging::{LogFormat, LoggingConfig};
use libcadence::upstream::http::{HttpContentGenerator, HttpUpstream};
use libcadence::{CadenceError, Config, Database, Result, Scheduler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cadence-send")]
#[command(version)]
#[command(about = "Scheduler daemon for automated posting")]
#[command(long_about = "\
cadence-send - Scheduler daemon for automated posting

DESCRIPTION:
    cadence-send is a long-running daemon that drives two recurring passes:

    sweep       Publishes every pending post whose time has come, refreshing
                upstream tokens as needed, and records posted/failed.
    generation  For users with automation enabled, creates upcoming posts
                from their posting days, time and topics, within quota.

    The passes run on independent intervals. A pass that is still running
    when its next tick arrives causes that tick to be skipped.

USAGE:
    # Run in foreground (logs to stderr)
    cadence-send

    # Sweep every 30 seconds, generate every 15 minutes
    cadence-send --sweep-interval 30 --generation-interval 900

    # JSON logs for a log pipeline
    cadence-send --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight passes complete)

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml
    Database location: ~/.local/share/cadence/cadence.db

    [scheduler]
    sweep_interval = 60        # seconds between sweep passes
    generation_interval = 3600 # seconds between generation passes
    pending_ceiling = 3        # future posts kept per automated user
    call_timeout = 10          # seconds allowed per upstream call

    Environment:
        CADENCE_CONFIG, CADENCE_DB_PATH, CADENCE_LOG_FORMAT,
        CADENCE_LOG_LEVEL, CADENCE_UPSTREAM_CLIENT_SECRET,
        CADENCE_GENERATOR_API_KEY

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Sweep interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    sweep_interval: Option<u64>,

    /// Generation interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    generation_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Run each pass once and exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    logging.init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(seconds) = cli.sweep_interval {
        config.scheduler.sweep_interval = seconds;
    }
    if let Some(seconds) = cli.generation_interval {
        config.scheduler.generation_interval = seconds;
    }
    config.validate()?;

    let db = Database::new(&config.database.path).await?;
    let scheduler = build_scheduler(db, &config)?;

    info!("cadence-send daemon starting");

    if cli.once {
        let sweep = scheduler.run_sweep_pass().await?;
        let generation = scheduler.run_generation_pass().await?;
        info!(
            posted = sweep.posted,
            failed = sweep.failed,
            generated = generation.posts_created,
            "cadence-send: ran passes once, exiting"
        );
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let handle = scheduler.start();
    while !shutdown.load(Ordering::Relaxed) {
        sleep(Duration::from_millis(250)).await;
    }

    info!("Shutdown requested, waiting for in-flight passes");
    handle.stop().await;
    info!("cadence-send daemon stopped");
    Ok(())
}

fn build_scheduler(db: Database, config: &Config) -> Result<Scheduler> {
    let timeout = config.scheduler.call_timeout();

    let upstream_config: &UpstreamConfig = config
        .upstream
        .as_ref()
        .ok_or_else(|| ConfigError::MissingField("upstream".to_string()))?;
    let upstream = HttpUpstream::new(upstream_config, timeout)?;

    let generator_config = config
        .generator
        .as_ref()
        .ok_or_else(|| ConfigError::MissingField("generator".to_string()))?;
    let generator = HttpContentGenerator::new(generator_config, timeout)?;

    Ok(Scheduler::new(
        db,
        Arc::new(upstream),
        Arc::new(generator),
        config,
    ))
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| CadenceError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

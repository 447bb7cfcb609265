//! castline-send - Dispatch daemon for scheduled posts
//!
//! Polls the queue, publishes due targets through the configured platform
//! bridges, schedules retries and resolves post status.

use anyhow::Context;
use clap::Parser;
use libcastline::platforms::PlatformRegistry;
use libcastline::{CastlineError, Config, Database, PublishPipeline};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "castline-send")]
#[command(version)]
#[command(about = "Dispatch daemon for scheduled posts")]
#[command(long_about = "\
castline-send - Dispatch daemon for scheduled posts

DESCRIPTION:
    castline-send is a long-running daemon that watches the Castline queue
    and publishes scheduled posts to every selected social profile.

    Each cycle it recovers claims abandoned by crashed workers, expands due
    posts into per-profile targets, publishes due targets in parallel, and
    schedules retries with exponential backoff for transient failures.
    Several instances may share one database.

USAGE:
    # Run in foreground (logs to stderr)
    castline-send

    # Poll every 10 seconds
    castline-send --poll-interval 10

    # Run a single cycle and print its report as JSON
    castline-send --once

    # Publish to mock platforms instead of the configured bridges
    castline-send --dry-run --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight attempts finish first)

CONFIGURATION:
    Configuration file: ~/.config/castline/config.toml

    [dispatch]
    poll_interval_secs = 60
    max_attempts = 5
    backoff_base_secs = 60
    backoff_cap_secs = 21600
    stale_after_secs = 900
    concurrency = 10

    [platforms.instagram]
    endpoint = \"https://bridge.internal/instagram/publish\"

    Override with environment variables:
        CASTLINE_CONFIG      - Path to config file
        CASTLINE_DB_PATH     - Path to database file
        CASTLINE_LOG_FORMAT  - text, json or pretty
        CASTLINE_LOG_LEVEL   - default log level

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run a single dispatch cycle, print its report and exit
    #[arg(long)]
    once: bool,

    /// Publish to mock platforms instead of the configured bridges
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    libcastline::logging::init_default(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<CastlineError>()
            .map_or(1, CastlineError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;

    if let Some(secs) = cli.poll_interval {
        config.dispatch.poll_interval_secs = i64::try_from(secs).map_err(|_| {
            CastlineError::InvalidInput(format!("poll interval {} is too large", secs))
        })?;
    }

    config.validate()?;

    let db = Database::new(&config.database_path()).await?;

    let platforms = if cli.dry_run {
        info!("Dry run: publishing to mock platforms");
        PlatformRegistry::dry_run()
    } else {
        PlatformRegistry::from_config(&config)?
    };

    if platforms.is_empty() {
        warn!("No platforms configured; due targets will fail with no_publisher");
    }

    let pipeline = PublishPipeline::new(db, platforms, &config);

    if cli.once {
        let report = pipeline
            .run_cycle(chrono::Utc::now().timestamp())
            .await?;
        println!(
            "{}",
            serde_json::to_string(&report).context("Failed to serialize cycle report")?
        );
        return Ok(());
    }

    info!("castline-send daemon starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    pipeline.run(shutdown).await;

    info!("castline-send daemon stopped");
    Ok(())
}

/// Set the shutdown flag on SIGINT or SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

/// Set the shutdown flag on Ctrl-C
#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

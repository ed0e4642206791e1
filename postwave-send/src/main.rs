//! postwave-send - Background daemon for scheduled publishing
//!
//! Polls for due posts and hands each one to the orchestrator. A credential
//! sweeper runs alongside and refreshes tokens before they expire.

use chrono::Utc;
use clap::Parser;
use futures::stream::{self, StreamExt};
use libpostwave::logging::{LogFormat, LoggingConfig};
use libpostwave::{
    default_registry, Config, CredentialSweeper, Database, Orchestrator, PostwaveError,
    PublishOutcome, PublishStore, Result,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Rate windows older than this are deleted; the longest window is a day.
const RATE_WINDOW_RETENTION: Duration = Duration::from_secs(2 * 24 * 3600);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "postwave-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
postwave-send - Background daemon for scheduled publishing

DESCRIPTION:
    postwave-send is a long-running daemon that publishes scheduled posts
    to X, LinkedIn, Threads, and TikTok when they come due.

    Each poll selects posts that are scheduled or waiting for a retry and
    whose time has come, then publishes them with bounded concurrency.
    Thread progress is checkpointed per segment, so an interrupted run
    resumes without double-posting. Rate-limited posts are suspended until
    the platform's reset time instead of blocking the daemon.

    A credential sweeper refreshes OAuth tokens shortly before they expire.

USAGE:
    # Run in foreground (logs to stderr)
    postwave-send

    # Poll every 10 seconds with JSON logs
    postwave-send --poll-interval 10 --log-format json

    # Process due posts once and exit
    postwave-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the in-flight batch)

CONFIGURATION:
    Configuration file: $POSTWAVE_CONFIG or ~/.config/postwave/config.toml

    [database]
    path = \"~/.local/share/postwave/postwave.db\"

    [security]
    encryption_key_env = \"POSTWAVE_ENCRYPTION_KEY\"

    [publishing]
    poll_interval = \"30s\"
    concurrency = 4
    max_attempts = 3

    [platforms.twitter]
    client_id = \"...\"
    client_secret_env = \"POSTWAVE_TWITTER_SECRET\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or credential error
    3 - Invalid input
")]
struct Cli {
    /// Path to the config file (overrides POSTWAVE_CONFIG)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json, pretty
    #[arg(long, value_name = "FORMAT", env = "POSTWAVE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Process due posts once and exit
    #[arg(long)]
    once: bool,

    /// Do not run the credential sweeper
    #[arg(long)]
    no_sweep: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, "info".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("postwave-send: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let key = config.encryption_key()?;
    let db = Arc::new(Database::new(&config.database.path).await?);
    let store: Arc<dyn PublishStore> = db.clone();
    let registry = Arc::new(default_registry(&config));

    info!("postwave-send daemon starting");
    debug!("Registered platforms: {}", registry.list().join(", "));

    let orchestrator =
        Orchestrator::from_config(store.clone(), registry.clone(), key.clone(), &config);
    let sweeper = Arc::new(
        CredentialSweeper::from_config(store, registry, key, &config)
            .with_events(orchestrator.events().clone()),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval = cli
        .poll_interval
        .map(Duration::from_secs)
        .unwrap_or(config.publishing.poll_interval);
    info!("Poll interval: {:?}", poll_interval);

    if cli.once {
        if !cli.no_sweep {
            sweeper.run_once(Utc::now()).await?;
        }
        run_maintenance(&db, &config).await?;
        process_due_posts(&db, &orchestrator, &config).await?;
        info!("postwave-send: processed due posts once, exiting");
        return Ok(());
    }

    let sweep_task = if cli.no_sweep {
        info!("Credential sweeper disabled");
        None
    } else {
        let sweeper = sweeper.clone();
        let flag = shutdown.clone();
        Some(tokio::spawn(async move { sweeper.run(flag).await }))
    };

    run_daemon_loop(&db, &orchestrator, &config, poll_interval, shutdown).await;

    if let Some(task) = sweep_task {
        if let Err(e) = task.await {
            warn!("Credential sweeper task ended abnormally: {}", e);
        }
    }

    info!("postwave-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| PostwaveError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            if matches!(signal, SIGINT | SIGTERM) {
                info!("Received shutdown signal, stopping gracefully...");
                shutdown.store(true, Ordering::Relaxed);
                break;
            }
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

async fn run_daemon_loop(
    db: &Database,
    orchestrator: &Orchestrator,
    config: &Config,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_maintenance: Option<Instant> = None;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        if last_maintenance.map_or(true, |at| at.elapsed() >= MAINTENANCE_INTERVAL) {
            if let Err(e) = run_maintenance(db, config).await {
                error!("Maintenance failed: {}", e);
            }
            last_maintenance = Some(Instant::now());
        }

        if let Err(e) = process_due_posts(db, orchestrator, config).await {
            error!("Error processing posts: {}", e);
        }

        // Sleep until next poll (check shutdown every second)
        let deadline = Instant::now() + poll_interval;
        while Instant::now() < deadline {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1).min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }
}

/// Requeue posts whose publish run died and drop old rate windows.
async fn run_maintenance(db: &Database, config: &Config) -> Result<()> {
    let now = Utc::now();

    // A live run finishes within one operation timeout; give it two
    let stale_for = chrono::Duration::from_std(config.publishing.operation_timeout * 2)
        .unwrap_or_else(|_| chrono::Duration::minutes(20));
    let released = db
        .release_stale_publishing((now - stale_for).timestamp(), now.timestamp())
        .await?;
    if released > 0 {
        warn!("Requeued {} post(s) left in publishing by an interrupted run", released);
    }

    let retention = chrono::Duration::from_std(RATE_WINDOW_RETENTION)
        .unwrap_or_else(|_| chrono::Duration::days(2));
    let removed = db
        .cleanup_rate_windows((now - retention).timestamp())
        .await?;
    if removed > 0 {
        debug!("Removed {} expired rate window(s)", removed);
    }
    Ok(())
}

/// Publish every post that is due, a bounded number at a time.
async fn process_due_posts(
    db: &Database,
    orchestrator: &Orchestrator,
    config: &Config,
) -> Result<()> {
    let due_posts = db
        .due_posts(Utc::now().timestamp(), config.publishing.batch_size)
        .await?;

    if due_posts.is_empty() {
        return Ok(());
    }

    info!("Found {} post(s) due for publishing", due_posts.len());

    let results: Vec<(String, Result<PublishOutcome>)> = stream::iter(due_posts)
        .map(|post| async move {
            let outcome = orchestrator.publish_post(&post.id).await;
            (post.id, outcome)
        })
        .buffer_unordered(config.publishing.concurrency)
        .collect()
        .await;

    for (post_id, outcome) in results {
        match outcome {
            Ok(PublishOutcome::Published { partial, external_post_id, .. }) => info!(
                "Post {} published{} ({})",
                post_id,
                if partial { " with partial failures" } else { "" },
                external_post_id.as_deref().unwrap_or("no external id")
            ),
            Ok(PublishOutcome::Suspended { next_attempt_at, reason, .. }) => info!(
                "Post {} suspended until {}: {}",
                post_id, next_attempt_at, reason
            ),
            Ok(PublishOutcome::Failed { reason, .. }) => {
                warn!("Post {} failed: {}", post_id, reason)
            }
            Ok(PublishOutcome::Skipped { reason }) => {
                debug!("Post {} skipped: {}", post_id, reason)
            }
            Err(e) => error!("Post {} could not be processed: {}", post_id, e),
        }
    }

    Ok(())
}

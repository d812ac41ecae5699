//! syndicast-send - Background daemon that drains the publish queue
//!
//! Polls the task queue for content items that are due, loads each one from
//! the content directory and publishes it through the orchestrator.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use libsyndicast::logging::LoggingConfig;
use libsyndicast::quota::QuotaCounter;
use libsyndicast::{
    AttemptStatus, Config, ContentSource, Database, JsonDirectorySource, PublishTask,
    PublishingOrchestrator, SyndicastError, TaskQueue,
};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// How long a task whose publish returned an error waits before it runs again
const FAILED_TASK_DELAY: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "syndicast-send")]
#[command(version)]
#[command(about = "Background daemon that publishes queued blog posts")]
#[command(long_about = "\
syndicast-send - Background daemon that publishes queued blog posts

DESCRIPTION:
    syndicast-send is a long-running daemon that drains the Syndicast
    publish queue. Each due task names a content item, which is loaded
    from <publishing.content_dir>/<content_id>.json and published once.

    Transient failures are rescheduled on the queue with exponential
    backoff. Content that was already published is never posted twice.

USAGE:
    # Run in foreground (logs to stderr)
    syndicast-send

    # Run with custom poll interval
    syndicast-send --poll-interval 30

    # Enable verbose logging
    syndicast-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes current post)

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml
    Override with SYNDICAST_CONFIG=/path/to/config.toml

    [database]
    path = \"~/.local/share/syndicast/syndicast.db\"

    [publishing]
    content_dir = \"~/blog/posts\"
    max_attempts = 3

LOGGING:
    SYNDICAST_LOG_FORMAT = text | json | pretty
    SYNDICAST_LOG_LEVEL  = info (any tracing filter directive)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime or configuration error
    2 - Platform authorization must be renewed
    3 - Invalid input
")]
struct Cli {
    /// Poll interval in seconds
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to check the publish queue (default: 60)")]
    poll_interval: Option<u64>,

    /// Maximum tasks taken from the queue per poll
    #[arg(long, value_name = "COUNT", default_value_t = 10)]
    batch_size: usize,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run once and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Process due tasks once and exit (for testing)")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("syndicast-send failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<SyndicastError>()
            .map(SyndicastError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let content_dir = config.content_dir()?;

    let db = Arc::new(Database::new(&config.database.path).await?);
    let orchestrator = PublishingOrchestrator::from_config(&config, db.clone())?;
    let source = JsonDirectorySource::new(content_dir);

    info!(content_dir = %source.dir().display(), "syndicast-send daemon starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let daemon = Daemon {
        db,
        orchestrator,
        source,
        batch_size: cli.batch_size.max(1),
        shutdown,
    };

    if cli.once {
        daemon.process_due().await?;
        info!("syndicast-send: processed queue once, exiting");
    } else {
        let poll_interval = cli.poll_interval.unwrap_or(60).max(1);
        info!("Poll interval: {}s", poll_interval);
        daemon.run_loop(poll_interval).await;
    }

    info!("syndicast-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

struct Daemon {
    db: Arc<Database>,
    orchestrator: PublishingOrchestrator,
    source: JsonDirectorySource,
    batch_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    async fn run_loop(&self, poll_interval: u64) {
        loop {
            if self.stopping() {
                info!("Shutdown requested, stopping daemon loop");
                break;
            }

            if let Err(e) = self.process_due().await {
                error!("Error processing queue: {}", e);
            }

            // Sleep until next poll (check shutdown every second)
            for _ in 0..poll_interval {
                if self.stopping() {
                    break;
                }
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// One poll: re-queue overdue retries, then publish every due task
    async fn process_due(&self) -> libsyndicast::Result<()> {
        let now = Utc::now();
        let queue = self.orchestrator.queue();

        // Retries whose queue entry was lost (crash, failed enqueue)
        let overdue = self.orchestrator.tracker().due_for_retry(now).await?;
        if !overdue.is_empty() {
            let pending = queue.pending().await?;
            for attempt in overdue {
                if pending.iter().any(|task| task.content_id == attempt.content_id) {
                    continue;
                }
                debug!(content_id = %attempt.content_id, "Re-queueing overdue retry");
                queue.enqueue(&attempt.content_id).await?;
            }
        }

        match QuotaCounter::purge_expired(self.db.as_ref(), now).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Purged expired quota windows"),
            Err(e) => warn!("Could not purge quota windows: {}", e),
        }

        let tasks = queue.take_due(Utc::now(), self.batch_size).await?;
        if tasks.is_empty() {
            return Ok(());
        }

        info!("Found {} task(s) due for publishing", tasks.len());

        run_batch(
            queue.as_ref(),
            tasks,
            || self.stopping(),
            move |content_id| async move { self.publish_one(&content_id).await },
        )
        .await;

        Ok(())
    }

    async fn publish_one(&self, content_id: &str) -> libsyndicast::Result<()> {
        let post = match self.source.load(content_id).await {
            Ok(Some(post)) => post,
            Ok(None) => {
                warn!(content_id, "Content item no longer exists, dropping task");
                return Ok(());
            }
            Err(e) => {
                error!(content_id, "Could not load content item: {}", e);
                return Ok(());
            }
        };

        if let Err(e) = post.validate() {
            error!(content_id, "Content item is invalid: {}", e);
            return Ok(());
        }

        let attempt = self.orchestrator.publish(&post).await?;
        let code = attempt
            .error_code
            .map(|code| code.to_string())
            .unwrap_or_default();
        match attempt.status {
            AttemptStatus::Success => info!(
                content_id,
                remote_post_id = attempt.remote_post_id.as_deref().unwrap_or_default(),
                image_status = attempt.image_status.as_str(),
                "Published"
            ),
            AttemptStatus::Retrying => warn!(
                content_id,
                attempt = attempt.attempt_count,
                code = %code,
                "Publish failed, retry scheduled"
            ),
            AttemptStatus::Pending => debug!(content_id, "Being published by another worker"),
            AttemptStatus::Failed => warn!(
                content_id,
                status = attempt.status.as_str(),
                code = %code,
                "Publish did not succeed: {}",
                attempt.error_message.as_deref().unwrap_or_default()
            ),
        }

        Ok(())
    }
}

/// Publish each task in order.
///
/// Tasks were already removed from the queue, so none may be dropped: a task
/// whose publish errors is put back after [`FAILED_TASK_DELAY`] and the batch
/// carries on, and once shutdown is requested every task not yet started is
/// put back as due.
async fn run_batch<S, F, Fut>(
    queue: &dyn TaskQueue,
    tasks: Vec<PublishTask>,
    stopping: S,
    mut publish: F,
) where
    S: Fn() -> bool,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = libsyndicast::Result<()>>,
{
    let mut remaining = tasks.into_iter();
    while let Some(task) = remaining.next() {
        if stopping() {
            for task in std::iter::once(task).chain(remaining.by_ref()) {
                requeue(queue, &task.content_id, Duration::ZERO).await;
            }
            break;
        }

        if let Err(e) = publish(task.content_id.clone()).await {
            error!(content_id = %task.content_id, "Publish aborted, task re-queued: {}", e);
            requeue(queue, &task.content_id, FAILED_TASK_DELAY).await;
        }
    }
}

async fn requeue(queue: &dyn TaskQueue, content_id: &str, delay: Duration) {
    if let Err(e) = queue.enqueue_delayed(content_id, delay).await {
        error!(content_id, "Could not re-queue task: {}", e);
    }
}

//! Clipferry daemon.
//!
//! Wires the store, scheduler, extractor, guards and delivery sink
//! together and runs until interrupted. Chat-platform integration
//! subscribes to the same event surface this binary logs from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use clipferry::{DeliveringRunner, DeliverySink};
use clipferry_extractor::StrategyExecutor;
use clipferry_guards::{DiskGuard, GuardSettings, MemoryGuard};
use clipferry_protocol::{defaults, JobEvent, RelayConfig};
use clipferry_queue::{DownloadQueue, SchedulerSettings};
use clipferry_store::JobStore;

/// Exit code asking the supervisor for a clean restart.
const EMERGENCY_EXIT_CODE: i32 = 12;

#[derive(Parser, Debug)]
#[command(name = "clipferry", about = "Download orchestration daemon for a chat media relay")]
struct Args {
    /// Job store path (SQLite). Defaults to ~/.clipferry/jobs.sqlite
    #[arg(long, env = "CLIPFERRY_STORE")]
    store: Option<PathBuf>,

    /// Temp directory for in-flight downloads. Defaults to ~/.clipferry/tmp
    #[arg(long, env = "CLIPFERRY_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// External extractor binary
    #[arg(long, env = "CLIPFERRY_EXTRACTOR", default_value = defaults::DEFAULT_EXTRACTOR_BIN)]
    extractor: String,

    /// Maximum concurrent downloads
    #[arg(long, env = "CLIPFERRY_MAX_CONCURRENT", default_value_t = defaults::DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Maximum queued jobs before admissions fail closed
    #[arg(long, env = "CLIPFERRY_MAX_QUEUE", default_value_t = defaults::DEFAULT_MAX_QUEUE_SIZE)]
    max_queue: usize,

    /// Retry budget per job for transient failures
    #[arg(long, env = "CLIPFERRY_MAX_RETRIES", default_value_t = defaults::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Inline delivery size limit in bytes; larger artifacts go to a file host
    #[arg(long, env = "CLIPFERRY_INLINE_LIMIT", default_value_t = defaults::DEFAULT_INLINE_LIMIT_BYTES)]
    inline_limit: u64,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,

    /// URLs to enqueue at startup
    #[arg(value_name = "URL")]
    urls: Vec<String>,
}

impl Args {
    fn into_config(self) -> (RelayConfig, Vec<String>, bool) {
        let mut config = RelayConfig {
            extractor_bin: self.extractor,
            max_concurrent: self.max_concurrent,
            max_queue_size: self.max_queue,
            max_retries: self.max_retries,
            inline_limit_bytes: self.inline_limit,
            ..RelayConfig::default()
        };
        if let Some(store) = self.store {
            config.store_path = store;
        }
        if let Some(temp_dir) = self.temp_dir {
            config.temp_dir = temp_dir;
        }
        (config, self.urls, self.verbose)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, urls, verbose) = Args::parse().into_config();
    config.validate().context("invalid configuration")?;

    clipferry_logging::init_logging("clipferry", verbose)?;
    info!("Starting Clipferry");
    info!("  Store: {}", config.store_path.display());
    info!("  Temp dir: {}", config.temp_dir.display());
    info!(
        "  Limits: {} concurrent, {} queued, {} retries",
        config.max_concurrent, config.max_queue_size, config.max_retries
    );

    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .with_context(|| format!("cannot create temp dir {}", config.temp_dir.display()))?;

    let store = Arc::new(JobStore::open(&config.store_path).await?);

    let executor = StrategyExecutor::new(&config);
    match executor.probe_version().await {
        Some(version) => info!("Extractor version: {}", version),
        None => warn!("Extractor version probe failed"),
    }

    let client = reqwest::Client::new();
    let sink = Arc::new(DeliverySink::with_default_hosts(config.inline_limit_bytes, &client));
    let runner = Arc::new(DeliveringRunner::new(executor, sink));

    let (handle, recovered) =
        DownloadQueue::start_recovered(SchedulerSettings::from(&config), store.clone(), runner)
            .await
            .context("failed to recover job queue")?;

    // This daemon's delivery contexts are self-contained JSON blobs, so
    // stored values re-attach verbatim. A chat frontend would re-resolve
    // its message handles here and omit the dead ones.
    let attachments: HashMap<_, _> = recovered
        .iter()
        .map(|job| (job.tag.clone(), job.caller_context.clone()))
        .collect();
    let report = handle.resume(attachments).await;
    if report.resumed + report.dropped > 0 {
        info!("Recovery: {} job(s) resumed, {} dropped", report.resumed, report.dropped);
    }

    let guard_settings = GuardSettings::from(&config);
    MemoryGuard::new(
        guard_settings.clone(),
        config.temp_dir.clone(),
        handle.clone(),
        || std::process::exit(EMERGENCY_EXIT_CODE),
    )
    .spawn();
    DiskGuard::new(guard_settings, config.temp_dir.clone()).spawn();

    spawn_purge_loop(store.clone(), &config);
    spawn_event_logger(handle.subscribe());

    for url in urls {
        match handle.admit(url.clone(), serde_json::json!({ "source": "cli" })).await {
            Ok(tag) => info!("Enqueued {} as {}", url, tag),
            Err(e) => warn!("Could not enqueue {}: {}", url, e),
        }
    }

    info!("Relay running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn spawn_purge_loop(store: Arc<JobStore>, config: &RelayConfig) {
    let age = config.purge_age;
    let every = config.purge_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
            if let Err(e) = store.purge_terminal(cutoff).await {
                warn!("Terminal-row purge failed: {}", e);
            }
        }
    });
}

/// The daemon's own subscriber: the status surface a chat frontend would
/// render lands in the logs instead.
fn spawn_event_logger(mut events: tokio::sync::broadcast::Receiver<JobEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::QueueAdded { tag, platform, position }) => {
                    info!("queued {} [{}] at position {}", tag, platform, position);
                }
                Ok(JobEvent::DownloadStart { tag }) => info!("downloading {}", tag),
                Ok(JobEvent::DownloadProgress { tag, percent }) => {
                    info!("progress {}: {}%", tag, percent);
                }
                Ok(JobEvent::DownloadComplete { tag, size_bytes }) => {
                    info!("completed {} ({} bytes)", tag, size_bytes);
                }
                Ok(JobEvent::DownloadError { tag, message, permanent }) => {
                    warn!(
                        "failed {} ({}): {}",
                        tag,
                        if permanent { "permanent" } else { "retries exhausted" },
                        message
                    );
                }
                Ok(JobEvent::QueueCleared { dropped }) => {
                    warn!("queue cleared, {} job(s) dropped", dropped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event logger lagged, skipped {} event(s)", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

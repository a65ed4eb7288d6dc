//! The scheduler actor and its handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use clipferry_extractor::{classify, Artifact, ExtractError, JobRunner};
use clipferry_protocol::{Job, JobEvent, JobStatus, JobTag, RelayConfig};
use clipferry_store::{JobStore, StoreError};

/// Broadcast buffer for lifecycle events. Slow subscribers lag and lose
/// events; they never block the scheduler.
const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    /// Admission failed closed; nothing was persisted or enqueued.
    #[error("queue is full ({len}/{max})")]
    QueueFull { len: usize, max: usize },
    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Scheduler knobs, lifted out of the full relay config.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub shutdown_grace: Duration,
}

impl From<&RelayConfig> for SchedulerSettings {
    fn from(config: &RelayConfig) -> Self {
        SchedulerSettings {
            max_concurrent: config.max_concurrent,
            max_queue_size: config.max_queue_size,
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Exponential backoff, capped.
fn backoff_delay(base: Duration, cap: Duration, retry_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(16));
    base.saturating_mul(factor).min(cap)
}

/// What recovery found and what resume kept.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub dropped: usize,
}

/// Point-in-time view of the scheduler, for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub queued_tags: Vec<JobTag>,
    pub active_tags: Vec<JobTag>,
    pub paused: bool,
}

impl QueueStatus {
    pub fn queued(&self) -> usize {
        self.queued_tags.len()
    }

    pub fn active(&self) -> usize {
        self.active_tags.len()
    }
}

enum Command {
    Admit {
        url: String,
        caller_context: serde_json::Value,
        reply: oneshot::Sender<Result<JobTag, AdmitError>>,
    },
    /// A retry backoff elapsed; the job re-enters at the queue front.
    Requeue { job: Job },
    /// A spawned attempt finished; ownership of the job comes back.
    Finished {
        job: Job,
        outcome: Result<Artifact, ExtractError>,
    },
    /// Discard every queued (not active) job.
    ClearQueue { reply: oneshot::Sender<usize> },
    /// Re-attach delivery contexts after recovery and unpause.
    Resume {
        attachments: HashMap<JobTag, serde_json::Value>,
        reply: oneshot::Sender<RecoveryReport>,
    },
    Status { reply: oneshot::Sender<QueueStatus> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable front door to the scheduler actor.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<JobEvent>,
}

impl QueueHandle {
    /// Admit a URL. Fails closed when the queue is at capacity.
    pub async fn admit(
        &self,
        url: impl Into<String>,
        caller_context: serde_json::Value,
    ) -> Result<JobTag, AdmitError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Admit { url: url.into(), caller_context, reply };
        if self.tx.send(cmd).await.is_err() {
            return Err(AdmitError::ShuttingDown);
        }
        rx.await.unwrap_or(Err(AdmitError::ShuttingDown))
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Discard all queued jobs (resource guards shed load this way).
    /// Active jobs are untouched. Returns how many were dropped.
    pub async fn clear_queue(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ClearQueue { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// After `start_recovered`, hand back the re-resolved delivery context
    /// per tag and unpause. Jobs missing from the map are dropped as
    /// failed; fresh admissions made while paused are unaffected.
    pub async fn resume(
        &self,
        attachments: HashMap<JobTag, serde_json::Value>,
    ) -> RecoveryReport {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Resume { attachments, reply }).await.is_err() {
            return RecoveryReport::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> Option<QueueStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Stop admitting, drain in-flight jobs within the grace period, then
    /// abandon whatever is left. Resolves when the actor has exited.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Constructor facade for the scheduler actor.
pub struct DownloadQueue;

impl DownloadQueue {
    /// Start with an empty queue.
    pub fn start(
        settings: SchedulerSettings,
        store: Arc<JobStore>,
        runner: Arc<dyn JobRunner>,
    ) -> QueueHandle {
        Self::spawn(settings, store, runner, VecDeque::new(), false)
    }

    /// Load non-terminal jobs from the store and start *paused*: nothing
    /// schedules until the caller re-attaches delivery contexts via
    /// [`QueueHandle::resume`]. Returns the recovered jobs so the caller
    /// can do that re-resolution.
    pub async fn start_recovered(
        settings: SchedulerSettings,
        store: Arc<JobStore>,
        runner: Arc<dyn JobRunner>,
    ) -> Result<(QueueHandle, Vec<Job>), StoreError> {
        let rows = store.load_resumable().await?;

        let mut recovered = Vec::new();
        for mut job in rows {
            if job.retry_count > settings.max_retries {
                warn!(
                    "Dropping job {} at recovery: retry budget exhausted ({} > {})",
                    job.tag, job.retry_count, settings.max_retries
                );
                let _ = store
                    .mark_failed(&job.tag, Utc::now(), "dropped at recovery: retry budget exhausted")
                    .await;
                continue;
            }
            // A row caught mid-download gets a fresh attempt generation.
            job.status = JobStatus::Queued;
            job.started_at = None;
            recovered.push(job);
        }

        info!("Recovered {} job(s); queue paused until delivery re-attachment", recovered.len());
        let queue: VecDeque<Job> = recovered.iter().cloned().collect();
        let handle = Self::spawn(settings, store, runner, queue, true);
        Ok((handle, recovered))
    }

    fn spawn(
        settings: SchedulerSettings,
        store: Arc<JobStore>,
        runner: Arc<dyn JobRunner>,
        queue: VecDeque<Job>,
        paused: bool,
    ) -> QueueHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let recovered_tags = queue.iter().map(|j| j.tag.clone()).collect();
        let actor = Scheduler {
            settings,
            store,
            runner,
            queue,
            active: HashMap::new(),
            recovered_tags,
            paused,
            shutting_down: false,
            events: events.clone(),
            cmd_tx: tx.clone(),
            cmd_rx: rx,
        };
        tokio::spawn(actor.run());

        QueueHandle { tx, events }
    }
}

struct Scheduler {
    settings: SchedulerSettings,
    store: Arc<JobStore>,
    runner: Arc<dyn JobRunner>,
    /// Jobs waiting for a slot, insertion order = priority.
    queue: VecDeque<Job>,
    /// Tag -> attempt task. A retrying job keeps its slot here (with a
    /// finished handle) until its backoff elapses, so a flaky job is
    /// serviced again before fresh queue entries take the slot.
    active: HashMap<JobTag, JoinHandle<()>>,
    /// Tags restored from the store, pending delivery re-attachment.
    recovered_tags: HashSet<JobTag>,
    paused: bool,
    shutting_down: bool,
    events: broadcast::Sender<JobEvent>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl Scheduler {
    async fn run(mut self) {
        debug!(
            "Scheduler running (concurrency {}, queue cap {})",
            self.settings.max_concurrent, self.settings.max_queue_size
        );

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Admit { url, caller_context, reply } => {
                    let result = self.handle_admit(url, caller_context).await;
                    let _ = reply.send(result);
                    self.schedule().await;
                }
                Command::Requeue { job } => {
                    self.handle_requeue(job);
                    self.schedule().await;
                }
                Command::Finished { job, outcome } => {
                    self.handle_finished(job, outcome).await;
                    self.schedule().await;
                }
                Command::ClearQueue { reply } => {
                    let dropped = self.handle_clear().await;
                    let _ = reply.send(dropped);
                }
                Command::Resume { attachments, reply } => {
                    let report = self.handle_resume(attachments).await;
                    let _ = reply.send(report);
                    self.schedule().await;
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown { reply } => {
                    self.drain().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        debug!("Scheduler stopped");
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            queued_tags: self.queue.iter().map(|j| j.tag.clone()).collect(),
            active_tags: self.active.keys().cloned().collect(),
            paused: self.paused,
        }
    }

    async fn handle_admit(
        &mut self,
        url: String,
        caller_context: serde_json::Value,
    ) -> Result<JobTag, AdmitError> {
        if self.shutting_down {
            return Err(AdmitError::ShuttingDown);
        }
        if self.queue.len() >= self.settings.max_queue_size {
            return Err(AdmitError::QueueFull {
                len: self.queue.len(),
                max: self.settings.max_queue_size,
            });
        }

        let platform = classify(&url);
        let job = Job::new(url, platform, caller_context);
        let tag = job.tag.clone();

        self.persist(self.store.insert_job(&job).await);

        self.queue.push_back(job);
        info!("Admitted {} ({}) at position {}", tag, platform, self.queue.len());
        self.emit(JobEvent::QueueAdded {
            tag: tag.clone(),
            platform,
            position: self.queue.len(),
        });

        Ok(tag)
    }

    /// Fill free slots from the queue head. Serialized by construction:
    /// this runs only inside the actor loop.
    async fn schedule(&mut self) {
        if self.paused || self.shutting_down {
            return;
        }
        while self.active.len() < self.settings.max_concurrent {
            let Some(job) = self.queue.pop_front() else { break };
            self.start_job(job).await;
        }
    }

    async fn start_job(&mut self, mut job: Job) {
        let now = Utc::now();
        job.status = JobStatus::Downloading;
        job.started_at = Some(now);

        self.persist(self.store.mark_downloading(&job.tag, now).await);
        self.emit(JobEvent::DownloadStart { tag: job.tag.clone() });
        info!("Starting {} ({} active)", job.tag, self.active.len() + 1);

        let tag = job.tag.clone();
        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        let cmd_tx = self.cmd_tx.clone();

        let handle = tokio::spawn(async move {
            let progress_tag = job.tag.clone();
            let progress = move |percent: u8| {
                let _ = events.send(JobEvent::DownloadProgress {
                    tag: progress_tag.clone(),
                    percent,
                });
            };
            let outcome = runner.run(&job, &progress).await;
            // Channel closed means the scheduler is gone; nothing to do.
            let _ = cmd_tx.send(Command::Finished { job, outcome }).await;
        });

        self.active.insert(tag, handle);
    }

    async fn handle_finished(&mut self, mut job: Job, outcome: Result<Artifact, ExtractError>) {
        match outcome {
            Ok(artifact) => {
                self.active.remove(&job.tag);
                let now = Utc::now();
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.result_size = Some(artifact.size);

                self.persist(self.store.mark_completed(&job.tag, now, artifact.size).await);
                info!("Completed {} ({} bytes)", job.tag, artifact.size);
                self.emit(JobEvent::DownloadComplete {
                    tag: job.tag,
                    size_bytes: artifact.size,
                });
            }
            Err(err) if err.is_transient() && job.retry_count < self.settings.max_retries => {
                // The slot is NOT released: the entry stays in the active
                // map until the backoff elapses, so the retry is serviced
                // before anything behind it in the queue.
                job.retry_count += 1;
                job.status = JobStatus::Queued;
                job.started_at = None;

                let delay = backoff_delay(
                    self.settings.backoff_base,
                    self.settings.backoff_cap,
                    job.retry_count,
                );
                warn!(
                    "Job {} failed transiently (attempt {}/{}), retrying in {:?}: {}",
                    job.tag,
                    job.retry_count,
                    self.settings.max_retries,
                    delay,
                    err.message()
                );
                self.persist(
                    self.store.mark_retrying(&job.tag, job.retry_count, err.message()).await,
                );

                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = cmd_tx.send(Command::Requeue { job }).await;
                });
            }
            Err(err) => {
                self.active.remove(&job.tag);
                let now = Utc::now();
                let permanent = err.is_permanent();
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error_message = Some(err.message().to_string());

                if permanent {
                    error!("Job {} failed permanently: {}", job.tag, err.message());
                } else {
                    error!(
                        "Job {} failed after {} retries: {}",
                        job.tag, job.retry_count, err.message()
                    );
                }
                self.persist(self.store.mark_failed(&job.tag, now, err.message()).await);
                self.emit(JobEvent::DownloadError {
                    tag: job.tag,
                    message: err.message().to_string(),
                    permanent,
                });
            }
        }
    }

    fn handle_requeue(&mut self, job: Job) {
        if self.shutting_down {
            // Persisted as queued; the next boot's recovery picks it up.
            return;
        }
        // Explicit transfer: out of the active set, into the queue front.
        self.active.remove(&job.tag);
        debug!("Requeueing {} at queue head (retry {})", job.tag, job.retry_count);
        self.queue.push_front(job);
    }

    async fn handle_clear(&mut self) -> usize {
        let drained: Vec<Job> = self.queue.drain(..).collect();
        let dropped = drained.len();
        for job in drained {
            self.persist(
                self.store
                    .mark_failed(&job.tag, Utc::now(), "dropped: queue cleared under resource pressure")
                    .await,
            );
        }
        if dropped > 0 {
            warn!("Cleared {} queued job(s) under resource pressure", dropped);
            self.emit(JobEvent::QueueCleared { dropped });
        }
        dropped
    }

    async fn handle_resume(
        &mut self,
        attachments: HashMap<JobTag, serde_json::Value>,
    ) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let recovered = std::mem::take(&mut self.recovered_tags);

        let drained: Vec<Job> = self.queue.drain(..).collect();
        let mut kept = VecDeque::with_capacity(drained.len());
        for mut job in drained {
            if !recovered.contains(&job.tag) {
                // Admitted while paused; its context is already valid.
                kept.push_back(job);
                continue;
            }
            match attachments.get(&job.tag) {
                Some(context) => {
                    job.caller_context = context.clone();
                    report.resumed += 1;
                    kept.push_back(job);
                }
                None => {
                    warn!("Dropping {}: delivery context could not be re-resolved", job.tag);
                    self.persist(
                        self.store
                            .mark_failed(&job.tag, Utc::now(), "delivery context could not be re-resolved")
                            .await,
                    );
                    self.emit(JobEvent::DownloadError {
                        tag: job.tag.clone(),
                        message: "delivery context could not be re-resolved".to_string(),
                        permanent: true,
                    });
                    report.dropped += 1;
                }
            }
        }
        self.queue = kept;
        self.paused = false;
        info!("Resumed: {} job(s) kept, {} dropped", report.resumed, report.dropped);
        report
    }

    /// Bounded drain: wait for in-flight jobs up to the grace period,
    /// then abandon the rest.
    async fn drain(&mut self) {
        self.shutting_down = true;
        if self.active.is_empty() {
            return;
        }
        info!(
            "Shutdown: waiting up to {:?} for {} active job(s)",
            self.settings.shutdown_grace,
            self.active.len()
        );

        let deadline = Instant::now() + self.settings.shutdown_grace;
        while !self.active.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, self.cmd_rx.recv()).await {
                Ok(Some(Command::Finished { job, outcome })) => {
                    self.handle_finished(job, outcome).await;
                }
                Ok(Some(Command::Admit { reply, .. })) => {
                    let _ = reply.send(Err(AdmitError::ShuttingDown));
                }
                Ok(Some(Command::Status { reply })) => {
                    let _ = reply.send(self.status());
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if !self.active.is_empty() {
            warn!("Abandoning {} job(s) still in flight after grace period", self.active.len());
            for (tag, handle) in self.active.drain() {
                handle.abort();
                debug!("Aborted attempt for {}", tag);
            }
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine; send only fails then.
        let _ = self.events.send(event);
    }

    /// Store failures degrade to in-memory-only operation.
    fn persist<T>(&self, result: Result<T, StoreError>) {
        if let Err(e) = result {
            warn!("Job store write failed (continuing in memory): {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1_500);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, cap, 4), Duration::from_millis(1_500));
        assert_eq!(backoff_delay(base, cap, 30), Duration::from_millis(1_500));
    }

    #[test]
    fn test_settings_from_relay_config() {
        let config = RelayConfig::default();
        let settings = SchedulerSettings::from(&config);
        assert_eq!(settings.max_concurrent, config.max_concurrent);
        assert_eq!(settings.max_queue_size, config.max_queue_size);
        assert_eq!(settings.max_retries, config.max_retries);
    }
}

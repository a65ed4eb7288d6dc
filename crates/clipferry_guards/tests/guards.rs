//! Guard behavior against a live scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

use clipferry_extractor::{Artifact, ExtractError, JobRunner, ProgressFn};
use clipferry_guards::{GuardSettings, MemoryGuard};
use clipferry_protocol::{Job, JobStatus};
use clipferry_queue::{DownloadQueue, SchedulerSettings};
use clipferry_store::JobStore;

struct NeverRuns;

#[async_trait]
impl JobRunner for NeverRuns {
    async fn run(&self, _job: &Job, _progress: ProgressFn<'_>) -> Result<Artifact, ExtractError> {
        panic!("scheduler was paused; nothing should run");
    }
}

#[tokio::test]
async fn test_emergency_tier_sheds_queue_and_fires_action() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let store = Arc::new(JobStore::new(pool));
    store.init_schema().await.unwrap();

    let scheduler_settings = SchedulerSettings {
        max_concurrent: 1,
        max_queue_size: 10,
        max_retries: 3,
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(100),
        shutdown_grace: Duration::from_secs(1),
    };
    // Empty recovery leaves the queue paused, so the admitted job stays
    // queued where the guard can shed it.
    let (handle, _) =
        DownloadQueue::start_recovered(scheduler_settings, store.clone(), Arc::new(NeverRuns))
            .await
            .unwrap();
    let tag = handle.admit("https://youtu.be/doomed", json!(null)).await.unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let fired_flag = Arc::clone(&fired);

    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("stale.mp4"), vec![0u8; 64]).unwrap();

    // Any real process RSS exceeds 3 MiB, so the first sample escalates
    // straight to the emergency tier.
    let guard_settings = GuardSettings {
        interval: Duration::from_millis(10),
        mem_warn_mb: 1,
        mem_critical_mb: 2,
        mem_emergency_mb: 3,
        disk_warn_pct: 80,
        disk_critical_pct: 90,
        disk_emergency_pct: 95,
        emergency_grace: Duration::from_millis(10),
    };
    let guard = MemoryGuard::new(guard_settings, temp.path().to_path_buf(), handle.clone(), {
        move || fired_flag.store(true, Ordering::SeqCst)
    });
    let guard_task = guard.spawn();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !fired.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("emergency action never fired");

    guard_task.abort();

    // Queue shed: the job never ran and is terminal in the store.
    let job = store.get_job(&tag).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    // Temp files are gone.
    assert!(!temp.path().join("stale.mp4").exists());

    handle.shutdown().await;
}

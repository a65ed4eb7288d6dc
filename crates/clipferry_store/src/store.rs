//! SQLite-backed job table.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tracing::{debug, info};

use clipferry_protocol::{Job, JobStatus, JobTag, Platform};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt row for tag '{tag}': {reason}")]
    Decode { tag: String, reason: String },
}

/// Durable job table keyed by tag.
pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the store at the given path and run
    /// schema init. WAL keeps writer stalls off the scheduler's path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        info!("Job store ready at {}", path.display());
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_jobs (
                tag TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                platform TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result_size INTEGER,
                error_message TEXT,
                caller_context TEXT NOT NULL DEFAULT 'null'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_relay_jobs_status ON relay_jobs (status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert (or overwrite) a job at admission time.
    pub async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO relay_jobs
                (tag, url, platform, status, retry_count, created_at,
                 started_at, completed_at, result_size, error_message, caller_context)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.tag.as_str())
        .bind(&job.url)
        .bind(job.platform.as_str())
        .bind(job.status.as_str())
        .bind(job.retry_count as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.result_size.map(|s| s as i64))
        .bind(job.error_message.as_deref())
        .bind(job.caller_context.to_string())
        .execute(&self.pool)
        .await?;

        debug!("Persisted job {} as {}", job.tag, job.status);
        Ok(())
    }

    /// Transition a job to `downloading`.
    pub async fn mark_downloading(
        &self,
        tag: &JobTag,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE relay_jobs
            SET status = 'downloading',
                started_at = ?
            WHERE tag = ?
            "#,
        )
        .bind(started_at.to_rfc3339())
        .bind(tag.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal success.
    pub async fn mark_completed(
        &self,
        tag: &JobTag,
        completed_at: DateTime<Utc>,
        result_size: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE relay_jobs
            SET status = 'completed',
                completed_at = ?,
                result_size = ?,
                error_message = NULL
            WHERE tag = ?
            "#,
        )
        .bind(completed_at.to_rfc3339())
        .bind(result_size as i64)
        .bind(tag.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal failure.
    pub async fn mark_failed(
        &self,
        tag: &JobTag,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE relay_jobs
            SET status = 'failed',
                completed_at = ?,
                error_message = ?
            WHERE tag = ?
            "#,
        )
        .bind(completed_at.to_rfc3339())
        .bind(error)
        .bind(tag.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a job back to `queued` for a retry, recording the attempt count
    /// and the failure that caused it. The attempt timestamps reset so the
    /// next attempt generation sets them once, fresh.
    pub async fn mark_retrying(
        &self,
        tag: &JobTag,
        retry_count: u32,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE relay_jobs
            SET status = 'queued',
                retry_count = ?,
                started_at = NULL,
                completed_at = NULL,
                error_message = ?
            WHERE tag = ?
            "#,
        )
        .bind(retry_count as i64)
        .bind(error)
        .bind(tag.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All non-terminal rows in admission order, for crash recovery.
    pub async fn load_resumable(&self) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM relay_jobs
            WHERE status IN ('queued', 'downloading')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Fetch a single job by tag.
    pub async fn get_job(&self, tag: &JobTag) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM relay_jobs WHERE tag = ?")
            .bind(tag.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Delete terminal rows older than the cutoff. Returns rows removed.
    pub async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let removed = sqlx::query(
            r#"
            DELETE FROM relay_jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at IS NOT NULL
              AND completed_at < ?
            "#,
        )
        .bind(older_than.to_rfc3339())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed > 0 {
            info!("Purged {} terminal job rows", removed);
        }
        Ok(removed)
    }

    /// Aggregate counters over the whole table.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let totals: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COALESCE(SUM(result_size), 0)
            FROM relay_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<(String, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                platform,
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COALESCE(SUM(result_size), 0)
            FROM relay_jobs
            GROUP BY platform
            ORDER BY platform
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let per_platform = rows
            .into_iter()
            .map(|(platform, total, completed, failed, bytes)| PlatformStats {
                platform: platform.parse().unwrap_or(Platform::Generic),
                total,
                completed,
                failed,
                bytes,
            })
            .collect();

        Ok(StoreStats {
            total: totals.0,
            completed: totals.1,
            failed: totals.2,
            total_bytes: totals.3,
            per_platform,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_bytes: i64,
    pub per_platform: Vec<PlatformStats>,
}

#[derive(Debug, Clone)]
pub struct PlatformStats {
    pub platform: Platform,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub bytes: i64,
}

/// Raw row shape. Enum and timestamp parsing happens at this boundary with
/// error propagation, so schema drift surfaces as a typed decode error
/// instead of a panic mid-recovery.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    tag: String,
    url: String,
    platform: String,
    status: String,
    retry_count: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result_size: Option<i64>,
    error_message: Option<String>,
    caller_context: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        let decode = |reason: String| StoreError::Decode { tag: self.tag.clone(), reason };

        let platform: Platform = self.platform.parse().map_err(decode)?;
        let status: JobStatus = self.status.parse().map_err(decode)?;
        let created_at = parse_ts(&self.created_at).map_err(decode)?;
        let started_at = self.started_at.as_deref().map(parse_ts).transpose().map_err(decode)?;
        let completed_at =
            self.completed_at.as_deref().map(parse_ts).transpose().map_err(decode)?;
        let caller_context = serde_json::from_str(&self.caller_context)
            .unwrap_or(serde_json::Value::Null);

        Ok(Job {
            tag: JobTag::from(self.tag),
            url: self.url,
            platform,
            status,
            retry_count: self.retry_count.max(0) as u32,
            created_at,
            started_at,
            completed_at,
            result_size: self.result_size.map(|s| s.max(0) as u64),
            error_message: self.error_message,
            caller_context,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> JobStore {
        // One connection: each pooled connection would otherwise get its
        // own private :memory: database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        let store = JobStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn job(url: &str, platform: Platform) -> Job {
        Job::new(url, platform, json!({"channel": 42}))
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = memory_store().await;
        let job = job("https://www.tiktok.com/@a/video/1", Platform::Tiktok);
        store.insert_job(&job).await.unwrap();

        let loaded = store.get_job(&job.tag).await.unwrap().unwrap();
        assert_eq!(loaded.url, job.url);
        assert_eq!(loaded.platform, Platform::Tiktok);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.caller_context, json!({"channel": 42}));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = memory_store().await;
        let job = job("https://youtu.be/x", Platform::Youtube);
        store.insert_job(&job).await.unwrap();

        store.mark_downloading(&job.tag, Utc::now()).await.unwrap();
        assert_eq!(
            store.get_job(&job.tag).await.unwrap().unwrap().status,
            JobStatus::Downloading
        );

        store.mark_completed(&job.tag, Utc::now(), 1234).await.unwrap();
        let done = store.get_job(&job.tag).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_size, Some(1234));
    }

    #[tokio::test]
    async fn test_retry_resets_attempt_timestamps() {
        let store = memory_store().await;
        let job = job("https://youtu.be/x", Platform::Youtube);
        store.insert_job(&job).await.unwrap();
        store.mark_downloading(&job.tag, Utc::now()).await.unwrap();
        store.mark_retrying(&job.tag, 1, "timed out").await.unwrap();

        let retried = store.get_job(&job.tag).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.started_at.is_none());
        assert_eq!(retried.error_message.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_load_resumable_orders_by_admission() {
        let store = memory_store().await;
        let mut first = job("https://youtu.be/a", Platform::Youtube);
        first.created_at = Utc::now() - chrono::Duration::seconds(30);
        let second = job("https://youtu.be/b", Platform::Youtube);
        // Insert newest first to prove ordering comes from the query.
        store.insert_job(&second).await.unwrap();
        store.insert_job(&first).await.unwrap();
        store.mark_downloading(&first.tag, Utc::now()).await.unwrap();

        let resumable = store.load_resumable().await.unwrap();
        assert_eq!(resumable.len(), 2);
        assert_eq!(resumable[0].tag, first.tag);
        assert_eq!(resumable[1].tag, second.tag);
    }

    #[tokio::test]
    async fn test_terminal_rows_not_resumable() {
        let store = memory_store().await;
        let a = job("https://youtu.be/a", Platform::Youtube);
        let b = job("https://youtu.be/b", Platform::Youtube);
        store.insert_job(&a).await.unwrap();
        store.insert_job(&b).await.unwrap();
        store.mark_failed(&a.tag, Utc::now(), "404").await.unwrap();

        let resumable = store.load_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].tag, b.tag);
    }

    #[tokio::test]
    async fn test_purge_only_old_terminal_rows() {
        let store = memory_store().await;
        let old = job("https://youtu.be/old", Platform::Youtube);
        let fresh = job("https://youtu.be/new", Platform::Youtube);
        let queued = job("https://youtu.be/queued", Platform::Youtube);
        store.insert_job(&old).await.unwrap();
        store.insert_job(&fresh).await.unwrap();
        store.insert_job(&queued).await.unwrap();

        store
            .mark_completed(&old.tag, Utc::now() - chrono::Duration::hours(100), 10)
            .await
            .unwrap();
        store.mark_completed(&fresh.tag, Utc::now(), 10).await.unwrap();

        let removed = store
            .purge_terminal(Utc::now() - chrono::Duration::hours(72))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_job(&old.tag).await.unwrap().is_none());
        assert!(store.get_job(&fresh.tag).await.unwrap().is_some());
        assert!(store.get_job(&queued.tag).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_grouped_by_platform() {
        let store = memory_store().await;
        let a = job("https://www.tiktok.com/@a/video/1", Platform::Tiktok);
        let b = job("https://www.tiktok.com/@b/video/2", Platform::Tiktok);
        let c = job("https://youtu.be/c", Platform::Youtube);
        for j in [&a, &b, &c] {
            store.insert_job(j).await.unwrap();
        }
        store.mark_completed(&a.tag, Utc::now(), 100).await.unwrap();
        store.mark_completed(&c.tag, Utc::now(), 50).await.unwrap();
        store.mark_failed(&b.tag, Utc::now(), "private video").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_bytes, 150);

        let tiktok = stats
            .per_platform
            .iter()
            .find(|p| p.platform == Platform::Tiktok)
            .unwrap();
        assert_eq!(tiktok.total, 2);
        assert_eq!(tiktok.completed, 1);
        assert_eq!(tiktok.failed, 1);
        assert_eq!(tiktok.bytes, 100);
    }
}

//! Canonical default values shared across the relay.

/// Maximum jobs extracting concurrently.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// Maximum queued (not yet started) jobs before admission fails closed.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 20;
/// Retry budget per job for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base backoff before a retry re-enters the queue (doubled per retry).
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
/// Backoff ceiling.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;

/// Metadata probe budget.
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 15;
/// Whole-attempt budget for the extractor process.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Budget per individual HTTP fallback call.
pub const DEFAULT_FALLBACK_TIMEOUT_SECS: u64 = 60;

/// Combined captured process output cap (tail kept beyond this).
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Resource guard sampling interval.
pub const DEFAULT_GUARD_INTERVAL_SECS: u64 = 60;
/// Process RSS tiers (MiB).
pub const DEFAULT_MEM_WARN_MB: u64 = 400;
pub const DEFAULT_MEM_CRITICAL_MB: u64 = 600;
pub const DEFAULT_MEM_EMERGENCY_MB: u64 = 800;
/// Filesystem usage tiers (percent of the temp dir's filesystem).
pub const DEFAULT_DISK_WARN_PCT: u8 = 80;
pub const DEFAULT_DISK_CRITICAL_PCT: u8 = 90;
pub const DEFAULT_DISK_EMERGENCY_PCT: u8 = 95;

/// Terminal rows older than this are purged from the store.
pub const DEFAULT_PURGE_AGE_HOURS: u64 = 72;
/// How often the purge pass runs.
pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 3_600;

/// Artifacts at or below this size are delivered inline.
pub const DEFAULT_INLINE_LIMIT_BYTES: u64 = 8 * 1024 * 1024;

/// Grace period for draining in-flight jobs at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 20;

/// External extractor binary, resolved via PATH.
pub const DEFAULT_EXTRACTOR_BIN: &str = "yt-dlp";
/// Spawn fallback when the primary binary is missing.
pub const EXTRACTOR_FALLBACK_BIN: &str = "youtube-dl";

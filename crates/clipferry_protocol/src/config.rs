//! Relay configuration.
//!
//! Assembled once at process start (CLI flags with env fallbacks in the
//! binary) and passed by reference to every component. Required values are
//! checked up front; a half-configured relay refuses to boot.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::defaults;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} is required")]
    Missing { field: &'static str },
    #[error("{low} must be below {high} ({low_value} >= {high_value})")]
    Unordered {
        low: &'static str,
        high: &'static str,
        low_value: u64,
        high_value: u64,
    },
}

/// Static configuration for the whole relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Job store URL or path (sqlite file).
    pub store_path: PathBuf,
    /// Shared temp directory for in-flight downloads.
    pub temp_dir: PathBuf,
    /// External extractor binary name or path.
    pub extractor_bin: String,

    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,

    pub backoff_base: Duration,
    pub backoff_cap: Duration,

    pub metadata_timeout: Duration,
    pub download_timeout: Duration,
    pub fallback_timeout: Duration,
    pub max_capture_bytes: usize,

    pub guard_interval: Duration,
    pub mem_warn_mb: u64,
    pub mem_critical_mb: u64,
    pub mem_emergency_mb: u64,
    pub disk_warn_pct: u8,
    pub disk_critical_pct: u8,
    pub disk_emergency_pct: u8,

    pub purge_age: Duration,
    pub purge_interval: Duration,

    pub inline_limit_bytes: u64,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            store_path: crate::paths::default_store_path(),
            temp_dir: crate::paths::default_temp_dir(),
            extractor_bin: defaults::DEFAULT_EXTRACTOR_BIN.to_string(),
            max_concurrent: defaults::DEFAULT_MAX_CONCURRENT,
            max_queue_size: defaults::DEFAULT_MAX_QUEUE_SIZE,
            max_retries: defaults::DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(defaults::DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(defaults::DEFAULT_BACKOFF_CAP_MS),
            metadata_timeout: Duration::from_secs(defaults::DEFAULT_METADATA_TIMEOUT_SECS),
            download_timeout: Duration::from_secs(defaults::DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            fallback_timeout: Duration::from_secs(defaults::DEFAULT_FALLBACK_TIMEOUT_SECS),
            max_capture_bytes: defaults::DEFAULT_MAX_CAPTURE_BYTES,
            guard_interval: Duration::from_secs(defaults::DEFAULT_GUARD_INTERVAL_SECS),
            mem_warn_mb: defaults::DEFAULT_MEM_WARN_MB,
            mem_critical_mb: defaults::DEFAULT_MEM_CRITICAL_MB,
            mem_emergency_mb: defaults::DEFAULT_MEM_EMERGENCY_MB,
            disk_warn_pct: defaults::DEFAULT_DISK_WARN_PCT,
            disk_critical_pct: defaults::DEFAULT_DISK_CRITICAL_PCT,
            disk_emergency_pct: defaults::DEFAULT_DISK_EMERGENCY_PCT,
            purge_age: Duration::from_secs(defaults::DEFAULT_PURGE_AGE_HOURS * 3_600),
            purge_interval: Duration::from_secs(defaults::DEFAULT_PURGE_INTERVAL_SECS),
            inline_limit_bytes: defaults::DEFAULT_INLINE_LIMIT_BYTES,
            shutdown_grace: Duration::from_secs(defaults::DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl RelayConfig {
    /// Fail-fast sanity check, run once before any component is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extractor_bin.trim().is_empty() {
            return Err(ConfigError::Missing { field: "extractor_bin" });
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing { field: "temp_dir" });
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing { field: "store_path" });
        }

        for (field, value) in [
            ("max_concurrent", self.max_concurrent as u64),
            ("max_queue_size", self.max_queue_size as u64),
            ("backoff_base", self.backoff_base.as_millis() as u64),
            ("download_timeout", self.download_timeout.as_secs()),
            ("metadata_timeout", self.metadata_timeout.as_secs()),
            ("fallback_timeout", self.fallback_timeout.as_secs()),
            ("max_capture_bytes", self.max_capture_bytes as u64),
            ("guard_interval", self.guard_interval.as_secs()),
            ("purge_interval", self.purge_interval.as_secs()),
            ("inline_limit_bytes", self.inline_limit_bytes),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        Self::check_order("mem_warn_mb", self.mem_warn_mb, "mem_critical_mb", self.mem_critical_mb)?;
        Self::check_order(
            "mem_critical_mb",
            self.mem_critical_mb,
            "mem_emergency_mb",
            self.mem_emergency_mb,
        )?;
        Self::check_order(
            "disk_warn_pct",
            self.disk_warn_pct as u64,
            "disk_critical_pct",
            self.disk_critical_pct as u64,
        )?;
        Self::check_order(
            "disk_critical_pct",
            self.disk_critical_pct as u64,
            "disk_emergency_pct",
            self.disk_emergency_pct as u64,
        )?;

        Ok(())
    }

    fn check_order(
        low: &'static str,
        low_value: u64,
        high: &'static str,
        high_value: u64,
    ) -> Result<(), ConfigError> {
        if low_value >= high_value {
            return Err(ConfigError::Unordered { low, high, low_value, high_value });
        }
        Ok(())
    }
}

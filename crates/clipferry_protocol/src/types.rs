//! Job model and canonical enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Job lifecycle status.
/// This is the CANONICAL definition - use this everywhere for queue status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job admitted, waiting for a concurrency slot
    #[default]
    Queued,
    /// Job handed to the extraction executor
    Downloading,
    /// Job finished with an artifact
    Completed,
    /// Job finished without an artifact (permanent error or retries exhausted)
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Downloading)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "downloading" => Ok(JobStatus::Downloading),
            "completed" | "complete" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

/// Source platform of a submitted URL.
///
/// The closed set of services the relay knows format policies for.
/// `Generic` is the fallback for anything the extractor might still handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Tiktok,
    Instagram,
    Twitter,
    Youtube,
    Snapchat,
    Facebook,
    Reddit,
    #[default]
    Generic,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
            Platform::Youtube => "youtube",
            Platform::Snapchat => "snapchat",
            Platform::Facebook => "facebook",
            Platform::Reddit => "reddit",
            Platform::Generic => "generic",
        }
    }

    pub const ALL: [Platform; 8] = [
        Platform::Tiktok,
        Platform::Instagram,
        Platform::Twitter,
        Platform::Youtube,
        Platform::Snapchat,
        Platform::Facebook,
        Platform::Reddit,
        Platform::Generic,
    ];
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiktok" => Ok(Platform::Tiktok),
            "instagram" => Ok(Platform::Instagram),
            "twitter" | "x" => Ok(Platform::Twitter),
            "youtube" => Ok(Platform::Youtube),
            "snapchat" => Ok(Platform::Snapchat),
            "facebook" => Ok(Platform::Facebook),
            "reddit" => Ok(Platform::Reddit),
            "generic" | "default" => Ok(Platform::Generic),
            _ => Err(format!("Invalid platform: '{}'", s)),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Unique job identifier, assigned at admission and never reused.
///
/// Format: `<unix-millis>-<8 hex chars>`. The timestamp prefix keeps tags
/// roughly sortable in logs; the random suffix guards against collisions
/// from admissions within the same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobTag(String);

impl JobTag {
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        JobTag(format!("{}-{}", now.timestamp_millis(), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobTag {
    fn from(s: String) -> Self {
        JobTag(s)
    }
}

impl From<&str> for JobTag {
    fn from(s: &str) -> Self {
        JobTag(s.to_string())
    }
}

/// One unit of download work.
///
/// `tag`, `url` and `platform` are immutable after admission. The scheduler
/// is the only writer of `status`, `retry_count` and the timestamps; the
/// store mirrors every transition synchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub tag: JobTag,
    pub url: String,
    pub platform: Platform,
    pub status: JobStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_size: Option<u64>,
    pub error_message: Option<String>,
    /// Opaque delivery context (reply target, requester identity, ...).
    /// Stored and returned unchanged; the core never interprets it.
    pub caller_context: serde_json::Value,
}

impl Job {
    pub fn new(url: impl Into<String>, platform: Platform, caller_context: serde_json::Value) -> Self {
        let now = Utc::now();
        Job {
            tag: JobTag::generate(now),
            url: url.into(),
            platform,
            status: JobStatus::Queued,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            result_size: None,
            error_message: None,
            caller_context,
        }
    }
}

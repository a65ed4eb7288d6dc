//! Lifecycle events emitted by the scheduler.
//!
//! Consumers (delivery, status messages) subscribe to a broadcast channel
//! at construction time; the core never renders anything itself. A slow
//! subscriber loses events rather than blocking the scheduler.

use serde::{Deserialize, Serialize};

use crate::types::{JobTag, Platform};

/// One lifecycle notification for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job admitted to the queue.
    QueueAdded {
        tag: JobTag,
        platform: Platform,
        /// Position in the queue at admission time (1-based).
        position: usize,
    },
    /// Job moved from the queue into the active set.
    DownloadStart { tag: JobTag },
    /// Progress report from the running attempt. Strictly increasing per
    /// attempt, clamped to 99 until completion.
    DownloadProgress { tag: JobTag, percent: u8 },
    /// Job completed with an artifact of the given size.
    DownloadComplete { tag: JobTag, size_bytes: u64 },
    /// Job reached the failed terminal state.
    DownloadError {
        tag: JobTag,
        message: String,
        permanent: bool,
    },
    /// Queued (not active) jobs were discarded wholesale, e.g. by a
    /// resource guard shedding load.
    QueueCleared { dropped: usize },
}

impl JobEvent {
    /// Tag of the job this event concerns, if it concerns a single job.
    pub fn tag(&self) -> Option<&JobTag> {
        match self {
            JobEvent::QueueAdded { tag, .. }
            | JobEvent::DownloadStart { tag }
            | JobEvent::DownloadProgress { tag, .. }
            | JobEvent::DownloadComplete { tag, .. }
            | JobEvent::DownloadError { tag, .. } => Some(tag),
            JobEvent::QueueCleared { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let event = JobEvent::DownloadProgress {
            tag: JobTag::from("1700000000000-deadbeef"),
            percent: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "download_progress");
        assert_eq!(json["percent"], 42);
    }

    #[test]
    fn test_event_tag_accessor() {
        let tag = JobTag::from("t");
        assert_eq!(
            JobEvent::DownloadStart { tag: tag.clone() }.tag(),
            Some(&tag)
        );
        assert_eq!(JobEvent::QueueCleared { dropped: 3 }.tag(), None);
    }
}

//! Job queue and scheduler.
//!
//! A single actor task owns the queue and the active set, so every queue
//! mutation is serialized - there is exactly one scheduling pass "in
//! flight" at any time, and concurrent triggers coalesce as queued
//! commands. Extraction itself runs in spawned tasks, up to the
//! configured concurrency limit.
//!
//! Retried jobs re-enter at the queue *front*: transient flakes recover
//! before older never-attempted jobs get their first slot. That is a
//! deliberate fairness trade-off, covered by an explicit test rather than
//! smoothed over.

mod scheduler;

pub use scheduler::{
    AdmitError, DownloadQueue, QueueHandle, QueueStatus, RecoveryReport, SchedulerSettings,
};

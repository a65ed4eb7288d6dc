//! Durable mirror of the job queue.
//!
//! One SQLite table keyed by job tag. Every in-memory state transition in
//! the scheduler is written here synchronously, so a crash loses at most
//! the in-flight attempt, never the job's existence. The scheduler treats
//! store failures as non-fatal (logged, processing continues in memory) -
//! availability is prioritized over durability for this workload.

mod store;

pub use store::{JobStore, PlatformStats, StoreError, StoreStats};

//! Canonical types shared across the Clipferry crates.
//!
//! Everything that more than one crate needs to agree on lives here: the
//! job model and its status enum, the platform enum, lifecycle events, the
//! relay configuration and the filesystem layout helpers. This crate is
//! deliberately free of I/O - the store, queue and extractor crates own
//! their side effects.

pub mod config;
pub mod defaults;
pub mod events;
pub mod paths;
pub mod types;

pub use config::{ConfigError, RelayConfig};
pub use events::JobEvent;
pub use types::{Job, JobStatus, JobTag, Platform};

//! Extraction strategies for the relay.
//!
//! Turns a classified URL into a media file on disk, or a typed failure.
//! The primary strategy shells out to the external extractor binary; each
//! platform can declare an ordered chain of HTTP API fallbacks that are
//! tried when the primary fails. Errors are classified permanent vs
//! transient exactly once, here - downstream consumers trust the tag.

pub mod error;
pub mod executor;
pub mod fallback;
pub mod metadata;
pub mod platform;
mod process;

pub use error::ExtractError;
pub use executor::{Artifact, JobRunner, ProgressFn, StrategyExecutor};
pub use fallback::{FallbackApi, FallbackError, ResolvedMedia};
pub use metadata::MediaMetadata;
pub use platform::{classify, FallbackKind, FormatPolicy};

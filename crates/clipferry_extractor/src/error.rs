//! Extraction failure classification.
//!
//! Classification happens once, at the executor boundary. The scheduler
//! never re-inspects messages; it only looks at the variant.

use thiserror::Error;

/// Diagnostic fragments that mark content as genuinely unavailable.
/// Anything matching one of these is never worth a retry.
const PERMANENT_SIGNATURES: &[&str] = &[
    "403",
    "404",
    "410",
    "private video",
    "video unavailable",
    "video is unavailable",
    "account is private",
    "private account",
    "copyright claim",
    "copyright grounds",
    "user not found",
    "content isn't available",
    "content is not available",
    "sign in to confirm your age",
    "removed by the uploader",
    "video has been removed",
];

/// HTTP statuses from fallback APIs that mean the content itself is gone
/// or forbidden, as opposed to the API having a bad day.
const PERMANENT_HTTP_STATUSES: &[u16] = &[400, 401, 403, 404, 410, 451];

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Content genuinely unavailable - never retried.
    #[error("permanent extraction failure: {message}")]
    Permanent { message: String },
    /// Network trouble, timeout, 5xx, unknown tool exit - retry eligible.
    #[error("transient extraction failure: {message}")]
    Transient { message: String },
}

impl ExtractError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExtractError::Permanent { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractError::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            ExtractError::Permanent { message } | ExtractError::Transient { message } => message,
        }
    }

    /// Classify a combined diagnostic (stderr tail, tool output).
    pub fn classify(diagnostic: impl Into<String>) -> Self {
        let message = diagnostic.into();
        if matches_permanent_signature(&message) {
            ExtractError::Permanent { message }
        } else {
            ExtractError::Transient { message }
        }
    }

    /// Classify an HTTP status from a fallback API response.
    pub fn from_http_status(status: u16, context: &str) -> Self {
        let message = format!("HTTP {} from {}", status, context);
        if PERMANENT_HTTP_STATUSES.contains(&status) {
            ExtractError::Permanent { message }
        } else {
            ExtractError::Transient { message }
        }
    }
}

pub(crate) fn matches_permanent_signature(diagnostic: &str) -> bool {
    let lower = diagnostic.to_lowercase();
    PERMANENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

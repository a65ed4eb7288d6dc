//! Metadata probing.
//!
//! A failed probe is not an error: several platforms refuse the metadata
//! endpoint while still serving the actual media, so the executor falls
//! back to placeholder metadata and downloads anyway.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

/// Title/uploader info attached to a finished artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMetadata {
    pub title: String,
    pub uploader: String,
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl MediaMetadata {
    /// Stand-in used when the probe fails or is blocked.
    pub fn placeholder(url: &str) -> Self {
        MediaMetadata {
            title: url.to_string(),
            uploader: "unknown_user".to_string(),
            duration_secs: None,
            width: None,
            height: None,
        }
    }

    pub fn from_probe_json(json: &Value) -> Self {
        MediaMetadata {
            title: json["title"].as_str().unwrap_or("untitled").to_string(),
            uploader: json["uploader"]
                .as_str()
                .or_else(|| json["channel"].as_str())
                .or_else(|| json["uploader_id"].as_str())
                .unwrap_or("unknown_user")
                .to_string(),
            duration_secs: json["duration"].as_f64(),
            width: json["width"].as_u64().map(|w| w as u32),
            height: json["height"].as_u64().map(|h| h as u32),
        }
    }
}

/// Probe a URL with the extractor in metadata-only mode.
///
/// Returns placeholder metadata on any failure path (missing binary,
/// non-zero exit, malformed JSON, timeout).
pub async fn probe(bin: &Path, url: &str, timeout: Duration) -> MediaMetadata {
    let invocation = Command::new(bin)
        .arg(url)
        .arg("--dump-json")
        .arg("--no-download")
        .arg("--no-warnings")
        .arg("--no-playlist")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match tokio::time::timeout(timeout, invocation).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Metadata probe failed to spawn: {}", e);
            return MediaMetadata::placeholder(url);
        }
        Err(_) => {
            warn!("Metadata probe timed out after {:?}", timeout);
            return MediaMetadata::placeholder(url);
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            "Metadata probe exited {:?}: {}",
            output.status.code(),
            stderr.lines().last().unwrap_or("")
        );
        return MediaMetadata::placeholder(url);
    }

    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(json) => MediaMetadata::from_probe_json(&json),
        Err(e) => {
            debug!("Metadata probe produced unparseable JSON: {}", e);
            MediaMetadata::placeholder(url)
        }
    }
}

/// Reduce a title to something safe for a filename.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('_');
    let mut out: String = trimmed.chars().take(64).collect();
    if out.is_empty() {
        out.push_str("media");
    }
    out
}

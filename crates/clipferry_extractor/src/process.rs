//! External extractor invocation.
//!
//! Spawns the extractor binary with piped stdio, streams stdout for
//! progress lines, keeps a bounded tail of diagnostics, and enforces the
//! attempt timeout by killing the child.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{matches_permanent_signature, ExtractError};
use crate::platform::FormatPolicy;

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[download\]\s+(\d{1,3}(?:\.\d+)?)%").unwrap())
}

/// Parse a percentage out of one extractor stdout line.
pub(crate) fn parse_progress_line(line: &str) -> Option<f64> {
    let caps = progress_pattern().captures(line)?;
    caps.get(1)?.as_str().parse::<f64>().ok().map(|p| p.clamp(0.0, 100.0))
}

/// Bounded diagnostic capture: total output is capped (tail dropped) and
/// the last non-empty stderr line is kept for error classification.
#[derive(Default)]
struct Capture {
    combined: String,
    last_stderr_line: Option<String>,
    budget: usize,
}

impl Capture {
    fn new(budget: usize) -> Self {
        Capture { budget, ..Capture::default() }
    }

    fn push_line(&mut self, line: &str, from_stderr: bool) {
        if self.combined.len() < self.budget {
            let remaining = self.budget - self.combined.len();
            let mut take = line.len().min(remaining);
            while take > 0 && !line.is_char_boundary(take) {
                take -= 1;
            }
            self.combined.push_str(&line[..take]);
            self.combined.push('\n');
        }
        if from_stderr && !line.trim().is_empty() {
            self.last_stderr_line = Some(line.trim().to_string());
        }
    }
}

pub(crate) struct DownloadSpec<'a> {
    pub bin: &'a Path,
    pub url: &'a str,
    pub policy: &'a FormatPolicy,
    pub dest: &'a Path,
    pub timeout: Duration,
    pub max_capture_bytes: usize,
}

/// Run one primary download attempt.
///
/// `progress` receives strictly increasing percentages, clamped to 99;
/// the caller announces 100 itself once the artifact is verified.
pub(crate) async fn run_download(
    spec: DownloadSpec<'_>,
    progress: &mut (dyn FnMut(u8) + Send),
) -> Result<(), ExtractError> {
    let mut cmd = Command::new(spec.bin);
    cmd.arg(spec.url)
        .arg("-f")
        .arg(spec.policy.format_selector)
        .arg("-o")
        .arg(spec.dest)
        .arg("--newline")
        .arg("--no-playlist")
        .arg("--no-warnings")
        .arg("--no-part");
    if let Some(referer) = spec.policy.referer {
        cmd.arg("--add-header").arg(format!("Referer:{}", referer));
    }
    if let Some(ua) = spec.policy.user_agent {
        cmd.arg("--user-agent").arg(ua);
    }
    if spec.policy.concurrent_fragments > 1 {
        cmd.arg("-N").arg(spec.policy.concurrent_fragments.to_string());
    }
    if let Some(chunk) = spec.policy.http_chunk_size {
        cmd.arg("--http-chunk-size").arg(chunk);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| ExtractError::Transient {
            message: format!("failed to spawn extractor '{}': {}", spec.bin.display(), e),
        })?;

    let stdout = child.stdout.take().ok_or_else(|| ExtractError::Transient {
        message: "failed to capture extractor stdout".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| ExtractError::Transient {
        message: "failed to capture extractor stderr".to_string(),
    })?;

    let capture = Arc::new(Mutex::new(Capture::new(spec.max_capture_bytes)));

    let stderr_capture = Arc::clone(&capture);
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut cap) = stderr_capture.lock() {
                cap.push_line(&line, true);
            }
        }
    });

    let stdout_capture = Arc::clone(&capture);
    let drive = async {
        let mut lines = BufReader::new(stdout).lines();
        let mut last_forwarded: u8 = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(pct) = parse_progress_line(&line) {
                // Tool output is not monotonic (fragment restarts, merged
                // streams); only strictly increasing values go out, and 100
                // is withheld until verification.
                let clamped = (pct as u8).min(99);
                if clamped > last_forwarded {
                    last_forwarded = clamped;
                    progress(clamped);
                }
            } else if let Ok(mut cap) = stdout_capture.lock() {
                cap.push_line(&line, false);
            }
        }
        child.wait().await
    };

    let status = match tokio::time::timeout(spec.timeout, drive).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            stderr_task.abort();
            return Err(ExtractError::Transient {
                message: format!("failed waiting for extractor: {}", e),
            });
        }
        Err(_) => {
            // The child is killed via kill_on_drop when this function
            // returns. Output seen before the kill still decides the
            // classification.
            stderr_task.abort();
            let diagnostic = snapshot_diagnostic(&capture);
            warn!("Extractor timed out after {:?}: {}", spec.timeout, diagnostic);
            if matches_permanent_signature(&diagnostic) {
                return Err(ExtractError::Permanent { message: diagnostic });
            }
            return Err(ExtractError::Transient {
                message: format!("extractor timed out after {}s", spec.timeout.as_secs()),
            });
        }
    };

    let _ = stderr_task.await;

    if status.success() {
        debug!("Extractor finished for {}", spec.url);
        return Ok(());
    }

    let diagnostic = {
        let cap = capture.lock().ok();
        let last = cap.as_ref().and_then(|c| c.last_stderr_line.clone());
        last.unwrap_or_else(|| {
            format!("extractor exited with status {}", status.code().unwrap_or(-1))
        })
    };
    Err(ExtractError::classify(diagnostic))
}

fn snapshot_diagnostic(capture: &Arc<Mutex<Capture>>) -> String {
    capture
        .lock()
        .ok()
        .map(|c| c.combined.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::policy_for;
    use clipferry_protocol::Platform;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line("[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10"),
            Some(45.2)
        );
        assert_eq!(parse_progress_line("[download] 100% of 3.2MiB"), Some(100.0));
        assert_eq!(parse_progress_line("[download] Destination: out.mp4"), None);
        assert_eq!(parse_progress_line("[info] Writing metadata"), None);
    }

    #[test]
    fn test_capture_keeps_last_stderr_line() {
        let mut cap = Capture::new(1024);
        cap.push_line("WARNING: something", true);
        cap.push_line("", true);
        cap.push_line("ERROR: Private video", true);
        assert_eq!(cap.last_stderr_line.as_deref(), Some("ERROR: Private video"));
    }

    #[test]
    fn test_capture_budget_is_bounded() {
        let mut cap = Capture::new(16);
        for _ in 0..100 {
            cap.push_line("0123456789", false);
        }
        assert!(cap.combined.len() <= 16 + 11);
    }

    #[tokio::test]
    async fn test_missing_binary_is_transient() {
        let policy = policy_for(Platform::Generic);
        let spec = DownloadSpec {
            bin: Path::new("/definitely/not/here"),
            url: "https://example.com/v",
            policy: &policy,
            dest: Path::new("/tmp/clipferry-test-none.mp4"),
            timeout: Duration::from_secs(2),
            max_capture_bytes: 1024,
        };
        let mut sink = |_p: u8| {};
        let err = run_download(spec, &mut sink).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_nonzero_exit_uses_last_stderr_line() {
        // `sh -c` stands in for the extractor: prints a permanent-failure
        // diagnostic on stderr and exits 1.
        let policy = FormatPolicy {
            format_selector: "echo 'ERROR: Private video' >&2; exit 1",
            ..policy_for(Platform::Generic)
        };
        let spec = DownloadSpec {
            bin: Path::new("/bin/sh"),
            url: "-c",
            policy: &policy,
            dest: Path::new("/tmp/clipferry-test-stderr.mp4"),
            timeout: Duration::from_secs(5),
            max_capture_bytes: 1024,
        };
        let mut sink = |_p: u8| {};
        let err = run_download(spec, &mut sink).await.unwrap_err();
        assert!(err.is_permanent(), "got: {}", err);
    }
}

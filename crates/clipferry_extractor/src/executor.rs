//! Strategy execution: primary extractor, then the platform's fallbacks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use clipferry_protocol::defaults::EXTRACTOR_FALLBACK_BIN;
use clipferry_protocol::{Job, JobTag, RelayConfig};

use crate::error::ExtractError;
use crate::fallback::{build_chain, stream_to_file, FallbackApi};
use crate::metadata::{self, sanitize_filename, MediaMetadata};
use crate::platform::{policy_for, FormatPolicy};
use crate::process::{run_download, DownloadSpec};

/// Progress callback handed down by the scheduler. Values arrive strictly
/// increasing within an attempt, clamped to 99 until verification; 100 is
/// emitted exactly once, after the artifact checks out.
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// A finished download on disk.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub size: u64,
    pub metadata: MediaMetadata,
}

impl Artifact {
    /// Human-facing filename for delivery (uploads, captions).
    pub fn suggested_name(&self) -> String {
        let ext = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        format!("{}.{}", sanitize_filename(&self.metadata.title), ext)
    }
}

/// The seam between the scheduler and the extraction machinery. The
/// scheduler only ever sees this trait; tests drive it with scripted
/// runners.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job, progress: ProgressFn<'_>) -> Result<Artifact, ExtractError>;
}

/// Production runner: external extractor binary first, then the
/// platform's HTTP API fallback chain, in policy order.
pub struct StrategyExecutor {
    bin: Option<PathBuf>,
    configured_bin: String,
    client: Client,
    temp_dir: PathBuf,
    metadata_timeout: Duration,
    download_timeout: Duration,
    fallback_timeout: Duration,
    max_capture_bytes: usize,
}

impl StrategyExecutor {
    pub fn new(config: &RelayConfig) -> Self {
        let bin = resolve_extractor(&config.extractor_bin);
        match &bin {
            Some(path) => info!("Extractor binary: {}", path.display()),
            None => warn!(
                "Extractor binary '{}' not found on PATH (nor '{}'); only HTTP fallbacks will work",
                config.extractor_bin, EXTRACTOR_FALLBACK_BIN
            ),
        }
        Self {
            bin,
            configured_bin: config.extractor_bin.clone(),
            client: Client::new(),
            temp_dir: config.temp_dir.clone(),
            metadata_timeout: config.metadata_timeout,
            download_timeout: config.download_timeout,
            fallback_timeout: config.fallback_timeout,
            max_capture_bytes: config.max_capture_bytes,
        }
    }

    pub fn extractor_available(&self) -> bool {
        self.bin.is_some()
    }

    /// Version probe for the startup log. Best effort.
    pub async fn probe_version(&self) -> Option<String> {
        let bin = self.bin.as_ref()?;
        let output = tokio::process::Command::new(bin)
            .arg("--version")
            .output()
            .await
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn execute(
        &self,
        job: &Job,
        progress: ProgressFn<'_>,
    ) -> Result<Artifact, ExtractError> {
        let policy = policy_for(job.platform);
        let chain = build_chain(policy.fallbacks, &self.client, self.fallback_timeout);
        self.execute_with_chain(job, &policy, &chain, progress).await
    }

    pub(crate) async fn execute_with_chain(
        &self,
        job: &Job,
        policy: &FormatPolicy,
        chain: &[Box<dyn FallbackApi>],
        progress: ProgressFn<'_>,
    ) -> Result<Artifact, ExtractError> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| ExtractError::Transient {
                message: format!("cannot create temp dir {}: {}", self.temp_dir.display(), e),
            })?;

        let dest = self.temp_dir.join(format!("{}.mp4", job.tag));

        let mut meta = match &self.bin {
            Some(bin) => metadata::probe(bin, &job.url, self.metadata_timeout).await,
            None => MediaMetadata::placeholder(&job.url),
        };

        // --- primary strategy ---
        let primary_err = match &self.bin {
            Some(bin) => {
                let spec = DownloadSpec {
                    bin,
                    url: &job.url,
                    policy,
                    dest: &dest,
                    timeout: self.download_timeout,
                    max_capture_bytes: self.max_capture_bytes,
                };
                let mut forward = |p: u8| progress(p);
                match run_download(spec, &mut forward).await {
                    Ok(()) => match self.locate_artifact(&job.tag).await {
                        Ok((path, size)) => {
                            progress(100);
                            return Ok(Artifact { path, size, metadata: meta });
                        }
                        Err(e) => {
                            self.cleanup_partial(&job.tag).await;
                            e
                        }
                    },
                    Err(e) => {
                        self.cleanup_partial(&job.tag).await;
                        e
                    }
                }
            }
            None => ExtractError::Transient {
                message: format!("extractor binary '{}' not available", self.configured_bin),
            },
        };

        if chain.is_empty() {
            return Err(primary_err);
        }

        warn!(
            "Primary extraction for {} failed ({}); trying {} fallback(s)",
            job.tag,
            primary_err.message(),
            chain.len()
        );

        // --- fallback chain, in policy order, first success wins ---
        let mut last_err = primary_err;
        for api in chain {
            debug!("Job {}: fallback '{}'", job.tag, api.name());
            let resolved = match api.resolve(&job.url).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    last_err = e.into_extract_error();
                    continue;
                }
            };

            match stream_to_file(&self.client, &resolved.media_url, &dest, self.fallback_timeout)
                .await
            {
                Ok(_) => match self.locate_artifact(&job.tag).await {
                    Ok((path, size)) => {
                        // A blocked probe left placeholder metadata; the
                        // API's answer is better than nothing.
                        if meta.uploader == "unknown_user" {
                            if let Some(uploader) = resolved.uploader {
                                meta.uploader = uploader;
                            }
                            if let Some(title) = resolved.title {
                                meta.title = title;
                            }
                        }
                        info!("Job {}: fallback '{}' succeeded", job.tag, api.name());
                        progress(100);
                        return Ok(Artifact { path, size, metadata: meta });
                    }
                    Err(e) => {
                        self.cleanup_partial(&job.tag).await;
                        last_err = e;
                    }
                },
                Err(e) => {
                    self.cleanup_partial(&job.tag).await;
                    last_err = e.into_extract_error();
                }
            }
        }

        Err(last_err)
    }

    /// Find the artifact for a tag. The extractor may change the extension
    /// when it merges streams, so this scans for the tag prefix instead of
    /// trusting the requested path.
    async fn locate_artifact(&self, tag: &JobTag) -> Result<(PathBuf, u64), ExtractError> {
        let prefix = tag.to_string();
        let mut found_empty = false;

        let mut entries = tokio::fs::read_dir(&self.temp_dir).await.map_err(|e| {
            ExtractError::Transient { message: format!("cannot read temp dir: {}", e) }
        })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() && meta.len() > 0 {
                    return Ok((entry.path(), meta.len()));
                }
                found_empty = true;
            }
        }

        Err(ExtractError::Transient {
            message: if found_empty {
                "strategy produced an empty file".to_string()
            } else {
                "strategy reported success but produced no file".to_string()
            },
        })
    }

    /// Remove anything this tag wrote, best effort.
    async fn cleanup_partial(&self, tag: &JobTag) {
        let prefix = tag.to_string();
        let Ok(mut entries) = tokio::fs::read_dir(&self.temp_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
    }
}

#[async_trait]
impl JobRunner for StrategyExecutor {
    async fn run(&self, job: &Job, progress: ProgressFn<'_>) -> Result<Artifact, ExtractError> {
        self.execute(job, progress).await
    }
}

fn resolve_extractor(name: &str) -> Option<PathBuf> {
    which::which(name)
        .or_else(|_| which::which(EXTRACTOR_FALLBACK_BIN))
        .ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::fallback::ResolvedMedia;
    use crate::platform::policy_for;
    use clipferry_protocol::Platform;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-extractor");
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn executor_with(bin: &Path, temp: &Path) -> StrategyExecutor {
        let config = RelayConfig {
            extractor_bin: bin.display().to_string(),
            temp_dir: temp.to_path_buf(),
            metadata_timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(10),
            fallback_timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        };
        StrategyExecutor::new(&config)
    }

    fn job(url: &str, platform: Platform) -> Job {
        Job::new(url, platform, json!(null))
    }

    struct StubApi {
        media_url: String,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl FallbackApi for StubApi {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn resolve(&self, _url: &str) -> Result<ResolvedMedia, crate::fallback::FallbackError> {
            if let Some(status) = self.fail_with {
                return Err(crate::fallback::FallbackError::Status { api: "stub", status });
            }
            Ok(ResolvedMedia {
                media_url: self.media_url.clone(),
                uploader: Some("someone".to_string()),
                title: Some("a clip".to_string()),
            })
        }
    }

    const OK_SCRIPT: &str = r#"#!/bin/sh
dest=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then dest="$2"; shift; fi
  shift
done
if [ -z "$dest" ]; then exit 1; fi
echo "[download]  10.0% of 1.00MiB at 500KiB/s"
echo "[download]   5.0% of 1.00MiB at 500KiB/s"
echo "[download]  55.5% of 1.00MiB at 500KiB/s"
echo "[download] 100% of 1.00MiB"
printf 'videodata' > "$dest"
"#;

    #[tokio::test]
    async fn test_primary_success_reports_monotonic_progress() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), OK_SCRIPT);
        let executor = executor_with(&bin, dir.path());

        let job = job("https://example.com/v", Platform::Generic);
        let seen = Mutex::new(Vec::new());
        let artifact = executor
            .execute(&job, &|p| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(artifact.size, 9);
        assert!(artifact.path.exists());

        let seen = seen.into_inner().unwrap();
        // Non-monotonic tool output is filtered; 100 only after verification.
        assert_eq!(seen, vec![10, 55, 99, 100]);
    }

    #[tokio::test]
    async fn test_empty_output_is_a_strategy_failure() {
        let script = r#"#!/bin/sh
dest=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then dest="$2"; shift; fi
  shift
done
: > "$dest"
"#;
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), script);
        let executor = executor_with(&bin, dir.path());

        let job = job("https://example.com/v", Platform::Generic);
        let err = executor.execute(&job, &|_| {}).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("empty"), "got: {}", err.message());
    }

    #[tokio::test]
    async fn test_fallback_succeeds_after_primary_failure() {
        let failing = "#!/bin/sh\necho 'network unreachable' >&2\nexit 1\n";
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), failing);
        let executor = executor_with(&bin, dir.path());

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 4096]))
            .mount(&server)
            .await;

        let chain: Vec<Box<dyn FallbackApi>> = vec![Box::new(StubApi {
            media_url: format!("{}/media.mp4", server.uri()),
            fail_with: None,
        })];

        let job = job("https://www.tiktok.com/@u/video/1", Platform::Tiktok);
        let policy = policy_for(Platform::Tiktok);
        let artifact = executor
            .execute_with_chain(&job, &policy, &chain, &|_| {})
            .await
            .unwrap();

        assert_eq!(artifact.size, 4096);
        // Probe was blocked, so the fallback's metadata filled the gap.
        assert_eq!(artifact.metadata.uploader, "someone");
        assert_eq!(artifact.metadata.title, "a clip");
    }

    #[tokio::test]
    async fn test_all_strategies_failed_returns_last_fallback_error() {
        let failing = "#!/bin/sh\necho 'ERROR: HTTP Error 404: Not Found' >&2\nexit 1\n";
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), failing);
        let executor = executor_with(&bin, dir.path());

        let chain: Vec<Box<dyn FallbackApi>> = vec![Box::new(StubApi {
            media_url: String::new(),
            fail_with: Some(503),
        })];

        let job = job("https://www.tiktok.com/@u/video/1", Platform::Tiktok);
        let policy = policy_for(Platform::Tiktok);
        let err = executor
            .execute_with_chain(&job, &policy, &chain, &|_| {})
            .await
            .unwrap_err();

        // Primary was permanent (404), but the chain ran and the LAST
        // fallback's error wins: 503 is transient.
        assert!(err.is_transient(), "got: {}", err);
    }

    #[tokio::test]
    async fn test_no_fallbacks_returns_primary_error() {
        let failing = "#!/bin/sh\necho 'ERROR: HTTP Error 404: Not Found' >&2\nexit 1\n";
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), failing);
        let executor = executor_with(&bin, dir.path());

        // Generic has an empty fallback chain.
        let job = job("https://example.com/v", Platform::Generic);
        let err = executor.execute(&job, &|_| {}).await.unwrap_err();
        assert!(err.is_permanent(), "got: {}", err);
    }

    #[tokio::test]
    async fn test_failed_attempt_cleans_partial_files() {
        // Writes the destination, then fails: the partial must not survive.
        let script = r#"#!/bin/sh
dest=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then dest="$2"; shift; fi
  shift
done
printf 'partial' > "$dest"
echo 'connection reset' >&2
exit 1
"#;
        let dir = tempfile::tempdir().unwrap();
        let bin = write_script(dir.path(), script);
        let executor = executor_with(&bin, dir.path());

        let job = job("https://example.com/v", Platform::Generic);
        let tag = job.tag.clone();
        let err = executor.execute(&job, &|_| {}).await.unwrap_err();
        assert!(err.is_transient());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(tag.as_str()))
            })
            .collect();
        assert!(leftovers.is_empty());
    }
}

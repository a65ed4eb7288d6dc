//! Delivery boundary.
//!
//! A finished artifact is either presented inline (small enough for the
//! chat platform to take directly) or pushed through an ordered chain of
//! external file hosts, first success wins. Delivery failures stay on
//! this side of the boundary - they are logged and surfaced, never fed
//! back into the scheduler's retry logic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use clipferry_extractor::Artifact;

const CATBOX_BASE: &str = "https://catbox.moe/user/api.php";
const ZEROXZERO_BASE: &str = "https://0x0.st";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// How the caller should present the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Small enough to attach directly.
    Inline(PathBuf),
    /// Uploaded to an external host; present this link instead.
    Hosted(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("all {tried} file host(s) failed, last error: {last}")]
    AllHostsFailed { tried: usize, last: String },
    #[error("no file hosts configured for oversized artifact ({size} bytes)")]
    NoHosts { size: u64 },
}

/// One external file host.
#[async_trait]
pub trait FileHost: Send + Sync {
    fn name(&self) -> &'static str;
    /// Upload and return a public link.
    async fn upload(&self, path: &Path, file_name: &str) -> Result<String>;
}

/// Inline-vs-host decision point plus the host chain.
pub struct DeliverySink {
    inline_limit: u64,
    hosts: Vec<Box<dyn FileHost>>,
}

impl DeliverySink {
    pub fn new(inline_limit: u64, hosts: Vec<Box<dyn FileHost>>) -> Self {
        Self { inline_limit, hosts }
    }

    /// Standard chain used by the daemon.
    pub fn with_default_hosts(inline_limit: u64, client: &Client) -> Self {
        Self::new(
            inline_limit,
            vec![
                Box::new(CatboxHost::new(client.clone())),
                Box::new(ZeroXZeroHost::new(client.clone())),
            ],
        )
    }

    pub async fn deliver(&self, artifact: &Artifact) -> Result<Delivery, DeliveryError> {
        if artifact.size <= self.inline_limit {
            return Ok(Delivery::Inline(artifact.path.clone()));
        }

        if self.hosts.is_empty() {
            return Err(DeliveryError::NoHosts { size: artifact.size });
        }

        let file_name = artifact.suggested_name();
        let mut last = String::new();
        for host in &self.hosts {
            match host.upload(&artifact.path, &file_name).await {
                Ok(link) => {
                    info!("Uploaded {} bytes to {}: {}", artifact.size, host.name(), link);
                    return Ok(Delivery::Hosted(link));
                }
                Err(e) => {
                    warn!("Upload to {} failed: {:#}", host.name(), e);
                    last = format!("{}: {:#}", host.name(), e);
                }
            }
        }

        Err(DeliveryError::AllHostsFailed { tried: self.hosts.len(), last })
    }
}

async fn file_part(path: &Path, file_name: &str) -> Result<Part> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("artifact vanished: {}", path.display()))?;
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open artifact: {}", path.display()))?;
    let body = Body::wrap_stream(ReaderStream::new(file));
    Ok(Part::stream_with_length(body, meta.len())
        .file_name(file_name.to_string())
        .mime_str("application/octet-stream")?)
}

/// Validate that a host's plain-text reply is actually a link.
fn expect_link(host: &'static str, text: &str) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        anyhow::bail!("{} returned a non-link reply: {}", host, truncate(trimmed, 120))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub struct CatboxHost {
    client: Client,
    base: String,
}

impl CatboxHost {
    pub fn new(client: Client) -> Self {
        Self { client, base: CATBOX_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base(client: Client, base: String) -> Self {
        Self { client, base }
    }
}

#[async_trait]
impl FileHost for CatboxHost {
    fn name(&self) -> &'static str {
        "catbox"
    }

    async fn upload(&self, path: &Path, file_name: &str) -> Result<String> {
        let form = Form::new()
            .text("reqtype", "fileupload")
            .part("fileToUpload", file_part(path, file_name).await?);

        let response = self
            .client
            .post(self.base.as_str())
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
            .context("catbox request failed")?
            .error_for_status()
            .context("catbox rejected the upload")?;

        expect_link("catbox", &response.text().await.context("catbox reply unreadable")?)
    }
}

pub struct ZeroXZeroHost {
    client: Client,
    base: String,
}

impl ZeroXZeroHost {
    pub fn new(client: Client) -> Self {
        Self { client, base: ZEROXZERO_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base(client: Client, base: String) -> Self {
        Self { client, base }
    }
}

#[async_trait]
impl FileHost for ZeroXZeroHost {
    fn name(&self) -> &'static str {
        "0x0"
    }

    async fn upload(&self, path: &Path, file_name: &str) -> Result<String> {
        let form = Form::new().part("file", file_part(path, file_name).await?);

        let response = self
            .client
            .post(self.base.as_str())
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
            .context("0x0 request failed")?
            .error_for_status()
            .context("0x0 rejected the upload")?;

        expect_link("0x0", &response.text().await.context("0x0 reply unreadable")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipferry_extractor::MediaMetadata;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn artifact(path: PathBuf, size: u64) -> Artifact {
        Artifact {
            path,
            size,
            metadata: MediaMetadata::placeholder("https://example.com/v"),
        }
    }

    #[tokio::test]
    async fn test_small_artifact_goes_inline() {
        let sink = DeliverySink::new(1_000, vec![]);
        let artifact = artifact(PathBuf::from("/tmp/small.mp4"), 999);
        let delivery = sink.deliver(&artifact).await.unwrap();
        assert_eq!(delivery, Delivery::Inline(PathBuf::from("/tmp/small.mp4")));
    }

    #[tokio::test]
    async fn test_oversized_without_hosts_errors() {
        let sink = DeliverySink::new(1_000, vec![]);
        let artifact = artifact(PathBuf::from("/tmp/big.mp4"), 5_000);
        let err = sink.deliver(&artifact).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NoHosts { size: 5_000 }));
    }

    #[tokio::test]
    async fn test_oversized_uploads_first_success_wins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://files.example/abc.mp4\n"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        std::fs::write(&path, vec![0u8; 2_000]).unwrap();

        let sink = DeliverySink::new(
            1_000,
            vec![Box::new(CatboxHost::with_base(Client::new(), server.uri()))],
        );
        let delivery = sink.deliver(&artifact(path, 2_000)).await.unwrap();
        assert_eq!(delivery, Delivery::Hosted("https://files.example/abc.mp4".to_string()));
    }

    #[tokio::test]
    async fn test_chain_falls_through_to_second_host() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&failing)
            .await;
        let working = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://0x0.example/xyz"))
            .mount(&working)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        std::fs::write(&path, vec![0u8; 2_000]).unwrap();

        let sink = DeliverySink::new(
            1_000,
            vec![
                Box::new(CatboxHost::with_base(Client::new(), failing.uri())),
                Box::new(ZeroXZeroHost::with_base(Client::new(), working.uri())),
            ],
        );
        let delivery = sink.deliver(&artifact(path, 2_000)).await.unwrap();
        assert_eq!(delivery, Delivery::Hosted("https://0x0.example/xyz".to_string()));
    }

    #[tokio::test]
    async fn test_all_hosts_failing_is_a_delivery_error() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        std::fs::write(&path, vec![0u8; 2_000]).unwrap();

        let sink = DeliverySink::new(
            1_000,
            vec![Box::new(CatboxHost::with_base(Client::new(), failing.uri()))],
        );
        let err = sink.deliver(&artifact(path, 2_000)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::AllHostsFailed { tried: 1, .. }));
    }

    #[tokio::test]
    async fn test_non_link_reply_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("internal error page"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        std::fs::write(&path, vec![0u8; 2_000]).unwrap();

        let sink = DeliverySink::new(
            1_000,
            vec![Box::new(CatboxHost::with_base(Client::new(), server.uri()))],
        );
        let err = sink.deliver(&artifact(path, 2_000)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::AllHostsFailed { .. }));
    }
}

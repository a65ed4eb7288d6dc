//! HTTP API fallbacks.
//!
//! Each platform can declare scraping APIs to try when the primary
//! extractor fails. A fallback resolves the page URL to a direct media
//! URL, which is then streamed to the destination file. APIs are
//! independent: one failing does not stop the chain.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ExtractError;
use crate::platform::FallbackKind;

const TIKWM_BASE: &str = "https://www.tikwm.com";
const VXTWITTER_BASE: &str = "https://api.vxtwitter.com";
const COBALT_BASE: &str = "https://api.cobalt.tools";

const FALLBACK_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Direct media location plus the minimal metadata an API exposes.
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub media_url: String,
    pub uploader: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("{api} responded with HTTP {status}")]
    Status { api: &'static str, status: u16 },
    #[error("{api} rejected the URL: {message}")]
    Rejected { api: &'static str, message: String },
    #[error("{api} returned an unusable payload: {reason}")]
    Decode { api: &'static str, reason: String },
    #[error("network error talking to {api}: {source}")]
    Network {
        api: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("i/o error while streaming fallback media: {0}")]
    Io(#[from] std::io::Error),
}

impl FallbackError {
    /// Collapse into the executor's taxonomy. HTTP statuses carry the
    /// permanent/transient split; rejection messages are pattern-matched
    /// like extractor diagnostics; everything else is transient.
    pub fn into_extract_error(self) -> ExtractError {
        match self {
            FallbackError::Status { api, status } => ExtractError::from_http_status(status, api),
            FallbackError::Rejected { api, message } => {
                ExtractError::classify(format!("{}: {}", api, message))
            }
            other => ExtractError::Transient { message: other.to_string() },
        }
    }
}

/// One pluggable scraping API.
#[async_trait]
pub trait FallbackApi: Send + Sync {
    fn name(&self) -> &'static str;
    async fn resolve(&self, url: &str) -> Result<ResolvedMedia, FallbackError>;
}

/// Instantiate the APIs a policy asks for, in policy order.
pub fn build_chain(
    kinds: &[FallbackKind],
    client: &Client,
    timeout: Duration,
) -> Vec<Box<dyn FallbackApi>> {
    kinds
        .iter()
        .map(|kind| -> Box<dyn FallbackApi> {
            match kind {
                FallbackKind::Tikwm => Box::new(TikwmApi::new(client.clone(), timeout)),
                FallbackKind::VxTwitter => Box::new(VxTwitterApi::new(client.clone(), timeout)),
                FallbackKind::RedditJson => Box::new(RedditJsonApi::new(client.clone(), timeout)),
                FallbackKind::Cobalt => Box::new(CobaltApi::new(client.clone(), timeout)),
            }
        })
        .collect()
}

/// Stream a resolved media URL into the destination file.
/// Returns bytes written; the caller verifies and cleans up.
pub async fn stream_to_file(
    client: &Client,
    media_url: &str,
    dest: &Path,
    timeout: Duration,
) -> Result<u64, FallbackError> {
    const API: &str = "media host";
    let response = client
        .get(media_url)
        .header(reqwest::header::USER_AGENT, FALLBACK_UA)
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| FallbackError::Network { api: API, source })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FallbackError::Status { api: API, status: status.as_u16() });
    }

    let mut file = tokio::fs::File::create(dest).await?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| FallbackError::Network { api: API, source })?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await.ok();

    debug!("Streamed {} bytes from fallback media host", written);
    Ok(written)
}

// ============================================================================
// Concrete APIs
// ============================================================================

pub struct TikwmApi {
    client: Client,
    timeout: Duration,
    base: String,
}

impl TikwmApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout, base: TIKWM_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base(client: Client, timeout: Duration, base: String) -> Self {
        Self { client, timeout, base }
    }
}

#[async_trait]
impl FallbackApi for TikwmApi {
    fn name(&self) -> &'static str {
        "tikwm"
    }

    async fn resolve(&self, url: &str) -> Result<ResolvedMedia, FallbackError> {
        let api = self.name();
        let response = self
            .client
            .get(format!("{}/api/", self.base))
            .query(&[("url", url), ("hd", "1")])
            .header(reqwest::header::USER_AGENT, FALLBACK_UA)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FallbackError::Network { api, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FallbackError::Status { api, status: status.as_u16() });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FallbackError::Decode { api, reason: e.to_string() })?;

        if body["code"].as_i64() != Some(0) {
            let message = body["msg"].as_str().unwrap_or("unspecified rejection").to_string();
            return Err(FallbackError::Rejected { api, message });
        }

        let data = &body["data"];
        let media_url = data["hdplay"]
            .as_str()
            .filter(|s| !s.is_empty())
            .or_else(|| data["play"].as_str().filter(|s| !s.is_empty()))
            .ok_or_else(|| FallbackError::Decode {
                api,
                reason: "no playable URL in response".to_string(),
            })?;

        Ok(ResolvedMedia {
            media_url: absolutize(&self.base, media_url),
            uploader: data["author"]["unique_id"].as_str().map(str::to_string),
            title: data["title"].as_str().map(str::to_string),
        })
    }
}

/// tikwm sometimes returns relative media paths.
fn absolutize(base: &str, url: &str) -> String {
    if url.starts_with("http") {
        url.to_string()
    } else {
        format!("{}{}", base, url)
    }
}

pub struct VxTwitterApi {
    client: Client,
    timeout: Duration,
    base: String,
}

impl VxTwitterApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout, base: VXTWITTER_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base(client: Client, timeout: Duration, base: String) -> Self {
        Self { client, timeout, base }
    }

    /// Rewrite a tweet URL onto the API host, keeping the status path.
    fn api_url(&self, url: &str) -> Result<String, FallbackError> {
        let path = url
            .split_once("twitter.com")
            .or_else(|| url.split_once("x.com"))
            .map(|(_, rest)| rest)
            .filter(|rest| rest.contains("/status/"))
            .ok_or_else(|| FallbackError::Decode {
                api: "vxtwitter",
                reason: format!("not a status URL: {}", url),
            })?;
        Ok(format!("{}{}", self.base, path))
    }
}

#[async_trait]
impl FallbackApi for VxTwitterApi {
    fn name(&self) -> &'static str {
        "vxtwitter"
    }

    async fn resolve(&self, url: &str) -> Result<ResolvedMedia, FallbackError> {
        let api = self.name();
        let request_url = self.api_url(url)?;
        let response = self
            .client
            .get(request_url)
            .header(reqwest::header::USER_AGENT, FALLBACK_UA)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FallbackError::Network { api, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FallbackError::Status { api, status: status.as_u16() });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FallbackError::Decode { api, reason: e.to_string() })?;

        let media_url = body["media_extended"]
            .as_array()
            .and_then(|media| {
                media.iter().find_map(|m| {
                    (m["type"].as_str() == Some("video") || m["type"].as_str() == Some("gif"))
                        .then(|| m["url"].as_str())
                        .flatten()
                })
            })
            .ok_or_else(|| FallbackError::Decode {
                api,
                reason: "tweet has no video media".to_string(),
            })?;

        Ok(ResolvedMedia {
            media_url: media_url.to_string(),
            uploader: body["user_screen_name"].as_str().map(str::to_string),
            title: body["text"].as_str().map(str::to_string),
        })
    }
}

pub struct RedditJsonApi {
    client: Client,
    timeout: Duration,
}

impl RedditJsonApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl FallbackApi for RedditJsonApi {
    fn name(&self) -> &'static str {
        "reddit-json"
    }

    async fn resolve(&self, url: &str) -> Result<ResolvedMedia, FallbackError> {
        let api = self.name();
        let json_url = format!("{}.json?raw_json=1", url.trim_end_matches('/'));
        let response = self
            .client
            .get(json_url)
            .header(reqwest::header::USER_AGENT, FALLBACK_UA)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FallbackError::Network { api, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FallbackError::Status { api, status: status.as_u16() });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FallbackError::Decode { api, reason: e.to_string() })?;

        let post = &body[0]["data"]["children"][0]["data"];
        let media_url = post["secure_media"]["reddit_video"]["fallback_url"]
            .as_str()
            .or_else(|| post["media"]["reddit_video"]["fallback_url"].as_str())
            .or_else(|| post["url_overridden_by_dest"].as_str().filter(|u| u.ends_with(".mp4")))
            .ok_or_else(|| FallbackError::Decode {
                api,
                reason: "post has no playable video".to_string(),
            })?;

        Ok(ResolvedMedia {
            media_url: media_url.to_string(),
            uploader: post["author"].as_str().map(str::to_string),
            title: post["title"].as_str().map(str::to_string),
        })
    }
}

pub struct CobaltApi {
    client: Client,
    timeout: Duration,
    base: String,
}

impl CobaltApi {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout, base: COBALT_BASE.to_string() }
    }

    #[cfg(test)]
    pub fn with_base(client: Client, timeout: Duration, base: String) -> Self {
        Self { client, timeout, base }
    }
}

#[async_trait]
impl FallbackApi for CobaltApi {
    fn name(&self) -> &'static str {
        "cobalt"
    }

    async fn resolve(&self, url: &str) -> Result<ResolvedMedia, FallbackError> {
        let api = self.name();
        let response = self
            .client
            .post(self.base.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, FALLBACK_UA)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|source| FallbackError::Network { api, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FallbackError::Status { api, status: status.as_u16() });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FallbackError::Decode { api, reason: e.to_string() })?;

        match body["status"].as_str() {
            Some("redirect") | Some("tunnel") | Some("stream") => {
                let media_url = body["url"].as_str().ok_or_else(|| FallbackError::Decode {
                    api,
                    reason: "resolver response missing url".to_string(),
                })?;
                Ok(ResolvedMedia {
                    media_url: media_url.to_string(),
                    uploader: None,
                    title: body["filename"].as_str().map(str::to_string),
                })
            }
            Some("error") | None => Err(FallbackError::Rejected {
                api,
                message: body["error"]["code"]
                    .as_str()
                    .or_else(|| body["text"].as_str())
                    .unwrap_or("unspecified rejection")
                    .to_string(),
            }),
            Some(other) => Err(FallbackError::Decode {
                api,
                reason: format!("unexpected resolver status '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        Client::new()
    }

    #[tokio::test]
    async fn test_tikwm_resolves_hd_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/"))
            .and(query_param("hd", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": {
                    "play": "/video/sd.mp4",
                    "hdplay": "https://cdn.example.com/hd.mp4",
                    "title": "a clip",
                    "author": { "unique_id": "someone" }
                }
            })))
            .mount(&server)
            .await;

        let api = TikwmApi::with_base(client(), Duration::from_secs(5), server.uri());
        let resolved = api.resolve("https://www.tiktok.com/@u/video/1").await.unwrap();
        assert_eq!(resolved.media_url, "https://cdn.example.com/hd.mp4");
        assert_eq!(resolved.uploader.as_deref(), Some("someone"));
    }

    #[tokio::test]
    async fn test_tikwm_relative_url_absolutized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "data": { "play": "/video/sd.mp4", "author": {}, "title": "" }
            })))
            .mount(&server)
            .await;

        let api = TikwmApi::with_base(client(), Duration::from_secs(5), server.uri());
        let resolved = api.resolve("https://www.tiktok.com/@u/video/1").await.unwrap();
        assert_eq!(resolved.media_url, format!("{}/video/sd.mp4", server.uri()));
    }

    #[tokio::test]
    async fn test_tikwm_rejection_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": -1,
                "msg": "url is invalid"
            })))
            .mount(&server)
            .await;

        let api = TikwmApi::with_base(client(), Duration::from_secs(5), server.uri());
        let err = api.resolve("https://www.tiktok.com/@u/video/1").await.unwrap_err();
        assert!(matches!(err, FallbackError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_fallback_status_maps_to_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = TikwmApi::with_base(client(), Duration::from_secs(5), server.uri());
        let err = api.resolve("https://www.tiktok.com/@u/video/1").await.unwrap_err();
        assert!(err.into_extract_error().is_permanent());
    }

    #[tokio::test]
    async fn test_fallback_5xx_maps_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = TikwmApi::with_base(client(), Duration::from_secs(5), server.uri());
        let err = api.resolve("https://www.tiktok.com/@u/video/1").await.unwrap_err();
        assert!(err.into_extract_error().is_transient());
    }

    #[tokio::test]
    async fn test_vxtwitter_url_rewrite_and_media_pick() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/status/123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "media_extended": [
                    { "type": "image", "url": "https://cdn/img.jpg" },
                    { "type": "video", "url": "https://cdn/video.mp4" }
                ],
                "user_screen_name": "user",
                "text": "tweet text"
            })))
            .mount(&server)
            .await;

        let api = VxTwitterApi::with_base(client(), Duration::from_secs(5), server.uri());
        let resolved = api.resolve("https://x.com/user/status/123").await.unwrap();
        assert_eq!(resolved.media_url, "https://cdn/video.mp4");
        assert_eq!(resolved.uploader.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_vxtwitter_rejects_non_status_urls() {
        let api = VxTwitterApi::new(client(), Duration::from_secs(5));
        let err = api.resolve("https://x.com/user").await.unwrap_err();
        assert!(matches!(err, FallbackError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_cobalt_error_status_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error",
                "text": "This video is unavailable"
            })))
            .mount(&server)
            .await;

        let api = CobaltApi::with_base(client(), Duration::from_secs(5), server.uri());
        let err = api.resolve("https://www.instagram.com/reel/x/").await.unwrap_err();
        // The rejection message itself carries the unavailability marker.
        assert!(err.into_extract_error().is_permanent());
    }

    #[tokio::test]
    async fn test_stream_to_file_writes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 2048]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let written = stream_to_file(
            &client(),
            &format!("{}/media.mp4", server.uri()),
            &dest,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(written, 2048);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 2048);
    }

    #[tokio::test]
    async fn test_stream_to_file_404_is_status_error() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.mp4");
        let err = stream_to_file(
            &client(),
            &format!("{}/missing.mp4", server.uri()),
            &dest,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FallbackError::Status { status: 404, .. }));
    }
}

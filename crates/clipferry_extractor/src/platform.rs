//! URL classification and per-platform extraction policy.
//!
//! `classify` is pure string inspection - no network, no state - so the
//! same URL always maps to the same platform and policy. First matching
//! pattern wins; the patterns are disjoint for the supported hosts.

use clipferry_protocol::Platform;

/// Host fragments per platform, checked in declaration order.
const HOST_PATTERNS: &[(Platform, &[&str])] = &[
    (Platform::Tiktok, &["tiktok.com", "vm.tiktok", "vt.tiktok"]),
    (Platform::Instagram, &["instagram.com", "instagr.am"]),
    (Platform::Twitter, &["twitter.com", "x.com/", "//x.com", "t.co/"]),
    (Platform::Youtube, &["youtube.com", "youtu.be"]),
    (Platform::Snapchat, &["snapchat.com"]),
    (Platform::Facebook, &["facebook.com", "fb.watch"]),
    (Platform::Reddit, &["reddit.com", "redd.it"]),
];

/// Map a URL to its platform. Unknown hosts fall back to `Generic`,
/// which still goes through the primary extractor (it supports far more
/// sites than we carry dedicated policies for).
pub fn classify(url: &str) -> Platform {
    let lower = url.to_lowercase();
    for (platform, patterns) in HOST_PATTERNS {
        if patterns.iter().any(|p| lower.contains(p)) {
            return *platform;
        }
    }
    Platform::Generic
}

/// HTTP fallback strategies, tried in the order a policy lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    /// tikwm.com JSON API (TikTok).
    Tikwm,
    /// api.vxtwitter.com JSON API (Twitter/X).
    VxTwitter,
    /// Reddit's own `.json` post endpoint.
    RedditJson,
    /// cobalt.tools generic resolver (Instagram, Facebook, Snapchat, ...).
    Cobalt,
}

/// Everything the executor needs to attempt one platform's download.
#[derive(Debug, Clone)]
pub struct FormatPolicy {
    /// yt-dlp format selector chain.
    pub format_selector: &'static str,
    /// Referer header some CDNs insist on.
    pub referer: Option<&'static str>,
    /// Override user agent; `None` keeps the extractor's default.
    pub user_agent: Option<&'static str>,
    /// Parallel fragment downloads (`-N`).
    pub concurrent_fragments: u8,
    /// HTTP chunk size hint (`--http-chunk-size`), platform dependent.
    pub http_chunk_size: Option<&'static str>,
    /// Ordered fallback chain when the primary extractor fails.
    pub fallbacks: &'static [FallbackKind],
}

const MOBILE_UA: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

/// Policy table. Selector strings keep files small enough for chat
/// delivery (height-capped mp4 first, best as the last resort).
pub fn policy_for(platform: Platform) -> FormatPolicy {
    match platform {
        Platform::Tiktok => FormatPolicy {
            format_selector: "mp4/best",
            referer: Some("https://www.tiktok.com/"),
            user_agent: Some(MOBILE_UA),
            concurrent_fragments: 1,
            http_chunk_size: Some("5M"),
            fallbacks: &[FallbackKind::Tikwm, FallbackKind::Cobalt],
        },
        Platform::Instagram => FormatPolicy {
            format_selector: "best[ext=mp4]/best",
            referer: Some("https://www.instagram.com/"),
            user_agent: Some(MOBILE_UA),
            concurrent_fragments: 1,
            http_chunk_size: None,
            fallbacks: &[FallbackKind::Cobalt],
        },
        Platform::Twitter => FormatPolicy {
            format_selector: "best[ext=mp4]/best",
            referer: None,
            user_agent: None,
            concurrent_fragments: 2,
            http_chunk_size: None,
            fallbacks: &[FallbackKind::VxTwitter, FallbackKind::Cobalt],
        },
        Platform::Youtube => FormatPolicy {
            format_selector: "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720]/best",
            referer: None,
            user_agent: None,
            concurrent_fragments: 4,
            http_chunk_size: Some("10M"),
            fallbacks: &[FallbackKind::Cobalt],
        },
        Platform::Snapchat => FormatPolicy {
            format_selector: "best",
            referer: Some("https://www.snapchat.com/"),
            user_agent: Some(MOBILE_UA),
            concurrent_fragments: 1,
            http_chunk_size: None,
            fallbacks: &[FallbackKind::Cobalt],
        },
        Platform::Facebook => FormatPolicy {
            format_selector: "best[ext=mp4]/best",
            referer: Some("https://www.facebook.com/"),
            user_agent: None,
            concurrent_fragments: 2,
            http_chunk_size: None,
            fallbacks: &[FallbackKind::Cobalt],
        },
        Platform::Reddit => FormatPolicy {
            format_selector: "bestvideo[ext=mp4]+bestaudio/best",
            referer: None,
            user_agent: None,
            concurrent_fragments: 2,
            http_chunk_size: None,
            fallbacks: &[FallbackKind::RedditJson],
        },
        Platform::Generic => FormatPolicy {
            format_selector: "best[ext=mp4]/best",
            referer: None,
            user_agent: None,
            concurrent_fragments: 2,
            http_chunk_size: None,
            fallbacks: &[],
        },
    }
}

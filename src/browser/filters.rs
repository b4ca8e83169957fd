//! Route policy: what the interceptor lets out of the browser.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet, RegexSetBuilder};

/// Play-button candidates, tried in order. Covers JW Player, video.js,
/// Plyr and the generic fallbacks, most specific first.
pub const PLAY_BUTTON_SELECTORS: [&str; 8] = [
    ".jw-icon-playback",
    ".jw-display-icon-container",
    ".vjs-big-play-button",
    "[aria-label=\"Play\"]",
    ".play-button",
    ".plyr__control--overlaid",
    "video",
    "[class*=\"play\"]",
];

/// Analytics/ads CDNs plus `.mp4`/`.webm` progressive previews that would
/// waste bandwidth or trip bot detection.
pub static BLOCK_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSetBuilder::new([
        r"google-analytics\.com",
        r"googletagmanager\.com",
        r"facebook\.(com|net)",
        r"doubleclick\.net",
        r"analytics\.",
        r"hotjar\.com",
        r"clarity\.ms",
        r"sentry\.io",
        r"segment\.(com|io)",
        r"mixpanel\.com",
        r"amplitude\.com",
        r"newrelic\.com",
        r"bugsnag\.com",
        r"datadog",
        r"ads\.",
        r"adserver\.",
        r"pagead",
        r"prebid",
        r"adsystem",
        r"adservice",
        r"\.(mp4|webm)(\?|$)",
    ])
    .case_insensitive(true)
    .build()
    .expect("block patterns are valid regexes")
});

/// Scripts whose URL names a known player stack are never blocked, even when
/// hosted on an otherwise blocked CDN path.
pub static PLAYER_ALLOWLIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(player|jwplayer|plyr|video|embed|hls|dash|stream)")
        .expect("player allowlist is a valid regex")
});

/// Telemetry-looking xhr/fetch traffic.
pub static TELEMETRY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(analytics|tracking|beacon|metrics|telemetry|collect|log|event)")
        .expect("telemetry pattern is a valid regex")
});

/// True for the target manifest: an `.m3u8` URL that is not a per-segment
/// sub-playlist.
pub fn is_manifest_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains(".m3u8") && !lower.contains(".ts.m3u8")
}

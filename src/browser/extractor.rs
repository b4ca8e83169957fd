//! Per-request extraction choreography: context, route policy, navigation,
//! play-button coaxing and manifest capture.
//!
//! The target manifest request is aborted rather than fulfilled: many
//! streams key the manifest URL with a one-shot token, and letting the
//! request complete would consume it before the client can.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::metrics::{
    EXTRACTIONS_TOTAL, EXTRACTION_DURATION_SECONDS, MANIFEST_DETECTION_SECONDS, QUEUE_WAIT_SECONDS,
};

use super::driver::{
    DriverContext, DriverFrame, InterceptedRequest, NavigationWait, ResourceKind, RouteDecision,
    RouteHandler,
};
use super::error::BrowserError;
use super::filters::{
    is_manifest_url, BLOCK_PATTERNS, PLAYER_ALLOWLIST, PLAY_BUTTON_SELECTORS, TELEMETRY_PATTERN,
};
use super::pool::{BrowserLease, BrowserPool};

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(15);
const SETTLE_DELAY: Duration = Duration::from_millis(500);
const CLICK_TIMEOUT: Duration = Duration::from_millis(500);

/// Admission priority of an extraction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn weight(self) -> i32 {
        match self {
            Priority::Normal => 0,
            Priority::High => 10,
        }
    }
}

/// A captured manifest URL plus everything needed to replay the fetch.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestCapture {
    pub manifest_url: String,
    /// Origin of the page that requested the manifest, with a trailing `/`.
    pub referer: String,
    /// Always the origin of `referer`.
    pub origin: String,
    pub user_agent: String,
    /// `name=value; ...` pairs; present only when the context held at least
    /// one cookie at capture time.
    pub cookies: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no manifest request observed within {0} ms")]
    Timeout(u64),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl ExtractError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ExtractError::Timeout(_) => "timeout",
            ExtractError::Browser(BrowserError::CircuitOpen { .. }) => "circuit_open",
            ExtractError::Browser(_) => "browser_error",
        }
    }
}

/// Drives extractions through the pool, one context per request.
pub struct ManifestExtractor {
    pool: Arc<BrowserPool>,
    user_agent: String,
}

impl ManifestExtractor {
    pub fn new(pool: Arc<BrowserPool>, user_agent: String) -> Self {
        Self { pool, user_agent }
    }

    pub async fn extract(
        &self,
        embed_url: &str,
        timeout_ms: u64,
        priority: Priority,
    ) -> Result<ManifestCapture, ExtractError> {
        let enqueued = Instant::now();
        let embed = embed_url.to_string();
        let user_agent = self.user_agent.clone();
        let submitted = self
            .pool
            .submit(priority.weight(), move |lease| async move {
                histogram!(QUEUE_WAIT_SECONDS).record(enqueued.elapsed().as_secs_f64());
                run_extraction(lease, embed, timeout_ms, enqueued, user_agent).await
            })
            .await;
        let outcome = match submitted {
            Ok(inner) => inner,
            Err(pool_error) => Err(ExtractError::Browser(pool_error)),
        };

        let duration = enqueued.elapsed().as_secs_f64();
        match &outcome {
            Ok(capture) => {
                info!(url = %capture.manifest_url, "manifest captured");
                counter!(EXTRACTIONS_TOTAL, "status" => "success", "error_type" => "none")
                    .increment(1);
                histogram!(EXTRACTION_DURATION_SECONDS, "status" => "success").record(duration);
            }
            Err(err) => {
                counter!(EXTRACTIONS_TOTAL, "status" => "failure", "error_type" => err.error_type())
                    .increment(1);
                histogram!(EXTRACTION_DURATION_SECONDS, "status" => "failure").record(duration);
            }
        }
        outcome
    }
}

async fn run_extraction(
    lease: BrowserLease,
    embed_url: String,
    timeout_ms: u64,
    enqueued: Instant,
    user_agent: String,
) -> Result<ManifestCapture, ExtractError> {
    let context = lease.context().await?;
    let result = drive(&context, &embed_url, timeout_ms, enqueued, user_agent).await;
    teardown(&context).await;
    result
}

async fn drive(
    context: &Arc<dyn DriverContext>,
    embed_url: &str,
    timeout_ms: u64,
    enqueued: Instant,
    user_agent: String,
) -> Result<ManifestCapture, ExtractError> {
    // Popups are an attack on memory, not part of extraction.
    context.on_page(Box::new(|page| {
        tokio::spawn(async move {
            let _ = page.close().await;
        });
    }));

    let (tx, mut rx) = oneshot::channel();
    let interceptor = Arc::new(ManifestInterceptor {
        embed_url: embed_url.to_string(),
        context: Arc::downgrade(context),
        slot: Mutex::new(Some(tx)),
        resolved: AtomicBool::new(false),
        enqueued,
        user_agent,
    });
    let handler: Arc<dyn RouteHandler> = interceptor.clone();
    context.route(handler).await.map_err(ExtractError::Browser)?;

    let page = context.new_page().await.map_err(ExtractError::Browser)?;

    let coax = {
        let page = Arc::clone(&page);
        let interceptor = Arc::clone(&interceptor);
        let embed_url = embed_url.to_string();
        tokio::spawn(async move {
            // Navigation errors are swallowed: the manifest may arrive even
            // when the page never finishes loading.
            if let Err(err) = page
                .goto(&embed_url, NavigationWait::DomContentLoaded, NAVIGATION_TIMEOUT)
                .await
            {
                debug!(error = %err, url = %embed_url, "navigation did not complete");
            }
            tokio::time::sleep(SETTLE_DELAY).await;
            if !interceptor.resolved() {
                if let Ok(frame) = page.main_frame().await {
                    press_play(frame).await;
                }
            }
            tokio::time::sleep(SETTLE_DELAY).await;
            if !interceptor.resolved() {
                if let Ok(frames) = page.frames().await {
                    join_all(frames.into_iter().map(press_play)).await;
                }
            }
        })
    };

    let outcome = tokio::select! {
        resolution = &mut rx => {
            resolution.map_err(|_| ExtractError::Timeout(timeout_ms))
        }
        _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
            if interceptor.resolved() {
                // The interceptor claimed the manifest just before the
                // deadline; the capture is already on its way.
                (&mut rx).await.map_err(|_| ExtractError::Timeout(timeout_ms))
            } else {
                Err(ExtractError::Timeout(timeout_ms))
            }
        }
    };
    coax.abort();
    outcome
}

/// Best-effort teardown; every error is swallowed. Runs on every exit path.
async fn teardown(context: &Arc<dyn DriverContext>) {
    if let Err(err) = context.unroute().await {
        debug!(error = %err, "unroute failed during teardown");
    }
    for page in context.pages().await {
        if let Err(err) = page.close().await {
            debug!(error = %err, "page close failed during teardown");
        }
    }
    if let Err(err) = context.close().await {
        debug!(error = %err, "context close failed during teardown");
    }
}

/// Clicks the first visible play-button candidate in the frame. Every
/// driver error is swallowed; no frame may fail the extraction.
async fn press_play(frame: Arc<dyn DriverFrame>) -> bool {
    for selector in PLAY_BUTTON_SELECTORS {
        let element = match frame.find(selector).await {
            Ok(Some(element)) => element,
            _ => continue,
        };
        let visible = matches!(
            element.bounding_box().await,
            Ok(Some(body)) if body.width > 0.0 && body.height > 0.0
        );
        if !visible {
            continue;
        }
        if element.click(CLICK_TIMEOUT).await.is_ok() {
            debug!(selector, "clicked play button");
            return true;
        }
    }
    false
}

/// The single route interceptor installed per extraction. The first
/// matching manifest request wins under a check-and-set on `resolved`;
/// everything the block rules catch is aborted in place.
struct ManifestInterceptor {
    embed_url: String,
    context: Weak<dyn DriverContext>,
    slot: Mutex<Option<oneshot::Sender<ManifestCapture>>>,
    resolved: AtomicBool,
    enqueued: Instant,
    user_agent: String,
}

impl ManifestInterceptor {
    fn resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    async fn capture_manifest(&self, request: &InterceptedRequest) -> RouteDecision {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return RouteDecision::Abort;
        }
        histogram!(MANIFEST_DETECTION_SECONDS).record(self.enqueued.elapsed().as_secs_f64());

        // Cookies first: the snapshot needs the context alive, and aborting
        // the request is what ends the page's interest in it.
        let cookies = match self.context.upgrade() {
            Some(context) => match context.cookies().await {
                Ok(list) if !list.is_empty() => Some(
                    list.into_iter()
                        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
                Ok(_) => None,
                Err(err) => {
                    debug!(error = %err, "cookie snapshot failed, continuing without");
                    None
                }
            },
            None => None,
        };

        let (referer, origin) = referer_origin(request.header("referer"), &self.embed_url);
        let capture = ManifestCapture {
            manifest_url: request.url.clone(),
            referer,
            origin,
            user_agent: self.user_agent.clone(),
            cookies,
        };
        if let Some(tx) = self.slot.lock().unwrap().take() {
            let _ = tx.send(capture);
        }
        RouteDecision::Abort
    }
}

#[async_trait]
impl RouteHandler for ManifestInterceptor {
    async fn handle(&self, request: InterceptedRequest) -> RouteDecision {
        if is_manifest_url(&request.url) {
            return self.capture_manifest(&request).await;
        }
        if matches!(
            request.kind,
            ResourceKind::Image | ResourceKind::Font | ResourceKind::Stylesheet
        ) {
            return RouteDecision::Abort;
        }
        if request.kind == ResourceKind::Script
            && !PLAYER_ALLOWLIST.is_match(&request.url)
            && BLOCK_PATTERNS.is_match(&request.url)
        {
            return RouteDecision::Abort;
        }
        if matches!(request.kind, ResourceKind::Xhr | ResourceKind::Fetch)
            && TELEMETRY_PATTERN.is_match(&request.url)
        {
            return RouteDecision::Abort;
        }
        if BLOCK_PATTERNS.is_match(&request.url) {
            return RouteDecision::Abort;
        }
        RouteDecision::Continue
    }
}

/// Referer is the origin of the requesting page (from the request's own
/// `Referer` header when parseable, else the embed URL) with a trailing
/// slash; Origin is that same origin bare.
fn referer_origin(referer_header: Option<&str>, embed_url: &str) -> (String, String) {
    let origin = referer_header
        .and_then(origin_of)
        .or_else(|| origin_of(embed_url))
        .unwrap_or_else(|| embed_url.trim_end_matches('/').to_string());
    (format!("{origin}/"), origin)
}

fn origin_of(value: &str) -> Option<String> {
    let url = Url::parse(value).ok()?;
    match url.origin() {
        origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}

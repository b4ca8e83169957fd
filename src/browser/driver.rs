//! Capability interface over the browser automation protocol.
//!
//! The pool and the extraction pipeline only speak these traits. The
//! production implementation sits in [`super::chromium`]; the integration
//! suite drives the same code paths through an in-memory fake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::error::BrowserResult;

/// Options applied when spawning the browser process.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Explicit browser binary; auto-detected when absent.
    pub executable: Option<String>,
}

/// Options applied to every fresh extraction context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_scale_factor: f64,
    pub bypass_csp: bool,
    pub ignore_https_errors: bool,
    pub has_touch: bool,
    pub is_mobile: bool,
    pub reduced_motion: bool,
    pub block_service_workers: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
                .to_string(),
            viewport_width: 800,
            viewport_height: 600,
            device_scale_factor: 1.0,
            bypass_csp: true,
            ignore_https_errors: true,
            has_touch: false,
            is_mobile: false,
            reduced_motion: true,
            block_service_workers: true,
        }
    }
}

/// Resource classification of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Script,
    Stylesheet,
    Image,
    Font,
    Xhr,
    Fetch,
    Media,
    Other,
}

/// A request observed by the route interceptor before it leaves the browser.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub kind: ResourceKind,
}

impl InterceptedRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What the interceptor tells the browser to do with a paused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Continue,
    Abort,
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, request: InterceptedRequest) -> RouteDecision;
}

pub type PageCallback = Box<dyn Fn(Arc<dyn DriverPage>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationWait {
    DomContentLoaded,
    Load,
}

/// Launches browser processes.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> BrowserResult<Arc<dyn DriverBrowser>>;
}

/// A live browser process.
#[async_trait]
pub trait DriverBrowser: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn new_context(&self, options: &ContextOptions) -> BrowserResult<Arc<dyn DriverContext>>;
    /// Resolves once the process drops off the automation transport. Used by
    /// the pool's disconnect watcher; never resolves for a healthy browser.
    async fn wait_disconnected(&self);
    async fn close(&self) -> BrowserResult<()>;
}

/// An isolated cookie-jar context owned by exactly one extraction.
#[async_trait]
pub trait DriverContext: Send + Sync {
    async fn new_page(&self) -> BrowserResult<Arc<dyn DriverPage>>;
    /// Installs the single route interceptor covering all requests from
    /// pages under this context.
    async fn route(&self, handler: Arc<dyn RouteHandler>) -> BrowserResult<()>;
    async fn unroute(&self) -> BrowserResult<()>;
    /// Registers a callback invoked for pages the site itself opens
    /// (popups). Pages created through [`Self::new_page`] do not trigger it.
    fn on_page(&self, callback: PageCallback);
    async fn cookies(&self) -> BrowserResult<Vec<Cookie>>;
    /// All pages currently open under this context.
    async fn pages(&self) -> Vec<Arc<dyn DriverPage>>;
    async fn close(&self) -> BrowserResult<()>;
}

#[async_trait]
pub trait DriverPage: Send + Sync {
    async fn goto(
        &self,
        url: &str,
        wait: NavigationWait,
        timeout: Duration,
    ) -> BrowserResult<()>;
    async fn main_frame(&self) -> BrowserResult<Arc<dyn DriverFrame>>;
    /// Sub-frames of the page, excluding the main frame.
    async fn frames(&self) -> BrowserResult<Vec<Arc<dyn DriverFrame>>>;
    async fn close(&self) -> BrowserResult<()>;
}

#[async_trait]
pub trait DriverFrame: Send + Sync {
    async fn find(&self, selector: &str) -> BrowserResult<Option<Arc<dyn DriverElement>>>;
}

#[async_trait]
pub trait DriverElement: Send + Sync {
    async fn bounding_box(&self) -> BrowserResult<Option<BoundingBox>>;
    async fn click(&self, timeout: Duration) -> BrowserResult<()>;
}

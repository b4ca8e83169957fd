//! chromiumoxide-backed implementation of the driver capability traits.
//!
//! Interception rides the CDP Fetch domain: every page enables it and
//! relays paused requests to the installed route handler, which answers
//! with continue or abort. Context isolation uses CDP browser contexts so
//! each extraction gets a fresh cookie jar.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::dom::{
    DescribeNodeParams, GetBoxModelParams, GetDocumentParams, GetFrameOwnerParams, NodeId,
    QuerySelectorParams,
};
use chromiumoxide::cdp::browser_protocol::emulation::{
    MediaFeature, SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
    SetTouchEmulationEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, DisableParams as FetchDisableParams, EnableParams as FetchEnableParams,
    EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, ResourceType, SetBypassServiceWorkerParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, FrameId, GetFrameTreeParams, NavigateParams,
    SetBypassCspParams,
};
use chromiumoxide::cdp::browser_protocol::security::SetIgnoreCertificateErrorsParams;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::driver::{
    BoundingBox, BrowserDriver, ContextOptions, Cookie, DriverBrowser, DriverContext,
    DriverElement, DriverFrame, DriverPage, InterceptedRequest, LaunchOptions, NavigationWait,
    PageCallback, ResourceKind, RouteDecision, RouteHandler,
};
use super::error::{BrowserError, BrowserResult};

const LAUNCH_FLAGS: &[&str] = &[
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-webgl",
    "--disable-3d-apis",
    "--disable-accelerated-2d-canvas",
    "--disable-blink-features=AutomationControlled",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-sync",
    "--disable-translate",
    "--disable-default-apps",
    "--no-first-run",
    "--disable-component-update",
    "--disable-domain-reliability",
    "--disable-client-side-phishing-detection",
    "--mute-audio",
    "--renderer-process-limit=1",
    "--disable-site-isolation-trials",
    "--disable-background-timer-throttling",
    "--disable-renderer-backgrounding",
    "--disable-backgrounding-occluded-windows",
    "--js-flags=--max-old-space-size=128",
];

pub struct ChromiumDriver;

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, options: &LaunchOptions) -> BrowserResult<Arc<dyn DriverBrowser>> {
        let config = build_browser_config(options)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let (connected_tx, connected_rx) = watch::channel(true);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
            let _ = connected_tx.send(false);
        });
        info!("chromium instance launched");

        Ok(Arc::new(ChromiumBrowser {
            shared: Arc::new(BrowserShared {
                browser: AsyncMutex::new(browser),
            }),
            connected: connected_rx,
            handler_task,
        }))
    }
}

fn build_browser_config(options: &LaunchOptions) -> BrowserResult<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .no_sandbox()
        .viewport(Viewport {
            width: 800,
            height: 600,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .args(
            LAUNCH_FLAGS
                .iter()
                .map(|flag| flag.to_string())
                .collect::<Vec<_>>(),
        );
    if let Some(executable) = &options.executable {
        builder = builder.chrome_executable(executable);
    }
    builder.build().map_err(BrowserError::Configuration)
}

struct BrowserShared {
    browser: AsyncMutex<Browser>,
}

struct ChromiumBrowser {
    shared: Arc<BrowserShared>,
    connected: watch::Receiver<bool>,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl DriverBrowser for ChromiumBrowser {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn new_context(&self, options: &ContextOptions) -> BrowserResult<Arc<dyn DriverContext>> {
        let context_id = {
            let mut browser = self.shared.browser.lock().await;
            browser
                .create_browser_context(CreateBrowserContextParams::default())
                .await?
        };
        Ok(Arc::new(ChromiumContext {
            shared: Arc::clone(&self.shared),
            context_id,
            options: options.clone(),
            handler: Mutex::new(None),
            page_callback: Mutex::new(None),
            pages: AsyncMutex::new(Vec::new()),
            intercept_tasks: Mutex::new(Vec::new()),
        }))
    }

    async fn wait_disconnected(&self) {
        let mut connected = self.connected.clone();
        while *connected.borrow() {
            if connected.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) -> BrowserResult<()> {
        {
            let mut browser = self.shared.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close browser gracefully");
            }
        }
        self.handler_task.abort();
        Ok(())
    }
}

struct ChromiumContext {
    shared: Arc<BrowserShared>,
    context_id: BrowserContextId,
    options: ContextOptions,
    handler: Mutex<Option<Arc<dyn RouteHandler>>>,
    /// Never fires here: window.open is neutered on every document, so the
    /// site cannot open pages behind our back.
    #[allow(dead_code)]
    page_callback: Mutex<Option<PageCallback>>,
    pages: AsyncMutex<Vec<Arc<ChromiumPage>>>,
    intercept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChromiumContext {
    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&self.options.user_agent)
            .await?;
        let user_agent = SetUserAgentOverrideParams::builder()
            .user_agent(self.options.user_agent.clone())
            .build()
            .map_err(BrowserError::Configuration)?;
        page.set_user_agent(user_agent).await?;

        if self.options.bypass_csp {
            page.execute(SetBypassCspParams::new(true)).await?;
        }
        if self.options.ignore_https_errors {
            page.execute(SetIgnoreCertificateErrorsParams::new(true))
                .await?;
        }
        page.execute(SetDeviceMetricsOverrideParams::new(
            self.options.viewport_width as i64,
            self.options.viewport_height as i64,
            self.options.device_scale_factor,
            self.options.is_mobile,
        ))
        .await?;
        page.execute(SetTouchEmulationEnabledParams::new(self.options.has_touch))
            .await?;
        if self.options.reduced_motion {
            let mut media = SetEmulatedMediaParams::default();
            media.features = Some(vec![MediaFeature {
                name: "prefers-reduced-motion".to_string(),
                value: "reduce".to_string(),
            }]);
            page.execute(media).await?;
        }
        if self.options.block_service_workers {
            page.execute(SetBypassServiceWorkerParams::new(true)).await?;
        }

        // Popups never get a chance to exist: window.open is neutered on
        // every document before any site script runs.
        let popup_guard = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source("window.open = () => null;")
            .build()
            .map_err(BrowserError::Configuration)?;
        page.evaluate_on_new_document(popup_guard).await?;
        Ok(())
    }
}

#[async_trait]
impl DriverContext for ChromiumContext {
    async fn new_page(&self) -> BrowserResult<Arc<dyn DriverPage>> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(self.context_id.clone())
            .build()
            .map_err(BrowserError::Configuration)?;
        let page = {
            let browser = self.shared.browser.lock().await;
            browser.new_page(params).await?
        };
        self.configure_page(&page).await?;

        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            page.execute(FetchEnableParams::default()).await?;
            let relay = tokio::spawn(relay_intercepts(page.clone(), handler));
            self.intercept_tasks.lock().unwrap().push(relay);
        }

        let wrapped = Arc::new(ChromiumPage { page });
        self.pages.lock().await.push(Arc::clone(&wrapped));
        Ok(wrapped)
    }

    async fn route(&self, handler: Arc<dyn RouteHandler>) -> BrowserResult<()> {
        *self.handler.lock().unwrap() = Some(Arc::clone(&handler));
        let pages = self.pages.lock().await;
        for page in pages.iter() {
            page.page.execute(FetchEnableParams::default()).await?;
            let relay = tokio::spawn(relay_intercepts(page.page.clone(), Arc::clone(&handler)));
            self.intercept_tasks.lock().unwrap().push(relay);
        }
        Ok(())
    }

    async fn unroute(&self) -> BrowserResult<()> {
        *self.handler.lock().unwrap() = None;
        for task in self.intercept_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let pages = self.pages.lock().await;
        for page in pages.iter() {
            if let Err(err) = page.page.execute(FetchDisableParams::default()).await {
                debug!(error = %err, "failed to disable interception");
            }
        }
        Ok(())
    }

    fn on_page(&self, callback: PageCallback) {
        *self.page_callback.lock().unwrap() = Some(callback);
    }

    async fn cookies(&self) -> BrowserResult<Vec<Cookie>> {
        let pages = self.pages.lock().await;
        let Some(page) = pages.first() else {
            return Ok(Vec::new());
        };
        let cookies = page.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|cookie| Cookie {
                name: cookie.name,
                value: cookie.value,
            })
            .collect())
    }

    async fn pages(&self) -> Vec<Arc<dyn DriverPage>> {
        self.pages
            .lock()
            .await
            .iter()
            .map(|page| Arc::clone(page) as Arc<dyn DriverPage>)
            .collect()
    }

    async fn close(&self) -> BrowserResult<()> {
        for task in self.intercept_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let pages: Vec<Arc<ChromiumPage>> = {
            let mut pages = self.pages.lock().await;
            pages.drain(..).collect()
        };
        for page in pages {
            if let Err(err) = page.page.clone().close().await {
                debug!(error = %err, "failed to close page");
            }
        }
        let mut browser = self.shared.browser.lock().await;
        if let Err(err) = browser
            .dispose_browser_context(self.context_id.clone())
            .await
        {
            debug!(error = %err, "failed to dispose browser context");
        }
        Ok(())
    }
}

async fn relay_intercepts(page: Page, handler: Arc<dyn RouteHandler>) {
    let mut events = match page.event_listener::<EventRequestPaused>().await {
        Ok(events) => events,
        Err(err) => {
            debug!(error = %err, "could not listen for paused requests");
            return;
        }
    };
    while let Some(event) = events.next().await {
        let request = InterceptedRequest {
            url: event.request.url.clone(),
            headers: headers_map(&event.request.headers),
            kind: resource_kind(&event.resource_type),
        };
        let decision = handler.handle(request).await;
        let resolution = match decision {
            RouteDecision::Continue => page
                .execute(ContinueRequestParams::new(event.request_id.clone()))
                .await
                .map(|_| ()),
            RouteDecision::Abort => page
                .execute(FailRequestParams::new(
                    event.request_id.clone(),
                    ErrorReason::Aborted,
                ))
                .await
                .map(|_| ()),
        };
        if let Err(err) = resolution {
            debug!(error = %err, url = %event.request.url, "failed to resolve paused request");
        }
    }
}

fn headers_map(headers: &chromiumoxide::cdp::browser_protocol::network::Headers) -> HashMap<String, String> {
    match serde_json::to_value(headers) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .filter_map(|(name, value)| value.as_str().map(|text| (name, text.to_string())))
            .collect(),
        _ => HashMap::new(),
    }
}

fn resource_kind(resource_type: &ResourceType) -> ResourceKind {
    match resource_type {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Script => ResourceKind::Script,
        ResourceType::Stylesheet => ResourceKind::Stylesheet,
        ResourceType::Image => ResourceKind::Image,
        ResourceType::Font => ResourceKind::Font,
        ResourceType::Xhr => ResourceKind::Xhr,
        ResourceType::Fetch => ResourceKind::Fetch,
        ResourceType::Media => ResourceKind::Media,
        _ => ResourceKind::Other,
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl DriverPage for ChromiumPage {
    async fn goto(
        &self,
        url: &str,
        wait: NavigationWait,
        timeout: Duration,
    ) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let navigate = async {
            self.page.goto(params).await?;
            // goto resolves at the navigation response, which tracks
            // DOMContentLoaded closely enough; a full load waits on top.
            if wait == NavigationWait::Load {
                self.page.wait_for_navigation().await?;
            }
            Ok::<(), chromiumoxide::error::CdpError>(())
        };
        match tokio::time::timeout(timeout, navigate).await {
            Ok(result) => result.map_err(BrowserError::from),
            Err(_) => Err(BrowserError::Timeout(format!("navigation to {url}"))),
        }
    }

    async fn main_frame(&self) -> BrowserResult<Arc<dyn DriverFrame>> {
        Ok(Arc::new(ChromiumFrame {
            page: self.page.clone(),
            frame_id: None,
        }))
    }

    async fn frames(&self) -> BrowserResult<Vec<Arc<dyn DriverFrame>>> {
        let tree = self.page.execute(GetFrameTreeParams::default()).await?;
        let mut frames: Vec<Arc<dyn DriverFrame>> = Vec::new();
        let mut stack: Vec<_> = tree
            .frame_tree
            .child_frames
            .clone()
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            frames.push(Arc::new(ChromiumFrame {
                page: self.page.clone(),
                frame_id: Some(node.frame.id.clone()),
            }));
            if let Some(children) = node.child_frames {
                stack.extend(children);
            }
        }
        Ok(frames)
    }

    async fn close(&self) -> BrowserResult<()> {
        self.page.clone().close().await?;
        Ok(())
    }
}

struct ChromiumFrame {
    page: Page,
    /// `None` addresses the main frame's document.
    frame_id: Option<FrameId>,
}

impl ChromiumFrame {
    async fn document_node(&self) -> BrowserResult<Option<NodeId>> {
        match &self.frame_id {
            None => {
                let document = self.page.execute(GetDocumentParams::default()).await?;
                Ok(Some(document.root.node_id.clone()))
            }
            Some(frame_id) => {
                let owner = self
                    .page
                    .execute(GetFrameOwnerParams::new(frame_id.clone()))
                    .await?;
                let described = self
                    .page
                    .execute(
                        DescribeNodeParams::builder()
                            .backend_node_id(owner.backend_node_id.clone())
                            .pierce(true)
                            .build(),
                    )
                    .await?;
                // Out-of-process frames carry no content document here and
                // are skipped rather than failing the sweep.
                Ok(described
                    .node
                    .content_document
                    .as_ref()
                    .map(|document| document.node_id.clone()))
            }
        }
    }
}

#[async_trait]
impl DriverFrame for ChromiumFrame {
    async fn find(&self, selector: &str) -> BrowserResult<Option<Arc<dyn DriverElement>>> {
        let Some(document) = self.document_node().await? else {
            return Ok(None);
        };
        let found = self
            .page
            .execute(QuerySelectorParams::new(document, selector))
            .await?;
        if *found.node_id.inner() == 0 {
            return Ok(None);
        }
        Ok(Some(Arc::new(ChromiumElement {
            page: self.page.clone(),
            node_id: found.node_id.clone(),
        })))
    }
}

struct ChromiumElement {
    page: Page,
    node_id: NodeId,
}

impl ChromiumElement {
    async fn box_center(&self) -> BrowserResult<Option<(f64, f64, f64, f64)>> {
        let params = GetBoxModelParams::builder()
            .node_id(self.node_id.clone())
            .build();
        let response = match self.page.execute(params).await {
            Ok(response) => response,
            // Detached or unrendered nodes have no box model.
            Err(_) => return Ok(None),
        };
        let model = &response.model;
        let quad = model.content.inner();
        if quad.len() < 8 {
            return Ok(None);
        }
        let x = (quad[0] + quad[2] + quad[4] + quad[6]) / 4.0;
        let y = (quad[1] + quad[3] + quad[5] + quad[7]) / 4.0;
        Ok(Some((x, y, model.width as f64, model.height as f64)))
    }
}

#[async_trait]
impl DriverElement for ChromiumElement {
    async fn bounding_box(&self) -> BrowserResult<Option<BoundingBox>> {
        Ok(self
            .box_center()
            .await?
            .map(|(_, _, width, height)| BoundingBox { width, height }))
    }

    async fn click(&self, timeout: Duration) -> BrowserResult<()> {
        let click = async {
            let Some((x, y, _, _)) = self.box_center().await? else {
                return Err(BrowserError::Unexpected(
                    "element has no clickable box".to_string(),
                ));
            };
            let press = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MousePressed)
                .x(x)
                .y(y)
                .button(MouseButton::Left)
                .click_count(1)
                .build()
                .map_err(BrowserError::Configuration)?;
            self.page.execute(press).await?;
            let release = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseReleased)
                .x(x)
                .y(y)
                .button(MouseButton::Left)
                .click_count(1)
                .build()
                .map_err(BrowserError::Configuration)?;
            self.page.execute(release).await?;
            Ok(())
        };
        match tokio::time::timeout(timeout, click).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout("element click".to_string())),
        }
    }
}

//! In-memory driver used by the integration suites. Scripted per scenario:
//! which requests a navigation emits, which elements exist, what clicking
//! them triggers, and whether launches fail. Every observable action lands
//! in an ordered event log so tests can assert sequencing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use hls_scout::browser::{
    BoundingBox, BrowserDriver, BrowserError, BrowserResult, ContextOptions, Cookie,
    DriverBrowser, DriverContext, DriverElement, DriverFrame, DriverPage, InterceptedRequest,
    LaunchOptions, NavigationWait, PageCallback, ResourceKind, RouteDecision, RouteHandler,
};

#[derive(Default)]
pub struct EventLog {
    entries: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|seen| seen == entry)
    }

    pub fn index_of(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|seen| seen == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|seen| *seen == entry).count()
    }
}

#[derive(Clone)]
pub struct ScriptedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub kind: ResourceKind,
}

impl ScriptedRequest {
    pub fn new(url: &str, kind: ResourceKind) -> Self {
        Self {
            url: url.to_string(),
            headers: Vec::new(),
            kind,
        }
    }

    pub fn manifest(url: &str) -> Self {
        Self::new(url, ResourceKind::Fetch)
    }

    pub fn with_referer(mut self, referer: &str) -> Self {
        self.headers.push(("Referer".to_string(), referer.to_string()));
        self
    }

    fn to_intercepted(&self) -> InterceptedRequest {
        InterceptedRequest {
            url: self.url.clone(),
            headers: self.headers.iter().cloned().collect::<HashMap<_, _>>(),
            kind: self.kind,
        }
    }
}

#[derive(Clone)]
pub struct FakeElementSpec {
    pub selector: String,
    pub width: f64,
    pub height: f64,
}

impl FakeElementSpec {
    pub fn visible(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            width: 48.0,
            height: 48.0,
        }
    }

    pub fn hidden(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            width: 0.0,
            height: 0.0,
        }
    }
}

#[derive(Default, Clone)]
pub struct Script {
    /// Requests the page fires while `goto` runs.
    pub on_goto: Vec<ScriptedRequest>,
    /// Requests fired when the element with this selector is clicked.
    pub on_click: HashMap<String, Vec<ScriptedRequest>>,
    /// Elements present on the main frame.
    pub elements: Vec<FakeElementSpec>,
    /// Elements present on the single sub-frame (absent when empty).
    pub subframe_elements: Vec<FakeElementSpec>,
    /// Whether the site opens a popup during navigation.
    pub popup_on_goto: bool,
}

pub struct FakeDriver {
    pub log: Arc<EventLog>,
    pub launches: AtomicUsize,
    fail_launches: AtomicUsize,
    fail_contexts: AtomicUsize,
    launch_delay: Mutex<Duration>,
    script: Mutex<Script>,
    cookies: Mutex<Vec<Cookie>>,
    current: Mutex<Option<Arc<FakeBrowser>>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Arc::new(EventLog::default()),
            launches: AtomicUsize::new(0),
            fail_launches: AtomicUsize::new(0),
            fail_contexts: AtomicUsize::new(0),
            launch_delay: Mutex::new(Duration::ZERO),
            script: Mutex::new(Script::default()),
            cookies: Mutex::new(Vec::new()),
            current: Mutex::new(None),
        })
    }

    pub fn fail_next_launches(&self, count: usize) {
        self.fail_launches.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_contexts(&self, count: usize) {
        self.fail_contexts.store(count, Ordering::SeqCst);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock().unwrap() = delay;
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn set_cookies(&self, cookies: Vec<(&str, &str)>) {
        *self.cookies.lock().unwrap() = cookies
            .into_iter()
            .map(|(name, value)| Cookie {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn disconnect_current(&self) {
        if let Some(browser) = self.current.lock().unwrap().clone() {
            browser.disconnect();
        }
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn launch(&self, _options: &LaunchOptions) -> BrowserResult<Arc<dyn DriverBrowser>> {
        let delay = *self.launch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let failures = self.fail_launches.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_launches.store(failures - 1, Ordering::SeqCst);
            self.log.push("launch_failed");
            return Err(BrowserError::Launch("boom".to_string()));
        }
        self.log.push("launch");
        let browser = Arc::new(FakeBrowser {
            log: Arc::clone(&self.log),
            script: self.script.lock().unwrap().clone(),
            cookies: self.cookies.lock().unwrap().clone(),
            fail_contexts: AtomicUsize::new(self.fail_contexts.swap(0, Ordering::SeqCst)),
            connected: AtomicBool::new(true),
            disconnected: Notify::new(),
        });
        *self.current.lock().unwrap() = Some(Arc::clone(&browser));
        Ok(browser)
    }
}

pub struct FakeBrowser {
    log: Arc<EventLog>,
    script: Script,
    cookies: Vec<Cookie>,
    fail_contexts: AtomicUsize,
    connected: AtomicBool,
    disconnected: Notify,
}

impl FakeBrowser {
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected.notify_waiters();
    }
}

#[async_trait]
impl DriverBrowser for FakeBrowser {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn new_context(&self, _options: &ContextOptions) -> BrowserResult<Arc<dyn DriverContext>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrowserError::Disconnected);
        }
        let failures = self.fail_contexts.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_contexts.store(failures - 1, Ordering::SeqCst);
            return Err(BrowserError::Unexpected("context creation failed".to_string()));
        }
        self.log.push("context_created");
        let log = Arc::clone(&self.log);
        let context = Arc::new_cyclic(|weak| FakeContext {
            weak: weak.clone(),
            log,
            script: self.script.clone(),
            cookies: self.cookies.clone(),
            handler: Mutex::new(None),
            callback: Mutex::new(None),
            pages: Mutex::new(Vec::new()),
        });
        Ok(context)
    }

    async fn wait_disconnected(&self) {
        loop {
            let notified = self.disconnected.notified();
            if !self.connected.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn close(&self) -> BrowserResult<()> {
        self.log.push("browser_closed");
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected.notify_waiters();
        Ok(())
    }
}

pub struct FakeContext {
    weak: Weak<FakeContext>,
    log: Arc<EventLog>,
    script: Script,
    cookies: Vec<Cookie>,
    handler: Mutex<Option<Arc<dyn RouteHandler>>>,
    callback: Mutex<Option<PageCallback>>,
    pages: Mutex<Vec<Arc<FakePage>>>,
}

impl FakeContext {
    async fn emit(&self, request: &ScriptedRequest) {
        let handler = self.handler.lock().unwrap().clone();
        let Some(handler) = handler else { return };
        match handler.handle(request.to_intercepted()).await {
            RouteDecision::Continue => self.log.push(format!("continue:{}", request.url)),
            RouteDecision::Abort => self.log.push(format!("abort:{}", request.url)),
        }
    }
}

#[async_trait]
impl DriverContext for FakeContext {
    async fn new_page(&self) -> BrowserResult<Arc<dyn DriverPage>> {
        let page = Arc::new(FakePage {
            label: "main",
            context: self.weak.clone(),
            log: Arc::clone(&self.log),
        });
        self.pages.lock().unwrap().push(Arc::clone(&page));
        self.log.push("page_created");
        Ok(page)
    }

    async fn route(&self, handler: Arc<dyn RouteHandler>) -> BrowserResult<()> {
        *self.handler.lock().unwrap() = Some(handler);
        self.log.push("route_installed");
        Ok(())
    }

    async fn unroute(&self) -> BrowserResult<()> {
        *self.handler.lock().unwrap() = None;
        self.log.push("unroute");
        Ok(())
    }

    fn on_page(&self, callback: PageCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    async fn cookies(&self) -> BrowserResult<Vec<Cookie>> {
        self.log.push("cookies");
        Ok(self.cookies.clone())
    }

    async fn pages(&self) -> Vec<Arc<dyn DriverPage>> {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .map(|page| Arc::clone(page) as Arc<dyn DriverPage>)
            .collect()
    }

    async fn close(&self) -> BrowserResult<()> {
        self.log.push("context_closed");
        Ok(())
    }
}

pub struct FakePage {
    label: &'static str,
    context: Weak<FakeContext>,
    log: Arc<EventLog>,
}

#[async_trait]
impl DriverPage for FakePage {
    async fn goto(
        &self,
        url: &str,
        _wait: NavigationWait,
        _timeout: Duration,
    ) -> BrowserResult<()> {
        self.log.push(format!("goto:{url}"));
        let Some(context) = self.context.upgrade() else {
            return Err(BrowserError::Disconnected);
        };
        if context.script.popup_on_goto {
            let popup = Arc::new(FakePage {
                label: "popup",
                context: self.context.clone(),
                log: Arc::clone(&self.log),
            });
            context.pages.lock().unwrap().push(Arc::clone(&popup));
            self.log.push("popup_opened");
            let callback = context.callback.lock().unwrap();
            if let Some(callback) = callback.as_ref() {
                callback(popup as Arc<dyn DriverPage>);
            }
        }
        let requests = context.script.on_goto.clone();
        for request in &requests {
            context.emit(request).await;
        }
        Ok(())
    }

    async fn main_frame(&self) -> BrowserResult<Arc<dyn DriverFrame>> {
        Ok(Arc::new(FakeFrame {
            context: self.context.clone(),
            elements: self
                .context
                .upgrade()
                .map(|context| context.script.elements.clone())
                .unwrap_or_default(),
        }))
    }

    async fn frames(&self) -> BrowserResult<Vec<Arc<dyn DriverFrame>>> {
        let Some(context) = self.context.upgrade() else {
            return Ok(Vec::new());
        };
        if context.script.subframe_elements.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Arc::new(FakeFrame {
            context: self.context.clone(),
            elements: context.script.subframe_elements.clone(),
        })])
    }

    async fn close(&self) -> BrowserResult<()> {
        self.log.push(format!("page_closed:{}", self.label));
        Ok(())
    }
}

pub struct FakeFrame {
    context: Weak<FakeContext>,
    elements: Vec<FakeElementSpec>,
}

#[async_trait]
impl DriverFrame for FakeFrame {
    async fn find(&self, selector: &str) -> BrowserResult<Option<Arc<dyn DriverElement>>> {
        let found = self
            .elements
            .iter()
            .find(|spec| spec.selector == selector)
            .cloned();
        Ok(found.map(|spec| {
            Arc::new(FakeElement {
                spec,
                context: self.context.clone(),
            }) as Arc<dyn DriverElement>
        }))
    }
}

pub struct FakeElement {
    spec: FakeElementSpec,
    context: Weak<FakeContext>,
}

#[async_trait]
impl DriverElement for FakeElement {
    async fn bounding_box(&self) -> BrowserResult<Option<BoundingBox>> {
        Ok(Some(BoundingBox {
            width: self.spec.width,
            height: self.spec.height,
        }))
    }

    async fn click(&self, _timeout: Duration) -> BrowserResult<()> {
        let Some(context) = self.context.upgrade() else {
            return Err(BrowserError::Disconnected);
        };
        context.log.push(format!("click:{}", self.spec.selector));
        let requests = context
            .script
            .on_click
            .get(&self.spec.selector)
            .cloned()
            .unwrap_or_default();
        for request in &requests {
            context.emit(request).await;
        }
        Ok(())
    }
}

mod breaker;
mod chromium;
mod driver;
mod error;
mod extractor;
mod filters;
mod pool;
mod queue;
mod watchdog;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CIRCUIT_RESET, CIRCUIT_THRESHOLD};
pub use chromium::ChromiumDriver;
pub use driver::{
    BoundingBox, BrowserDriver, ContextOptions, Cookie, DriverBrowser, DriverContext,
    DriverElement, DriverFrame, DriverPage, InterceptedRequest, LaunchOptions, NavigationWait,
    PageCallback, ResourceKind, RouteDecision, RouteHandler,
};
pub use error::{BrowserError, BrowserResult};
pub use extractor::{ExtractError, ManifestCapture, ManifestExtractor, Priority};
pub use filters::{
    is_manifest_url, BLOCK_PATTERNS, PLAYER_ALLOWLIST, PLAY_BUTTON_SELECTORS, TELEMETRY_PATTERN,
};
pub use pool::{BrowserLease, BrowserPool, PoolConfig, PoolStatus};
pub use watchdog::{
    CircuitWatchdog, ProcessTerminator, SystemTerminator, WATCHDOG_INTERVAL,
};

pub mod browser;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;

pub use browser::{
    BrowserDriver, BrowserError, BrowserPool, BrowserResult, ChromiumDriver, CircuitWatchdog,
    ExtractError, ManifestCapture, ManifestExtractor, PoolConfig, PoolStatus, Priority,
};
pub use config::ServiceConfig;
pub use error::{ConfigError, Result};
pub use server::{build_router, AppState};

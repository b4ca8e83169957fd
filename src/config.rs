use std::time::Duration;

use tracing::warn;

use crate::error::{ConfigError, Result};

/// Service configuration, read from the environment at startup.
///
/// Every knob has a default except `EXTRACTION_SECRET`; a missing secret is
/// tolerated at load time so the HTTP layer can answer with a 500 instead of
/// refusing to boot a container that is still being wired up.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub metrics_port: u16,
    pub extraction_secret: Option<String>,
    pub max_concurrent: usize,
    pub browser_idle_timeout: Duration,
    pub browser_max_age: Duration,
    pub shutdown_timeout: Duration,
    pub circuit_exit_threshold: Duration,
    pub chrome_path: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            metrics_port: 9090,
            extraction_secret: None,
            max_concurrent: 2,
            browser_idle_timeout: Duration::from_millis(60_000),
            browser_max_age: Duration::from_millis(7_200_000),
            shutdown_timeout: Duration::from_millis(30_000),
            circuit_exit_threshold: Duration::from_millis(120_000),
            chrome_path: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            port: env_u16("PORT", defaults.port)?,
            metrics_port: env_u16("METRICS_PORT", defaults.metrics_port)?,
            extraction_secret: env_string("EXTRACTION_SECRET"),
            max_concurrent: env_u64("MAX_CONCURRENT", defaults.max_concurrent as u64)?.max(1)
                as usize,
            browser_idle_timeout: env_millis("BROWSER_IDLE_TIMEOUT", defaults.browser_idle_timeout)?,
            browser_max_age: env_millis("BROWSER_MAX_AGE", defaults.browser_max_age)?,
            shutdown_timeout: env_millis("SHUTDOWN_TIMEOUT", defaults.shutdown_timeout)?,
            circuit_exit_threshold: env_millis(
                "CIRCUIT_BREAKER_EXIT_THRESHOLD",
                defaults.circuit_exit_threshold,
            )?,
            chrome_path: env_string("CHROME_PATH"),
        };
        if config.extraction_secret.is_none() {
            warn!("EXTRACTION_SECRET is not set; /extract will reject all requests");
        }
        Ok(config)
    }
}

fn env_string(key: &'static str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &'static str, default: u64) -> Result<u64> {
    match env_string(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn env_u16(key: &'static str, default: u16) -> Result<u16> {
    match env_string(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_u64(
        key,
        default.as_millis() as u64,
    )?))
}

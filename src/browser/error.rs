use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("browser disconnected")]
    Disconnected,
    #[error("browser temporarily unavailable, retry in {retry_in_secs}s")]
    CircuitOpen { retry_in_secs: u64 },
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}

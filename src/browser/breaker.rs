//! Circuit breaker guarding browser relaunch.

use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::time::Instant;
use tracing::warn;

use crate::metrics::{CIRCUIT_OPEN, CIRCUIT_TRIPS_TOTAL, LAUNCH_FAILURES_TOTAL};

use super::error::{BrowserError, BrowserResult};

pub const CIRCUIT_THRESHOLD: u32 = 3;
pub const CIRCUIT_RESET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub open: bool,
    pub consecutive_failures: u32,
    /// Remaining cool-down; zero when closed.
    pub reopen_in: Duration,
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    reopen_at: Option<Instant>,
}

/// Counts consecutive launch failures and short-circuits acquisition while
/// the cool-down runs. The breaker itself never attempts a launch; callers
/// probe it with [`CircuitBreaker::check`] before creating the launch future.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset: Duration,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CIRCUIT_THRESHOLD, CIRCUIT_RESET)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset: Duration) -> Self {
        Self {
            threshold,
            reset,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                reopen_at: None,
            }),
        }
    }

    /// Fails fast with the remaining cool-down while open. Does not touch
    /// any counter.
    pub fn check(&self) -> BrowserResult<()> {
        let state = self.state.lock().unwrap();
        match state.reopen_at {
            Some(reopen_at) if reopen_at > Instant::now() => {
                let remaining = reopen_at - Instant::now();
                Err(BrowserError::CircuitOpen {
                    retry_in_secs: remaining.as_secs().max(1),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        matches!(state.reopen_at, Some(reopen_at) if reopen_at > Instant::now())
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.reopen_at = None;
        gauge!(CIRCUIT_OPEN).set(0.0);
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        counter!(LAUNCH_FAILURES_TOTAL).increment(1);
        if state.consecutive_failures >= self.threshold {
            state.reopen_at = Some(Instant::now() + self.reset);
            gauge!(CIRCUIT_OPEN).set(1.0);
            counter!(CIRCUIT_TRIPS_TOTAL).increment(1);
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.reset.as_secs(),
                "browser launch circuit opened"
            );
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        let reopen_in = state
            .reopen_at
            .filter(|reopen_at| *reopen_at > now)
            .map(|reopen_at| reopen_at - now)
            .unwrap_or_default();
        BreakerSnapshot {
            open: !reopen_in.is_zero(),
            consecutive_failures: state.consecutive_failures,
            reopen_in,
        }
    }
}

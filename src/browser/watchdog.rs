//! Watchdog that force-exits the process when the launch circuit stays open
//! too long, so the supervisor can replace the container.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, warn};

use super::pool::BrowserPool;

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Seam for the process exit so tests can observe it instead of dying.
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self);
}

pub struct SystemTerminator;

impl ProcessTerminator for SystemTerminator {
    fn terminate(&self) {
        std::process::exit(1);
    }
}

pub struct CircuitWatchdog {
    pool: Arc<BrowserPool>,
    interval: Duration,
    exit_threshold: Duration,
    terminator: Arc<dyn ProcessTerminator>,
}

impl CircuitWatchdog {
    pub fn new(pool: Arc<BrowserPool>, exit_threshold: Duration) -> Self {
        Self {
            pool,
            interval: WATCHDOG_INTERVAL,
            exit_threshold,
            terminator: Arc::new(SystemTerminator),
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn ProcessTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs until the shutdown signal flips. The watchdog is the only
    /// component allowed to terminate the process unilaterally.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut open_since: Option<Instant> = None;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            let status = self.pool.status();
            if status.circuit_open {
                let since = *open_since.get_or_insert_with(|| {
                    warn!(
                        failures = status.consecutive_failures,
                        "circuit breaker observed open"
                    );
                    Instant::now()
                });
                if since.elapsed() >= self.exit_threshold {
                    error!(
                        open_secs = since.elapsed().as_secs(),
                        "circuit breaker stuck open, exiting so the supervisor can restart"
                    );
                    self.terminator.terminate();
                    return;
                }
            } else {
                open_since = None;
            }
        }
    }
}

//! Lazy singleton browser handle with priority-queued task admission.
//!
//! The browser is launched on first demand, never at startup. All lifecycle
//! transitions (launch, idle restart, max-age restart, disconnect, shutdown)
//! funnel through the pool so at most one handle is ever live and at most
//! one relaunch is ever in flight. Concurrent acquirers share a single
//! launch future instead of spawning parallel launches.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge, histogram};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::{
    ACTIVE_EXTRACTIONS, CONTEXT_CREATION_SECONDS, DISCONNECTS_TOTAL, LAUNCHES_TOTAL, QUEUE_DEPTH,
    RESTARTS_TOTAL,
};

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::driver::{BrowserDriver, ContextOptions, DriverBrowser, DriverContext, LaunchOptions};
use super::error::{BrowserError, BrowserResult};
use super::queue::TaskQueue;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrent: usize,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub shutdown_timeout: Duration,
    pub launch: LaunchOptions,
    pub context: ContextOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            idle_timeout: Duration::from_secs(60),
            max_age: Duration::from_secs(7200),
            shutdown_timeout: Duration::from_secs(30),
            launch: LaunchOptions::default(),
            context: ContextOptions::default(),
        }
    }
}

/// Snapshot for the health endpoint and the watchdog.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub reopen_in: Duration,
    pub pending: usize,
    pub active: usize,
}

#[derive(Clone)]
struct LiveBrowser {
    handle: Arc<dyn DriverBrowser>,
    launched_at: Instant,
    generation: u64,
}

type LaunchFuture = Shared<BoxFuture<'static, Result<LiveBrowser, String>>>;
type AdmissionSender = oneshot::Sender<Result<AdmissionGuard, BrowserError>>;

struct PoolState {
    browser: Option<LiveBrowser>,
    launching: Option<LaunchFuture>,
    next_generation: u64,
    active: usize,
    waiting: TaskQueue<AdmissionSender>,
    idle_timer: Option<JoinHandle<()>>,
    idle_epoch: u64,
    shutting_down: bool,
}

pub struct BrowserPool {
    weak: Weak<BrowserPool>,
    driver: Arc<dyn BrowserDriver>,
    config: PoolConfig,
    breaker: CircuitBreaker,
    state: Mutex<PoolState>,
    drained: Notify,
}

impl BrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: PoolConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            driver,
            config,
            breaker: CircuitBreaker::default(),
            state: Mutex::new(PoolState {
                browser: None,
                launching: None,
                next_generation: 0,
                active: 0,
                waiting: TaskQueue::new(),
                idle_timer: None,
                idle_epoch: 0,
                shutting_down: false,
            }),
            drained: Notify::new(),
        })
    }

    /// Schedules `task` under the concurrency bound and runs it to
    /// completion. Higher priority is admitted first; ties admit in FIFO
    /// order. An admitted task is never preempted.
    pub async fn submit<F, Fut, T>(&self, priority: i32, task: F) -> BrowserResult<T>
    where
        F: FnOnce(BrowserLease) -> Fut,
        Fut: Future<Output = T>,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return Err(BrowserError::ShuttingDown);
            }
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
                state.idle_epoch += 1;
            }
            state.waiting.push(priority, tx);
            self.pump(&mut state);
        }
        let guard = match rx.await {
            Ok(admission) => admission?,
            Err(_) => return Err(BrowserError::ShuttingDown),
        };
        let lease = BrowserLease {
            pool: self.strong(),
        };
        let output = task(lease).await;
        drop(guard);
        Ok(output)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock().unwrap();
        let BreakerSnapshot {
            open,
            consecutive_failures,
            reopen_in,
        } = self.breaker.snapshot();
        PoolStatus {
            circuit_open: open,
            consecutive_failures,
            reopen_in,
            pending: state.waiting.len(),
            active: state.active,
        }
    }

    /// Whether a browser handle is currently live.
    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().browser.is_some()
    }

    /// Drains the queue to a terminal error, waits for in-flight work up to
    /// the configured deadline and closes the browser. Idempotent.
    pub async fn shutdown(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                Vec::new()
            } else {
                state.shutting_down = true;
                if let Some(timer) = state.idle_timer.take() {
                    timer.abort();
                    state.idle_epoch += 1;
                }
                state.waiting.drain()
            }
        };
        for tx in waiters {
            let _ = tx.send(Err(BrowserError::ShuttingDown));
        }
        gauge!(QUEUE_DEPTH).set(0.0);

        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.state.lock().unwrap().active == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("in-flight extractions did not drain before the shutdown deadline");
        }

        let browser = {
            let mut state = self.state.lock().unwrap();
            state.launching = None;
            state.browser.take()
        };
        if let Some(live) = browser {
            if let Err(err) = live.handle.close().await {
                debug!(error = %err, "error closing browser during shutdown");
            }
        }
        info!("browser pool shut down");
    }

    /// The pool always sits behind the [`Arc`] produced by [`Self::new`],
    /// so the upgrade holds whenever a method is reachable.
    fn strong(&self) -> Arc<BrowserPool> {
        self.weak.upgrade().expect("pool outlives its handles")
    }

    /// Admits waiters while capacity remains. Callers must hold the lock.
    fn pump(&self, state: &mut PoolState) {
        if !state.shutting_down {
            while state.active < self.config.max_concurrent {
                let Some(tx) = state.waiting.pop() else { break };
                let guard = AdmissionGuard {
                    pool: Some(self.strong()),
                };
                state.active += 1;
                if let Err(rejected) = tx.send(Ok(guard)) {
                    // Caller vanished between enqueue and admission. The
                    // slot is reclaimed inline; the guard must not run its
                    // Drop while this lock is held.
                    if let Ok(mut guard) = rejected {
                        guard.disarm();
                    }
                    state.active -= 1;
                }
            }
        }
        gauge!(QUEUE_DEPTH).set(state.waiting.len() as f64);
        gauge!(ACTIVE_EXTRACTIONS).set(state.active as f64);
    }

    /// Returns the live browser, launching or restarting as the lifecycle
    /// rules demand. Concurrent callers during a launch all await the same
    /// shared future and observe the same outcome.
    async fn acquire(&self) -> BrowserResult<LiveBrowser> {
        let launch = {
            let mut state = self.state.lock().unwrap();
            if let Some(live) = state.browser.clone() {
                if live.handle.is_connected() {
                    let age = live.launched_at.elapsed();
                    // Only the sole active extraction may retire an aged
                    // browser; anything newer keeps it alive until quiet.
                    if age <= self.config.max_age || state.active > 1 {
                        return Ok(live);
                    }
                    debug!(age_secs = age.as_secs(), "browser exceeded max age");
                    self.restart(&mut state, "max_age");
                } else {
                    state.browser = None;
                }
            }
            match &state.launching {
                Some(shared) => shared.clone(),
                None => {
                    self.breaker.check()?;
                    let shared = self.launch_future();
                    state.launching = Some(shared.clone());
                    shared
                }
            }
        };
        launch.await.map_err(BrowserError::Launch)
    }

    fn launch_future(&self) -> LaunchFuture {
        let pool = self.strong();
        async move {
            counter!(LAUNCHES_TOTAL).increment(1);
            info!("launching browser");
            let result = pool.driver.launch(&pool.config.launch).await;
            let mut state = pool.state.lock().unwrap();
            state.launching = None;
            match result {
                Ok(handle) => {
                    pool.breaker.record_success();
                    state.next_generation += 1;
                    let live = LiveBrowser {
                        handle,
                        launched_at: Instant::now(),
                        generation: state.next_generation,
                    };
                    state.browser = Some(live.clone());
                    drop(state);
                    pool.watch_disconnect(&live);
                    info!("browser launched");
                    Ok(live)
                }
                Err(err) => {
                    drop(state);
                    pool.breaker.record_failure();
                    warn!(error = %err, "browser launch failed");
                    Err(err.to_string())
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Nulls the handle reference first, then closes the retired browser in
    /// the background. The next submission triggers the relaunch.
    fn restart(&self, state: &mut PoolState, reason: &'static str) {
        let Some(live) = state.browser.take() else {
            return;
        };
        counter!(RESTARTS_TOTAL, "reason" => reason).increment(1);
        info!(reason, "restarting browser");
        tokio::spawn(async move {
            if let Err(err) = live.handle.close().await {
                debug!(error = %err, "error closing retired browser");
            }
        });
    }

    fn watch_disconnect(&self, live: &LiveBrowser) {
        let pool = self.strong();
        let handle = Arc::clone(&live.handle);
        let generation = live.generation;
        tokio::spawn(async move {
            handle.wait_disconnected().await;
            let mut state = pool.state.lock().unwrap();
            let current = state.browser.as_ref().map(|live| live.generation);
            if current == Some(generation) {
                warn!("browser disconnected unexpectedly");
                counter!(DISCONNECTS_TOTAL).increment(1);
                state.browser = None;
            }
        });
    }

    fn schedule_idle_restart(&self, state: &mut PoolState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        state.idle_epoch += 1;
        let epoch = state.idle_epoch;
        let pool = self.strong();
        let idle_timeout = self.config.idle_timeout;
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let mut state = pool.state.lock().unwrap();
            // A timer that was cancelled mid-fire must not act on a newer
            // schedule; the epoch pins it to the quiet period that armed it.
            if state.idle_epoch == epoch && state.active == 0 && !state.shutting_down {
                pool.restart(&mut state, "idle");
                state.idle_timer = None;
            }
        }));
    }
}

/// Handed to an admitted task; yields the fresh extraction context.
pub struct BrowserLease {
    pool: Arc<BrowserPool>,
}

impl BrowserLease {
    pub async fn context(&self) -> BrowserResult<Arc<dyn DriverContext>> {
        let live = self.pool.acquire().await?;
        let started = Instant::now();
        let context = live.handle.new_context(&self.pool.config.context).await?;
        histogram!(CONTEXT_CREATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(context)
    }
}

/// Tracks one admitted task. Dropping it releases the slot, admits the next
/// waiter and arms the idle timer when the pool goes quiet.
struct AdmissionGuard {
    pool: Option<Arc<BrowserPool>>,
}

impl AdmissionGuard {
    fn disarm(&mut self) {
        self.pool = None;
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else { return };
        let mut state = pool.state.lock().unwrap();
        state.active = state.active.saturating_sub(1);
        pool.pump(&mut state);
        if state.active == 0 {
            if state.shutting_down {
                pool.drained.notify_waiters();
            } else if state.browser.is_some() && state.waiting.is_empty() {
                pool.schedule_idle_restart(&mut state);
            }
        }
    }
}

//! Wake-safe keep-alive scheduling
//!
//! An in-process `tokio::time::sleep` runs on the monotonic clock, which
//! stops while the host is suspended. The scheduler therefore arms one-shot
//! wake-ups at a wall-clock deadline through a [`WakeTimer`], and re-arms
//! itself after every fire instead of using a repeating interval, so a late
//! fire never accumulates drift or duplicate registrations.
//!
//! Each fire brackets the transport's activity check with a [`WakeLock`];
//! the lock is released exactly once, after the ping settles or right away
//! when no ping was needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Longest single sleep slice used by [`WallClockTimer`]
pub const DEFAULT_WAKE_SLICE: Duration = Duration::from_secs(1);

/// Callback run when a wake-up fires
pub type WakeCallback = Box<dyn FnOnce() + Send + 'static>;

/// Registration returned by [`WakeTimer::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeHandle(pub u64);

/// Platform facility able to fire at a wall-clock time
pub trait WakeTimer: Send + Sync {
    /// Register a one-shot wake-up
    fn schedule(&self, at: SystemTime, wake: WakeCallback) -> WakeHandle;

    /// Cancel a pending wake-up; unknown or fired handles are ignored
    fn cancel(&self, handle: WakeHandle);
}

/// "Stay awake" primitive held while a ping is outstanding
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Wake lock for hosts without power management
#[derive(Debug, Default)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {
        trace!("wake lock acquired (noop)");
    }

    fn release(&self) {
        trace!("wake lock released (noop)");
    }
}

/// Holds a [`WakeLock`] and releases it once on drop
pub struct WakeLockGuard {
    lock: Option<Arc<dyn WakeLock>>,
}

impl WakeLockGuard {
    pub fn acquire(lock: Arc<dyn WakeLock>) -> Self {
        lock.acquire();
        Self { lock: Some(lock) }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Completion handle for a ping started by [`ActivityProbe::check_for_activity`]
#[derive(Debug)]
pub struct PingToken {
    rx: oneshot::Receiver<Result<(), String>>,
}

/// Transport-side half of a [`PingToken`]
#[derive(Debug)]
pub struct PingCompleter {
    tx: oneshot::Sender<Result<(), String>>,
}

impl PingToken {
    pub fn pair() -> (PingCompleter, PingToken) {
        let (tx, rx) = oneshot::channel();
        (PingCompleter { tx }, PingToken { rx })
    }

    /// Wait for the ping response
    pub async fn wait(self) -> Result<(), String> {
        self.rx
            .await
            .unwrap_or_else(|_| Err("ping abandoned by transport".to_string()))
    }
}

impl PingCompleter {
    pub fn complete(self, outcome: Result<(), String>) {
        let _ = self.tx.send(outcome);
    }
}

/// Transport operation that pings only when the link has been idle
pub trait ActivityProbe: Send + Sync {
    /// `None` when no ping was needed
    fn check_for_activity(&self) -> Option<PingToken>;
}

/// Default [`WakeTimer`] comparing against the wall clock
///
/// Sleeps in bounded slices and re-reads `SystemTime` after each one, so a
/// deadline that passed while the process was suspended fires on the first
/// slice after resume.
#[derive(Debug)]
pub struct WallClockTimer {
    next_id: AtomicU64,
    slice: Duration,
    pending: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl Default for WallClockTimer {
    fn default() -> Self {
        Self::new(DEFAULT_WAKE_SLICE)
    }
}

impl WallClockTimer {
    pub fn new(slice: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slice: slice.max(Duration::from_millis(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of armed wake-ups
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl WakeTimer for WallClockTimer {
    fn schedule(&self, at: SystemTime, wake: WakeCallback) -> WakeHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slice = self.slice;
        let pending = self.pending.clone();

        // Hold the map while spawning so an already-due task cannot miss its entry
        let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let task = tokio::spawn(async move {
            loop {
                match at.duration_since(SystemTime::now()) {
                    Ok(remaining) if !remaining.is_zero() => {
                        tokio::time::sleep(remaining.min(slice)).await;
                    }
                    _ => break,
                }
            }
            let still_armed = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some();
            if still_armed {
                wake();
            }
        });
        guard.insert(id, task.abort_handle());

        WakeHandle(id)
    }

    fn cancel(&self, handle: WakeHandle) {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if let Some(task) = removed {
            task.abort();
        }
    }
}

#[derive(Debug)]
struct SchedulerState {
    interval: Duration,
    running: bool,
    generation: u64,
    pending: Option<WakeHandle>,
}

struct SchedulerInner {
    timer: Arc<dyn WakeTimer>,
    probe: Arc<dyn ActivityProbe>,
    wake_lock: Arc<dyn WakeLock>,
    state: Mutex<SchedulerState>,
    wakeups: AtomicU64,
}

/// Periodic activity check that survives host suspension
#[derive(Clone)]
pub struct KeepAliveScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for KeepAliveScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveScheduler")
            .field("state", &self.inner.lock_state())
            .finish()
    }
}

impl KeepAliveScheduler {
    pub fn new(
        timer: Arc<dyn WakeTimer>,
        probe: Arc<dyn ActivityProbe>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                timer,
                probe,
                wake_lock,
                state: Mutex::new(SchedulerState {
                    interval: Duration::ZERO,
                    running: false,
                    generation: 0,
                    pending: None,
                }),
                wakeups: AtomicU64::new(0),
            }),
        }
    }

    /// Arm the first wake-up at `now + interval`; no-op while running
    pub fn start(&self, interval: Duration) {
        let mut state = self.inner.lock_state();
        if state.running {
            debug!("keep-alive scheduler already running");
            return;
        }
        state.running = true;
        state.interval = interval;
        debug!(interval_secs = interval.as_secs(), "keep-alive scheduler started");
        SchedulerInner::arm(&self.inner, &mut state);
    }

    /// Cancel any pending wake-up (idempotent)
    pub fn stop(&self) {
        let mut state = self.inner.lock_state();
        let was_running = state.running;
        state.running = false;
        state.generation = state.generation.wrapping_add(1);
        if let Some(handle) = state.pending.take() {
            self.inner.timer.cancel(handle);
        }
        if was_running {
            debug!("keep-alive scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    /// Total wake-ups handled since creation
    pub fn wakeups(&self) -> u64 {
        self.inner.wakeups.load(Ordering::Relaxed)
    }
}

impl SchedulerInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(inner: &Arc<SchedulerInner>, state: &mut SchedulerState) {
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let at = SystemTime::now() + state.interval;
        let this = inner.clone();
        let handle = inner
            .timer
            .schedule(at, Box::new(move || SchedulerInner::fire(&this, generation)));
        trace!(generation, "keep-alive wake-up armed");
        state.pending = Some(handle);
    }

    fn fire(inner: &Arc<SchedulerInner>, generation: u64) {
        let interval = {
            let mut state = inner.lock_state();
            if !state.running || state.generation != generation {
                trace!(generation, "stale keep-alive wake-up ignored");
                return;
            }
            state.pending = None;
            state.interval
        };
        inner.wakeups.fetch_add(1, Ordering::Relaxed);

        let guard = WakeLockGuard::acquire(inner.wake_lock.clone());
        match inner.probe.check_for_activity() {
            None => {
                trace!("link active, no ping sent");
                guard.release();
            }
            Some(token) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        match tokio::time::timeout(interval, token.wait()).await {
                            Ok(Ok(())) => debug!("keep-alive ping acknowledged"),
                            Ok(Err(reason)) => warn!(%reason, "keep-alive ping failed"),
                            Err(_) => warn!("keep-alive ping unanswered within interval"),
                        }
                        guard.release();
                    });
                }
                Err(_) => {
                    warn!("no async runtime to await ping, releasing wake lock");
                    guard.release();
                }
            },
        }

        let mut state = inner.lock_state();
        if state.running && state.generation == generation {
            SchedulerInner::arm(inner, &mut state);
        }
    }
}

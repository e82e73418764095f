use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub const DEFAULT_MAX_CALLS: usize = 10;
pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(60);

/// Time source for the limiter. Tests swap in [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    slept: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = lock(&self.offset);
        *offset += by;
    }

    /// Total time spent in `sleep` so far.
    pub fn slept(&self) -> Duration {
        *lock(&self.slept)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *lock(&self.offset)
    }

    fn sleep(&self, duration: Duration) {
        *lock(&self.slept) += duration;
        self.advance(duration);
    }
}

// A poisoned lock only means another caller panicked mid-update; the queue is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sliding-window admission control.
///
/// Every admitted call is stamped into a queue. Stamps at least `time_window`
/// old fall out of the window; once `max_calls` stamps remain the caller
/// blocks until the oldest one leaves.
pub struct RateLimiter {
    max_calls: usize,
    time_window: Duration,
    calls: Mutex<VecDeque<Instant>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, time_window: Duration) -> Self {
        Self::with_clock(max_calls, time_window, Arc::new(SystemClock))
    }

    pub fn with_clock(max_calls: usize, time_window: Duration, clock: Arc<dyn Clock>) -> Self {
        let max_calls = max_calls.max(1);
        debug!(max_calls, window_secs = time_window.as_secs_f64(), "rate limiter initialized");
        Self {
            max_calls,
            time_window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
            clock,
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn time_window(&self) -> Duration {
        self.time_window
    }

    fn evict_expired(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= self.time_window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Blocks until a slot is free, then records the call.
    ///
    /// The queue lock is released while sleeping so introspection from other
    /// threads stays responsive.
    pub fn acquire(&self) {
        loop {
            let (wait, in_window) = {
                let mut calls = lock(&self.calls);
                let now = self.clock.now();
                self.evict_expired(&mut calls, now);
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                let age = calls
                    .front()
                    .map(|oldest| now.duration_since(*oldest))
                    .unwrap_or(self.time_window);
                (self.time_window.saturating_sub(age), calls.len())
            };
            if !wait.is_zero() {
                warn!(
                    in_window,
                    max_calls = self.max_calls,
                    wait_secs = wait.as_secs_f64(),
                    "rate limit reached, sleeping"
                );
                self.clock.sleep(wait);
            }
        }
    }

    /// Runs `op` once admitted.
    pub fn call<T, F>(&self, op: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.acquire();
        op()
    }

    pub fn remaining_calls(&self) -> usize {
        let mut calls = lock(&self.calls);
        self.evict_expired(&mut calls, self.clock.now());
        self.max_calls.saturating_sub(calls.len())
    }

    /// Time until the oldest call in the window expires; zero when the window is empty.
    pub fn reset_time(&self) -> Duration {
        let mut calls = lock(&self.calls);
        let now = self.clock.now();
        self.evict_expired(&mut calls, now);
        match calls.front() {
            Some(oldest) => self.time_window.saturating_sub(now.duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALLS, DEFAULT_TIME_WINDOW)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("time_window", &self.time_window)
            .field("in_window", &lock(&self.calls).len())
            .finish()
    }
}

//! Sliding-window request throttle for control-server calls.
//!
//! Shared by the fetcher and the uploader: every call to the control
//! server passes through [`RateLimiter::acquire`], which delays (never
//! rejects) until one more request fits inside the trailing window.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Sliding-window rate limiter.
///
/// Holds the timestamps of recent grants; a grant is issued when fewer
/// than `max_requests` of them fall inside the trailing `window`. Callers
/// contend on a mutex around the timestamp deque, so concurrent use never
/// double-grants. Limits can be swapped live via [`set_limits`](Self::set_limits).
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    max_requests: usize,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_requests` per trailing `window`.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            inner: Mutex::new(Window {
                max_requests,
                window,
                grants: VecDeque::new(),
            }),
        }
    }

    /// Replace the limits without dropping the grant history.
    ///
    /// Used when the control server pushes a new request budget via a
    /// task's global config.
    pub fn set_limits(&self, max_requests: usize, window: Duration) {
        let mut inner = self.inner.lock();
        inner.max_requests = max_requests;
        inner.window = window;
    }

    /// Block until issuing one more request stays within the window.
    pub async fn acquire(&self) {
        loop {
            match self.try_grant() {
                None => return,
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Attempt a grant; on refusal, return how long until the oldest
    /// grant leaves the window. The lock is never held across an await.
    fn try_grant(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(horizon) = now.checked_sub(inner.window) {
            while inner.grants.front().is_some_and(|oldest| *oldest <= horizon) {
                inner.grants.pop_front();
            }
        }

        if inner.grants.len() < inner.max_requests {
            inner.grants.push_back(now);
            return None;
        }

        match inner.grants.front() {
            Some(&oldest) => {
                let wait = (oldest + inner.window).saturating_duration_since(now);
                // Zero can happen when the oldest grant expires between the
                // prune and this computation; nudge forward so the loop
                // makes progress.
                Some(wait.max(Duration::from_millis(1)))
            }
            // Zero-capacity limits leave nothing to wait out; re-check
            // after a full window in case set_limits raises them.
            None => Some(inner.window),
        }
    }

    /// Number of grants currently inside the window. Diagnostic only.
    #[cfg(test)]
    fn in_window(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock();
        let horizon = now.checked_sub(inner.window);
        inner
            .grants
            .iter()
            .filter(|g| match horizon {
                Some(h) => **g > h,
                None => true,
            })
            .count()
    }
}

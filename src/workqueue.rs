//! Work queue rate limiting primitives.
//!
//! [`ExponentialTimedFailureRateLimiter`] backs off per key like the classic
//! item-exponential-failure limiter, but additionally forgets about keys that
//! have been idle longer than twice the maximum delay, so a key that failed
//! long ago gets a free pass instead of resuming a stale backoff curve.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A per-item rate limiter consulted by dispatchers before they forward work.
pub trait RateLimiter<T>: Send + Sync {
    /// How long the item should wait before being processed.
    fn when(&self, item: &T) -> Duration;
    /// The number of times the item has been through the limiter.
    fn num_requeues(&self, item: &T) -> u32;
    /// Drop tracking state for the item, if it is safe to do so.
    fn forget(&self, item: &T);
}

#[derive(Debug, Clone, Copy)]
struct FailureRequest {
    attempts: u32,
    last_attempt: Instant,
}

/// Per-key exponential backoff with self-forgetting idle entries.
pub struct ExponentialTimedFailureRateLimiter<T> {
    failures: Mutex<HashMap<T, FailureRequest>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: Eq + Hash + Clone> ExponentialTimedFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        ExponentialTimedFailureRateLimiter {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ExponentialTimedFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().expect("rate limiter mutex poisoned");

        let Some(failreq) = failures.get_mut(item) else {
            failures.insert(
                item.clone(),
                FailureRequest {
                    attempts: 1,
                    last_attempt: Instant::now(),
                },
            );
            return self.base_delay;
        };

        // Idle longer than twice the cap: free pass. The entry stays; only
        // Forget deletes it.
        if failreq.last_attempt.elapsed() > 2 * self.max_delay {
            return Duration::ZERO;
        }

        let exp = failreq.attempts;
        failreq.attempts += 1;
        failreq.last_attempt = Instant::now();

        // The backoff is capped such that the computed value never overflows.
        let backoff = (self.base_delay.as_nanos() as f64) * 2f64.powi(exp as i32);
        if backoff > i64::MAX as f64 {
            return self.max_delay;
        }

        let calculated = Duration::from_nanos(backoff as u64);
        calculated.min(self.max_delay)
    }

    fn num_requeues(&self, item: &T) -> u32 {
        let failures = self.failures.lock().expect("rate limiter mutex poisoned");
        failures.get(item).map(|f| f.attempts).unwrap_or(0)
    }

    fn forget(&self, item: &T) {
        let mut failures = self.failures.lock().expect("rate limiter mutex poisoned");
        // Removing an entry that is still backing off would reset the curve
        // mid-storm, so only idle entries are dropped.
        if let Some(failreq) = failures.get(item) {
            if failreq.last_attempt.elapsed() > 2 * self.max_delay {
                failures.remove(item);
            }
        }
    }
}

//! Rate-limited dispatch of reconcile requests.
//!
//! [`RateLimitedReconciler`] wraps an inner [`Reconciler`] and consults a
//! [`RateLimiter`] the first time it sees a request key. Rate-limited
//! requests return `requeue_after: d` without touching the inner reconciler;
//! when the same key comes back it is trusted to have served its delay and
//! passes straight through.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::resource::{ReconcileResult, Reconciler, Request};
use crate::workqueue::RateLimiter;

/// Rate limits an inner, wrapped reconciler. Multiple uniquely named
/// dispatchers can share the same rate limiter.
pub struct RateLimitedReconciler {
    name: String,
    inner: Arc<dyn Reconciler>,
    limit: Arc<dyn RateLimiter<String>>,

    limited: RwLock<HashSet<String>>,
}

impl RateLimitedReconciler {
    /// Wrap the supplied reconciler, ensuring requests are passed to it no
    /// more frequently than the rate limiter allows.
    pub fn new(name: &str, inner: Arc<dyn Reconciler>, limit: Arc<dyn RateLimiter<String>>) -> Self {
        RateLimitedReconciler {
            name: name.to_string(),
            inner,
            limit,
            limited: RwLock::new(HashSet::new()),
        }
    }

    /// Adapt the limiter's `when` such that a request that already served a
    /// delay is allowed to proceed immediately without being limited again.
    /// Optimised for requests that have not been and will not be rate
    /// limited: the hot path takes only the read lock.
    fn when(&self, item: &str) -> Duration {
        let was_limited = self
            .limited
            .read()
            .expect("limited set lock poisoned")
            .contains(item);

        // If we already rate limited this request we trust that it complied
        // and let it pass immediately.
        if was_limited {
            self.limited
                .write()
                .expect("limited set lock poisoned")
                .remove(item);
            return Duration::ZERO;
        }

        let d = self.limit.when(&item.to_string());

        // Record that this request was rate limited so that we can let it
        // through when it requeues after the supplied duration.
        if !d.is_zero() {
            self.limited
                .write()
                .expect("limited set lock poisoned")
                .insert(item.to_string());
        }

        d
    }
}

#[async_trait]
impl Reconciler for RateLimitedReconciler {
    async fn reconcile(&self, req: &Request) -> Result<ReconcileResult, Error> {
        let item = format!("{}{}", self.name, req);
        let d = self.when(&item);
        if !d.is_zero() {
            return Ok(ReconcileResult::requeue_after(d));
        }
        self.limit.forget(&item);
        self.inner.reconcile(req).await
    }
}

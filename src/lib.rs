//! Provider Runtime
//!
//! A reconciliation runtime for Kubernetes providers. A provider watches
//! *managed resources*, custom resources declaring the desired state of
//! something living in an external system (a cloud database, a SaaS tenant,
//! a remote configuration), and keeps the external side in agreement with
//! them.
//!
//! The runtime supplies the generic control loop: it sequences
//! observe/create/update/delete against the external system, enforces
//! management and deletion policies, defers Kubernetes deletion behind a
//! finalizer until the external side is settled, and records enough state in
//! annotations that no external resource is leaked across crashes and
//! restarts.
//!
//! Providers implement [`reconciler::ExternalConnector`] and
//! [`reconciler::ExternalClient`] for their system and hand a
//! [`reconciler::ManagedReconciler`] to their controller:
//!
//! ```ignore
//! let reconciler = ManagedReconciler::<Database>::new(client)
//!     .with_connector(DatabaseConnector::new(config))
//!     .with_poll_interval(Duration::from_secs(120));
//! ```

pub mod api;
pub mod conditions;
pub mod error;
pub mod event;
pub mod helpers;
pub mod meta;
pub mod ratelimiter;
pub mod reconciler;
pub mod resource;
pub mod workqueue;

#[cfg(test)]
pub(crate) mod test_utils;

pub use conditions::{Condition, ConditionedStatus};
pub use error::{Error, ExternalError, Result};
pub use event::{Event, EventType, Recorder};
pub use ratelimiter::RateLimitedReconciler;
pub use reconciler::{
    ExternalClient, ExternalConnector, ExternalDisconnector, ExternalObservation,
    ManagedReconciler, FINALIZER_NAME,
};
pub use resource::{
    Conditioned, DeletionPolicy, Managed, Orphanable, ReconcileResult, Reconciler, Request,
};
pub use workqueue::{ExponentialTimedFailureRateLimiter, RateLimiter};

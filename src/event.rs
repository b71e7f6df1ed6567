//! Kubernetes event recording for managed resources.
//!
//! The runtime emits events describing reconcile outcomes through a
//! [`Recorder`]. Hosts that want events on the API server plug their own
//! recorder in; the in-crate implementations log through `tracing` or drop
//! events entirely.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::resource::Managed;

/// The type of a Kubernetes event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// An event relating to a managed resource. Reasons are opaque strings; the
/// runtime's vocabulary lives in [`crate::reconciler`].
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub annotations: BTreeMap<String, String>,
}

impl Event {
    /// An event emitted when something expected happens.
    pub fn normal(reason: &str, message: impl Into<String>) -> Self {
        Event {
            event_type: EventType::Normal,
            reason: reason.to_string(),
            message: message.into(),
            annotations: BTreeMap::new(),
        }
    }

    /// An event emitted when something unexpected happens.
    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Event {
            event_type: EventType::Warning,
            reason: reason.to_string(),
            message: message.into(),
            annotations: BTreeMap::new(),
        }
    }

    /// Attach a key/value annotation to the event.
    pub fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }
}

/// Records events for a managed resource. Recording must never fail the
/// reconcile; implementations swallow and log their own errors.
#[async_trait]
pub trait Recorder<T: Managed>: Send + Sync {
    async fn record(&self, obj: &T, event: Event);
}

/// A [`Recorder`] that does nothing.
pub struct NopRecorder;

#[async_trait]
impl<T: Managed> Recorder<T> for NopRecorder {
    async fn record(&self, _obj: &T, _event: Event) {}
}

/// A [`Recorder`] that logs events through `tracing`.
pub struct TracingRecorder;

#[async_trait]
impl<T: Managed> Recorder<T> for TracingRecorder {
    async fn record(&self, obj: &T, event: Event) {
        let kind = T::kind(&());
        let name = obj.meta().name.as_deref().unwrap_or("unknown");
        let namespace = obj.meta().namespace.as_deref().unwrap_or("default");
        let object = format!("{}/{}", namespace, name);
        match event.event_type {
            EventType::Normal => info!(
                kind = %kind,
                object = %object,
                reason = %event.reason,
                "{}", event.message
            ),
            EventType::Warning => warn!(
                kind = %kind,
                object = %object,
                reason = %event.reason,
                "{}", event.message
            ),
        }
    }
}

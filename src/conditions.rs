//! Status condition types for managed resources.
//!
//! Provides the `Synced` and `Ready` conditions the reconciler maintains,
//! following the Kubernetes API conventions. Providers embed
//! [`ConditionedStatus`] in the status of their custom resources.

use std::fmt;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// The resource is believed to be ready for use.
pub const TYPE_READY: &str = "Ready";
/// The desired state of the resource is in sync with the external system.
pub const TYPE_SYNCED: &str = "Synced";

// Ready condition reasons
pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_UNAVAILABLE: &str = "Unavailable";
pub const REASON_CREATING: &str = "Creating";
pub const REASON_DELETING: &str = "Deleting";

// Synced condition reasons
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_RECONCILE_PAUSED: &str = "ReconcilePaused";

/// A condition describing one aspect of the state of a managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. `Ready`, `Synced`)
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned from one status to another
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable reason for the condition's last transition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    /// Build a condition stamped with the current time.
    pub fn new(condition_type: &str, status: &str, reason: &str, message: &str) -> Self {
        Condition {
            r#type: condition_type.to_string(),
            status: status.to_string(),
            last_transition_time: Some(Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// `Ready=False, Reason=Creating`: the external resource is being created.
pub fn creating() -> Condition {
    Condition::new(TYPE_READY, CONDITION_FALSE, REASON_CREATING, "")
}

/// `Ready=False, Reason=Deleting`: the external resource is being deleted.
pub fn deleting() -> Condition {
    Condition::new(TYPE_READY, CONDITION_FALSE, REASON_DELETING, "")
}

/// `Ready=True, Reason=Available`: the external resource is ready for use.
pub fn available() -> Condition {
    Condition::new(TYPE_READY, CONDITION_TRUE, REASON_AVAILABLE, "")
}

/// `Ready=False, Reason=Unavailable`: the external resource is not ready.
pub fn unavailable() -> Condition {
    Condition::new(TYPE_READY, CONDITION_FALSE, REASON_UNAVAILABLE, "")
}

/// `Synced=True, Reason=ReconcileSuccess`: the last reconcile completed.
pub fn reconcile_success() -> Condition {
    Condition::new(TYPE_SYNCED, CONDITION_TRUE, REASON_RECONCILE_SUCCESS, "")
}

/// `Synced=False, Reason=ReconcileError`: the last reconcile failed with the
/// supplied error.
pub fn reconcile_error(err: &impl fmt::Display) -> Condition {
    Condition::new(
        TYPE_SYNCED,
        CONDITION_FALSE,
        REASON_RECONCILE_ERROR,
        &err.to_string(),
    )
}

/// `Synced=False, Reason=ReconcilePaused`: reconciliation is paused via the
/// pause annotation.
pub fn reconcile_paused() -> Condition {
    Condition::new(
        TYPE_SYNCED,
        CONDITION_FALSE,
        REASON_RECONCILE_PAUSED,
        "Reconciliation is paused via the pause annotation",
    )
}

/// A set of conditions keyed by type, embeddable in a custom resource status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionedStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ConditionedStatus {
    /// Upsert each supplied condition by type. When the status value of an
    /// existing condition is unchanged its `lastTransitionTime` is preserved
    /// and only reason and message are refreshed.
    pub fn set_conditions(&mut self, conditions: impl IntoIterator<Item = Condition>) {
        for new in conditions {
            match self.conditions.iter_mut().find(|c| c.r#type == new.r#type) {
                Some(existing) if existing.status == new.status => {
                    existing.reason = new.reason;
                    existing.message = new.message;
                }
                Some(existing) => *existing = new,
                None => self.conditions.push(new),
            }
        }
    }

    /// The condition with the supplied type, if any.
    pub fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    /// Remove the condition with the supplied type, if present.
    pub fn remove_condition(&mut self, condition_type: &str) {
        self.conditions.retain(|c| c.r#type != condition_type);
    }
}

//! Helpers for the object metadata the runtime uses as persistent state.
//!
//! All reconciler memory lives in annotations and finalizers on the managed
//! object itself, so the runtime stays stateless across restarts. This module
//! owns the reserved annotation keys and the pure functions that read and
//! write them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Annotation holding the name of the resource as it appears on the
/// provider's systems.
pub const ANNOTATION_EXTERNAL_NAME: &str = "krateo.io/external-name";

/// Annotation recording the last time creation of the external resource was
/// about to happen. Its value must be an RFC3339 timestamp.
pub const ANNOTATION_EXTERNAL_CREATE_PENDING: &str = "krateo.io/external-create-pending";

/// Annotation recording the last time the external resource was created
/// successfully. Its value must be an RFC3339 timestamp, which can be used to
/// determine how long ago a resource was created. This is useful for
/// eventually consistent APIs that may take some time before they report that
/// a recently created external resource exists.
pub const ANNOTATION_EXTERNAL_CREATE_SUCCEEDED: &str = "krateo.io/external-create-succeeded";

/// Annotation recording the last time creation of the external resource
/// failed. Its value must be an RFC3339 timestamp.
pub const ANNOTATION_EXTERNAL_CREATE_FAILED: &str = "krateo.io/external-create-failed";

/// Annotation that suspends further reconciliation of the resource while its
/// value is exactly `"true"`.
pub const ANNOTATION_PAUSED: &str = "krateo.io/paused";

/// Annotation that asks the external client for verbose diagnostics.
pub const ANNOTATION_CONNECTOR_VERBOSE: &str = "krateo.io/connector-verbose";

/// Annotation selecting which of create/update/delete the runtime may perform
/// on the external resource. See [`ManagementPolicy`].
pub const ANNOTATION_MANAGEMENT_POLICY: &str = "krateo.io/management-policy";

/// How much of the external resource lifecycle the runtime may drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ManagementPolicy {
    /// The runtime fully manages the resource.
    #[default]
    Default,
    /// The runtime may observe, create, or update the resource, but not
    /// delete it.
    ObserveCreateUpdate,
    /// The runtime may observe or delete the resource, but not create or
    /// update it.
    ObserveDelete,
    /// The runtime may only observe the resource. This maps to the read-only
    /// scenario where the resource is fully controlled by a third party.
    Observe,
}

impl ManagementPolicy {
    fn parse(value: &str) -> Self {
        match value {
            "" | "default" => ManagementPolicy::Default,
            "observe-create-update" => ManagementPolicy::ObserveCreateUpdate,
            "observe-delete" => ManagementPolicy::ObserveDelete,
            _ => ManagementPolicy::Observe,
        }
    }
}

/// An action the runtime may perform against the external resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Add the supplied labels, creating the label map if absent. Keys not in
/// `labels` are left untouched.
pub fn add_labels(meta: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Remove the labels with the supplied keys. No-op if the label map is
/// absent.
pub fn remove_labels(meta: &mut ObjectMeta, keys: &[&str]) {
    if let Some(labels) = meta.labels.as_mut() {
        for k in keys {
            labels.remove(*k);
        }
    }
}

/// Add the supplied annotations, creating the annotation map if absent. Keys
/// not in `annotations` are left untouched.
pub fn add_annotations(meta: &mut ObjectMeta, annotations: &BTreeMap<String, String>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Remove the annotations with the supplied keys. No-op if the annotation map
/// is absent.
pub fn remove_annotations(meta: &mut ObjectMeta, keys: &[&str]) {
    if let Some(annotations) = meta.annotations.as_mut() {
        for k in keys {
            annotations.remove(*k);
        }
    }
}

/// Append the finalizer unless it is already present.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
}

/// Remove every occurrence of the finalizer. There should be at most one, but
/// the filter tolerates duplicates.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) {
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
}

/// Whether the finalizer is already set.
pub fn finalizer_exists(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|fs| fs.iter().any(|f| f == finalizer))
}

/// Whether the object was deleted from the API server (has a deletion
/// timestamp).
pub fn was_deleted(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Whether the object was created in the API server (has a creation
/// timestamp).
pub fn was_created(meta: &ObjectMeta) -> bool {
    meta.creation_timestamp.is_some()
}

/// The external name annotation value, or the empty string if unset.
pub fn get_external_name(meta: &ObjectMeta) -> String {
    annotation(meta, ANNOTATION_EXTERNAL_NAME)
        .unwrap_or_default()
        .to_string()
}

/// Set the external name annotation.
pub fn set_external_name(meta: &mut ObjectMeta, name: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_EXTERNAL_NAME.to_string(), name.to_string());
}

fn get_timestamp(meta: &ObjectMeta, key: &str) -> Option<DateTime<Utc>> {
    let raw = annotation(meta, key)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn set_timestamp(meta: &mut ObjectMeta, key: &str, t: DateTime<Utc>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), t.to_rfc3339());
}

/// The time at which the external resource was most recently pending
/// creation. `None` if the annotation is absent or malformed.
pub fn get_external_create_pending(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    get_timestamp(meta, ANNOTATION_EXTERNAL_CREATE_PENDING)
}

/// Record that creation of the external resource is about to be attempted.
pub fn set_external_create_pending(meta: &mut ObjectMeta, t: DateTime<Utc>) {
    set_timestamp(meta, ANNOTATION_EXTERNAL_CREATE_PENDING, t);
}

/// The time at which the external resource was most recently created.
/// `None` if the annotation is absent or malformed.
pub fn get_external_create_succeeded(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    get_timestamp(meta, ANNOTATION_EXTERNAL_CREATE_SUCCEEDED)
}

/// Record that creation of the external resource succeeded.
pub fn set_external_create_succeeded(meta: &mut ObjectMeta, t: DateTime<Utc>) {
    set_timestamp(meta, ANNOTATION_EXTERNAL_CREATE_SUCCEEDED, t);
}

/// The time at which the external resource most recently failed to create.
/// `None` if the annotation is absent or malformed.
pub fn get_external_create_failed(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    get_timestamp(meta, ANNOTATION_EXTERNAL_CREATE_FAILED)
}

/// Record that creation of the external resource failed.
pub fn set_external_create_failed(meta: &mut ObjectMeta, t: DateTime<Utc>) {
    set_timestamp(meta, ANNOTATION_EXTERNAL_CREATE_FAILED, t);
}

/// Whether creation of the external resource appears to be incomplete:
/// the pending annotation is set and newer than both the succeeded and
/// failed annotations. A reconciler observing this cannot know whether an
/// external resource was created, so it must refuse to create another one.
pub fn external_create_incomplete(meta: &ObjectMeta) -> bool {
    let Some(pending) = get_external_create_pending(meta) else {
        // Creation never started, so it cannot be incomplete.
        return false;
    };

    let latest = match (
        get_external_create_succeeded(meta),
        get_external_create_failed(meta),
    ) {
        (None, None) => return true,
        (Some(s), None) => s,
        (None, Some(f)) => f,
        (Some(s), Some(f)) => s.max(f),
    };

    pending > latest
}

/// Whether creation of the external resource succeeded within the supplied
/// duration.
pub fn external_create_succeeded_during(meta: &ObjectMeta, d: std::time::Duration) -> bool {
    let Some(t) = get_external_create_succeeded(meta) else {
        return false;
    };
    match chrono::Duration::from_std(d) {
        Ok(window) => Utc::now().signed_duration_since(t) < window,
        Err(_) => true,
    }
}

/// Whether reconciliation of the object is paused via the pause annotation.
pub fn is_paused(meta: &ObjectMeta) -> bool {
    annotation(meta, ANNOTATION_PAUSED) == Some("true")
}

/// Whether the connector-verbose annotation is set to `"true"`.
pub fn is_verbose(meta: &ObjectMeta) -> bool {
    annotation(meta, ANNOTATION_CONNECTOR_VERBOSE) == Some("true")
}

/// The management policy selected by the object's annotations. An absent
/// annotation means [`ManagementPolicy::Default`].
pub fn management_policy(meta: &ObjectMeta) -> ManagementPolicy {
    ManagementPolicy::parse(annotation(meta, ANNOTATION_MANAGEMENT_POLICY).unwrap_or_default())
}

/// Whether the current management policy permits the supplied action.
pub fn is_action_allowed(meta: &ObjectMeta, action: Action) -> bool {
    let policy = management_policy(meta);
    match action {
        Action::Create | Action::Update => matches!(
            policy,
            ManagementPolicy::Default | ManagementPolicy::ObserveCreateUpdate
        ),
        Action::Delete => matches!(
            policy,
            ManagementPolicy::Default | ManagementPolicy::ObserveDelete
        ),
    }
}

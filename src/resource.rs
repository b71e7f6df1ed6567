//! The managed resource contract and the Kubernetes API surface the runtime
//! consumes.
//!
//! A *managed resource* is a custom resource declaring the desired state of
//! an external resource. Provider CRDs opt in by implementing [`Orphanable`]
//! and [`Conditioned`]; everything else the runtime needs comes from the
//! `kube` resource machinery.

use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::error::Error;
use crate::meta::{self, Action as ManagedAction};

/// What should happen to the external resource when its managed resource is
/// deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeletionPolicy {
    /// The external resource is orphaned when its managed resource is
    /// deleted.
    Orphan,
    /// The external resource is deleted along with its managed resource.
    #[default]
    Delete,
}

/// A resource that may specify a [`DeletionPolicy`].
pub trait Orphanable {
    fn deletion_policy(&self) -> DeletionPolicy;
    fn set_deletion_policy(&mut self, policy: DeletionPolicy);
}

/// A resource that exposes status conditions. Conditions typically indicate
/// the status of both the resource and its reconciliation process.
pub trait Conditioned {
    /// Upsert the supplied conditions by type.
    fn set_conditions(&mut self, conditions: Vec<Condition>);
    /// The condition with the supplied type, if any.
    fn get_condition(&self, condition_type: &str) -> Option<Condition>;
}

/// A Kubernetes custom resource declaring the desired state of an external
/// resource. Blanket-implemented for any namespaced kube resource that is
/// [`Orphanable`] and [`Conditioned`]; reconciling a kind that does not
/// satisfy these bounds is a compile error.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Orphanable
    + Conditioned
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Managed for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Orphanable
        + Conditioned
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Whether the runtime may create the external resource.
pub fn should_create<T: Managed>(mg: &T) -> bool {
    meta::is_action_allowed(mg.meta(), ManagedAction::Create)
}

/// Whether the runtime may update the external resource.
pub fn should_update<T: Managed>(mg: &T) -> bool {
    meta::is_action_allowed(mg.meta(), ManagedAction::Update)
}

/// Whether the runtime should delete the external resource when the managed
/// resource is deleted. An `Orphan` deletion policy wins over the management
/// policy.
pub fn should_delete<T: Managed>(mg: &T) -> bool {
    mg.deletion_policy() != DeletionPolicy::Orphan
        && meta::is_action_allowed(mg.meta(), ManagedAction::Delete)
}

/// Whether the management policy restricts the runtime to observation only.
pub fn should_only_observe<T: Managed>(mg: &T) -> bool {
    meta::management_policy(mg.meta()) == meta::ManagementPolicy::Observe
}

/// A request asking a reconciler to process one managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub name: String,
    pub namespace: Option<String>,
}

impl Request {
    pub fn new(namespace: &str, name: &str) -> Self {
        Request {
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace.as_deref().unwrap_or(""), self.name)
    }
}

/// What the host work queue should do with the request next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Deliver the same key again immediately.
    pub requeue: bool,
    /// Deliver the same key again after the supplied delay.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Ask for an immediate redelivery.
    pub fn requeue() -> Self {
        ReconcileResult {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Ask for a redelivery after the supplied delay.
    pub fn requeue_after(after: Duration) -> Self {
        ReconcileResult {
            requeue: false,
            requeue_after: Some(after),
        }
    }

    /// Adapt the result for hosts driving a `kube` runtime controller.
    pub fn into_action(self) -> Action {
        match (self.requeue, self.requeue_after) {
            (_, Some(after)) => Action::requeue(after),
            (true, None) => Action::requeue(Duration::ZERO),
            (false, None) => Action::await_change(),
        }
    }
}

/// One pass of a control loop for one object. The managed reconciler and the
/// rate-limited dispatcher both expose this interface, so dispatchers can
/// wrap any inner reconciler.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, req: &Request) -> Result<ReconcileResult, Error>;
}

/// The slice of the Kubernetes API the runtime consumes, as a seam so that
/// reconciler components can be exercised without an API server. Every
/// method returns the server's view of the object so callers can keep
/// working with the latest resourceVersion.
#[async_trait]
pub trait ResourceClient<T: Managed>: Send + Sync {
    /// Read the object by namespaced name.
    async fn get(&self, req: &Request) -> Result<T, kube::Error>;
    /// Replace the object, subject to optimistic concurrency: a stale
    /// resourceVersion yields a 409 conflict.
    async fn update(&self, obj: &T) -> Result<T, kube::Error>;
    /// Replace the object's status subresource.
    async fn update_status(&self, obj: &T) -> Result<T, kube::Error>;
}

/// The production [`ResourceClient`], backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        KubeResourceClient { client }
    }

    fn api_for<T: Managed>(&self, namespace: Option<&str>) -> Api<T> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl<T: Managed> ResourceClient<T> for KubeResourceClient {
    async fn get(&self, req: &Request) -> Result<T, kube::Error> {
        self.api_for::<T>(req.namespace.as_deref())
            .get(&req.name)
            .await
    }

    async fn update(&self, obj: &T) -> Result<T, kube::Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api_for::<T>(obj.meta().namespace.as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
    }

    async fn update_status(&self, obj: &T) -> Result<T, kube::Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let data = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
        self.api_for::<T>(obj.meta().namespace.as_deref())
            .replace_status(&name, &PostParams::default(), data)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ANNOTATION_MANAGEMENT_POLICY;
    use crate::test_utils::TestResource;

    fn resource_with_policy(policy: &str) -> TestResource {
        let mut mg = TestResource::test("default", "res");
        mg.meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_MANAGEMENT_POLICY.to_string(), policy.to_string());
        mg
    }

    #[test]
    fn test_request_display() {
        assert_eq!(Request::new("team-a", "db").to_string(), "team-a/db");
        let cluster_scoped = Request {
            name: "db".to_string(),
            namespace: None,
        };
        assert_eq!(cluster_scoped.to_string(), "/db");
    }

    #[test]
    fn test_reconcile_result_into_action() {
        let requeue = ReconcileResult::requeue().into_action();
        assert_eq!(
            format!("{:?}", requeue),
            format!("{:?}", Action::requeue(Duration::ZERO))
        );

        let after = ReconcileResult::requeue_after(Duration::from_secs(30)).into_action();
        assert_eq!(
            format!("{:?}", after),
            format!("{:?}", Action::requeue(Duration::from_secs(30)))
        );

        let done = ReconcileResult::default().into_action();
        assert_eq!(format!("{:?}", done), format!("{:?}", Action::await_change()));
    }

    #[test]
    fn test_should_delete_respects_orphan_policy() {
        let mut mg = TestResource::test("default", "res");
        assert!(should_delete(&mg));

        mg.set_deletion_policy(DeletionPolicy::Orphan);
        assert!(!should_delete(&mg));
    }

    #[test]
    fn test_should_delete_respects_management_policy() {
        let mg = resource_with_policy("observe-create-update");
        assert!(!should_delete(&mg));

        let mg = resource_with_policy("observe-delete");
        assert!(should_delete(&mg));
    }

    #[test]
    fn test_should_create_and_update() {
        let mg = TestResource::test("default", "res");
        assert!(should_create(&mg));
        assert!(should_update(&mg));

        let mg = resource_with_policy("observe-delete");
        assert!(!should_create(&mg));
        assert!(!should_update(&mg));
    }

    #[test]
    fn test_should_only_observe() {
        assert!(should_only_observe(&resource_with_policy("observe")));
        assert!(!should_only_observe(&TestResource::test("default", "res")));
    }

    #[test]
    fn test_deletion_policy_default() {
        assert_eq!(DeletionPolicy::default(), DeletionPolicy::Delete);
    }
}

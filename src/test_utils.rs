//! Shared fixtures and fakes for the crate's tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, ConditionedStatus};
use crate::error::{Error, ExternalError};
use crate::event::{Event, Recorder};
use crate::meta;
use crate::reconciler::{
    CriticalAnnotationUpdater, ExternalClient, ExternalConnector, ExternalDisconnector,
    ExternalObservation, Finalizer, FINALIZER_NAME,
};
use crate::resource::{Conditioned, DeletionPolicy, Managed, Orphanable, Request, ResourceClient};

/// A Kubernetes API status error with the supplied code.
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} error", reason),
        reason: reason.to_string(),
        code,
    })
}

/// A minimal managed resource kind for exercising the runtime.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "test.krateo.io",
    version = "v1alpha1",
    kind = "TestResource",
    namespaced,
    status = "TestResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TestResourceSpec {
    #[serde(default)]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TestResourceStatus {
    #[serde(flatten)]
    pub conditioned: ConditionedStatus,
}

impl TestResource {
    /// A named test resource in the supplied namespace.
    pub fn test(namespace: &str, name: &str) -> Self {
        let mut mg = TestResource::new(name, TestResourceSpec::default());
        mg.meta_mut().namespace = Some(namespace.to_string());
        mg.meta_mut().uid = Some("test-uid".to_string());
        mg.meta_mut().resource_version = Some("1".to_string());
        mg
    }
}

impl Orphanable for TestResource {
    fn deletion_policy(&self) -> DeletionPolicy {
        self.spec.deletion_policy.unwrap_or_default()
    }
    fn set_deletion_policy(&mut self, policy: DeletionPolicy) {
        self.spec.deletion_policy = Some(policy);
    }
}

impl Conditioned for TestResource {
    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        self.status
            .get_or_insert_with(Default::default)
            .conditioned
            .set_conditions(conditions);
    }
    fn get_condition(&self, condition_type: &str) -> Option<Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditioned.get_condition(condition_type))
            .cloned()
    }
}

type GetFn<T> = Box<dyn Fn(&Request) -> Result<T, kube::Error> + Send + Sync>;
type WriteFn<T> = Box<dyn Fn(&T) -> Result<T, kube::Error> + Send + Sync>;

/// A [`ResourceClient`] whose behavior is configured with closures, in the
/// spirit of a fake API client.
pub struct MockResourceClient<T> {
    pub get_fn: GetFn<T>,
    pub update_fn: WriteFn<T>,
    pub update_status_fn: WriteFn<T>,
}

impl<T: Managed> MockResourceClient<T> {
    /// A client that serves the supplied object on get and echoes writes.
    pub fn returning(obj: T) -> Self {
        MockResourceClient {
            get_fn: Box::new(move |_| Ok(obj.clone())),
            update_fn: Box::new(|obj| Ok(obj.clone())),
            update_status_fn: Box::new(|obj| Ok(obj.clone())),
        }
    }

    pub fn with_get(
        mut self,
        f: impl Fn(&Request) -> Result<T, kube::Error> + Send + Sync + 'static,
    ) -> Self {
        self.get_fn = Box::new(f);
        self
    }

    pub fn with_update(
        mut self,
        f: impl Fn(&T) -> Result<T, kube::Error> + Send + Sync + 'static,
    ) -> Self {
        self.update_fn = Box::new(f);
        self
    }

    pub fn with_update_status(
        mut self,
        f: impl Fn(&T) -> Result<T, kube::Error> + Send + Sync + 'static,
    ) -> Self {
        self.update_status_fn = Box::new(f);
        self
    }
}

#[async_trait]
impl<T: Managed> ResourceClient<T> for MockResourceClient<T> {
    async fn get(&self, req: &Request) -> Result<T, kube::Error> {
        (self.get_fn)(req)
    }
    async fn update(&self, obj: &T) -> Result<T, kube::Error> {
        (self.update_fn)(obj)
    }
    async fn update_status(&self, obj: &T) -> Result<T, kube::Error> {
        (self.update_status_fn)(obj)
    }
}

type ObserveFn<T> = Box<dyn Fn(&mut T) -> Result<ExternalObservation, ExternalError> + Send + Sync>;
type ExternalFn<T> = Box<dyn Fn(&mut T) -> Result<(), ExternalError> + Send + Sync>;

/// An [`ExternalClient`] whose behavior is configured with closures.
pub struct MockExternalClient<T> {
    pub observe_fn: ObserveFn<T>,
    pub create_fn: ExternalFn<T>,
    pub update_fn: ExternalFn<T>,
    pub delete_fn: ExternalFn<T>,
}

impl<T: Managed> MockExternalClient<T> {
    /// A client whose Observe reports the supplied observation and whose
    /// mutations succeed silently.
    pub fn observing(observation: ExternalObservation) -> Self {
        MockExternalClient {
            observe_fn: Box::new(move |_| Ok(observation.clone())),
            create_fn: Box::new(|_| Ok(())),
            update_fn: Box::new(|_| Ok(())),
            delete_fn: Box::new(|_| Ok(())),
        }
    }

    pub fn with_create(
        mut self,
        f: impl Fn(&mut T) -> Result<(), ExternalError> + Send + Sync + 'static,
    ) -> Self {
        self.create_fn = Box::new(f);
        self
    }

    pub fn with_update(
        mut self,
        f: impl Fn(&mut T) -> Result<(), ExternalError> + Send + Sync + 'static,
    ) -> Self {
        self.update_fn = Box::new(f);
        self
    }

    pub fn with_delete(
        mut self,
        f: impl Fn(&mut T) -> Result<(), ExternalError> + Send + Sync + 'static,
    ) -> Self {
        self.delete_fn = Box::new(f);
        self
    }
}

#[async_trait]
impl<T: Managed> ExternalClient<T> for MockExternalClient<T> {
    async fn observe(&self, mg: &mut T) -> Result<ExternalObservation, ExternalError> {
        (self.observe_fn)(mg)
    }
    async fn create(&self, mg: &mut T) -> Result<(), ExternalError> {
        (self.create_fn)(mg)
    }
    async fn update(&self, mg: &mut T) -> Result<(), ExternalError> {
        (self.update_fn)(mg)
    }
    async fn delete(&self, mg: &mut T) -> Result<(), ExternalError> {
        (self.delete_fn)(mg)
    }
}

type ConnectFn<T> =
    Box<dyn Fn() -> Result<Box<dyn ExternalClient<T>>, ExternalError> + Send + Sync>;

/// A connector that counts connects and disconnects.
pub struct MockConnector<T> {
    connect_fn: ConnectFn<T>,
    pub connects: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
}

impl<T: Managed> MockConnector<T> {
    fn with_connect_fn(connect_fn: ConnectFn<T>) -> Self {
        MockConnector {
            connect_fn,
            connects: Arc::new(AtomicUsize::new(0)),
            disconnects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A connector that builds a fresh client from the factory on each
    /// connect.
    pub fn serving<C, F>(factory: F) -> Self
    where
        C: ExternalClient<T> + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self::with_connect_fn(Box::new(move || Ok(Box::new(factory()))))
    }

    /// A connector that fails with the supplied message.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::with_connect_fn(Box::new(move || Err(message.clone().into())))
    }

    /// A connector that must never be reached.
    pub fn never() -> Self {
        Self::with_connect_fn(Box::new(|| {
            panic!("connect must not be called in this scenario")
        }))
    }
}

#[async_trait]
impl<T: Managed> ExternalConnector<T> for MockConnector<T> {
    async fn connect(&self, _mg: &T) -> Result<Box<dyn ExternalClient<T>>, ExternalError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        (self.connect_fn)()
    }
}

#[async_trait]
impl<T: Managed> ExternalDisconnector for MockConnector<T> {
    async fn disconnect(&self) -> Result<(), ExternalError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type ResultFn = Box<dyn Fn() -> Result<(), Error> + Send + Sync>;

/// A [`Finalizer`] that counts calls and mutates the object's finalizer list
/// like the API-backed implementation would.
pub struct MockFinalizer {
    pub adds: Arc<AtomicUsize>,
    pub removes: Arc<AtomicUsize>,
    add_result: ResultFn,
    remove_result: ResultFn,
}

impl MockFinalizer {
    pub fn succeeding() -> Self {
        MockFinalizer {
            adds: Arc::new(AtomicUsize::new(0)),
            removes: Arc::new(AtomicUsize::new(0)),
            add_result: Box::new(|| Ok(())),
            remove_result: Box::new(|| Ok(())),
        }
    }

    pub fn with_add(mut self, f: impl Fn() -> Result<(), Error> + Send + Sync + 'static) -> Self {
        self.add_result = Box::new(f);
        self
    }

    pub fn with_remove(
        mut self,
        f: impl Fn() -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        self.remove_result = Box::new(f);
        self
    }
}

#[async_trait]
impl<T: Managed> Finalizer<T> for MockFinalizer {
    async fn add_finalizer(&self, mg: &mut T) -> Result<(), Error> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        meta::add_finalizer(mg.meta_mut(), FINALIZER_NAME);
        (self.add_result)()
    }
    async fn remove_finalizer(&self, mg: &mut T) -> Result<(), Error> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        meta::remove_finalizer(mg.meta_mut(), FINALIZER_NAME);
        (self.remove_result)()
    }
}

/// A [`CriticalAnnotationUpdater`] that counts calls.
pub struct MockAnnotationUpdater {
    pub calls: Arc<AtomicUsize>,
    result_fn: ResultFn,
}

impl MockAnnotationUpdater {
    pub fn succeeding() -> Self {
        MockAnnotationUpdater {
            calls: Arc::new(AtomicUsize::new(0)),
            result_fn: Box::new(|| Ok(())),
        }
    }

    pub fn failing(f: impl Fn() -> Error + Send + Sync + 'static) -> Self {
        MockAnnotationUpdater {
            calls: Arc::new(AtomicUsize::new(0)),
            result_fn: Box::new(move || Err(f())),
        }
    }
}

#[async_trait]
impl<T: Managed> CriticalAnnotationUpdater<T> for MockAnnotationUpdater {
    async fn update_critical_annotations(&self, _mg: &mut T) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.result_fn)()
    }
}

/// A [`Recorder`] that captures events for assertions.
#[derive(Clone, Default)]
pub struct TestRecorder {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl TestRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[async_trait]
impl<T: Managed> Recorder<T> for TestRecorder {
    async fn record(&self, _obj: &T, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

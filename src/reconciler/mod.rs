//! The managed resource reconciliation engine.
//!
//! [`ManagedReconciler`] keeps a managed resource in agreement with an
//! external resource living in a third-party system reachable only through a
//! provider-specific [`ExternalClient`]. Each pass loads the managed object,
//! interprets its annotations, connects through the provider's
//! [`ExternalConnector`], and decides whether to create, update, or delete
//! the external resource, persisting enough state in annotations along the
//! way that a crash between any two steps is recoverable.
//!
//! The engine reconciles against a no-op external system by default; callers
//! supply a connector that produces a client capable of managing resources
//! in a real system:
//!
//! ```ignore
//! let reconciler = ManagedReconciler::<Database>::new(client)
//!     .with_connector(DatabaseConnector::new(config))
//!     .with_poll_interval(Duration::from_secs(120))
//!     .with_recorder(TracingRecorder);
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::Client;
#[cfg(test)]
use kube::Resource;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::api::{ApiFinalizer, RetryingCriticalAnnotationUpdater};
use crate::conditions;
use crate::error::{external_is_conflict, is_conflict, is_not_found, Error, ExternalError};
use crate::event::{Event, NopRecorder, Recorder};
use crate::meta;
use crate::resource::{
    should_create, should_delete, should_only_observe, should_update, KubeResourceClient, Managed,
    ReconcileResult, Reconciler, Request, ResourceClient,
};

/// The finalizer placed on managed resource objects while an external
/// resource may still exist for them.
pub const FINALIZER_NAME: &str = "finalizer.managedresource.krateo.io";

/// Extra headroom on top of the reconcile timeout so that status updates can
/// still be persisted after external calls exhaust their budget.
const RECONCILE_GRACE_PERIOD: Duration = Duration::from_secs(30);
const RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

// Event reasons.
pub const REASON_CANNOT_CONNECT: &str = "CannotConnectToProvider";
pub const REASON_CANNOT_DISCONNECT: &str = "CannotDisconnectFromProvider";
pub const REASON_CANNOT_INITIALIZE: &str = "CannotInitializeManagedResource";
pub const REASON_CANNOT_OBSERVE: &str = "CannotObserveExternalResource";
pub const REASON_CANNOT_CREATE: &str = "CannotCreateExternalResource";
pub const REASON_CANNOT_UPDATE: &str = "CannotUpdateExternalResource";
pub const REASON_CANNOT_DELETE: &str = "CannotDeleteExternalResource";
pub const REASON_CANNOT_UPDATE_MANAGED: &str = "CannotUpdateManagedResource";
pub const REASON_CREATED: &str = "CreatedExternalResource";
pub const REASON_UPDATED: &str = "UpdatedExternalResource";
pub const REASON_DELETED: &str = "DeletedExternalResource";
pub const REASON_PENDING: &str = "PendingExternalResource";
pub const REASON_RECONCILIATION_PAUSED: &str = "ReconciliationPaused";

/// The recommended name for controllers that use this module to reconcile a
/// particular kind of managed resource.
pub fn controller_name(kind: &str) -> String {
    format!("managed/{}", kind.to_lowercase())
}

/// The result of an observation of an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalObservation {
    /// Whether a corresponding external resource exists for the managed
    /// resource, typically proven by the presence of an external resource
    /// whose unique identifier matches the managed resource's external name.
    pub resource_exists: bool,

    /// Whether the external resource appears to be up to date, i.e. updating
    /// it to match the desired state of the managed resource would be a
    /// no-op. Keep in mind that often only a subset of external fields can
    /// be updated.
    pub resource_up_to_date: bool,

    /// Whether the managed resource's spec was updated during observation.
    /// Observe implementations may only set previously unset spec fields and
    /// add keys to maps; such changes are persisted before any status
    /// change.
    pub resource_late_initialized: bool,

    /// A debug-level description of how the observed state diverges from the
    /// desired state.
    pub diff: String,
}

/// Produces a new [`ExternalClient`] for the supplied managed resource.
/// Connecting must be side-effect-free against the external system beyond
/// authentication.
#[async_trait]
pub trait ExternalConnector<T: Managed>: Send + Sync {
    async fn connect(&self, mg: &T) -> Result<Box<dyn ExternalClient<T>>, ExternalError>;
}

/// Disconnects from a provider. Called on every reconcile return path after a
/// successful connect; errors are logged and recorded but never propagated.
#[async_trait]
pub trait ExternalDisconnector: Send + Sync {
    async fn disconnect(&self) -> Result<(), ExternalError>;
}

/// A connector that can also disconnect.
pub trait ExternalConnectDisconnector<T: Managed>:
    ExternalConnector<T> + ExternalDisconnector
{
}

impl<T: Managed, C: ExternalConnector<T> + ExternalDisconnector> ExternalConnectDisconnector<T>
    for C
{
}

/// Manages the lifecycle of an external resource. None of the calls should
/// block longer than the reconcile timeout, and all of them must be
/// idempotent: Create must not fail when called again with the same
/// parameters, Delete must not fail when the resource is already gone.
#[async_trait]
pub trait ExternalClient<T: Managed>: Send + Sync {
    /// Observe the external resource the supplied managed resource
    /// represents, if any. Observe implementations must not modify the
    /// external resource, but may update the managed resource to reflect
    /// its state, and may fill previously unset spec fields (reporting
    /// `resource_late_initialized`).
    async fn observe(&self, mg: &mut T) -> Result<ExternalObservation, ExternalError>;

    /// Create an external resource per the specifications of the supplied
    /// managed resource. Called when Observe reports that the external
    /// resource does not exist. Create implementations may update managed
    /// resource annotations (e.g. a generated external name), and those
    /// updates will be persisted. All other updates will be discarded.
    async fn create(&self, mg: &mut T) -> Result<(), ExternalError>;

    /// Update the external resource represented by the supplied managed
    /// resource. Called unless Observe reports that it is up to date.
    async fn update(&self, mg: &mut T) -> Result<(), ExternalError>;

    /// Delete the external resource upon deletion of its managed resource.
    /// Success means the deletion was accepted, not necessarily that the
    /// resource is gone.
    async fn delete(&self, mg: &mut T) -> Result<(), ExternalError>;
}

/// Converts an [`ExternalConnector`] into an [`ExternalConnectDisconnector`]
/// with a no-op disconnect.
pub struct NopDisconnector<C>(pub C);

#[async_trait]
impl<T: Managed, C: ExternalConnector<T>> ExternalConnector<T> for NopDisconnector<C> {
    async fn connect(&self, mg: &T) -> Result<Box<dyn ExternalClient<T>>, ExternalError> {
        self.0.connect(mg).await
    }
}

#[async_trait]
impl<C: Send + Sync> ExternalDisconnector for NopDisconnector<C> {
    async fn disconnect(&self) -> Result<(), ExternalError> {
        Ok(())
    }
}

/// A connector to a no-op external system.
pub struct NopConnector;

#[async_trait]
impl<T: Managed> ExternalConnector<T> for NopConnector {
    async fn connect(&self, _mg: &T) -> Result<Box<dyn ExternalClient<T>>, ExternalError> {
        Ok(Box::new(NopClient))
    }
}

/// An [`ExternalClient`] that does nothing.
pub struct NopClient;

#[async_trait]
impl<T: Managed> ExternalClient<T> for NopClient {
    async fn observe(&self, _mg: &mut T) -> Result<ExternalObservation, ExternalError> {
        Ok(ExternalObservation::default())
    }
    async fn create(&self, _mg: &mut T) -> Result<(), ExternalError> {
        Ok(())
    }
    async fn update(&self, _mg: &mut T) -> Result<(), ExternalError> {
        Ok(())
    }
    async fn delete(&self, _mg: &mut T) -> Result<(), ExternalError> {
        Ok(())
    }
}

/// Adds and removes the runtime's finalizer on managed resources.
#[async_trait]
pub trait Finalizer<T: Managed>: Send + Sync {
    async fn add_finalizer(&self, mg: &mut T) -> Result<(), Error>;
    async fn remove_finalizer(&self, mg: &mut T) -> Result<(), Error>;
}

/// Persists annotations that must survive the reconcile even over API server
/// conflicts, e.g. a non-deterministic external name set by Create.
#[async_trait]
pub trait CriticalAnnotationUpdater<T: Managed>: Send + Sync {
    async fn update_critical_annotations(&self, mg: &mut T) -> Result<(), Error>;
}

/// Computes the delay before an up-to-date resource is reconciled again.
pub type PollIntervalHook<T> = Box<dyn Fn(&T, Duration) -> Duration + Send + Sync>;

/// Reconciles managed resources with resources in an external system such as
/// a cloud provider API. Each controller must watch the managed resource
/// kind for which it is responsible.
pub struct ManagedReconciler<T: Managed> {
    client: Arc<dyn ResourceClient<T>>,

    timeout: Duration,
    poll_interval: Duration,
    poll_interval_hook: PollIntervalHook<T>,
    creation_grace_period: Duration,

    external: Box<dyn ExternalConnectDisconnector<T>>,
    finalizer: Box<dyn Finalizer<T>>,
    annotations: Box<dyn CriticalAnnotationUpdater<T>>,
    recorder: Box<dyn Recorder<T>>,
}

impl<T: Managed> ManagedReconciler<T> {
    /// A reconciler backed by the supplied Kubernetes client. It reconciles
    /// with a no-op external system until a connector is supplied.
    pub fn new(client: Client) -> Self {
        Self::from_resource_client(Arc::new(KubeResourceClient::new(client)))
    }

    /// A reconciler backed by any [`ResourceClient`] implementation.
    pub fn from_resource_client(client: Arc<dyn ResourceClient<T>>) -> Self {
        ManagedReconciler {
            finalizer: Box::new(ApiFinalizer::new(client.clone(), FINALIZER_NAME)),
            annotations: Box::new(RetryingCriticalAnnotationUpdater::new(client.clone())),
            client,
            timeout: RECONCILE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_interval_hook: Box::new(|_, poll| poll),
            creation_grace_period: DEFAULT_GRACE_PERIOD,
            external: Box::new(NopDisconnector(NopConnector)),
            recorder: Box::new(NopRecorder),
        }
    }

    /// The cumulative budget for external calls in one pass. Even when the
    /// budget is exhausted, status updates get an extra 30s to persist an
    /// error condition.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long to wait before queueing a new reconciliation after a
    /// successful one. Nothing notifies the runtime when the external
    /// resource changes, so up-to-date resources are re-observed on this
    /// cadence.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Dynamic computation of the poll interval. If called multiple times,
    /// only the latest hook is used.
    pub fn with_poll_interval_hook(
        mut self,
        hook: impl Fn(&T, Duration) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.poll_interval_hook = Box::new(hook);
        self
    }

    /// Adds uniform noise in `[-jitter, +jitter]` to the poll interval so a
    /// fleet of resources created together does not reconcile in lockstep.
    /// Wraps [`Self::with_poll_interval_hook`] and is subject to the same
    /// last-one-wins constraint.
    pub fn with_poll_jitter(self, jitter: Duration) -> Self {
        self.with_poll_interval_hook(move |_, poll| {
            let noise = (rand::random::<f64>() - 0.5) * 2.0 * jitter.as_secs_f64();
            Duration::from_secs_f64((poll.as_secs_f64() + noise).max(0.0))
        })
    }

    /// How long to wait for an eventually consistent external API to report
    /// that a newly created resource exists before trusting a "does not
    /// exist" observation.
    pub fn with_creation_grace_period(mut self, period: Duration) -> Self {
        self.creation_grace_period = period;
        self
    }

    /// How the reconciler connects to the external system. The connector's
    /// clients are released with a no-op disconnect.
    pub fn with_connector(mut self, connector: impl ExternalConnector<T> + 'static) -> Self {
        self.external = Box::new(NopDisconnector(connector));
        self
    }

    /// How the reconciler connects to and disconnects from the external
    /// system.
    pub fn with_connect_disconnector(
        mut self,
        external: impl ExternalConnectDisconnector<T> + 'static,
    ) -> Self {
        self.external = Box::new(external);
        self
    }

    /// How the reconciler adds and removes finalizers on the managed
    /// resource.
    pub fn with_finalizer(mut self, finalizer: impl Finalizer<T> + 'static) -> Self {
        self.finalizer = Box::new(finalizer);
        self
    }

    /// How the reconciler persists critical annotations. Implementations
    /// typically retry so that state like non-deterministic external names
    /// survives API server hiccups.
    pub fn with_critical_annotation_updater(
        mut self,
        updater: impl CriticalAnnotationUpdater<T> + 'static,
    ) -> Self {
        self.annotations = Box::new(updater);
        self
    }

    /// How the reconciler records events.
    pub fn with_recorder(mut self, recorder: impl Recorder<T> + 'static) -> Self {
        self.recorder = Box::new(recorder);
        self
    }

    async fn record(&self, mg: &T, event: Event) {
        let external_name = meta::get_external_name(mg.meta());
        let event = if external_name.is_empty() {
            event
        } else {
            event.with_annotation("external-name", external_name)
        };
        self.recorder.record(mg, event).await;
    }

    /// Write the conditions accumulated on the object back to the status
    /// subresource. The status write error, not any earlier processing
    /// error, is what the host's backoff reacts to: the condition already
    /// encodes the processing error.
    async fn persist_status(
        &self,
        mg: &mut T,
        result: ReconcileResult,
    ) -> Result<ReconcileResult, Error> {
        match self.client.update_status(mg).await {
            Ok(updated) => {
                *mg = updated;
                Ok(result)
            }
            Err(err) => Err(Error::UpdateManagedStatus(err)),
        }
    }

    async fn do_reconcile(&self, req: &Request) -> Result<ReconcileResult, Error> {
        debug!(request = %req, "reconciling");

        let outer_deadline = Instant::now() + self.timeout + RECONCILE_GRACE_PERIOD;
        let external_deadline = Instant::now() + self.timeout;

        match timeout_at(outer_deadline, self.reconcile_managed(req, external_deadline)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    async fn reconcile_managed(
        &self,
        req: &Request,
        external_deadline: Instant,
    ) -> Result<ReconcileResult, Error> {
        let mut managed = match self.client.get(req).await {
            Ok(managed) => managed,
            Err(err) if is_not_found(&err) => {
                // No need to requeue if the object no longer exists.
                debug!(request = %req, error = %err, "cannot get managed resource");
                return Ok(ReconcileResult::default());
            }
            Err(err) => return Err(Error::GetManaged(err)),
        };

        debug!(
            request = %req,
            uid = managed.meta().uid.as_deref().unwrap_or_default(),
            version = managed.meta().resource_version.as_deref().unwrap_or_default(),
            external_name = %meta::get_external_name(managed.meta()),
            "loaded managed resource"
        );

        if meta::is_paused(managed.meta()) {
            debug!(request = %req, "reconciliation is paused via the pause annotation");
            self.record(
                &managed,
                Event::normal(
                    REASON_RECONCILIATION_PAUSED,
                    "Reconciliation is paused via the pause annotation",
                ),
            )
            .await;
            managed.set_conditions(vec![conditions::reconcile_paused()]);
            // When the pause annotation is removed we get a chance to
            // reconcile again and resume.
            return self.persist_status(&mut managed, ReconcileResult::default()).await;
        }

        // A deleted object whose external resource must be orphaned needs no
        // observation before the finalizer can go.
        if meta::was_deleted(managed.meta()) && !should_delete(&managed) {
            if let Err(err) = self.finalizer.remove_finalizer(&mut managed).await {
                debug!(request = %req, error = %err, "cannot remove managed resource finalizer");
                if err.is_conflict() {
                    return Ok(ReconcileResult::requeue());
                }
                managed
                    .set_conditions(vec![conditions::deleting(), conditions::reconcile_error(&err)]);
                return self.persist_status(&mut managed, ReconcileResult::requeue()).await;
            }

            // With the finalizer gone the object is about to vanish, so
            // there is no point updating its status.
            debug!(request = %req, "successfully deleted managed resource");
            return Ok(ReconcileResult::default());
        }

        // If we started but never completed creation of an external resource
        // we may have lost critical information, e.g. an external name that
        // was never persisted. Refusing to proceed is the only safe choice;
        // an operator must clear the pending annotation.
        if meta::external_create_incomplete(managed.meta()) {
            let err = Error::CreateIncomplete;
            debug!(request = %req, "{err}");
            self.record(
                &managed,
                Event::warning(REASON_CANNOT_INITIALIZE, err.to_string()),
            )
            .await;
            managed.set_conditions(vec![conditions::creating(), conditions::reconcile_error(&err)]);
            return self.persist_status(&mut managed, ReconcileResult::default()).await;
        }

        let external = match bounded(external_deadline, self.external.connect(&managed)).await {
            Ok(client) => client,
            Err(err) => {
                // Usually a missing or invalid provider configuration.
                debug!(request = %req, error = %err, "cannot connect to provider");
                if external_is_conflict(&err) {
                    return Ok(ReconcileResult::requeue());
                }
                self.record(&managed, Event::warning(REASON_CANNOT_CONNECT, err.to_string()))
                    .await;
                managed.set_conditions(vec![conditions::reconcile_error(&Error::Connect(err))]);
                return self.persist_status(&mut managed, ReconcileResult::requeue()).await;
            }
        };

        let result = self
            .reconcile_external(req, &mut managed, external.as_ref(), external_deadline)
            .await;

        if let Err(err) = self.external.disconnect().await {
            debug!(request = %req, error = %err, "cannot disconnect from provider");
            self.record(
                &managed,
                Event::warning(REASON_CANNOT_DISCONNECT, err.to_string()),
            )
            .await;
        }

        result
    }

    async fn reconcile_external(
        &self,
        req: &Request,
        managed: &mut T,
        external: &dyn ExternalClient<T>,
        deadline: Instant,
    ) -> Result<ReconcileResult, Error> {
        let observation = match bounded(deadline, external.observe(managed)).await {
            Ok(observation) => observation,
            Err(err) => {
                // Usually insufficient provider credentials for observing
                // this external resource type.
                debug!(request = %req, error = %err, "cannot observe external resource");
                if external_is_conflict(&err) {
                    return Ok(ReconcileResult::requeue());
                }
                self.record(managed, Event::warning(REASON_CANNOT_OBSERVE, err.to_string()))
                    .await;
                managed.set_conditions(vec![conditions::reconcile_error(&Error::Observe(err))]);
                return self.persist_status(managed, ReconcileResult::requeue()).await;
            }
        };

        // In observe-only mode a missing external resource is an error the
        // user must know about, not something to create.
        if !observation.resource_exists && should_only_observe(managed) {
            let err = Error::Observe(Box::new(Error::ExternalResourceNotExist));
            self.record(
                managed,
                Event::warning(REASON_CANNOT_OBSERVE, Error::ExternalResourceNotExist.to_string()),
            )
            .await;
            managed.set_conditions(vec![conditions::reconcile_error(&err)]);
            return self.persist_status(managed, ReconcileResult::requeue()).await;
        }

        // Some external APIs are eventually consistent and may report that a
        // recently created resource does not exist. Within the grace window
        // the observation is not trusted.
        if !observation.resource_exists
            && meta::external_create_succeeded_during(managed.meta(), self.creation_grace_period)
        {
            debug!(request = %req, "waiting for external resource existence to be confirmed");
            self.record(
                managed,
                Event::normal(
                    REASON_PENDING,
                    "Waiting for external resource existence to be confirmed",
                ),
            )
            .await;
            return Ok(ReconcileResult::requeue());
        }

        if meta::was_deleted(managed.meta()) {
            // Only reachable when the deletion policy is not orphan, so
            // external deletion is safe if the resource exists.
            if observation.resource_exists && should_delete(managed) {
                if let Err(err) = bounded(deadline, external.delete(managed)).await {
                    debug!(request = %req, error = %err, "cannot delete external resource");
                    self.record(managed, Event::warning(REASON_CANNOT_DELETE, err.to_string()))
                        .await;
                    managed.set_conditions(vec![
                        conditions::deleting(),
                        conditions::reconcile_error(&Error::Delete(err)),
                    ]);
                    return self.persist_status(managed, ReconcileResult::requeue()).await;
                }

                // Deletion was accepted, not necessarily finished. Requeue
                // to re-observe until the external resource is gone; only
                // then is the finalizer removed.
                debug!(request = %req, "successfully requested deletion of external resource");
                self.record(
                    managed,
                    Event::normal(
                        REASON_DELETED,
                        "Successfully requested deletion of external resource",
                    ),
                )
                .await;
                managed.set_conditions(vec![conditions::deleting(), conditions::reconcile_success()]);
                return self.persist_status(managed, ReconcileResult::requeue()).await;
            }

            if let Err(err) = self.finalizer.remove_finalizer(managed).await {
                debug!(request = %req, error = %err, "cannot remove managed resource finalizer");
                if err.is_conflict() {
                    return Ok(ReconcileResult::requeue());
                }
                managed
                    .set_conditions(vec![conditions::deleting(), conditions::reconcile_error(&err)]);
                return self.persist_status(managed, ReconcileResult::requeue()).await;
            }

            // The object is about to vanish; no status update.
            debug!(request = %req, "successfully deleted managed resource");
            return Ok(ReconcileResult::default());
        }

        if let Err(err) = self.finalizer.add_finalizer(managed).await {
            debug!(request = %req, error = %err, "cannot add finalizer");
            if err.is_conflict() {
                return Ok(ReconcileResult::requeue());
            }
            managed.set_conditions(vec![conditions::reconcile_error(&err)]);
            return self.persist_status(managed, ReconcileResult::requeue()).await;
        }

        if !observation.resource_exists && should_create(managed) {
            return self.create_external(req, managed, external, deadline).await;
        }

        if observation.resource_late_initialized {
            // This update may reset pending status changes from the
            // observation above; they are recovered by the requeued
            // reconcile re-observing the external resource.
            match self.client.update(managed).await {
                Ok(updated) => *managed = updated,
                Err(err) => {
                    let err = Error::UpdateManaged(err);
                    debug!(request = %req, error = %err, "cannot update managed resource");
                    self.record(
                        managed,
                        Event::warning(REASON_CANNOT_UPDATE_MANAGED, err.to_string()),
                    )
                    .await;
                    managed.set_conditions(vec![conditions::reconcile_error(&err)]);
                    return self.persist_status(managed, ReconcileResult::requeue()).await;
                }
            }
        }

        if observation.resource_up_to_date {
            // Nothing to create, update, or delete. Nothing will notify us
            // if the external resource changes behind our back, so requeue a
            // speculative reconcile after the poll interval.
            let after = (self.poll_interval_hook)(managed, self.poll_interval);
            debug!(request = %req, requeue_after = ?after, "external resource is up to date");
            managed.set_conditions(vec![conditions::reconcile_success()]);
            return self
                .persist_status(managed, ReconcileResult::requeue_after(after))
                .await;
        }

        if !observation.diff.is_empty() {
            debug!(request = %req, diff = %observation.diff, "external resource differs from desired state");
        }

        if !should_update(managed) {
            let after = (self.poll_interval_hook)(managed, self.poll_interval);
            debug!(request = %req, requeue_after = ?after, "skipping update due to management policy");
            managed.set_conditions(vec![conditions::reconcile_success()]);
            return self
                .persist_status(managed, ReconcileResult::requeue_after(after))
                .await;
        }

        if let Err(err) = bounded(deadline, external.update(managed)).await {
            // Usually insufficient provider credentials for updating the
            // external resource.
            debug!(request = %req, error = %err, "cannot update external resource");
            self.record(managed, Event::warning(REASON_CANNOT_UPDATE, err.to_string()))
                .await;
            managed.set_conditions(vec![conditions::reconcile_error(&Error::Update(err))]);
            return self.persist_status(managed, ReconcileResult::requeue()).await;
        }

        let after = (self.poll_interval_hook)(managed, self.poll_interval);
        debug!(request = %req, requeue_after = ?after, "successfully requested update of external resource");
        self.record(
            managed,
            Event::normal(REASON_UPDATED, "Successfully requested update of external resource"),
        )
        .await;
        managed.set_conditions(vec![conditions::reconcile_success()]);
        self.persist_status(managed, ReconcileResult::requeue_after(after))
            .await
    }

    async fn create_external(
        &self,
        req: &Request,
        managed: &mut T,
        external: &dyn ExternalClient<T>,
        deadline: Instant,
    ) -> Result<ReconcileResult, Error> {
        // The pending annotation is written first for two reasons: it lets a
        // later pass detect that critical information (like an external name
        // set by Create) was never persisted, and the bare Update guarantees
        // we hold the latest version of the resource. The critical
        // annotation updater is deliberately not used here: this write must
        // fail on a stale resourceVersion, before the external call.
        meta::set_external_create_pending(managed.meta_mut(), Utc::now());
        match self.client.update(managed).await {
            Ok(updated) => *managed = updated,
            Err(err) if is_conflict(&err) => return Ok(ReconcileResult::requeue()),
            Err(err) => {
                let err = Error::UpdateManaged(err);
                debug!(request = %req, error = %err, "cannot update managed resource");
                self.record(
                    managed,
                    Event::warning(REASON_CANNOT_UPDATE_MANAGED, err.to_string()),
                )
                .await;
                managed.set_conditions(vec![conditions::creating(), conditions::reconcile_error(&err)]);
                return self.persist_status(managed, ReconcileResult::requeue()).await;
            }
        }

        if let Err(err) = bounded(deadline, external.create(managed)).await {
            // Usually insufficient provider credentials for creating the
            // external resource.
            debug!(request = %req, error = %err, "cannot create external resource");
            if external_is_conflict(&err) {
                return Ok(ReconcileResult::requeue());
            }
            self.record(managed, Event::warning(REASON_CANNOT_CREATE, err.to_string()))
                .await;

            // The failed annotation must make it to the API server; without
            // it the next pass cannot know whether an external resource was
            // created and will refuse to proceed.
            meta::set_external_create_failed(managed.meta_mut(), Utc::now());
            if let Err(annotation_err) = self.annotations.update_critical_annotations(managed).await
            {
                debug!(request = %req, error = %annotation_err, "cannot update managed resource annotations");
                // Log and record only; the status condition is more useful
                // carrying the reason the create failed.
                self.record(
                    managed,
                    Event::warning(REASON_CANNOT_UPDATE_MANAGED, annotation_err.to_string()),
                )
                .await;
            }

            managed.set_conditions(vec![
                conditions::creating(),
                conditions::reconcile_error(&Error::Create(err)),
            ]);
            return self.persist_status(managed, ReconcileResult::requeue()).await;
        }

        // The external name may have been set by Create above. The succeeded
        // annotation must be persisted alongside it; any other changes made
        // during Create are reverted when annotations are re-applied.
        meta::set_external_create_succeeded(managed.meta_mut(), Utc::now());
        if let Err(err) = self.annotations.update_critical_annotations(managed).await {
            debug!(request = %req, error = %err, "cannot update managed resource annotations");
            self.record(
                managed,
                Event::warning(REASON_CANNOT_UPDATE_MANAGED, err.to_string()),
            )
            .await;
            managed.set_conditions(vec![conditions::creating(), conditions::reconcile_error(&err)]);
            return self.persist_status(managed, ReconcileResult::requeue()).await;
        }

        // Creation usually takes a while to finish; requeue to observe the
        // external resource until it is ready for use.
        debug!(request = %req, "successfully requested creation of external resource");
        self.record(
            managed,
            Event::normal(REASON_CREATED, "Successfully requested creation of external resource"),
        )
        .await;
        managed.set_conditions(vec![conditions::creating(), conditions::reconcile_success()]);
        self.persist_status(managed, ReconcileResult::requeue()).await
    }
}

#[async_trait]
impl<T: Managed> Reconciler for ManagedReconciler<T> {
    async fn reconcile(&self, req: &Request) -> Result<ReconcileResult, Error> {
        self.do_reconcile(req).await
    }
}

/// Run the future against the external-call deadline, surfacing an elapsed
/// deadline as an external error.
async fn bounded<O, F>(deadline: Instant, fut: F) -> Result<O, ExternalError>
where
    F: std::future::Future<Output = Result<O, ExternalError>>,
{
    match timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(elapsed) => Err(Box::new(elapsed)),
    }
}

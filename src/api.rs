//! API-server-backed implementations of the reconciler's collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use kube::Resource;
use tokio::time::sleep;

use crate::error::{is_api_error, is_not_found, Error};
use crate::meta;
use crate::reconciler::{CriticalAnnotationUpdater, Finalizer};
use crate::resource::{Managed, Request, ResourceClient};

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

fn request_for<T: Managed>(obj: &T) -> Request {
    Request {
        name: obj.meta().name.clone().unwrap_or_default(),
        namespace: obj.meta().namespace.clone(),
    }
}

/// Adds and removes a single well-known finalizer to and from a managed
/// resource via the API server.
pub struct ApiFinalizer<T: Managed> {
    client: Arc<dyn ResourceClient<T>>,
    finalizer: String,
}

impl<T: Managed> ApiFinalizer<T> {
    pub fn new(client: Arc<dyn ResourceClient<T>>, finalizer: &str) -> Self {
        ApiFinalizer {
            client,
            finalizer: finalizer.to_string(),
        }
    }
}

#[async_trait]
impl<T: Managed> Finalizer<T> for ApiFinalizer<T> {
    async fn add_finalizer(&self, mg: &mut T) -> Result<(), Error> {
        if meta::finalizer_exists(mg.meta(), &self.finalizer) {
            return Ok(());
        }
        meta::add_finalizer(mg.meta_mut(), &self.finalizer);
        match self.client.update(mg).await {
            Ok(updated) => {
                *mg = updated;
                Ok(())
            }
            Err(err) => Err(Error::UpdateObject(err)),
        }
    }

    async fn remove_finalizer(&self, mg: &mut T) -> Result<(), Error> {
        if !meta::finalizer_exists(mg.meta(), &self.finalizer) {
            return Ok(());
        }
        meta::remove_finalizer(mg.meta_mut(), &self.finalizer);
        match self.client.update(mg).await {
            Ok(updated) => {
                *mg = updated;
                Ok(())
            }
            // The object may have been removed between observation and
            // finalizer removal.
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(Error::UpdateObject(err)),
        }
    }
}

/// A [`Finalizer`] that does nothing.
pub struct NopFinalizer;

#[async_trait]
impl<T: Managed> Finalizer<T> for NopFinalizer {
    async fn add_finalizer(&self, _mg: &mut T) -> Result<(), Error> {
        Ok(())
    }
    async fn remove_finalizer(&self, _mg: &mut T) -> Result<(), Error> {
        Ok(())
    }
}

/// A [`CriticalAnnotationUpdater`] that retries annotation updates in the
/// face of API server errors.
///
/// The annotations captured from the supplied object are the only truth being
/// asserted: each attempt re-reads the latest version of the object and
/// re-applies them, deliberately discarding concurrent spec or status
/// changes.
pub struct RetryingCriticalAnnotationUpdater<T: Managed> {
    client: Arc<dyn ResourceClient<T>>,
}

impl<T: Managed> RetryingCriticalAnnotationUpdater<T> {
    pub fn new(client: Arc<dyn ResourceClient<T>>) -> Self {
        RetryingCriticalAnnotationUpdater { client }
    }
}

#[async_trait]
impl<T: Managed> CriticalAnnotationUpdater<T> for RetryingCriticalAnnotationUpdater<T> {
    async fn update_critical_annotations(&self, mg: &mut T) -> Result<(), Error> {
        let annotations = mg.meta().annotations.clone().unwrap_or_default();
        let req = request_for(mg);

        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<T, kube::Error> = async {
                let mut latest = self.client.get(&req).await?;
                meta::add_annotations(latest.meta_mut(), &annotations);
                self.client.update(&latest).await
            }
            .await;

            match result {
                Ok(updated) => {
                    *mg = updated;
                    return Ok(());
                }
                Err(err) if is_api_error(&err) && attempt < RETRY_ATTEMPTS => {
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(Error::UpdateCriticalAnnotations(err)),
            }
        }
    }
}

//! Error types for the provider runtime.

use std::fmt;

/// An error produced by a provider's external client. Providers surface
/// whatever error type their SDK produces; the runtime only needs `Display`
/// and the ability to probe for wrapped Kubernetes API errors.
pub type ExternalError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling a managed resource
#[derive(Debug)]
pub enum Error {
    /// The managed resource could not be read from the API server
    GetManaged(kube::Error),
    /// The managed resource could not be updated
    UpdateManaged(kube::Error),
    /// The managed resource status could not be updated
    UpdateManagedStatus(kube::Error),
    /// The managed resource annotations could not be persisted
    UpdateCriticalAnnotations(kube::Error),
    /// A finalizer update on the managed resource failed
    UpdateObject(kube::Error),
    /// The external client could not be produced
    Connect(ExternalError),
    /// The external resource could not be observed
    Observe(ExternalError),
    /// The external resource could not be created
    Create(ExternalError),
    /// The external resource could not be updated
    Update(ExternalError),
    /// The external resource could not be deleted
    Delete(ExternalError),
    /// A previous create attempt never recorded its outcome
    CreateIncomplete,
    /// The external resource does not exist
    ExternalResourceNotExist,
    /// The reconcile pass overran its deadline
    DeadlineExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::GetManaged(err) => write!(f, "cannot get managed resource: {}", err),
            Error::UpdateManaged(err) => write!(f, "cannot update managed resource: {}", err),
            Error::UpdateManagedStatus(err) => {
                write!(f, "cannot update managed resource status: {}", err)
            }
            Error::UpdateCriticalAnnotations(err) => {
                write!(f, "cannot update managed resource annotations: {}", err)
            }
            Error::UpdateObject(err) => write!(f, "cannot update object: {}", err),
            Error::Connect(err) => write!(f, "connect failed: {}", err),
            Error::Observe(err) => write!(f, "observe failed: {}", err),
            Error::Create(err) => write!(f, "create failed: {}", err),
            Error::Update(err) => write!(f, "update failed: {}", err),
            Error::Delete(err) => write!(f, "delete failed: {}", err),
            Error::CreateIncomplete => write!(
                f,
                "cannot determine creation result - remove the {} annotation if it is safe to proceed",
                crate::meta::ANNOTATION_EXTERNAL_CREATE_PENDING
            ),
            Error::ExternalResourceNotExist => write!(f, "external resource does not exist"),
            Error::DeadlineExceeded => write!(f, "reconcile deadline exceeded"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::GetManaged(err)
            | Error::UpdateManaged(err)
            | Error::UpdateManagedStatus(err)
            | Error::UpdateCriticalAnnotations(err)
            | Error::UpdateObject(err) => Some(err),
            Error::Connect(err)
            | Error::Observe(err)
            | Error::Create(err)
            | Error::Update(err)
            | Error::Delete(err) => Some(err.as_ref()),
            Error::CreateIncomplete | Error::ExternalResourceNotExist | Error::DeadlineExceeded => {
                None
            }
        }
    }
}

impl Error {
    /// Whether the underlying cause is a stale-resourceVersion write
    /// conflict. Conflicts are retried with a plain requeue instead of a
    /// status write.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::GetManaged(err)
            | Error::UpdateManaged(err)
            | Error::UpdateManagedStatus(err)
            | Error::UpdateCriticalAnnotations(err)
            | Error::UpdateObject(err) => is_conflict(err),
            Error::Connect(err)
            | Error::Observe(err)
            | Error::Create(err)
            | Error::Update(err)
            | Error::Delete(err) => external_is_conflict(err),
            _ => false,
        }
    }
}

/// Whether the supplied Kubernetes API error is a 409 write conflict.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Whether the supplied Kubernetes API error is a 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether the error is a status response from the API server, as opposed to
/// a transport or serialization failure.
pub fn is_api_error(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(_))
}

/// Whether a provider-returned error wraps a Kubernetes write conflict.
pub fn external_is_conflict(err: &ExternalError) -> bool {
    err.downcast_ref::<kube::Error>().is_some_and(is_conflict)
}

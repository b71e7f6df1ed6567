//! Small helpers for optional values and for the runtime's environment.

use std::env;

const ENV_KUBERNETES_SERVICE_PORT: &str = "KUBERNETES_SERVICE_PORT";

/// Wrap the supplied value in `Some`, mirroring how optional Kubernetes API
/// fields are populated.
pub fn to<T>(value: T) -> Option<T> {
    Some(value)
}

/// The value inside `opt`, or `default` when it is `None`.
pub fn deref<T: Clone>(opt: &Option<T>, default: T) -> T {
    opt.clone().unwrap_or(default)
}

/// The string inside `opt`, or the empty string when it is `None`.
pub fn deref_str(opt: &Option<String>) -> String {
    deref(opt, String::new())
}

/// Whether both values are `None` or both wrap the same value.
pub fn equal<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    a == b
}

/// Some cluster environments export a malformed `KUBERNETES_SERVICE_PORT` of
/// the form `tcp/<ip>:<port>`. Rewrite it to just `<port>` so client
/// bootstrapping works.
pub fn fix_kubernetes_service_port() {
    let Ok(ksp) = env::var(ENV_KUBERNETES_SERVICE_PORT) else {
        return;
    };
    if !ksp.starts_with("tcp") {
        return;
    }
    if let Some(idx) = ksp.rfind(':') {
        env::set_var(ENV_KUBERNETES_SERVICE_PORT, &ksp[idx + 1..]);
    }
}

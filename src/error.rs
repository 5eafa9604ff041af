use thiserror::Error;

use crate::store::InvocationId;

/// Error type returned by service factories
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while binding an injected parameter.
///
/// All of them are fatal to the binding attempt: the host is expected to fail
/// the invocation before the handler runs.
#[derive(Error, Debug)]
pub enum BindingError {
    #[error("Configuration error: no service registered for `{service}`")]
    Unregistered { service: &'static str },
    #[error("Scope creation failed: {0}")]
    ScopeCreation(#[source] BoxError),
    #[error("Construction of `{service}` failed: {source}")]
    Construction {
        service: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("Cyclic dependencies: `{service}` is already being resolved")]
    CyclicDependency { service: &'static str },
    #[error("Configuration error: scoped service `{service}` requested outside of a scope")]
    ScopedFromRoot { service: &'static str },
    #[error("Consistency error: stored instance is not a `{service}`")]
    TypeMismatch { service: &'static str },
    #[error("Scope {scope_id} is disposed")]
    ScopeDisposed { scope_id: u64 },
    #[error(transparent)]
    Lifecycle(#[from] LifecycleViolation),
}

/// Broken ordering between bindings and lifecycle hooks.
///
/// These indicate a host integration bug and are never silently ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleViolation {
    #[error("Lifecycle violation: invocation {0} requested a binding after its scope was released")]
    ResolvedAfterRelease(InvocationId),
    #[error("Lifecycle violation: cleanup for invocation {0} fired more than once")]
    AlreadyReleased(InvocationId),
    #[error("Lifecycle violation: scope {0} disposed more than once")]
    AlreadyDisposed(u64),
}

/// Failures while releasing services
#[derive(Error, Debug)]
pub enum DisposeError {
    #[error("Disposing `{service}` failed: {source}")]
    Service {
        service: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("Scope {scope_id}: {failures} service(s) failed to dispose, first: {first}")]
    ScopeDispose {
        scope_id: u64,
        failures: usize,
        first: Box<DisposeError>,
    },
}

/// Errors reported by the success and exception hooks.
///
/// The scope entry is always gone from the store when one of these is returned.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleViolation),
    #[error(transparent)]
    Dispose(#[from] DisposeError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable `{name}` is not set")]
    MissingVariable { name: String },
    #[error("Environment variable `{name}` is not valid unicode")]
    NotUnicode { name: String },
    #[error("Environment variable `{name}` is empty")]
    EmptyVariable { name: String },
}

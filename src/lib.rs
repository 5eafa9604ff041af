//! Request-scoped dependency injection for host-driven function invocations.
//!
//! A host runtime dispatches invocations and asks for the values of their
//! parameters one binding at a time. This crate lets such parameters receive
//! services resolved from a per-invocation scope, without the host knowing
//! anything about dependency injection.
//!
//! # Simple use case
//!
//! ```
//! # use std::sync::Arc;
//! # use scopebind::*;
//! struct UnitOfWork {
//!     connection: Arc<ConnectionString>,
//! }
//!
//! # fn main() -> Result<(), BindingError> {
//! let extension = InjectExtension::new(
//!     &ExtensionConfig::default(),
//!     ConnectionString::new("Server=localhost"),
//!     |services| {
//!         services.add_scoped(|r| Ok(UnitOfWork { connection: r.resolve()? }));
//!     },
//! );
//!
//! // two parameters of the same invocation share the scoped instance
//! let id = InvocationId::new();
//! let first: Arc<UnitOfWork> = extension.resolver().resolve_typed(id)?;
//! let second: Arc<UnitOfWork> = extension.resolver().resolve_typed(id)?;
//! assert!(Arc::ptr_eq(&first, &second));
//! assert_eq!(first.connection.as_str(), "Server=localhost");
//!
//! // the invocation ends: its scope is removed and disposed
//! extension.cleanup().on_success(id).unwrap();
//! assert!(extension.store().is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! # Mechanism
//!
//! * The [ServiceCollection] lists service factories with their [Lifetime]. It is
//!   frozen at startup into the [RootResolver], shared by all invocations.
//! * The [ScopeStore] maps each [InvocationId] to its [ResourceScope]. It is the only
//!   state shared across invocations and is only reached through atomic operations.
//! * The [BindingResolver] serves binding requests: the first one of an invocation
//!   creates its scope through the [ScopeFactory], later ones reuse it.
//! * The [ScopeCleanup] hooks remove the scope of a finished invocation and dispose it,
//!   whether the handler succeeded or failed. [InvocationGuard] does the same on drop.
//! * The [InjectExtension] builds all of the above and registers it with a [HostPipeline].

mod binding;
mod config;
mod error;
mod extension;
mod inject;
mod lifecycle;
mod resolve;
mod scope;
mod store;

pub use binding::{BindingDescriptor, BindingResolver, ResolvedValue};
pub use config::{ConnectionString, ExtensionConfig, DEFAULT_CONNECTION_STRING_VAR};
pub use error::{
    BindingError, BoxError, CleanupError, ConfigError, DisposeError, LifecycleViolation,
};
pub use extension::{
    BindingRule, HostPipeline, InjectExtension, Invocation, InvocationFilter, INJECT_MARKER,
};
pub use inject::Resolver;
pub use lifecycle::{InvocationGuard, Outcome, ScopeCleanup};
pub use resolve::{Dispose, Lifetime, RootResolver, ServiceCollection};
pub use scope::{ResourceScope, ScopeFactory};
pub use store::{InvocationId, Removal, ScopeStore, DEFAULT_TOMBSTONE_CAPACITY};

#[cfg(test)]
mod tests;

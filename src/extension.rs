//! Wiring into the host runtime
//!
//! The host is an external collaborator. It is seen through three traits:
//! a [HostPipeline] accepting binding rules and invocation filters, the
//! [BindingRule] it calls for parameters carrying the injection marker, and the
//! [InvocationFilter] it calls around each handler.

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::binding::{BindingDescriptor, BindingResolver, ResolvedValue};
use crate::config::{ConnectionString, ExtensionConfig};
use crate::error::{BindingError, CleanupError, ConfigError};
use crate::lifecycle::{Outcome, ScopeCleanup};
use crate::resolve::{RootResolver, ServiceCollection};
use crate::scope::ScopeFactory;
use crate::store::{InvocationId, ScopeStore};

/// Marker selecting the parameters routed through the injection binding
pub const INJECT_MARKER: &str = "inject";

/// Produces values for the parameters carrying a marker
pub trait BindingRule: Send + Sync {
    fn marker(&self) -> &'static str;

    fn bind(
        &self,
        invocation_id: InvocationId,
        descriptor: &BindingDescriptor,
    ) -> Result<ResolvedValue, BindingError>;
}

/// Callbacks fired by the host around each handler
pub trait InvocationFilter: Send + Sync {
    fn on_executing(&self, invocation_id: InvocationId);

    fn on_executed(&self, invocation_id: InvocationId) -> Result<(), CleanupError>;

    fn on_exception(&self, invocation_id: InvocationId) -> Result<(), CleanupError>;
}

/// Registration surface of the host runtime
pub trait HostPipeline {
    fn add_binding_rule(&mut self, rule: Arc<dyn BindingRule>);

    fn add_invocation_filter(&mut self, filter: Arc<dyn InvocationFilter>);
}

impl BindingRule for BindingResolver {
    fn marker(&self) -> &'static str {
        INJECT_MARKER
    }

    fn bind(
        &self,
        invocation_id: InvocationId,
        descriptor: &BindingDescriptor,
    ) -> Result<ResolvedValue, BindingError> {
        self.resolve(invocation_id, descriptor)
    }
}

impl InvocationFilter for ScopeCleanup {
    fn on_executing(&self, invocation_id: InvocationId) {
        self.on_start(invocation_id)
    }

    fn on_executed(&self, invocation_id: InvocationId) -> Result<(), CleanupError> {
        self.on_success(invocation_id)
    }

    fn on_exception(&self, invocation_id: InvocationId) -> Result<(), CleanupError> {
        ScopeCleanup::on_exception(self, invocation_id)
    }
}

/// Scoped dependency injection for function invocations
pub struct InjectExtension {
    resolver: Arc<BindingResolver>,
    cleanup: ScopeCleanup,
}

impl InjectExtension {
    /// Build the extension from the environment.
    ///
    /// The connection string is read once and registered as a [ConnectionString]
    /// singleton before `register` adds the application services.
    pub fn from_env(
        config: ExtensionConfig,
        register: impl FnOnce(&mut ServiceCollection),
    ) -> Result<Self, ConfigError> {
        let connection_string = config.connection_string()?;
        Ok(Self::new(&config, connection_string, register))
    }

    pub fn new(
        config: &ExtensionConfig,
        connection_string: ConnectionString,
        register: impl FnOnce(&mut ServiceCollection),
    ) -> Self {
        let mut services = ServiceCollection::new();
        services.add_instance(connection_string);
        register(&mut services);
        Self::with_services(config, services)
    }

    pub fn with_services(config: &ExtensionConfig, services: ServiceCollection) -> Self {
        let root = Arc::new(services.build());
        debug!(?root, "root resolver built");
        let store = Arc::new(ScopeStore::with_tombstone_capacity(config.tombstone_capacity));
        let factory = ScopeFactory::new(root);
        Self {
            resolver: Arc::new(BindingResolver::new(Arc::clone(&store), factory)),
            cleanup: ScopeCleanup::new(store),
        }
    }

    /// Register the binding rule and the cleanup filter with the host
    pub fn register(&self, pipeline: &mut impl HostPipeline) {
        pipeline.add_binding_rule(self.resolver.clone());
        pipeline.add_invocation_filter(Arc::new(self.cleanup.clone()));
    }

    /// Run a handler with guaranteed release of the invocation scope.
    ///
    /// A cleanup failure after a failed handler is logged and the handler error wins.
    pub fn invoke<T, E, F>(&self, invocation_id: InvocationId, handler: F) -> Result<T, E>
    where
        F: FnOnce(&Invocation<'_>) -> Result<T, E>,
        E: From<CleanupError>,
    {
        let guard = self.cleanup.guard(invocation_id);
        let invocation = Invocation {
            invocation_id,
            resolver: &self.resolver,
        };
        match handler(&invocation) {
            Ok(value) => {
                guard.complete(Outcome::Succeeded)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(cleanup) = guard.complete(Outcome::Failed) {
                    warn!(invocation_id = %invocation_id, "{cleanup}");
                }
                Err(err)
            }
        }
    }

    pub fn resolver(&self) -> &Arc<BindingResolver> {
        &self.resolver
    }

    pub fn cleanup(&self) -> &ScopeCleanup {
        &self.cleanup
    }

    pub fn store(&self) -> &Arc<ScopeStore> {
        self.resolver.store()
    }

    pub fn root(&self) -> &Arc<RootResolver> {
        self.resolver.factory().root()
    }
}

/// Handle given to a handler run by [InjectExtension::invoke]
pub struct Invocation<'a> {
    invocation_id: InvocationId,
    resolver: &'a BindingResolver,
}

impl Invocation<'_> {
    pub fn id(&self) -> InvocationId {
        self.invocation_id
    }

    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, BindingError> {
        self.resolver.resolve_typed(self.invocation_id)
    }

    pub fn bind(&self, descriptor: &BindingDescriptor) -> Result<ResolvedValue, BindingError> {
        self.resolver.resolve(self.invocation_id, descriptor)
    }
}

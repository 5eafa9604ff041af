//! Service registrations and the process-wide root resolver
//!
//! A [ServiceCollection] maps each service type to a factory and a [Lifetime].
//! It is built once at startup into an immutable [RootResolver], from which every
//! invocation scope is derived.
//!
//! * Factories receive a [Resolver] and may resolve their own dependencies through it.
//! * Services implementing [Dispose] can be registered with the `*_disposable` variants:
//!   the scope that created them releases them when it is disposed.
//! * Registering a type twice replaces the previous registration.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::error::{BindingError, BoxError};
use crate::inject::Resolver;

/// Type-erased service instance
pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

type Factory = Box<dyn Fn(&mut Resolver<'_>) -> Result<Instance, BoxError> + Send + Sync>;

/// Release function of a disposable service, applied to the erased instance
pub(crate) type Disposer = fn(&(dyn Any + Send + Sync)) -> Result<(), BoxError>;

/// Release resources held by a service (connections, open transactions...)
pub trait Dispose: Send + Sync {
    fn dispose(&self) -> Result<(), BoxError>;
}

/// How often a registered factory is called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance per root resolver
    Singleton,
    /// One instance per invocation scope
    Scoped,
    /// A new instance on every resolution
    Transient,
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Singleton => write!(f, "singleton"),
            Self::Scoped => write!(f, "scoped"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

pub(crate) struct ServiceDescriptor {
    pub(crate) service: &'static str,
    pub(crate) lifetime: Lifetime,
    pub(crate) disposer: Option<Disposer>,
    factory: Factory,
    singleton: OnceCell<Instance>,
}

impl ServiceDescriptor {
    pub(crate) fn construct(&self, resolver: &mut Resolver<'_>) -> Result<Instance, BindingError> {
        debug!(service = self.service, lifetime = %self.lifetime, "constructing service");
        (self.factory)(resolver).map_err(|source| BindingError::Construction {
            service: self.service,
            source,
        })
    }

    /// Shared singleton instance, built on first use
    pub(crate) fn singleton(
        &self,
        init: impl FnOnce() -> Result<Instance, BindingError>,
    ) -> Result<Instance, BindingError> {
        self.singleton.get_or_try_init(init).cloned()
    }
}

fn dispose_erased<T: Dispose + Any>(instance: &(dyn Any + Send + Sync)) -> Result<(), BoxError> {
    match instance.downcast_ref::<T>() {
        Some(service) => service.dispose(),
        None => Ok(()),
    }
}

/// Registration list used to build a [RootResolver]
#[derive(Default)]
pub struct ServiceCollection {
    descriptors: HashMap<TypeId, ServiceDescriptor>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared, already constructed value
    pub fn add_instance<T: Any + Send + Sync>(&mut self, value: T) -> &mut Self {
        let instance: Instance = Arc::new(value);
        let factory: Factory = Box::new(move |_| Ok(Arc::clone(&instance)));
        self.insert::<T>(Lifetime::Singleton, factory, None)
    }

    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut Resolver<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.insert::<T>(Lifetime::Singleton, erase(factory), None)
    }

    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut Resolver<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.insert::<T>(Lifetime::Scoped, erase(factory), None)
    }

    /// Register a scoped service released when its scope is disposed
    pub fn add_scoped_disposable<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Dispose + Any,
        F: Fn(&mut Resolver<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.insert::<T>(Lifetime::Scoped, erase(factory), Some(dispose_erased::<T>))
    }

    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut Resolver<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.insert::<T>(Lifetime::Transient, erase(factory), None)
    }

    /// Register a transient service.
    ///
    /// Every instance built inside a scope is tracked and released with that scope.
    pub fn add_transient_disposable<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Dispose + Any,
        F: Fn(&mut Resolver<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.insert::<T>(Lifetime::Transient, erase(factory), Some(dispose_erased::<T>))
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.descriptors.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Freeze the registrations
    pub fn build(self) -> RootResolver {
        RootResolver {
            descriptors: self.descriptors,
        }
    }

    fn insert<T: Any>(
        &mut self,
        lifetime: Lifetime,
        factory: Factory,
        disposer: Option<Disposer>,
    ) -> &mut Self {
        let descriptor = ServiceDescriptor {
            service: type_name::<T>(),
            lifetime,
            disposer,
            factory,
            singleton: OnceCell::new(),
        };
        if let Some(previous) = self.descriptors.insert(TypeId::of::<T>(), descriptor) {
            debug!(service = previous.service, "replacing service registration");
        }
        self
    }
}

fn erase<T, F>(factory: F) -> Factory
where
    T: Any + Send + Sync,
    F: Fn(&mut Resolver<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
{
    Box::new(move |resolver| {
        let instance: Instance = Arc::new(factory(resolver)?);
        Ok(instance)
    })
}

/// Immutable set of registrations shared by all scopes.
///
/// Singletons are created lazily and live as long as the root resolver.
/// Resolving directly from the root only reaches singleton and transient services.
pub struct RootResolver {
    descriptors: HashMap<TypeId, ServiceDescriptor>,
}

impl RootResolver {
    /// Resolve a service outside of any invocation scope
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, BindingError> {
        Resolver::root(self).resolve()
    }

    pub fn is_registered<T: Any>(&self) -> bool {
        self.contains(TypeId::of::<T>())
    }

    pub fn lifetime_of<T: Any>(&self) -> Option<Lifetime> {
        self.descriptors
            .get(&TypeId::of::<T>())
            .map(|descriptor| descriptor.lifetime)
    }

    pub(crate) fn contains(&self, type_id: TypeId) -> bool {
        self.descriptors.contains_key(&type_id)
    }

    pub(crate) fn descriptor(&self, type_id: TypeId) -> Option<&ServiceDescriptor> {
        self.descriptors.get(&type_id)
    }
}

impl fmt::Debug for RootResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.descriptors.values().map(|d| (d.service, d.lifetime)))
            .finish()
    }
}

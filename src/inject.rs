use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::error::BindingError;
use crate::resolve::{Instance, Lifetime, RootResolver, ServiceDescriptor};
use crate::scope::ResourceScope;

/// Injection context handed to service factories.
///
/// A resolver either belongs to an invocation scope, and then reaches every
/// registered service, or to the root resolver alone, and then refuses scoped
/// services. It remembers the chain of services being built to report cycles.
pub struct Resolver<'a> {
    root: &'a RootResolver,
    scope: Option<&'a ResourceScope>,
    path: Vec<TypeId>,
}

impl<'a> Resolver<'a> {
    pub(crate) fn root(root: &'a RootResolver) -> Self {
        Self {
            root,
            scope: None,
            path: Vec::new(),
        }
    }

    pub(crate) fn scoped(scope: &'a ResourceScope) -> Self {
        Self {
            root: scope.root(),
            scope: Some(scope),
            path: Vec::new(),
        }
    }

    /// Obtain an instance of the target type.
    ///
    /// Return an error if the type is not registered or could not be built.
    pub fn resolve<T: Any + Send + Sync>(&mut self) -> Result<Arc<T>, BindingError> {
        let service = type_name::<T>();
        self.resolve_erased(TypeId::of::<T>(), service)?
            .downcast::<T>()
            .map_err(|_| BindingError::TypeMismatch { service })
    }

    /// Identifier of the scope this resolver belongs to, if any
    pub fn scope_id(&self) -> Option<u64> {
        self.scope.map(ResourceScope::id)
    }

    pub(crate) fn resolve_erased(
        &mut self,
        type_id: TypeId,
        service: &'static str,
    ) -> Result<Instance, BindingError> {
        let root = self.root;
        let descriptor = root
            .descriptor(type_id)
            .ok_or(BindingError::Unregistered { service })?;
        if self.path.contains(&type_id) {
            return Err(BindingError::CyclicDependency {
                service: descriptor.service,
            });
        }
        if let Some(scope) = self.scope {
            scope.ensure_active()?;
        }

        self.path.push(type_id);
        let result = self.build(descriptor, type_id);
        self.path.pop();
        result
    }

    fn build(
        &mut self,
        descriptor: &'a ServiceDescriptor,
        type_id: TypeId,
    ) -> Result<Instance, BindingError> {
        match descriptor.lifetime {
            Lifetime::Singleton => descriptor.singleton(|| {
                // singletons never see the scope that happened to build them first
                let mut nested = Resolver {
                    root: self.root,
                    scope: None,
                    path: self.path.clone(),
                };
                descriptor.construct(&mut nested)
            }),
            Lifetime::Scoped => {
                let scope = self.scope.ok_or(BindingError::ScopedFromRoot {
                    service: descriptor.service,
                })?;
                scope
                    .instances()
                    .get_or_try_init(type_id, descriptor.service, || {
                        let instance = descriptor.construct(self)?;
                        if let Some(disposer) = descriptor.disposer {
                            scope.track(descriptor.service, &instance, disposer)?;
                        }
                        Ok(instance)
                    })
            }
            Lifetime::Transient => {
                let instance = descriptor.construct(self)?;
                match (self.scope, descriptor.disposer) {
                    (Some(scope), Some(disposer)) => {
                        scope.track(descriptor.service, &instance, disposer)?
                    }
                    (None, Some(_)) => debug!(
                        service = descriptor.service,
                        "disposable transient built outside of a scope is not tracked"
                    ),
                    _ => {}
                }
                Ok(instance)
            }
        }
    }
}

/// Scoped instances of one scope, keyed by service type
#[derive(Default)]
pub(crate) struct InstanceMap {
    cells: Mutex<HashMap<TypeId, Arc<OnceCell<Instance>>>>,
    building: Mutex<HashSet<(TypeId, ThreadId)>>,
    construction: ConstructionLock,
}

impl InstanceMap {
    /// Return the instance for the type, building it exactly once.
    ///
    /// Scoped construction is serialised per scope: one thread builds at a time,
    /// and may re-enter for the dependencies it needs. Other threads wait for it,
    /// so dependency cycles always surface on a single thread as an error.
    /// A thread re-entering the construction of a type it is already building
    /// gets an error instead of a deadlock.
    pub(crate) fn get_or_try_init(
        &self,
        type_id: TypeId,
        service: &'static str,
        init: impl FnOnce() -> Result<Instance, BindingError>,
    ) -> Result<Instance, BindingError> {
        let cell = Arc::clone(
            self.cells
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(type_id)
                .or_default(),
        );
        if let Some(instance) = cell.get() {
            return Ok(Arc::clone(instance));
        }

        let _construction = self.construction.acquire();
        if let Some(instance) = cell.get() {
            return Ok(Arc::clone(instance));
        }
        let Some(_building) = BuildingGuard::enter(&self.building, type_id) else {
            return Err(BindingError::CyclicDependency { service });
        };
        cell.get_or_try_init(init).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    pub(crate) fn clear(&self) {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Marks a type as being built by the current thread
struct BuildingGuard<'m> {
    building: &'m Mutex<HashSet<(TypeId, ThreadId)>>,
    key: (TypeId, ThreadId),
}

impl<'m> BuildingGuard<'m> {
    fn enter(building: &'m Mutex<HashSet<(TypeId, ThreadId)>>, type_id: TypeId) -> Option<Self> {
        let key = (type_id, thread::current().id());
        let inserted = building
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        inserted.then(|| Self { building, key })
    }
}

impl Drop for BuildingGuard<'_> {
    fn drop(&mut self) {
        self.building
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Reentrant lock owned by the thread currently building scoped services
#[derive(Default)]
struct ConstructionLock {
    owner: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

impl ConstructionLock {
    fn acquire(&self) -> ConstructionGuard<'_> {
        let current = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let state = *owner;
            match state {
                None => *owner = Some((current, 1)),
                Some((thread, depth)) if thread == current => *owner = Some((thread, depth + 1)),
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
            }
            return ConstructionGuard { lock: self };
        }
    }
}

struct ConstructionGuard<'l> {
    lock: &'l ConstructionLock,
}

impl Drop for ConstructionGuard<'_> {
    fn drop(&mut self) {
        let mut owner = self.lock.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match *owner {
            Some((thread, depth)) if depth > 1 => *owner = Some((thread, depth - 1)),
            _ => {
                *owner = None;
                self.lock.released.notify_all();
            }
        }
    }
}

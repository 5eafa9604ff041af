//! Per-invocation resource scopes

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};

use crate::error::{BindingError, CleanupError, DisposeError, LifecycleViolation};
use crate::inject::{InstanceMap, Resolver};
use crate::resolve::{Disposer, Instance, RootResolver};

struct Tracked {
    service: &'static str,
    instance: Instance,
    disposer: Disposer,
}

impl Tracked {
    fn dispose(&self) -> Result<(), DisposeError> {
        (self.disposer)(self.instance.as_ref()).map_err(|source| DisposeError::Service {
            service: self.service,
            source,
        })
    }
}

/// Boundary of shared, disposable state for one invocation.
///
/// Scoped services are built at most once per scope. Disposable services built
/// within the scope are released by [ResourceScope::dispose], in reverse creation order.
pub struct ResourceScope {
    id: u64,
    root: Arc<RootResolver>,
    instances: InstanceMap,
    tracked: Mutex<Vec<Tracked>>,
    disposed: AtomicBool,
}

impl ResourceScope {
    fn new(id: u64, root: Arc<RootResolver>) -> Self {
        Self {
            id,
            root,
            instances: InstanceMap::default(),
            tracked: Mutex::default(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Obtain an instance of the target type from this scope
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, BindingError> {
        Resolver::scoped(self).resolve()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of scoped instances built so far
    pub fn scoped_instances(&self) -> usize {
        self.instances.len()
    }

    /// Release every tracked service.
    ///
    /// All services are released even when some fail; the first failure is
    /// reported. A second call is a lifecycle violation.
    pub fn dispose(&self) -> Result<(), CleanupError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(LifecycleViolation::AlreadyDisposed(self.id).into());
        }
        let tracked = std::mem::take(&mut *self.lock_tracked());
        self.instances.clear();
        debug!(scope_id = self.id, services = tracked.len(), "disposing scope");

        let mut failures = tracked
            .iter()
            .rev()
            .filter_map(|service| service.dispose().err())
            .inspect(|err| error!(scope_id = self.id, "{err}"));
        let Some(first) = failures.next() else {
            return Ok(());
        };
        let failures = 1 + failures.count();
        Err(DisposeError::ScopeDispose {
            scope_id: self.id,
            failures,
            first: Box::new(first),
        }
        .into())
    }

    pub(crate) fn root(&self) -> &RootResolver {
        &self.root
    }

    pub(crate) fn instances(&self) -> &InstanceMap {
        &self.instances
    }

    pub(crate) fn ensure_active(&self) -> Result<(), BindingError> {
        if self.is_disposed() {
            return Err(BindingError::ScopeDisposed { scope_id: self.id });
        }
        Ok(())
    }

    pub(crate) fn resolve_erased(
        &self,
        type_id: TypeId,
        service: &'static str,
    ) -> Result<Instance, BindingError> {
        Resolver::scoped(self).resolve_erased(type_id, service)
    }

    /// Hand a disposable instance over to the scope.
    ///
    /// If the scope was disposed meanwhile, the instance is released right away.
    pub(crate) fn track(
        &self,
        service: &'static str,
        instance: &Instance,
        disposer: Disposer,
    ) -> Result<(), BindingError> {
        let entry = Tracked {
            service,
            instance: Arc::clone(instance),
            disposer,
        };
        let mut tracked = self.lock_tracked();
        if self.is_disposed() {
            drop(tracked);
            if let Err(err) = entry.dispose() {
                error!(scope_id = self.id, "{err}");
            }
            return Err(BindingError::ScopeDisposed { scope_id: self.id });
        }
        tracked.push(entry);
        Ok(())
    }

    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, Vec<Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if !self.is_disposed() {
            warn!(scope_id = self.id, "scope dropped without being disposed");
            if let Err(err) = self.dispose() {
                error!(scope_id = self.id, "{err}");
            }
        }
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Builds fresh scopes derived from the root resolver
#[derive(Clone)]
pub struct ScopeFactory {
    root: Arc<RootResolver>,
    next_id: Arc<AtomicU64>,
}

impl ScopeFactory {
    pub fn new(root: Arc<RootResolver>) -> Self {
        Self {
            root,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn create(&self) -> ResourceScope {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(scope_id = id, "creating scope");
        ResourceScope::new(id, Arc::clone(&self.root))
    }

    /// Number of scopes created so far
    pub fn created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }

    pub fn root(&self) -> &Arc<RootResolver> {
        &self.root
    }
}

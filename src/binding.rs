use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::BindingError;
use crate::resolve::Instance;
use crate::scope::ScopeFactory;
use crate::store::{InvocationId, ScopeStore};

/// Requested type of one injectable parameter.
///
/// Built once per parameter declaration and reused across invocations.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BindingDescriptor {
    type_id: TypeId,
    service: &'static str,
}

impl BindingDescriptor {
    pub fn of<T: Any + Send + Sync>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            service: type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Name of the requested type
    pub fn service(&self) -> &'static str {
        self.service
    }
}

impl fmt::Debug for BindingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BindingDescriptor").field(&self.service).finish()
    }
}

/// A resolved instance paired with its type, handed over to the host
#[derive(Clone)]
pub struct ResolvedValue {
    value: Instance,
    type_id: TypeId,
    service: &'static str,
}

impl ResolvedValue {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Recover the typed instance, or give the value back on mismatch
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, Self> {
        let Self {
            value,
            type_id,
            service,
        } = self;
        value.downcast::<T>().map_err(|value| Self {
            value,
            type_id,
            service,
        })
    }
}

impl fmt::Debug for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResolvedValue").field(&self.service).finish()
    }
}

/// Delivers injected values for the parameters of an invocation.
///
/// The first binding of an invocation creates its scope; every further binding
/// of the same invocation resolves from that same scope.
pub struct BindingResolver {
    store: Arc<ScopeStore>,
    factory: ScopeFactory,
}

impl BindingResolver {
    pub fn new(store: Arc<ScopeStore>, factory: ScopeFactory) -> Self {
        Self { store, factory }
    }

    pub fn resolve(
        &self,
        invocation_id: InvocationId,
        descriptor: &BindingDescriptor,
    ) -> Result<ResolvedValue, BindingError> {
        // unknown types are refused before a scope gets created for them
        if !self.factory.root().contains(descriptor.type_id) {
            return Err(BindingError::Unregistered {
                service: descriptor.service,
            });
        }

        let scope = self
            .store
            .get_or_create(invocation_id, || Ok(self.factory.create()))?;
        let value = scope.resolve_erased(descriptor.type_id, descriptor.service)?;
        debug!(
            invocation_id = %invocation_id,
            scope_id = scope.id(),
            service = descriptor.service,
            "parameter bound"
        );
        Ok(ResolvedValue {
            value,
            type_id: descriptor.type_id,
            service: descriptor.service,
        })
    }

    /// Typed variant of [BindingResolver::resolve]
    pub fn resolve_typed<T: Any + Send + Sync>(
        &self,
        invocation_id: InvocationId,
    ) -> Result<Arc<T>, BindingError> {
        let service = type_name::<T>();
        self.resolve(invocation_id, &BindingDescriptor::of::<T>())?
            .downcast()
            .map_err(|_| BindingError::TypeMismatch { service })
    }

    pub fn store(&self) -> &Arc<ScopeStore> {
        &self.store
    }

    pub fn factory(&self) -> &ScopeFactory {
        &self.factory
    }
}

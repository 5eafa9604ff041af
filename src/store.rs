//! Registry of live scopes, keyed by invocation
//!
//! The binding step and the lifecycle hooks are separate, uncorrelated calls from
//! the host: the store is where they agree on which scope belongs to which
//! invocation. It only exposes atomic operations, never the underlying map.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::{BindingError, BoxError, LifecycleViolation};
use crate::scope::ResourceScope;

/// Default number of released invocations remembered by a store
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 4096;

/// Opaque identifier assigned by the host to each invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvocationId(Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for InvocationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

enum Slot {
    Active(Arc<ResourceScope>),
    Released,
}

/// Result of [ScopeStore::remove_and_take]
#[derive(Debug)]
pub enum Removal {
    /// The scope of the invocation, now owned by the caller
    Taken(Arc<ResourceScope>),
    /// The invocation never created a scope
    Absent,
    /// The invocation was already released
    AlreadyReleased,
}

impl Removal {
    pub fn into_scope(self) -> Option<Arc<ResourceScope>> {
        match self {
            Self::Taken(scope) => Some(scope),
            Self::Absent | Self::AlreadyReleased => None,
        }
    }

    pub fn is_taken(&self) -> bool {
        matches!(self, Self::Taken(_))
    }
}

/// Concurrent map from invocation to its scope.
///
/// Released invocations leave a tombstone so that late bindings and repeated
/// cleanups are detected. Only the most recent tombstones are kept.
pub struct ScopeStore {
    slots: DashMap<InvocationId, Slot>,
    released: Mutex<VecDeque<InvocationId>>,
    tombstone_capacity: usize,
}

impl ScopeStore {
    pub fn new() -> Self {
        Self::with_tombstone_capacity(DEFAULT_TOMBSTONE_CAPACITY)
    }

    pub fn with_tombstone_capacity(tombstone_capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            released: Mutex::default(),
            tombstone_capacity,
        }
    }

    /// Return the scope of the invocation, creating it if absent.
    ///
    /// `create` is called at most once per invocation, even under concurrent calls.
    /// It runs while the entry is locked and must not use the store itself.
    /// On failure nothing is inserted.
    pub fn get_or_create<F>(
        &self,
        id: InvocationId,
        create: F,
    ) -> Result<Arc<ResourceScope>, BindingError>
    where
        F: FnOnce() -> Result<ResourceScope, BoxError>,
    {
        match self.slots.entry(id) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Active(scope) => Ok(Arc::clone(scope)),
                Slot::Released => Err(LifecycleViolation::ResolvedAfterRelease(id).into()),
            },
            Entry::Vacant(entry) => {
                let scope = Arc::new(create().map_err(BindingError::ScopeCreation)?);
                debug!(invocation_id = %id, scope_id = scope.id(), "scope registered");
                entry.insert(Slot::Active(Arc::clone(&scope)));
                Ok(scope)
            }
        }
    }

    /// Remove the scope of the invocation and hand it to the caller.
    ///
    /// Disposing the returned scope is the caller's job.
    pub fn remove_and_take(&self, id: InvocationId) -> Removal {
        let removal = match self.slots.entry(id) {
            Entry::Occupied(mut entry) => {
                match std::mem::replace(entry.get_mut(), Slot::Released) {
                    Slot::Active(scope) => Removal::Taken(scope),
                    Slot::Released => return Removal::AlreadyReleased,
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Released);
                Removal::Absent
            }
        };
        self.remember_released(id);
        removal
    }

    /// Whether the invocation currently owns a scope
    pub fn contains(&self, id: InvocationId) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|slot| matches!(*slot, Slot::Active(_)))
    }

    pub fn is_released(&self, id: InvocationId) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|slot| matches!(*slot, Slot::Released))
    }

    /// Number of live scopes
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remember_released(&self, id: InvocationId) {
        let evicted = {
            let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
            released.push_back(id);
            if released.len() > self.tombstone_capacity {
                released.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            self.slots
                .remove_if(&old, |_, slot| matches!(slot, Slot::Released));
        }
    }
}

impl Default for ScopeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScopeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeStore")
            .field("scopes", &self.len())
            .field("tombstone_capacity", &self.tombstone_capacity)
            .finish()
    }
}

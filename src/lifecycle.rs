//! Invocation lifecycle hooks
//!
//! Whatever way an invocation ends, its scope is removed from the store and
//! disposed exactly once. The success hook, the exception hook and the drop of
//! an [InvocationGuard] all go through the same cleanup routine.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{CleanupError, LifecycleViolation};
use crate::store::{InvocationId, Removal, ScopeStore};

/// How the handler of an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

/// Cleanup hooks bound to a scope store
#[derive(Clone)]
pub struct ScopeCleanup {
    store: Arc<ScopeStore>,
}

impl ScopeCleanup {
    pub fn new(store: Arc<ScopeStore>) -> Self {
        Self { store }
    }

    /// Fired before the handler runs. Nothing to prepare: scopes are created by the first binding.
    pub fn on_start(&self, _invocation_id: InvocationId) {}

    pub fn on_success(&self, invocation_id: InvocationId) -> Result<(), CleanupError> {
        self.finish(invocation_id, Outcome::Succeeded)
    }

    pub fn on_exception(&self, invocation_id: InvocationId) -> Result<(), CleanupError> {
        self.finish(invocation_id, Outcome::Failed)
    }

    /// Release the scope of a finished invocation.
    ///
    /// The store entry is gone even when disposing fails.
    pub fn finish(
        &self,
        invocation_id: InvocationId,
        outcome: Outcome,
    ) -> Result<(), CleanupError> {
        match self.store.remove_and_take(invocation_id) {
            Removal::Taken(scope) => {
                debug!(
                    invocation_id = %invocation_id,
                    scope_id = scope.id(),
                    ?outcome,
                    "releasing scope"
                );
                scope.dispose().map_err(|err| {
                    error!(invocation_id = %invocation_id, "{err}");
                    err
                })
            }
            Removal::Absent => Ok(()),
            Removal::AlreadyReleased => {
                Err(LifecycleViolation::AlreadyReleased(invocation_id).into())
            }
        }
    }

    /// Start an invocation whose cleanup runs when the guard completes or drops
    pub fn guard(&self, invocation_id: InvocationId) -> InvocationGuard {
        self.on_start(invocation_id);
        InvocationGuard {
            cleanup: self.clone(),
            invocation_id,
            completed: false,
        }
    }

    pub fn store(&self) -> &Arc<ScopeStore> {
        &self.store
    }
}

/// Ties the release of an invocation's scope to the invocation's execution.
///
/// Dropping the guard without [InvocationGuard::complete] (cancellation, panic)
/// runs the exception path.
#[must_use = "dropping the guard releases the invocation scope"]
pub struct InvocationGuard {
    cleanup: ScopeCleanup,
    invocation_id: InvocationId,
    completed: bool,
}

impl InvocationGuard {
    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    pub fn complete(mut self, outcome: Outcome) -> Result<(), CleanupError> {
        self.completed = true;
        self.cleanup.finish(self.invocation_id, outcome)
    }
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Err(err) = self.cleanup.finish(self.invocation_id, Outcome::Failed) {
            warn!(
                invocation_id = %self.invocation_id,
                "cleanup of abandoned invocation failed: {err}"
            );
        }
    }
}

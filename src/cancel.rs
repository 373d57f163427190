//! Cancellation of composite operations.
//!
//! A request executed through the pool passes through several stages: waiting
//! for a lease, connecting, then the exchange itself. Each stage is represented by
//! a [`Cancellable`] dependency, and the [`ComplexCancellable`] tracking the whole
//! operation forwards cancellation to whichever stage is current.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Something which can be cancelled.
pub trait Cancellable: Send + Sync {
    /// Request cancellation. Returns `true` if this call cancelled the operation.
    fn cancel(&self) -> bool;
}

impl<F> Cancellable for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn cancel(&self) -> bool {
        (self)()
    }
}

/// A cancellable operation built out of a sequence of dependencies.
///
/// Cancelling marks the composite as cancelled and cancels the current dependency.
/// A dependency installed after cancellation is cancelled immediately, so the
/// handoff between stages never loses a cancellation request.
#[derive(Default)]
pub struct ComplexCancellable {
    cancelled: AtomicBool,
    dependency: Mutex<Option<Arc<dyn Cancellable>>>,
}

impl ComplexCancellable {
    /// Create a composite with no dependency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once [`cancel`](Cancellable::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Install the dependency for the current stage, replacing any previous one.
    ///
    /// Returns `false`, after cancelling `dependency`, if the composite was already
    /// cancelled.
    pub fn set_dependency(&self, dependency: Arc<dyn Cancellable>) -> bool {
        let mut slot = self.dependency.lock();
        if self.is_cancelled() {
            drop(slot);
            dependency.cancel();
            return false;
        }
        *slot = Some(dependency);
        true
    }

    /// Remove the current dependency without cancelling it.
    pub fn clear_dependency(&self) {
        self.dependency.lock().take();
    }
}

impl Cancellable for ComplexCancellable {
    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }

        let dependency = self.dependency.lock().take();
        if let Some(dependency) = dependency {
            tracing::trace!("forwarding cancellation to dependency");
            dependency.cancel();
        }
        true
    }
}

impl fmt::Debug for ComplexCancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComplexCancellable")
            .field("cancelled", &self.is_cancelled())
            .field("dependency", &self.dependency.lock().is_some())
            .finish()
    }
}

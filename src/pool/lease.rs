use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::trace;

use super::entry::PoolEntry;
use super::route::Delivery;
use super::{Error, PoolRef, PoolableConnection, Route};
use crate::cancel::Cancellable;
use crate::CloseMode;

/// Identifies a queued lease request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(pub(super) u64);

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiter-{}", self.0)
    }
}

/// A lease request waiting for capacity on its route.
///
/// Resolves to the leased entry once one is freed, or to an error if the request
/// is cancelled, times out, or the pool shuts down. Dropping the request
/// withdraws it; an entry delivered after the last poll is handed back to the
/// route it came from.
#[must_use = "futures do nothing unless polled"]
pub struct PendingLease<C: PoolableConnection> {
    route: Route,
    waiter: WaiterId,
    rx: oneshot::Receiver<Delivery<C>>,
    pool: PoolRef<C>,
    returns: Weak<Mutex<Vec<PoolEntry<C>>>>,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl<C: PoolableConnection> PendingLease<C> {
    pub(super) fn new(
        route: Route,
        waiter: WaiterId,
        rx: oneshot::Receiver<Delivery<C>>,
        returns: Weak<Mutex<Vec<PoolEntry<C>>>>,
    ) -> Self {
        Self {
            route,
            waiter,
            rx,
            pool: PoolRef::none(),
            returns,
            timeout: None,
            deadline: None,
            done: false,
        }
    }

    pub(super) fn attach(mut self, pool: PoolRef<C>, timeout: Option<Duration>) -> Self {
        self.pool = pool;
        self.timeout = timeout;
        self
    }

    /// The route this request is waiting on.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The identifier of the queued request.
    pub fn waiter(&self) -> WaiterId {
        self.waiter
    }

    /// Fail the request with [`Error::Timeout`] if it is not served within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self.deadline = None;
        self
    }

    /// Withdraw the request. Returns `false` if it had already resolved.
    pub fn cancel(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        self.withdraw();
        true
    }

    /// A handle which withdraws this request from another task.
    pub fn canceller(&self) -> LeaseCanceller<C> {
        LeaseCanceller {
            pool: self.pool.clone(),
            route: self.route.clone(),
            waiter: self.waiter,
        }
    }

    /// Stop listening, return any entry which arrived in the meantime and remove
    /// the request from the queue.
    fn withdraw(&mut self) {
        self.rx.close();
        let delivered = self.rx.try_recv();

        let Some(mut pool) = self.pool.lock() else {
            if let Ok(Ok(entry)) = delivered {
                self.hand_back(entry);
            }
            return;
        };

        if let Ok(Ok(entry)) = delivered {
            trace!(
                waiter = %self.waiter,
                entry = %entry.id(),
                "returning entry delivered to withdrawn lease"
            );
            let _ = pool.free(entry, true);
        } else {
            pool.cancel_pending(&self.route, self.waiter);
        }
    }
}

impl<C: PoolableConnection> PendingLease<C> {
    /// Queue an entry on its route pool, or close it if the route pool is gone.
    fn hand_back(&self, mut entry: PoolEntry<C>) {
        match self.returns.upgrade() {
            Some(returned) => {
                trace!(
                    waiter = %self.waiter,
                    entry = %entry.id(),
                    "handing back entry delivered to withdrawn lease"
                );
                returned.lock().push(entry);
            }
            None => entry.discard_connection(CloseMode::Immediate),
        }
    }
}

impl<C: PoolableConnection> Future for PendingLease<C> {
    type Output = Result<PoolEntry<C>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(Error::Cancelled));
        }

        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(delivery)) => {
                this.done = true;
                return Poll::Ready(delivery);
            }
            Poll::Ready(Err(_)) => {
                this.done = true;
                return Poll::Ready(Err(Error::Cancelled));
            }
            Poll::Pending => {}
        }

        if let Some(timeout) = this.timeout {
            let deadline = this
                .deadline
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
            if deadline.as_mut().poll(cx).is_ready() {
                this.done = true;
                this.rx.close();
                if let Ok(delivery) = this.rx.try_recv() {
                    return Poll::Ready(delivery);
                }

                trace!(route = %this.route, waiter = %this.waiter, "lease request timed out");
                if let Some(mut pool) = this.pool.lock() {
                    pool.cancel_pending(&this.route, this.waiter);
                }
                return Poll::Ready(Err(Error::Timeout(timeout)));
            }
        }

        Poll::Pending
    }
}

impl<C: PoolableConnection> Drop for PendingLease<C> {
    fn drop(&mut self) {
        if !self.done {
            self.withdraw();
        }
    }
}

impl<C: PoolableConnection> fmt::Debug for PendingLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLease")
            .field("route", &crate::DebugLiteral(&self.route))
            .field("waiter", &self.waiter)
            .field("timeout", &self.timeout)
            .field("done", &self.done)
            .finish()
    }
}

/// Withdraws a pending lease request from any thread.
pub struct LeaseCanceller<C: PoolableConnection> {
    pool: PoolRef<C>,
    route: Route,
    waiter: WaiterId,
}

impl<C: PoolableConnection> Cancellable for LeaseCanceller<C> {
    fn cancel(&self) -> bool {
        self.pool
            .lock()
            .is_some_and(|mut pool| pool.cancel_pending(&self.route, self.waiter))
    }
}

impl<C: PoolableConnection> fmt::Debug for LeaseCanceller<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCanceller")
            .field("route", &crate::DebugLiteral(&self.route))
            .field("waiter", &self.waiter)
            .finish()
    }
}

/// A leased entry which returns itself to the pool when dropped.
///
/// The entry is freed as non-reusable (closing its connection) unless
/// [`set_reusable(true)`](Self::set_reusable) was called. A closed connection is
/// never kept.
pub struct Pooled<C: PoolableConnection> {
    entry: Option<PoolEntry<C>>,
    pool: PoolRef<C>,
    reusable: bool,
}

impl<C: PoolableConnection> Pooled<C> {
    pub(super) fn new(entry: PoolEntry<C>, pool: PoolRef<C>) -> Self {
        Self {
            entry: Some(entry),
            pool,
            reusable: false,
        }
    }

    /// Mark whether the connection may be handed to another caller.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Detach the entry from this guard. The caller becomes responsible for
    /// returning it with [`Pool::free`](super::Pool::free).
    pub fn into_entry(mut self) -> PoolEntry<C> {
        self.entry.take().expect("entry only taken on Drop")
    }
}

impl<C: PoolableConnection> Deref for Pooled<C> {
    type Target = PoolEntry<C>;

    fn deref(&self) -> &Self::Target {
        self.entry.as_ref().expect("entry only taken on Drop")
    }
}

impl<C: PoolableConnection> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry.as_mut().expect("entry only taken on Drop")
    }
}

impl<C: PoolableConnection> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            if let Some(mut pool) = self.pool.lock() {
                trace!(entry = %entry.id(), reusable = self.reusable, "pooled entry returned");
                if let Err(error) = pool.free(entry, self.reusable) {
                    tracing::warn!(%error, "unable to return entry to pool");
                }
            } else {
                entry.discard_connection(CloseMode::Immediate);
            }
        }
    }
}

impl<C: PoolableConnection> fmt::Debug for Pooled<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.entry).finish()
    }
}

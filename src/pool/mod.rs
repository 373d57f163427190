//! Connection pooling per route.
//!
//! The pool hands out [`PoolEntry`] leases. An entry is a unit of capacity on a
//! [`Route`]: it may already carry an open connection (a persistent connection
//! returned by an earlier caller), or it may be empty, in which case the caller
//! connects and assigns the connection before using it. Every entry is either
//! available in the pool or leased to exactly one caller.
//!
//! Each route has its own [`RouteSpecificPool`] with a LIFO list of available
//! entries, the set of leased entries and a FIFO queue of pending requests. The
//! [`Pool`] shares a set of route pools between callers behind a mutex, and
//! bounds the total number of connections across routes by evicting the least
//! recently used idle connection when needed.
//!
//! Connections are closed by the pool with a [`CloseMode`], so that shutdown can
//! drain gracefully or abort.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{ArcMutexGuard, Mutex};
use tracing::{debug, trace};

use crate::CloseMode;

mod entry;
mod key;
mod lease;
mod route;

pub use self::entry::{EntryId, PoolEntry, State};
pub use self::key::{Route, RouteError};
pub use self::lease::{LeaseCanceller, PendingLease, Pooled, WaiterId};
pub use self::route::{LeaseOutcome, RouteSpecificPool};

/// A connection which can be held by the pool.
///
/// Connections are shared handles: the pool keeps one copy to close the
/// connection on shutdown while the caller uses another.
pub trait PoolableConnection: Clone + Send + Sync + 'static {
    /// Returns `true` if the connection is still open.
    fn is_open(&self) -> bool;

    /// Close the connection.
    fn close(&self, mode: CloseMode);
}

/// Misuse of the pool, or a lease which could not be served.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The entry was not created by this pool.
    #[error("{entry} does not belong to the pool for {route}")]
    NotOwned {
        /// The foreign entry.
        entry: EntryId,
        /// The route the entry claims.
        route: Route,
    },

    /// The entry is not currently leased.
    #[error("{0} is not leased")]
    NotLeased(EntryId),

    /// The pool has been shut down.
    #[error("pool is shut down")]
    ShutDown,

    /// The route's queue of pending lease requests is full.
    #[error("too many pending lease requests for {0}")]
    TooManyPending(Route),

    /// The lease request was cancelled, or the pool shut down while it waited.
    #[error("lease request cancelled")]
    Cancelled,

    /// The lease request was not served in time.
    #[error("lease request timed out after {0:?}")]
    Timeout(Duration),
}

/// Configuration for a [`Pool`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum number of connections to a single route.
    pub max_per_route: usize,

    /// The maximum number of connections across all routes.
    pub max_total: usize,

    /// How long a connection may sit idle in the pool before it is no longer
    /// reused.
    pub idle_timeout: Option<Duration>,

    /// How long a lease request may wait for capacity.
    pub lease_timeout: Option<Duration>,

    /// The maximum number of pending lease requests per route.
    pub max_pending: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_per_route: 5,
            max_total: 25,
            idle_timeout: Some(Duration::from_secs(90)),
            lease_timeout: None,
            max_pending: usize::MAX,
        }
    }
}

impl Config {
    /// Set the maximum number of connections to a single route.
    pub fn with_max_per_route(mut self, max: usize) -> Self {
        self.max_per_route = max;
        self
    }

    /// Set the maximum number of connections across all routes.
    pub fn with_max_total(mut self, max: usize) -> Self {
        self.max_total = max;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the lease timeout.
    pub fn with_lease_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Set the maximum number of pending lease requests per route.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }
}

/// A snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Entries held by the pool, ready for reuse.
    pub available: usize,

    /// Entries held by callers.
    pub leased: usize,

    /// Lease requests waiting for capacity.
    pub pending: usize,

    /// The capacity limit.
    pub max: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[leased: {}; pending: {}; available: {}; max: {}]",
            self.leased, self.pending, self.available, self.max
        )
    }
}

/// A pool of connections shared across routes.
///
/// Cloning the pool is cheap and all clones share the same connections.
pub struct Pool<C: PoolableConnection> {
    inner: Arc<Mutex<PoolInner<C>>>,
}

impl<C: PoolableConnection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PoolableConnection> Default for Pool<C> {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<C: PoolableConnection> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("stats", &self.total_stats()).finish()
    }
}

impl<C: PoolableConnection> Pool<C> {
    /// Create an empty pool.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::new(config))),
        }
    }

    fn as_ref(&self) -> PoolRef<C> {
        PoolRef {
            inner: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Lease an entry for `route`, preferring a connection carrying `state`.
    ///
    /// A pending outcome inherits the configured lease timeout.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%route), level = "debug"))]
    pub fn lease(&self, route: &Route, state: Option<&State>) -> LeaseOutcome<C> {
        let (outcome, timeout) = {
            let mut inner = self.inner.lock();
            (inner.lease(route, state), inner.config.lease_timeout)
        };

        match outcome {
            LeaseOutcome::Pending(pending) => {
                LeaseOutcome::Pending(pending.attach(self.as_ref(), timeout))
            }
            outcome => outcome,
        }
    }

    /// Lease an entry, waiting for capacity if necessary.
    pub async fn checkout(&self, route: &Route, state: Option<&State>) -> Result<Pooled<C>, Error> {
        let entry = match self.lease(route, state) {
            LeaseOutcome::Leased(entry) => entry,
            LeaseOutcome::Pending(pending) => pending.await?,
            LeaseOutcome::Rejected(error) => return Err(error),
        };
        Ok(Pooled::new(entry, self.as_ref()))
    }

    /// Wrap a leased entry so that it is returned when dropped.
    pub fn guard(&self, entry: PoolEntry<C>) -> Pooled<C> {
        Pooled::new(entry, self.as_ref())
    }

    /// Return a leased entry.
    #[cfg_attr(
        not(tarpaulin),
        tracing::instrument(
            skip_all,
            fields(entry = %entry.id(), reusable = reusable),
            level = "debug"
        )
    )]
    pub fn free(&self, entry: PoolEntry<C>, reusable: bool) -> Result<(), Error> {
        self.inner.lock().free(entry, reusable)
    }

    /// Remove an entry and close its connection. Returns `false` if the entry was
    /// already removed.
    pub fn remove(&self, entry: &PoolEntry<C>) -> Result<bool, Error> {
        self.inner.lock().remove(entry)
    }

    /// Close every connection and cancel every pending lease request.
    ///
    /// Leased entries have their connections closed; freeing them afterwards
    /// succeeds without returning them to the pool.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(?mode), level = "debug"))]
    pub fn shutdown(&self, mode: CloseMode) {
        self.inner.lock().shutdown(mode);
    }

    /// Returns `true` once the pool has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Close available connections idle for longer than `idle`. Returns the
    /// number closed.
    pub fn close_idle(&self, idle: Duration) -> usize {
        let mut inner = self.inner.lock();
        let closed: usize = inner.routes.values_mut().map(|pool| pool.close_idle(idle)).sum();
        inner.service_all();
        closed
    }

    /// Close available connections which have expired. Returns the number closed.
    pub fn close_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let closed: usize = inner.routes.values_mut().map(RouteSpecificPool::close_expired).sum();
        inner.service_all();
        closed
    }

    /// Occupancy of a single route, if the pool has seen it.
    pub fn stats(&self, route: &Route) -> Option<Stats> {
        self.inner.lock().routes.get(route).map(RouteSpecificPool::stats)
    }

    /// Occupancy across all routes.
    pub fn total_stats(&self) -> Stats {
        let inner = self.inner.lock();
        inner.routes.values().map(RouteSpecificPool::stats).fold(
            Stats {
                max: inner.config.max_total,
                ..Stats::default()
            },
            |total, stats| Stats {
                available: total.available + stats.available,
                leased: total.leased + stats.leased,
                pending: total.pending + stats.pending,
                max: total.max,
            },
        )
    }

    /// Change the connection limit for one route.
    pub fn set_max_per_route(&self, route: &Route, max: usize) {
        let mut inner = self.inner.lock();
        inner.route_mut(route).set_max(max);
        inner.service_all();
    }

    /// The connection limit for one route.
    pub fn max_per_route(&self, route: &Route) -> usize {
        let inner = self.inner.lock();
        inner
            .routes
            .get(route)
            .map_or(inner.config.max_per_route, RouteSpecificPool::max)
    }

    /// Routes the pool has seen.
    pub fn routes(&self) -> Vec<Route> {
        self.inner.lock().routes.keys().cloned().collect()
    }
}

/// A weak reference to the pool, held by leases and guards so that they do not
/// keep the pool alive.
pub(crate) struct PoolRef<C: PoolableConnection> {
    inner: Option<Weak<Mutex<PoolInner<C>>>>,
}

impl<C: PoolableConnection> PoolRef<C> {
    pub(crate) fn none() -> Self {
        Self { inner: None }
    }

    fn lock(&self) -> Option<PoolGuard<C>> {
        self.inner
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| PoolGuard(inner.lock_arc()))
    }
}

impl<C: PoolableConnection> Clone for PoolRef<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PoolableConnection> fmt::Debug for PoolRef<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.inner.is_some() { "Some(...)" } else { "None" };
        f.debug_tuple("PoolRef").field(&crate::DebugLiteral(state)).finish()
    }
}

struct PoolGuard<C: PoolableConnection>(ArcMutexGuard<parking_lot::RawMutex, PoolInner<C>>);

impl<C: PoolableConnection> Deref for PoolGuard<C> {
    type Target = PoolInner<C>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<C: PoolableConnection> DerefMut for PoolGuard<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

struct PoolInner<C: PoolableConnection> {
    config: Config,
    routes: HashMap<Route, RouteSpecificPool<C>>,
    shut_down: bool,
}

impl<C: PoolableConnection> PoolInner<C> {
    fn new(config: Config) -> Self {
        Self {
            config,
            routes: HashMap::new(),
            shut_down: false,
        }
    }

    fn route_mut(&mut self, route: &Route) -> &mut RouteSpecificPool<C> {
        let config = &self.config;
        self.routes.entry(route.clone()).or_insert_with(|| {
            trace!(%route, "new route pool");
            let mut pool = RouteSpecificPool::new(route.clone(), config.max_per_route);
            pool.set_max_pending(config.max_pending);
            pool
        })
    }

    fn allocated(&self) -> usize {
        self.routes.values().map(RouteSpecificPool::allocated).sum()
    }

    fn budget(&self) -> usize {
        self.config.max_total.saturating_sub(self.allocated())
    }

    fn lease(&mut self, route: &Route, state: Option<&State>) -> LeaseOutcome<C> {
        if self.shut_down {
            return LeaseOutcome::Rejected(Error::ShutDown);
        }

        if self.route_mut(route).needs_allocation(state) && self.budget() == 0 {
            self.make_room();
        }

        let budget = self.budget();
        self.route_mut(route).lease_within(state, budget)
    }

    fn free(&mut self, mut entry: PoolEntry<C>, reusable: bool) -> Result<(), Error> {
        if reusable {
            if let Some(idle) = self.config.idle_timeout {
                let limit = Instant::now().checked_add(idle);
                let beyond = limit.is_some_and(|limit| entry.expiry() > Some(limit));
                if entry.expiry().is_none() || beyond {
                    entry.update_expiry(Some(idle));
                }
            }
        }

        let Some(pool) = self.routes.get_mut(entry.route()) else {
            return Err(Error::NotOwned {
                entry: entry.id(),
                route: entry.route().clone(),
            });
        };

        pool.free_within(entry, reusable, 0)?;
        self.service_all();
        Ok(())
    }

    fn remove(&mut self, entry: &PoolEntry<C>) -> Result<bool, Error> {
        let Some(pool) = self.routes.get_mut(entry.route()) else {
            return Err(Error::NotOwned {
                entry: entry.id(),
                route: entry.route().clone(),
            });
        };

        let removed = pool.remove_within(entry, 0)?;
        if removed {
            self.service_all();
        }
        Ok(removed)
    }

    fn cancel_pending(&mut self, route: &Route, waiter: WaiterId) -> bool {
        self.routes
            .get_mut(route)
            .is_some_and(|pool| pool.cancel_pending(waiter))
    }

    fn shutdown(&mut self, mode: CloseMode) {
        if self.shut_down {
            return;
        }
        debug!(routes = self.routes.len(), "pool shutting down");
        self.shut_down = true;
        for pool in self.routes.values_mut() {
            pool.shutdown(mode);
        }
    }

    /// Evict the least recently used idle entry across all routes.
    fn make_room(&mut self) -> bool {
        self.routes
            .values_mut()
            .filter(|pool| pool.lru_updated().is_some())
            .min_by_key(|pool| pool.lru_updated())
            .is_some_and(RouteSpecificPool::evict_lru)
    }

    /// Hand capacity freed anywhere in the pool to routes with pending requests.
    fn service_all(&mut self) {
        if self.shut_down {
            return;
        }

        let waiting: Vec<Route> = self
            .routes
            .iter()
            .filter(|(_, pool)| pool.has_pending())
            .map(|(route, _)| route.clone())
            .collect();

        for route in waiting {
            loop {
                let budget = self.budget();
                let Some(pool) = self.routes.get_mut(&route) else {
                    break;
                };
                pool.serve_pending(budget);
                if !pool.is_starved() || self.budget() > 0 || !self.make_room() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::PoolableConnection;
    use crate::CloseMode;

    #[derive(Debug, Clone)]
    pub(crate) struct MockConnection {
        id: u32,
        open: Arc<AtomicBool>,
        closed_with: Arc<Mutex<Option<CloseMode>>>,
    }

    impl MockConnection {
        pub(crate) fn new() -> Self {
            static IDENT: AtomicU32 = AtomicU32::new(1);
            Self {
                id: IDENT.fetch_add(1, Ordering::Relaxed),
                open: Arc::new(AtomicBool::new(true)),
                closed_with: Arc::new(Mutex::new(None)),
            }
        }

        pub(crate) fn id(&self) -> u32 {
            self.id
        }

        pub(crate) fn closed_with(&self) -> Option<CloseMode> {
            *self.closed_with.lock()
        }

        /// Simulate the peer closing the connection.
        pub(crate) fn drop_remote(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    impl PoolableConnection for MockConnection {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&self, mode: CloseMode) {
            self.open.store(false, Ordering::SeqCst);
            self.closed_with.lock().get_or_insert(mode);
        }
    }
}

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::entry::{EntryId, PoolEntry, Slot, State};
use super::lease::{PendingLease, WaiterId};
use super::{Error, PoolableConnection, Route, Stats};
use crate::CloseMode;

/// The result of asking a pool for a connection.
#[derive(Debug)]
pub enum LeaseOutcome<C: PoolableConnection> {
    /// An entry was leased immediately. It may not have a connection yet.
    Leased(PoolEntry<C>),

    /// The route is at capacity; the request was queued.
    Pending(PendingLease<C>),

    /// The request cannot be served.
    Rejected(Error),
}

pub(super) type Delivery<C> = Result<PoolEntry<C>, Error>;

/// Entries delivered to lease requests which were withdrawn before taking them.
/// The route pool reclaims them the next time it is used.
pub(super) type Returned<C> = Arc<Mutex<Vec<PoolEntry<C>>>>;

struct Waiter<C> {
    id: WaiterId,
    state: Option<State>,
    tx: oneshot::Sender<Delivery<C>>,
}

/// Available, leased and pending bookkeeping for one route.
///
/// Available entries are reused most recently released first. Pending lease
/// requests are served in arrival order, except that a request whose affinity
/// matches a released connection is served ahead of those which do not.
///
/// The route pool does no locking of its own; [`Pool`](super::Pool) wraps it in a
/// mutex shared by all callers. Entries delivered to lease requests which are then
/// dropped come back through a small queue and are reclaimed the next time the
/// pool is used.
pub struct RouteSpecificPool<C> {
    route: Route,
    owner: Arc<()>,
    max: usize,
    max_pending: usize,
    next_entry: u64,
    next_waiter: u64,
    available: VecDeque<PoolEntry<C>>,
    leased: HashMap<EntryId, Slot<C>>,
    pending: VecDeque<Waiter<C>>,
    returned: Returned<C>,
    shut_down: bool,
}

impl<C: PoolableConnection> RouteSpecificPool<C> {
    /// Create an empty route pool allowing at most `max` connections.
    pub fn new(route: Route, max: usize) -> Self {
        Self {
            route,
            owner: Arc::new(()),
            max,
            max_pending: usize::MAX,
            next_entry: 1,
            next_waiter: 1,
            available: VecDeque::new(),
            leased: HashMap::new(),
            pending: VecDeque::new(),
            returned: Arc::new(Mutex::new(Vec::new())),
            shut_down: false,
        }
    }

    /// The route served by this pool.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The maximum number of allocated entries.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Change the maximum number of allocated entries.
    ///
    /// Lowering the maximum does not close leased connections; the pool shrinks as
    /// they are returned.
    pub fn set_max(&mut self, max: usize) {
        self.max = max;
    }

    /// Limit the number of queued lease requests. Further requests are rejected.
    pub fn set_max_pending(&mut self, max_pending: usize) {
        self.max_pending = max_pending;
    }

    /// Entries held by the pool or by callers.
    pub fn allocated(&self) -> usize {
        let (returned, reusable) = self.returned_counts();
        self.available.len() + self.leased.len() - returned + reusable
    }

    /// Counts of available, leased and pending entries.
    pub fn stats(&self) -> Stats {
        let (returned, reusable) = self.returned_counts();
        Stats {
            available: self.available.len() + reusable,
            leased: self.leased.len() - returned,
            pending: self.pending.iter().filter(|waiter| !waiter.tx.is_closed()).count(),
            max: self.max,
        }
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Admit a newly created connection, leased to the caller.
    pub fn add(&mut self, connection: C) -> Result<PoolEntry<C>, Error> {
        if self.shut_down {
            connection.close(CloseMode::Immediate);
            return Err(Error::ShutDown);
        }
        Ok(self.allocate(Some(connection)))
    }

    /// Lease an entry.
    ///
    /// Returns an available entry matching `state`, or a new, empty entry if the
    /// route is below its maximum. At the maximum, the least recently used
    /// available entry is evicted to make room, and if nothing is available the
    /// request is queued.
    pub fn lease(&mut self, state: Option<&State>) -> LeaseOutcome<C> {
        self.lease_within(state, usize::MAX)
    }

    /// Lease, allocating a new entry only if `budget` is non-zero.
    pub(super) fn lease_within(&mut self, state: Option<&State>, budget: usize) -> LeaseOutcome<C> {
        if self.shut_down {
            return LeaseOutcome::Rejected(Error::ShutDown);
        }

        if self.reclaim() {
            self.serve_pending(0);
        }
        self.prune_available(Instant::now());

        if let Some(entry) = self.take_available(state) {
            trace!(route = %self.route, entry = %entry.id(), "leased available entry");
            return LeaseOutcome::Leased(self.mark_leased(entry));
        }

        if let Some(entry) = self.allocate_within(budget) {
            return LeaseOutcome::Leased(entry);
        }

        self.enqueue(state.cloned())
    }

    /// Return a leased entry to the pool.
    ///
    /// A reusable entry with an open connection becomes available; otherwise its
    /// connection is closed and its capacity released. Either way, the oldest
    /// suitable pending request is then served.
    pub fn free(&mut self, entry: PoolEntry<C>, reusable: bool) -> Result<(), Error> {
        self.free_within(entry, reusable, usize::MAX)
    }

    /// Free an entry, then serve pending requests with at most `budget` new
    /// entries.
    pub(super) fn free_within(
        &mut self,
        mut entry: PoolEntry<C>,
        reusable: bool,
        budget: usize,
    ) -> Result<(), Error> {
        self.check_owner(&entry)?;

        if self.shut_down {
            entry.discard_connection(CloseMode::Immediate);
            return Ok(());
        }
        self.reclaim();

        if self.leased.remove(&entry.id()).is_none() {
            return Err(Error::NotLeased(entry.id()));
        }

        if reusable && entry.has_open_connection() {
            trace!(route = %self.route, entry = %entry.id(), "entry released");
            entry.touch();
            self.available.push_front(entry);
        } else {
            trace!(route = %self.route, entry = %entry.id(), "entry discarded");
            entry.discard_connection(CloseMode::Graceful);
        }

        self.serve_pending(budget);
        Ok(())
    }

    /// Remove an entry from whichever collection holds it, closing its connection.
    ///
    /// Returns `false` if the entry was already removed.
    pub fn remove(&mut self, entry: &PoolEntry<C>) -> Result<bool, Error> {
        self.remove_within(entry, usize::MAX)
    }

    pub(super) fn remove_within(
        &mut self,
        entry: &PoolEntry<C>,
        budget: usize,
    ) -> Result<bool, Error> {
        self.check_owner(entry)?;
        let reclaimed = self.reclaim();

        let removed = if let Some(slot) = self.leased.remove(&entry.id()) {
            close_slot(&slot, CloseMode::Immediate);
            true
        } else if let Some(position) = self
            .available
            .iter()
            .position(|available| available.id() == entry.id())
        {
            if let Some(mut available) = self.available.remove(position) {
                available.discard_connection(CloseMode::Immediate);
            }
            true
        } else {
            false
        };

        if removed || reclaimed {
            self.serve_pending(budget);
        }
        Ok(removed)
    }

    /// Close every connection, cancel every pending request and clear all
    /// bookkeeping. Entries still held by callers are closed when they are freed.
    pub fn shutdown(&mut self, mode: CloseMode) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.reclaim();

        debug!(
            route = %self.route,
            available = self.available.len(),
            leased = self.leased.len(),
            pending = self.pending.len(),
            "route pool shutting down"
        );

        for mut entry in self.available.drain(..) {
            entry.discard_connection(mode);
        }
        for (_, slot) in self.leased.drain() {
            close_slot(&slot, mode);
        }
        for waiter in self.pending.drain(..) {
            let _ = waiter.tx.send(Err(Error::Cancelled));
        }
    }

    /// Close available connections which have been idle for longer than `idle`.
    pub fn close_idle(&mut self, idle: Duration) -> usize {
        self.reclaim();
        let Some(cutoff) = Instant::now().checked_sub(idle) else {
            return 0;
        };
        self.close_available(|entry| entry.updated() <= cutoff)
    }

    /// Close available connections which have expired or been closed by the peer.
    pub fn close_expired(&mut self) -> usize {
        self.reclaim();
        let now = Instant::now();
        self.close_available(|entry| entry.is_expired(now) || !entry.has_open_connection())
    }

    /// Cancel a pending request, resolving it as cancelled.
    pub(super) fn cancel_pending(&mut self, id: WaiterId) -> bool {
        let Some(position) = self.pending.iter().position(|waiter| waiter.id == id) else {
            return false;
        };
        if let Some(waiter) = self.pending.remove(position) {
            trace!(route = %self.route, waiter = %id, "pending lease cancelled");
            let _ = waiter.tx.send(Err(Error::Cancelled));
        }
        true
    }

    /// Returns `true` if a lease for `state` would need a new allocation.
    pub(super) fn needs_allocation(&self, state: Option<&State>) -> bool {
        !self.available.iter().any(|entry| matches_state(entry, state))
            && self.allocated() < self.max
    }

    /// Close the least recently used available entry.
    pub(super) fn evict_lru(&mut self) -> bool {
        match self.available.pop_back() {
            Some(mut entry) => {
                trace!(route = %self.route, entry = %entry.id(), "evicting idle entry");
                entry.discard_connection(CloseMode::Graceful);
                true
            }
            None => false,
        }
    }

    /// When the least recently used available entry was released.
    pub(super) fn lru_updated(&self) -> Option<Instant> {
        self.available.back().map(PoolEntry::updated)
    }

    pub(super) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pending requests are waiting for capacity this route is allowed to use.
    pub(super) fn is_starved(&self) -> bool {
        self.pending.iter().any(|waiter| !waiter.tx.is_closed()) && self.allocated() < self.max
    }

    /// Serve pending requests in order, allocating at most `budget` new entries.
    /// Returns the number allocated.
    pub(super) fn serve_pending(&mut self, budget: usize) -> usize {
        let mut allocated = 0;
        self.reclaim();
        self.pending.retain(|waiter| !waiter.tx.is_closed());

        while !self.pending.is_empty() {
            // A released connection goes first to the oldest request for its state.
            let affinity = self.pending.iter().position(|waiter| {
                waiter.state.is_some()
                    && self
                        .available
                        .iter()
                        .any(|entry| entry.state() == waiter.state.as_ref())
            });

            let position = affinity.unwrap_or(0);
            let Some(waiter) = self.pending.remove(position) else {
                break;
            };

            let before = self.allocated();
            let entry = match self.take_available(waiter.state.as_ref()) {
                Some(entry) => self.mark_leased(entry),
                None => match self.allocate_within(budget - allocated) {
                    Some(entry) => entry,
                    None => {
                        self.pending.insert(position, waiter);
                        break;
                    }
                },
            };
            let grew = self.allocated() > before;

            trace!(
                route = %self.route,
                waiter = %waiter.id,
                entry = %entry.id(),
                "serving pending lease"
            );
            match waiter.tx.send(Ok(entry)) {
                Ok(()) if grew => allocated += 1,
                Ok(()) => {}
                Err(Ok(entry)) => {
                    // The request went away; return the entry and try the next one.
                    self.leased.remove(&entry.id());
                    if entry.has_open_connection() {
                        self.available.push_front(entry);
                    }
                }
                Err(Err(_)) => {}
            }
        }

        allocated
    }

    fn enqueue(&mut self, state: Option<State>) -> LeaseOutcome<C> {
        self.pending.retain(|waiter| !waiter.tx.is_closed());
        if self.pending.len() >= self.max_pending {
            return LeaseOutcome::Rejected(Error::TooManyPending(self.route.clone()));
        }

        let id = WaiterId(self.next_waiter);
        self.next_waiter += 1;

        let (tx, rx) = oneshot::channel();
        trace!(route = %self.route, waiter = %id, "lease request queued");
        self.pending.push_back(Waiter { id, state, tx });
        let returns = Arc::downgrade(&self.returned);
        LeaseOutcome::Pending(PendingLease::new(self.route.clone(), id, rx, returns))
    }

    /// Take back entries which withdrawn lease requests handed back. Returns
    /// `true` if any were reclaimed.
    fn reclaim(&mut self) -> bool {
        let returned = std::mem::take(&mut *self.returned.lock());
        if returned.is_empty() {
            return false;
        }

        for mut entry in returned {
            if self.shut_down || self.leased.remove(&entry.id()).is_none() {
                entry.discard_connection(CloseMode::Immediate);
            } else if entry.has_open_connection() {
                trace!(
                    route = %self.route,
                    entry = %entry.id(),
                    "reclaimed entry from withdrawn lease"
                );
                entry.touch();
                self.available.push_front(entry);
            } else {
                trace!(
                    route = %self.route,
                    entry = %entry.id(),
                    "released entry from withdrawn lease"
                );
                entry.discard_connection(CloseMode::Graceful);
            }
        }
        true
    }

    /// Returned entries still counted as leased, and how many of those will
    /// become available once reclaimed.
    fn returned_counts(&self) -> (usize, usize) {
        let returned = self.returned.lock();
        returned
            .iter()
            .filter(|entry| self.leased.contains_key(&entry.id()))
            .fold((0, 0), |(count, reusable), entry| {
                (count + 1, reusable + usize::from(entry.has_open_connection()))
            })
    }

    /// Take the most recently released entry matching `state`: an exact state
    /// match first, then an entry without state. Without a requested state, any
    /// entry matches.
    fn take_available(&mut self, state: Option<&State>) -> Option<PoolEntry<C>> {
        let position = match state {
            Some(state) => self
                .available
                .iter()
                .position(|entry| entry.state() == Some(state))
                .or_else(|| self.available.iter().position(|entry| entry.state().is_none())),
            None => (!self.available.is_empty()).then_some(0),
        }?;
        self.available.remove(position)
    }

    /// Allocate a new, empty leased entry, evicting an idle entry if the route is
    /// at its maximum.
    fn allocate_within(&mut self, budget: usize) -> Option<PoolEntry<C>> {
        if self.allocated() >= self.max {
            if self.available.is_empty() || !self.evict_lru() {
                return None;
            }
        } else if budget == 0 {
            return None;
        }
        Some(self.allocate(None))
    }

    fn allocate(&mut self, connection: Option<C>) -> PoolEntry<C> {
        let id = EntryId(self.next_entry);
        self.next_entry += 1;

        let entry = PoolEntry::new(id, self.route.clone(), connection, self.owner.clone());
        trace!(route = %self.route, entry = %id, "entry allocated");
        self.mark_leased(entry)
    }

    fn mark_leased(&mut self, entry: PoolEntry<C>) -> PoolEntry<C> {
        self.leased.insert(entry.id(), entry.slot());
        entry
    }

    fn prune_available(&mut self, now: Instant) {
        self.available.retain_mut(|entry| {
            let keep = !entry.is_expired(now) && entry.has_open_connection();
            if !keep {
                trace!(entry = %entry.id(), "discarding stale entry");
                entry.discard_connection(CloseMode::Immediate);
            }
            keep
        });
    }

    fn close_available<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&PoolEntry<C>) -> bool,
    {
        let before = self.available.len();
        self.available.retain_mut(|entry| {
            if predicate(entry) {
                entry.discard_connection(CloseMode::Graceful);
                false
            } else {
                true
            }
        });
        before - self.available.len()
    }

    fn check_owner(&self, entry: &PoolEntry<C>) -> Result<(), Error> {
        if entry.is_owned_by(&self.owner) {
            Ok(())
        } else {
            Err(Error::NotOwned {
                entry: entry.id(),
                route: entry.route().clone(),
            })
        }
    }

    #[cfg(test)]
    pub(super) fn assert_consistent(&self) {
        use std::collections::HashSet;

        let available: HashSet<_> = self.available.iter().map(PoolEntry::id).collect();
        assert_eq!(available.len(), self.available.len(), "duplicate available entries");
        for id in self.leased.keys() {
            assert!(!available.contains(id), "{id} is both available and leased");
        }
    }
}

fn matches_state<C: PoolableConnection>(entry: &PoolEntry<C>, state: Option<&State>) -> bool {
    match state {
        Some(state) => entry.state().map_or(true, |entry_state| entry_state == state),
        None => true,
    }
}

fn close_slot<C: PoolableConnection>(slot: &Slot<C>, mode: CloseMode) {
    if let Some(connection) = slot.lock().take() {
        connection.close(mode);
    }
}

impl<C> fmt::Debug for RouteSpecificPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSpecificPool")
            .field("route", &crate::DebugLiteral(&self.route))
            .field("available", &self.available.len())
            .field("leased", &self.leased.len())
            .field("pending", &self.pending.len())
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt as _;

    use super::super::mock::MockConnection;
    use super::*;

    fn route() -> Route {
        "http://localhost:8080".parse().unwrap()
    }

    fn connected(
        pool: &mut RouteSpecificPool<MockConnection>,
    ) -> (PoolEntry<MockConnection>, MockConnection) {
        let LeaseOutcome::Leased(mut entry) = pool.lease(None) else {
            panic!("expected a leased entry");
        };
        let connection = MockConnection::new();
        entry.assign_connection(connection.clone());
        (entry, connection)
    }

    fn pending(outcome: LeaseOutcome<MockConnection>) -> PendingLease<MockConnection> {
        match outcome {
            LeaseOutcome::Pending(pending) => pending,
            other => panic!("expected a pending lease, got {other:?}"),
        }
    }

    #[test]
    fn dropped_lease_hands_back_delivered_entry() {
        let _ = tracing_subscriber::fmt::try_init();
        let mut pool = RouteSpecificPool::new(route(), 1);

        let (entry, connection) = connected(&mut pool);
        let waiting = pending(pool.lease(None));
        pool.free(entry, true).unwrap();
        assert_eq!(pool.stats().leased, 1);

        drop(waiting);
        assert_eq!(pool.stats(), Stats { available: 1, leased: 0, pending: 0, max: 1 });
        assert_eq!(pool.allocated(), 1);

        let LeaseOutcome::Leased(entry) = pool.lease(None) else {
            panic!("capacity leaked: {:?}", pool.stats());
        };
        assert_eq!(entry.connection().unwrap().id(), connection.id());
        assert!(connection.closed_with().is_none());
    }

    #[test]
    fn cancelled_lease_hands_back_delivered_entry() {
        let mut pool = RouteSpecificPool::new(route(), 1);

        let (entry, _) = connected(&mut pool);
        let mut waiting = pending(pool.lease(None));
        pool.free(entry, false).unwrap();

        // Delivered as a fresh entry without a connection, so the slot is released.
        assert!(waiting.cancel());
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.allocated(), 0);
        assert!(matches!((&mut waiting).now_or_never(), Some(Err(Error::Cancelled))));

        assert!(matches!(pool.lease(None), LeaseOutcome::Leased(_)));
        assert_eq!(pool.stats().leased, 1);
    }

    #[test]
    fn handed_back_entry_serves_the_next_waiter() {
        let mut pool = RouteSpecificPool::new(route(), 1);

        let (entry, connection) = connected(&mut pool);
        let first = pending(pool.lease(None));
        let mut second = pending(pool.lease(None));
        pool.free(entry, true).unwrap();
        drop(first);

        // The next lease goes behind the request already waiting.
        let mut third = pending(pool.lease(None));
        let entry = (&mut second).now_or_never().unwrap().unwrap();
        assert_eq!(entry.connection().unwrap().id(), connection.id());
        assert!((&mut third).now_or_never().is_none());
    }

    #[test]
    fn handed_back_entries_are_closed_after_shutdown() {
        let mut pool = RouteSpecificPool::new(route(), 1);

        let (entry, connection) = connected(&mut pool);
        let waiting = pending(pool.lease(None));
        pool.free(entry, true).unwrap();

        pool.shutdown(CloseMode::Graceful);
        drop(waiting);
        assert_eq!(pool.close_expired(), 0);
        assert_eq!(connection.closed_with(), Some(CloseMode::Graceful));
        assert_eq!(pool.stats(), Stats { available: 0, leased: 0, pending: 0, max: 1 });
    }

    #[test]
    fn dropping_the_pool_closes_late_deliveries() {
        let mut pool = RouteSpecificPool::new(route(), 1);

        let (entry, connection) = connected(&mut pool);
        let waiting = pending(pool.lease(None));
        pool.free(entry, true).unwrap();

        drop(pool);
        drop(waiting);
        assert_eq!(connection.closed_with(), Some(CloseMode::Immediate));
    }
}

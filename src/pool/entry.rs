use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{PoolableConnection, Route};
use crate::CloseMode;

/// Identifies an entry within the route pool which created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(super) u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Opaque connection state used for lease affinity.
///
/// A connection which carries state (for example, the identity of an
/// authenticated user) is only handed to lease requests asking for the same state,
/// or to requests which do not care.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct State(Arc<str>);

impl State {
    /// The state as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for State {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for State {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The connection slot of an entry, shared with the pool while the entry is leased
/// so that shutdown can close connections it does not hold.
pub(super) type Slot<C> = Arc<Mutex<Option<C>>>;

/// A unit of pool capacity: a route, an optional connection, and bookkeeping.
///
/// An entry is either held by the pool (available) or by exactly one caller
/// (leased). A freshly allocated entry has no connection; the caller connects and
/// [assigns](Self::assign_connection) one.
pub struct PoolEntry<C> {
    id: EntryId,
    route: Route,
    slot: Slot<C>,
    state: Option<State>,
    created: Instant,
    updated: Instant,
    expiry: Option<Instant>,
    owner: Arc<()>,
}

impl<C: PoolableConnection> PoolEntry<C> {
    pub(super) fn new(id: EntryId, route: Route, connection: Option<C>, owner: Arc<()>) -> Self {
        let now = Instant::now();
        Self {
            id,
            route,
            slot: Arc::new(Mutex::new(connection)),
            state: None,
            created: now,
            updated: now,
            expiry: None,
            owner,
        }
    }

    /// The entry's identifier.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// The route this entry connects to.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The connection, if one has been assigned.
    pub fn connection(&self) -> Option<C> {
        self.slot.lock().clone()
    }

    /// Returns `true` if the entry holds a connection which is still open.
    pub fn has_open_connection(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(C::is_open)
    }

    /// Assign a newly established connection to this entry.
    pub fn assign_connection(&mut self, connection: C) {
        let previous = self.slot.lock().replace(connection);
        if let Some(previous) = previous {
            previous.close(CloseMode::Immediate);
        }
        self.updated = Instant::now();
    }

    /// Close and remove the connection, keeping the entry.
    pub fn discard_connection(&mut self, mode: CloseMode) {
        if let Some(connection) = self.slot.lock().take() {
            connection.close(mode);
        }
    }

    /// The affinity state of the connection.
    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// Set the affinity state of the connection.
    pub fn set_state(&mut self, state: Option<State>) {
        self.state = state;
    }

    /// When the entry was created.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// When the entry was last returned to the pool, or its connection assigned.
    pub fn updated(&self) -> Instant {
        self.updated
    }

    /// When the connection stops being eligible for reuse, if ever.
    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// Refresh the expiry to `keep_alive` from now, or clear it.
    pub fn update_expiry(&mut self, keep_alive: Option<Duration>) {
        self.updated = Instant::now();
        self.expiry = keep_alive.and_then(|keep_alive| self.updated.checked_add(keep_alive));
    }

    /// Returns `true` if the entry expired before `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    pub(super) fn touch(&mut self) {
        self.updated = Instant::now();
    }

    pub(super) fn slot(&self) -> Slot<C> {
        self.slot.clone()
    }

    pub(super) fn is_owned_by(&self, owner: &Arc<()>) -> bool {
        Arc::ptr_eq(&self.owner, owner)
    }
}

impl<C> fmt::Debug for PoolEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("route", &crate::DebugLiteral(&self.route))
            .field("state", &self.state)
            .field("expiry", &self.expiry)
            .finish()
    }
}

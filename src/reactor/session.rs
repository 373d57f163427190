use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{CloseMode, Command, EventHandler};
use crate::channel::{self, Channel, Interest};
use crate::http1::Exchange;
use crate::pool::PoolableConnection;
use crate::Error;

/// Identifies a session within its reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Upgrades a session's channel to a secure transport.
///
/// The crate ships no TLS implementation; this is the seam where one plugs in.
pub trait TlsUpgrade {
    /// Wrap `channel` in a secure transport.
    fn upgrade(&self, channel: Box<dyn Channel>) -> io::Result<Box<dyn Channel>>;
}

/// Session state visible from other threads.
#[derive(Debug)]
pub(super) struct SessionShared {
    interest: AtomicU8,
    closed: AtomicBool,
    timeout_ms: AtomicU64,
    notify: Notify,
}

impl SessionShared {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            interest: AtomicU8::new(Interest::READ.bits()),
            closed: AtomicBool::new(false),
            timeout_ms: AtomicU64::new(encode_timeout(timeout)),
            notify: Notify::new(),
        }
    }

    fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Acquire))
    }

    fn add_interest(&self, interest: Interest) {
        self.interest.fetch_or(interest.bits(), Ordering::AcqRel);
    }

    fn remove_interest(&self, interest: Interest) {
        self.interest.fetch_and(!interest.bits(), Ordering::AcqRel);
    }

    fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn encode_timeout(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1))
}

/// A connection managed by the reactor.
///
/// The session owns the channel, the event interest mask, named attributes and
/// the idle timeout. It is owned by one reactor thread; other threads reach it
/// through a [`SessionHandle`].
pub struct Session {
    id: SessionId,
    channel: Box<dyn Channel>,
    shared: Arc<SessionShared>,
    tx: mpsc::UnboundedSender<Command>,
    commands: VecDeque<Command>,
    attributes: HashMap<String, Box<dyn Any>>,
    local_address: Option<String>,
    remote_address: Option<String>,
    last_activity: Instant,
    secure: bool,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        channel: Box<dyn Channel>,
        timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            local_address: channel.local_addr(),
            remote_address: channel.peer_addr(),
            channel,
            shared: Arc::new(SessionShared::new(timeout)),
            tx,
            commands: VecDeque::new(),
            attributes: HashMap::new(),
            last_activity: Instant::now(),
            secure: false,
        };
        (session, rx)
    }

    /// The session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// A handle for reaching this session from other threads.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
    }

    /// The underlying channel.
    pub fn channel(&mut self) -> &mut dyn Channel {
        &mut *self.channel
    }

    /// A description of the local address.
    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    /// A description of the remote address.
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    /// The events this session is waiting for.
    pub fn interest(&self) -> Interest {
        self.shared.interest()
    }

    /// Replace the interest mask.
    pub fn set_interest(&mut self, interest: Interest) {
        self.shared.interest.store(interest.bits(), Ordering::Release);
    }

    /// Wait for the channel to become readable.
    pub fn request_input(&mut self) {
        self.shared.add_interest(Interest::READ);
    }

    /// Stop waiting for the channel to become readable.
    pub fn suspend_input(&mut self) {
        self.shared.remove_interest(Interest::READ);
    }

    /// Wait for the channel to become writable.
    pub fn request_output(&mut self) {
        self.shared.add_interest(Interest::WRITE);
    }

    /// Stop waiting for the channel to become writable.
    pub fn suspend_output(&mut self) {
        self.shared.remove_interest(Interest::WRITE);
    }

    /// Store a named attribute, returning `false` if it replaced another.
    pub fn set_attribute<T: Any>(&mut self, name: impl Into<String>, value: T) -> bool {
        self.attributes.insert(name.into(), Box::new(value)).is_none()
    }

    /// A named attribute, if present and of type `T`.
    pub fn attribute<T: Any>(&self, name: &str) -> Option<&T> {
        self.attributes.get(name).and_then(|value| value.downcast_ref())
    }

    /// A named attribute, mutably.
    pub fn attribute_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.attributes.get_mut(name).and_then(|value| value.downcast_mut())
    }

    /// Remove a named attribute of type `T`.
    pub fn remove_attribute<T: Any>(&mut self, name: &str) -> Option<T> {
        match self.attributes.remove(name)?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                self.attributes.insert(name.to_owned(), value);
                None
            }
        }
    }

    /// The idle timeout.
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.shared.timeout()
    }

    /// Set the idle timeout. `None` disables it.
    pub fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        self.shared
            .timeout_ms
            .store(encode_timeout(timeout), Ordering::Release);
    }

    /// When the session last saw an I/O event.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Take the next queued command.
    pub fn poll_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Returns `true` if commands are queued.
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Queue a command from the owning thread.
    pub fn enqueue(&mut self, command: Command) {
        self.commands.push_back(command);
        self.request_output();
    }

    /// Returns `true` once the session has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the session. A graceful close shuts down the write half of the channel
    /// so the peer sees end of stream; callers flush their output first.
    pub fn close(&mut self, mode: CloseMode) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(session = %self.id, %mode, "closing session");
        if mode == CloseMode::Graceful {
            if let Err(error) = self.channel.shutdown_output() {
                trace!(session = %self.id, %error, "shutdown of output failed");
            }
        }
        self.shared.notify.notify_one();
    }

    /// Returns `true` once the channel has been upgraded with [`start_tls`](Self::start_tls).
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Replace the channel with a secure one.
    pub fn start_tls(&mut self, upgrade: &dyn TlsUpgrade) -> Result<(), Error> {
        if self.secure {
            return Err(Error::IllegalState("session is already secure"));
        }
        let channel = std::mem::replace(&mut self.channel, Box::new(Detached));
        self.channel = upgrade.upgrade(channel)?;
        self.secure = true;
        debug!(session = %self.id, "session upgraded to a secure channel");
        Ok(())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn deadline(&self, interval: Duration) -> Instant {
        let tick = Instant::now() + interval;
        match self.socket_timeout() {
            Some(timeout) => (self.last_activity + timeout).min(tick),
            None => tick,
        }
    }

    fn is_timed_out(&self) -> bool {
        self.socket_timeout()
            .is_some_and(|timeout| self.last_activity + timeout <= Instant::now())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("interest", &self.interest())
            .field("closed", &self.is_closed())
            .field("remote", &self.remote_address)
            .field("commands", &self.commands.len())
            .finish()
    }
}

/// Reaches a session from any thread.
///
/// Handles enqueue commands, adjust interest and observe whether the session is
/// still open. They are also what the connection pool holds for each pooled
/// connection.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    shared: Arc<SessionShared>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// The session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a command and wake the session.
    ///
    /// A command sent to a closed session is failed with
    /// [`Error::ConnectionClosed`], which is also returned.
    pub fn enqueue(&self, command: Command) -> Result<(), Error> {
        if self.is_closed() {
            command.fail(Error::ConnectionClosed);
            return Err(Error::ConnectionClosed);
        }

        if let Err(mpsc::error::SendError(command)) = self.tx.send(command) {
            command.fail(Error::ConnectionClosed);
            return Err(Error::ConnectionClosed);
        }

        self.shared.add_interest(Interest::WRITE);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Run an exchange on the session.
    pub fn execute(&self, exchange: Exchange) -> Result<(), Error> {
        self.enqueue(Command::Execute(exchange))
    }

    /// Ask the session to close. An immediate close marks the session closed at
    /// once; a graceful one lets its handler finish in-flight work.
    pub fn shutdown(&self, mode: CloseMode) {
        if mode == CloseMode::Immediate {
            self.shared.closed.store(true, Ordering::Release);
        }
        let _ = self.tx.send(Command::Shutdown(mode));
        self.shared.notify.notify_one();
    }

    /// Returns `true` once the session has closed or been asked to close at once.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait for the channel to become writable.
    pub fn request_output(&self) {
        self.shared.add_interest(Interest::WRITE);
        self.shared.notify.notify_one();
    }

    /// Set the idle timeout.
    pub fn set_socket_timeout(&self, timeout: Option<Duration>) {
        self.shared
            .timeout_ms
            .store(encode_timeout(timeout), Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl PoolableConnection for SessionHandle {
    fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn close(&self, mode: CloseMode) {
        self.shutdown(mode);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// What woke the session loop.
enum Event {
    Wakeup,
    Ready(io::Result<Interest>),
    Tick,
}

/// Drive a session until it closes, dispatching events to its handler.
pub(super) async fn run(
    mut session: Session,
    mut handler: Box<dyn EventHandler>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    interval: Duration,
) {
    let shared = session.shared.clone();

    if let Err(error) = handler.connected(&mut session) {
        handler.exception(&mut session, error);
        session.close(CloseMode::Immediate);
    }

    while !session.is_closed() {
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Shutdown(CloseMode::Immediate) => session.close(CloseMode::Immediate),
                Command::Shutdown(CloseMode::Graceful) => {
                    if let Err(error) = handler.shutdown(&mut session, CloseMode::Graceful) {
                        handler.exception(&mut session, error);
                        session.close(CloseMode::Immediate);
                    }
                }
                command => session.enqueue(command),
            }
        }

        if session.is_closed() {
            break;
        }

        let interest = session.interest();
        let deadline = session.deadline(interval);
        let channel = &*session.channel;

        let event = tokio::select! {
            biased;
            _ = shared.notify.notified() => Event::Wakeup,
            ready = poll_fn(|cx| poll_interest(channel, cx, interest)), if !interest.is_empty() => {
                Event::Ready(ready)
            }
            _ = tokio::time::sleep_until(deadline) => Event::Tick,
        };

        let result = match event {
            Event::Wakeup => Ok(()),
            Event::Ready(Ok(ready)) => {
                session.touch();
                let mut result = Ok(());
                if ready.is_readable() {
                    result = handler.input_ready(&mut session);
                }
                if result.is_ok() && ready.is_writable() && !session.is_closed() {
                    result = handler.output_ready(&mut session);
                }
                result
            }
            Event::Ready(Err(error)) => Err(Error::Io(error)),
            Event::Tick if session.is_timed_out() => {
                trace!(session = %session.id, "session timed out");
                session.touch();
                handler.timeout(&mut session)
            }
            Event::Tick => Ok(()),
        };

        if let Err(error) = result {
            handler.exception(&mut session, error);
            session.close(CloseMode::Immediate);
        }
    }

    handler.disconnected(&mut session);

    rx.close();
    let queued: Vec<Command> = session.commands.drain(..).collect();
    for command in queued {
        command.fail(Error::ConnectionClosed);
    }
    while let Ok(command) = rx.try_recv() {
        command.fail(Error::ConnectionClosed);
    }
    trace!(session = %session.id, "session finished");
}

fn poll_interest(
    channel: &dyn Channel,
    cx: &mut Context<'_>,
    interest: Interest,
) -> Poll<io::Result<Interest>> {
    channel::poll_ready(channel, cx, interest)
}

/// Stands in for the channel while it is being upgraded.
struct Detached;

impl Channel for Detached {
    fn poll_read_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
    }

    fn poll_write_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
    }

    fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn try_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        Ok(())
    }
}

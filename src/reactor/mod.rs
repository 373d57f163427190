//! Event-driven I/O reactor.
//!
//! An [`IOReactor`] runs a fixed number of worker threads. Each worker owns a
//! disjoint set of [`Session`]s and waits for readiness on all of them, dispatching
//! `input_ready` and `output_ready` to the session's [`EventHandler`]. Handlers
//! steer the loop through the session's interest mask. Other threads reach a
//! session only through its [`SessionHandle`], which enqueues [`Command`]s that
//! the owning worker drains once per loop iteration.

use std::fmt;
use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::SockRef;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

mod command;
mod handler;
mod session;
mod worker;

pub use self::command::{CloseMode, Command};
pub use self::handler::{Attachment, EventHandler, HandlerFactory};
pub use self::session::{Session, SessionHandle, SessionId, TlsUpgrade};

use self::worker::{Shared, WorkerCommand};
use crate::channel::RawStream;
use crate::notify::{self, Completion};
use crate::Error;

/// Configuration for an [`IOReactor`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ReactorConfig {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Longest a worker waits before re-checking session timeouts.
    pub select_interval: Duration,

    /// Idle timeout given to new sessions.
    pub socket_timeout: Option<Duration>,

    /// Time allowed for an outgoing connection to be established.
    pub connect_timeout: Option<Duration>,

    /// Disable Nagle's algorithm on TCP sockets.
    pub tcp_nodelay: bool,

    /// Enable TCP keep-alive probes.
    pub so_keepalive: bool,

    /// Linger on close for up to this long.
    pub so_linger: Option<Duration>,

    /// Socket send buffer size.
    pub send_buffer_size: Option<usize>,

    /// Socket receive buffer size.
    pub recv_buffer_size: Option<usize>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map_or(1, |count| count.get()),
            select_interval: Duration::from_secs(1),
            socket_timeout: Some(Duration::from_secs(180)),
            connect_timeout: Some(Duration::from_secs(30)),
            tcp_nodelay: true,
            so_keepalive: false,
            so_linger: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl ReactorConfig {
    /// Set the number of worker threads. At least one worker always runs.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the select interval.
    pub fn with_select_interval(mut self, interval: Duration) -> Self {
        self.select_interval = interval;
        self
    }

    /// Set the idle timeout given to new sessions.
    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set `TCP_NODELAY`.
    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Set `SO_KEEPALIVE`.
    pub fn with_so_keepalive(mut self, keepalive: bool) -> Self {
        self.so_keepalive = keepalive;
        self
    }

    /// Set `SO_LINGER`.
    pub fn with_so_linger(mut self, linger: Option<Duration>) -> Self {
        self.so_linger = linger;
        self
    }

    /// Set the socket send buffer size.
    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Set the socket receive buffer size.
    pub fn with_recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub(crate) fn apply(&self, socket: &SockRef<'_>, tcp: bool) -> io::Result<()> {
        if tcp {
            socket.set_nodelay(self.tcp_nodelay)?;
            socket.set_keepalive(self.so_keepalive)?;
        }
        if let Some(linger) = self.so_linger {
            socket.set_linger(Some(linger))?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Lifecycle of an [`IOReactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IOReactorStatus {
    /// Created but not started.
    Inactive,

    /// Workers are running.
    Active,

    /// Shutdown was requested and workers are draining.
    ShuttingDown,

    /// Every worker has stopped.
    ShutDown,
}

impl fmt::Display for IOReactorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IOReactorStatus::Inactive => f.write_str("inactive"),
            IOReactorStatus::Active => f.write_str("active"),
            IOReactorStatus::ShuttingDown => f.write_str("shutting down"),
            IOReactorStatus::ShutDown => f.write_str("shut down"),
        }
    }
}

#[derive(Debug)]
struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    done: Completion,
}

#[derive(Debug)]
struct ReactorState {
    status: IOReactorStatus,
    workers: Vec<WorkerHandle>,
}

impl ReactorState {
    fn refresh(&mut self) -> IOReactorStatus {
        if self.status == IOReactorStatus::ShuttingDown
            && self.workers.iter().all(|worker| worker.done.is_complete())
        {
            self.status = IOReactorStatus::ShutDown;
        }
        self.status
    }
}

#[derive(Debug)]
struct ReactorInner {
    shared: Arc<Shared>,
    state: Mutex<ReactorState>,
}

/// A multi-threaded reactor multiplexing sessions over a fixed set of workers.
///
/// The reactor is cheap to clone; clones share the same workers. Dropping the
/// last clone stops the workers, closing their sessions immediately.
#[derive(Debug, Clone)]
pub struct IOReactor {
    inner: Arc<ReactorInner>,
}

impl IOReactor {
    /// Create a reactor which builds a handler for every session with `factory`.
    pub fn new<F>(config: ReactorConfig, factory: F) -> Self
    where
        F: HandlerFactory,
    {
        Self {
            inner: Arc::new(ReactorInner {
                shared: Arc::new(Shared::new(config, Arc::new(factory))),
                state: Mutex::new(ReactorState {
                    status: IOReactorStatus::Inactive,
                    workers: Vec::new(),
                }),
            }),
        }
    }

    /// The reactor configuration.
    pub fn config(&self) -> &ReactorConfig {
        &self.inner.shared.config
    }

    /// The current lifecycle status.
    pub fn status(&self) -> IOReactorStatus {
        self.inner.state.lock().refresh()
    }

    /// The number of open sessions across all workers.
    pub fn session_count(&self) -> usize {
        self.inner.shared.session_count()
    }

    /// Start the worker threads.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.status != IOReactorStatus::Inactive {
            return Err(Error::IllegalState("reactor already started"));
        }

        let count = self.config().worker_count.max(1);
        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let (signal, done) = notify::signal();
            if let Err(error) = worker::spawn(index, self.inner.shared.clone(), rx, signal) {
                for worker in &state.workers {
                    let _ = worker.tx.send(WorkerCommand::Shutdown(CloseMode::Immediate));
                }
                state.status = IOReactorStatus::ShuttingDown;
                return Err(error.into());
            }
            state.workers.push(WorkerHandle { tx, done });
        }

        self.inner
            .shared
            .set_workers(state.workers.iter().map(|worker| worker.tx.downgrade()).collect());
        state.status = IOReactorStatus::Active;
        debug!(workers = count, "reactor started");
        Ok(())
    }

    fn send(&self, worker: Option<usize>, command: WorkerCommand) -> Result<(), Error> {
        let state = self.inner.state.lock();
        match state.status {
            IOReactorStatus::Active => {}
            IOReactorStatus::Inactive => return Err(Error::IllegalState("reactor not started")),
            IOReactorStatus::ShuttingDown | IOReactorStatus::ShutDown => {
                return Err(Error::Shutdown)
            }
        }

        let index = worker.unwrap_or_else(|| self.inner.shared.next_worker(state.workers.len()));
        state.workers[index % state.workers.len()]
            .tx
            .send(command)
            .map_err(|_| Error::Shutdown)
    }

    /// Open an outgoing TCP connection and create a session for it.
    ///
    /// `attachment` is passed to the handler factory.
    pub async fn connect(
        &self,
        address: SocketAddr,
        attachment: Option<Attachment>,
    ) -> Result<SessionHandle, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(
            None,
            WorkerCommand::Connect {
                address,
                attachment,
                reply,
            },
        )?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Create a session for an already connected socket.
    pub async fn register(
        &self,
        stream: impl Into<RawStream>,
        attachment: Option<Attachment>,
    ) -> Result<SessionHandle, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(
            None,
            WorkerCommand::Register {
                stream: stream.into(),
                attachment,
                reply: Some(reply),
            },
        )?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Bind a TCP listener. Accepted connections are spread across the workers in turn.
    pub fn listen(&self, address: SocketAddr) -> Result<ListenerEndpoint, Error> {
        let listener = std::net::TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        let stop = Arc::new(Notify::new());
        let (signal, closed) = notify::signal();

        self.send(
            Some(0),
            WorkerCommand::Listen {
                listener,
                stop: stop.clone(),
                signal,
            },
        )?;

        debug!(%address, "listening");
        Ok(ListenerEndpoint {
            address,
            stop,
            closed,
        })
    }

    /// Shut the reactor down.
    ///
    /// Queued commands are failed first, then every session is asked to close with
    /// `mode`. An immediate shutdown after a graceful one escalates the sessions
    /// which are still open.
    pub fn shutdown(&self, mode: CloseMode) {
        let mut state = self.inner.state.lock();
        match state.status {
            IOReactorStatus::Inactive => {
                state.status = IOReactorStatus::ShutDown;
                return;
            }
            IOReactorStatus::ShutDown => return,
            IOReactorStatus::Active => {
                debug!(%mode, "reactor shutting down");
                state.status = IOReactorStatus::ShuttingDown;
                for worker in &state.workers {
                    let _ = worker.tx.send(WorkerCommand::Shutdown(mode));
                }
            }
            IOReactorStatus::ShuttingDown => {}
        }
        drop(state);

        if mode == CloseMode::Immediate {
            for handle in self.inner.shared.sessions(None) {
                handle.shutdown(CloseMode::Immediate);
            }
        }
    }

    /// Wait up to `timeout` for every worker to stop. Returns `true` if they did.
    pub async fn await_shutdown(&self, timeout: Duration) -> bool {
        let completions: Vec<Completion> = self
            .inner
            .state
            .lock()
            .workers
            .iter()
            .map(|worker| worker.done.clone())
            .collect();

        let finished =
            futures_util::future::join_all(completions.into_iter().map(IntoFuture::into_future));
        let stopped = tokio::time::timeout(timeout, finished).await.is_ok();
        self.inner.state.lock().refresh();
        stopped
    }
}

/// A listening socket owned by a reactor worker.
#[derive(Debug)]
pub struct ListenerEndpoint {
    address: SocketAddr,
    stop: Arc<Notify>,
    closed: Completion,
}

impl ListenerEndpoint {
    /// The bound address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting connections. Sessions already accepted are unaffected.
    pub fn close(&self) {
        self.stop.notify_one();
    }

    /// Returns `true` once the listener has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_complete()
    }

    /// Wait for the listener to stop.
    pub async fn closed(&self) {
        self.closed.clone().await;
    }
}

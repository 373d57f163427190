use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, trace, warn, Instrument};

use super::session::{self, Session, SessionHandle, SessionId};
use super::{Attachment, CloseMode, HandlerFactory, ReactorConfig};
use crate::channel::{Channel, RawStream};
use crate::notify::Signal;
use crate::Error;

pub(super) type Reply = oneshot::Sender<Result<SessionHandle, Error>>;

/// Work sent to a reactor worker.
pub(super) enum WorkerCommand {
    Register {
        stream: RawStream,
        attachment: Option<Attachment>,
        reply: Option<Reply>,
    },
    Connect {
        address: SocketAddr,
        attachment: Option<Attachment>,
        reply: Reply,
    },
    Listen {
        listener: std::net::TcpListener,
        stop: Arc<Notify>,
        signal: Signal,
    },
    Shutdown(CloseMode),
}

impl WorkerCommand {
    fn fail(self, error: Error) {
        match self {
            WorkerCommand::Register {
                reply: Some(reply), ..
            }
            | WorkerCommand::Connect { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            _ => {}
        }
    }
}

impl fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCommand::Register { stream, .. } => {
                f.debug_tuple("Register").field(stream).finish()
            }
            WorkerCommand::Connect { address, .. } => {
                f.debug_tuple("Connect").field(address).finish()
            }
            WorkerCommand::Listen { listener, .. } => {
                f.debug_tuple("Listen").field(listener).finish()
            }
            WorkerCommand::Shutdown(mode) => f.debug_tuple("Shutdown").field(mode).finish(),
        }
    }
}

/// State shared by every worker of one reactor.
pub(super) struct Shared {
    pub(super) config: ReactorConfig,
    factory: Arc<dyn HandlerFactory>,
    ids: AtomicU64,
    next_worker: AtomicUsize,
    sessions: Mutex<HashMap<SessionId, (usize, SessionHandle)>>,
    workers: Mutex<Vec<mpsc::WeakUnboundedSender<WorkerCommand>>>,
}

impl Shared {
    pub(super) fn new(config: ReactorConfig, factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            config,
            factory,
            ids: AtomicU64::new(1),
            next_worker: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn set_workers(&self, workers: Vec<mpsc::WeakUnboundedSender<WorkerCommand>>) {
        *self.workers.lock() = workers;
    }

    /// The index of the worker which should take the next session.
    pub(super) fn next_worker(&self, count: usize) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % count.max(1)
    }

    /// Hand an accepted socket to the next worker in turn.
    fn dispatch(&self, stream: RawStream) {
        let workers: Vec<_> = self.workers.lock().clone();
        if workers.is_empty() {
            return;
        }

        let start = self.next_worker(workers.len());
        let mut command = WorkerCommand::Register {
            stream,
            attachment: None,
            reply: None,
        };

        for offset in 0..workers.len() {
            let index = (start + offset) % workers.len();
            let Some(worker) = workers[index].upgrade() else {
                continue;
            };
            match worker.send(command) {
                Ok(()) => {
                    trace!(worker = index, "dispatched accepted connection");
                    return;
                }
                Err(mpsc::error::SendError(returned)) => command = returned,
            }
        }
        debug!("no worker accepted the connection");
    }

    /// Sessions which are still open, optionally limited to one worker.
    pub(super) fn sessions(&self, worker: Option<usize>) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .values()
            .filter(|(index, _)| worker.map_or(true, |worker| worker == *index))
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    pub(super) fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Start a worker on its own thread.
///
/// The worker runs a single-threaded runtime and owns every session it creates.
/// `signal` fires when the thread exits.
pub(super) fn spawn(
    index: usize,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<WorkerCommand>,
    signal: Signal,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name(format!("warpcore-worker-{index}"))
        .spawn(move || {
            let _signal = signal;
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    warn!(worker = index, %error, "unable to start worker runtime");
                    return;
                }
            };

            let worker = Worker::new(index, shared);
            let local = LocalSet::new();
            local.block_on(&runtime, worker.run(rx));
            trace!(worker = index, "worker finished");
        })?;
    Ok(())
}

struct Worker {
    index: usize,
    shared: Arc<Shared>,
    closing: watch::Sender<bool>,
    sessions: JoinSet<()>,
    listeners: JoinSet<()>,
}

impl Worker {
    fn new(index: usize, shared: Arc<Shared>) -> Self {
        Self {
            index,
            shared,
            closing: watch::Sender::new(false),
            sessions: JoinSet::new(),
            listeners: JoinSet::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
        debug!(worker = self.index, "worker started");

        let mode = loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(WorkerCommand::Shutdown(mode)) => break mode,
                    Some(command) => self.handle(command),
                    None => break CloseMode::Immediate,
                },
                Some(_) = self.sessions.join_next(), if !self.sessions.is_empty() => {},
                Some(_) = self.listeners.join_next(), if !self.listeners.is_empty() => {},
            }
        };

        debug!(worker = self.index, %mode, "worker shutting down");
        self.closing.send_replace(true);

        rx.close();
        while let Ok(command) = rx.try_recv() {
            command.fail(Error::Shutdown);
        }

        self.listeners.shutdown().await;
        for handle in self.shared.sessions(Some(self.index)) {
            handle.shutdown(mode);
        }

        while self.sessions.join_next().await.is_some() {}
    }

    fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Register {
                stream,
                attachment,
                reply,
            } => {
                let result = self.register(stream, attachment);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(error) = result {
                    debug!(worker = self.index, %error, "unable to register connection");
                }
            }
            WorkerCommand::Connect {
                address,
                attachment,
                reply,
            } => self.connect(address, attachment, reply),
            WorkerCommand::Listen { listener, stop, signal } => {
                let shared = Arc::downgrade(&self.shared);
                self.listeners.spawn_local(accept(listener, stop, signal, shared));
            }
            WorkerCommand::Shutdown(_) => {}
        }
    }

    fn register(
        &mut self,
        stream: RawStream,
        attachment: Option<Attachment>,
    ) -> Result<SessionHandle, Error> {
        self.shared.config.apply(&stream.sock_ref(), stream.is_tcp())?;
        let channel = stream.into_channel()?;
        let (handle, session) = open(self.index, &self.shared, channel, attachment);
        self.sessions.spawn_local(session);
        Ok(handle)
    }

    fn connect(&mut self, address: SocketAddr, attachment: Option<Attachment>, reply: Reply) {
        let index = self.index;
        let shared = self.shared.clone();
        let mut closing = self.closing.subscribe();
        let timeout = shared.config.connect_timeout;

        self.sessions.spawn_local(
            async move {
                let connected = tokio::select! {
                    connected = connect(address, timeout) => connected,
                    _ = closing.wait_for(|closing| *closing) => Err(Error::Shutdown),
                };

                let stream = match connected {
                    Ok(stream) => stream,
                    Err(error) => {
                        debug!(%error, "connect failed");
                        let _ = reply.send(Err(error));
                        return;
                    }
                };

                let applied = shared.config.apply(&socket2::SockRef::from(&stream), true);
                let channel: Box<dyn Channel> = match applied {
                    Ok(()) => Box::new(stream),
                    Err(error) => {
                        let _ = reply.send(Err(error.into()));
                        return;
                    }
                };

                let (handle, session) = open(index, &shared, channel, attachment);
                if reply.send(Ok(handle.clone())).is_err() {
                    trace!(session = %handle.id(), "connect abandoned by caller");
                    handle.shutdown(CloseMode::Immediate);
                }
                session.await;
            }
            .instrument(tracing::debug_span!("connect", %address)),
        );
    }
}

async fn connect(address: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream, Error> {
    trace!(%address, "connecting");
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(Error::Timeout(timeout)),
        },
        None => Ok(TcpStream::connect(address).await?),
    }
}

/// Create a session for `channel` and return its handle with the future driving it.
fn open(
    worker: usize,
    shared: &Arc<Shared>,
    channel: Box<dyn Channel>,
    attachment: Option<Attachment>,
) -> (SessionHandle, impl Future<Output = ()>) {
    let id = SessionId(shared.ids.fetch_add(1, Ordering::Relaxed));
    let (mut session, rx) = Session::new(id, channel, shared.config.socket_timeout);
    let handler = shared.factory.create(&mut session, attachment);
    let handle = session.handle();
    shared.sessions.lock().insert(id, (worker, handle.clone()));
    debug!(session = %id, worker, remote = ?session.remote_address(), "session opened");

    let interval = shared.config.select_interval;
    let shared = shared.clone();
    let future = async move {
        session::run(session, handler, rx, interval).await;
        shared.sessions.lock().remove(&id);
        debug!(session = %id, "session closed");
    }
    .instrument(tracing::debug_span!("session", %id));

    (handle, future)
}

async fn accept(
    listener: std::net::TcpListener,
    stop: Arc<Notify>,
    signal: Signal,
    shared: Weak<Shared>,
) {
    let _signal = signal;
    let listener = match listener
        .set_nonblocking(true)
        .and_then(|()| TcpListener::from_std(listener))
    {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%error, "unable to register listener");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    trace!(%remote, "accepted connection");
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    match stream.into_std() {
                        Ok(stream) => shared.dispatch(RawStream::Tcp(stream)),
                        Err(error) => debug!(%error, "unable to detach accepted connection"),
                    }
                }
                Err(error) => {
                    debug!(%error, "accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }

    debug!(address = ?listener.local_addr().ok(), "listener closed");
}

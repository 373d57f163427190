//! A pooled HTTP/1.x client.
//!
//! The [`Client`] joins the three lower layers: it leases a connection slot from
//! the [`Pool`], connects through the [`IOReactor`] when the slot has no open
//! connection, and runs the exchange on the session's
//! [`ClientDuplexer`](crate::http1::ClientDuplexer). The connection is returned to
//! the pool afterwards, for reuse if the session is still open.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::cancel::{Cancellable, ComplexCancellable};
use crate::http1::{
    keep_alive_timeout, ClientHandlerFactory, Exchange, Http1Config, Request, Response,
};
use crate::pool::{self, LeaseOutcome, Pool, PoolableConnection, Route, State};
use crate::reactor::{IOReactor, ReactorConfig, SessionHandle};
use crate::{CloseMode, Error};

/// Configuration for a [`Client`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Reactor threads, timeouts and socket options.
    pub reactor: ReactorConfig,

    /// Connection pool limits.
    pub pool: pool::Config,

    /// Buffer sizes and limits for each connection.
    pub http1: Http1Config,
}

impl ClientConfig {
    /// Set the reactor configuration.
    pub fn with_reactor(mut self, reactor: ReactorConfig) -> Self {
        self.reactor = reactor;
        self
    }

    /// Set the pool configuration.
    pub fn with_pool(mut self, pool: pool::Config) -> Self {
        self.pool = pool;
        self
    }

    /// Set the HTTP/1.x configuration.
    pub fn with_http1(mut self, http1: Http1Config) -> Self {
        self.http1 = http1;
        self
    }
}

#[derive(Debug)]
struct ClientInner {
    reactor: IOReactor,
    pool: Pool<SessionHandle>,
}

/// An HTTP/1.x client with a per-route connection pool.
///
/// Clients are cheap to clone; clones share the reactor and the pool.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start a client with its own reactor.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let reactor = IOReactor::new(config.reactor, ClientHandlerFactory::new(config.http1));
        reactor.start()?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                reactor,
                pool: Pool::new(config.pool),
            }),
        })
    }

    /// The connection pool.
    pub fn pool(&self) -> &Pool<SessionHandle> {
        &self.inner.pool
    }

    /// The reactor running the connections.
    pub fn reactor(&self) -> &IOReactor {
        &self.inner.reactor
    }

    /// Send `request` on `route`.
    pub fn execute(&self, route: Route, request: Request) -> ResponseFuture {
        self.execute_with_state(route, None, request)
    }

    /// Send `request` on `route`, preferring a connection which carries `state`.
    ///
    /// The connection is tagged with `state` once the exchange completes.
    pub fn execute_with_state(
        &self,
        route: Route,
        state: Option<State>,
        request: Request,
    ) -> ResponseFuture {
        let cancellable = Arc::new(ComplexCancellable::new());
        let inner = self.inner.clone();
        let token = cancellable.clone();

        let future = async move {
            match inner.execute(route, state, request, &token).await {
                Err(error) if token.is_cancelled() => {
                    trace!(%error, "exchange cancelled");
                    Err(Error::Cancelled)
                }
                result => result,
            }
        };

        ResponseFuture {
            future: Box::pin(future),
            cancellable,
        }
    }

    /// Shut down the pool and the reactor.
    pub fn shutdown(&self, mode: CloseMode) {
        debug!(%mode, "client shutting down");
        self.inner.pool.shutdown(mode);
        self.inner.reactor.shutdown(mode);
    }

    /// Wait up to `timeout` for the reactor to stop.
    pub async fn await_shutdown(&self, timeout: Duration) -> bool {
        self.inner.reactor.await_shutdown(timeout).await
    }
}

impl ClientInner {
    async fn execute(
        &self,
        route: Route,
        state: Option<State>,
        mut request: Request,
        cancellable: &ComplexCancellable,
    ) -> Result<Response, Error> {
        let entry = match self.pool.lease(&route, state.as_ref()) {
            LeaseOutcome::Leased(entry) => entry,
            LeaseOutcome::Pending(pending) => {
                if !cancellable.set_dependency(Arc::new(pending.canceller())) {
                    return Err(Error::Cancelled);
                }
                pending.await?
            }
            LeaseOutcome::Rejected(error) => return Err(error.into()),
        };
        let mut entry = self.pool.guard(entry);

        let session = match entry.connection().filter(PoolableConnection::is_open) {
            Some(session) => {
                trace!(session = %session.id(), entry = %entry.id(), "reusing connection");
                session
            }
            None => {
                let session = self.connect(&route, cancellable).await?;
                entry.assign_connection(session.clone());
                session
            }
        };

        if !request.head.headers.contains("host") {
            request.head.headers.set("Host", route.host_header());
        }

        let handle = session.clone();
        let abort = move || {
            handle.shutdown(CloseMode::Immediate);
            true
        };
        if !cancellable.set_dependency(Arc::new(abort)) {
            return Err(Error::Cancelled);
        }

        let in_flight = InFlight(Some(session.clone()));
        let (exchange, rx) = Exchange::new(request);
        session.execute(exchange)?;
        let response = rx.await.map_err(|_| Error::ConnectionClosed)??;
        cancellable.clear_dependency();
        in_flight.finish();

        let reusable = session.is_open();
        if reusable {
            if let Some(keep_alive) = keep_alive_timeout(response.headers()) {
                entry.update_expiry(Some(keep_alive));
            }
            if state.is_some() {
                entry.set_state(state);
            }
        }
        entry.set_reusable(reusable);
        Ok(response)
    }

    async fn connect(
        &self,
        route: &Route,
        cancellable: &ComplexCancellable,
    ) -> Result<SessionHandle, Error> {
        if route.is_secure() {
            return Err(Error::IllegalState("no secure transport is available for https routes"));
        }

        let aborted = Arc::new(Notify::new());
        let signal = aborted.clone();
        let abort = move || {
            signal.notify_one();
            true
        };
        if !cancellable.set_dependency(Arc::new(abort)) {
            return Err(Error::Cancelled);
        }

        tokio::select! {
            connected = self.connect_any(route) => connected,
            _ = aborted.notified() => Err(Error::Cancelled),
        }
    }

    async fn connect_any(&self, route: &Route) -> Result<SessionHandle, Error> {
        let addresses: Vec<SocketAddr> = tokio::net::lookup_host((route.host(), route.port()))
            .await?
            .collect();

        let mut last = None;
        for address in addresses {
            trace!(%route, %address, "connecting");
            match self.reactor.connect(address, None).await {
                Ok(session) => {
                    debug!(%route, %address, session = %session.id(), "connected");
                    return Ok(session);
                }
                Err(error) => {
                    debug!(%route, %address, %error, "connection attempt failed");
                    last = Some(error);
                }
            }
        }

        Err(last.unwrap_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {route}"),
            ))
        }))
    }
}

/// Closes a session immediately unless the exchange running on it finishes, so
/// that its pool slot is only released once the session is gone.
struct InFlight(Option<SessionHandle>);

impl InFlight {
    fn finish(mut self) {
        self.0 = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            trace!(session = %session.id(), "exchange abandoned");
            session.shutdown(CloseMode::Immediate);
        }
    }
}

/// The response to a request sent with [`Client::execute`].
///
/// The exchange can be cancelled while it waits for a connection, while it
/// connects, or while the request is in flight. A cancelled exchange resolves to
/// [`Error::Cancelled`] and its connection is not reused.
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    future: BoxFuture<'static, Result<Response, Error>>,
    cancellable: Arc<ComplexCancellable>,
}

impl ResponseFuture {
    /// Cancel the exchange. Returns `false` if it was already cancelled.
    pub fn cancel(&self) -> bool {
        self.cancellable.cancel()
    }

    /// A handle which cancels the exchange from elsewhere.
    pub fn canceller(&self) -> Arc<dyn Cancellable> {
        self.cancellable.clone()
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("cancelled", &self.cancellable.is_cancelled())
            .finish()
    }
}

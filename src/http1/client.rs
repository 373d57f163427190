use std::time::Duration;

use http::{Method, StatusCode, Version};
use tracing::{debug, trace};

use super::{
    keep_alive, BodyReader, BodyWriter, Exchange, Http1Config, Request, Responder, Response,
};
use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::codec::FramingMode;
use crate::message::{MessageWriter, ResponseHead, ResponseParser};
use crate::reactor::{Attachment, CloseMode, Command, EventHandler, HandlerFactory, Session};
use crate::{Error, ProtocolError};

#[derive(Debug)]
enum RequestPhase {
    /// Head sent, waiting for `100 Continue`. Holds the socket timeout to restore.
    Continue(Option<Duration>),
    Body,
    Done,
    /// The server answered before the body was sent.
    Abandoned,
}

#[derive(Debug)]
enum ResponsePhase {
    Head,
    Body {
        head: ResponseHead,
        reader: BodyReader,
        persistent: bool,
    },
}

#[derive(Debug)]
struct ActiveExchange {
    tx: Responder,
    method: Method,
    persistent: bool,
    body: BodyWriter,
    request: RequestPhase,
    response: ResponsePhase,
}

/// Runs request/response exchanges on an outgoing session.
///
/// Exchanges arrive as [`Command::Execute`] and run one at a time: the request is
/// written, interim `1xx` responses are skipped, and the final response is read in
/// full before it is delivered. A response which leaves the connection unusable
/// closes the session before the response is delivered, so the session is never
/// seen as open by whoever receives the response.
#[derive(Debug)]
pub struct ClientDuplexer {
    config: Http1Config,
    input: SessionInputBuffer,
    output: SessionOutputBuffer,
    writer: MessageWriter,
    parser: ResponseParser,
    active: Option<ActiveExchange>,
    shutdown: Option<CloseMode>,
}

impl ClientDuplexer {
    /// Create a duplexer with buffers sized by `config`.
    pub fn new(config: Http1Config) -> Self {
        Self {
            input: config.input_buffer(),
            output: config.output_buffer(),
            writer: MessageWriter::new(),
            parser: ResponseParser::new(config.max_header_count),
            active: None,
            shutdown: None,
            config,
        }
    }

    /// Returns `true` while an exchange is in flight.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    fn begin(&mut self, session: &mut Session, exchange: Exchange) -> Result<(), Error> {
        let (request, tx) = exchange.into_parts();
        let Request {
            mut head,
            body,
            trailers,
        } = request;

        let expects_body = matches!(head.method, Method::POST | Method::PUT | Method::PATCH);
        let framing = if body.is_empty() && !expects_body {
            head.headers.remove("content-length");
            head.headers.remove("transfer-encoding");
            None
        } else {
            let length = body
                .len()
                .or_else(|| (head.version < Version::HTTP_11).then(|| body.size()));
            let framing = FramingMode::outgoing(head.version, length);
            framing.apply(&mut head.headers);
            Some(framing)
        };

        trace!(method = %head.method, path = %head.target, ?framing, "sending request");
        self.writer.write(&head, &mut self.output)?;

        let request = if head.expects_continue() && framing.is_some() && !body.is_empty() {
            let saved = session.socket_timeout();
            session.set_socket_timeout(Some(self.config.wait_for_continue));
            RequestPhase::Continue(saved)
        } else {
            RequestPhase::Body
        };

        self.active = Some(ActiveExchange {
            tx,
            persistent: keep_alive(head.version, &head.headers),
            method: head.method,
            body: BodyWriter::new(framing, body, trailers),
            request,
            response: ResponsePhase::Head,
        });
        self.parser.reset();
        session.request_input();
        Ok(())
    }

    fn write_request(&mut self, session: &mut Session) -> Result<(), Error> {
        let channel = session.channel();
        let mut sending = false;

        if let Some(active) = self.active.as_mut() {
            if matches!(active.request, RequestPhase::Body) {
                if active.body.write(channel, &mut self.output)? {
                    active.request = RequestPhase::Done;
                } else {
                    sending = true;
                }
            }
        }

        self.output.flush(channel)?;
        if self.output.is_empty() && !sending {
            session.suspend_output();
        }
        Ok(())
    }

    fn read_response(&mut self, session: &mut Session) -> Result<(), Error> {
        loop {
            let Some(active) = self.active.as_mut() else {
                return Ok(());
            };

            match &mut active.response {
                ResponsePhase::Head => {
                    let Some(head) = self.parser.parse(&mut self.input, session.channel())? else {
                        return Ok(());
                    };
                    self.parser.reset();

                    if head.is_informational() {
                        trace!(status = %head.status, "interim response");
                        if head.status == StatusCode::CONTINUE {
                            if let RequestPhase::Continue(saved) = active.request {
                                session.set_socket_timeout(saved);
                                active.request = RequestPhase::Body;
                                session.request_output();
                            }
                        }
                        continue;
                    }

                    match active.request {
                        RequestPhase::Continue(saved) => {
                            session.set_socket_timeout(saved);
                            active.request = RequestPhase::Abandoned;
                        }
                        RequestPhase::Body => active.request = RequestPhase::Abandoned,
                        RequestPhase::Done | RequestPhase::Abandoned => {}
                    }

                    let framing = FramingMode::for_response(&active.method, &head)?;
                    let persistent = active.persistent
                        && keep_alive(head.version, &head.headers)
                        && framing.map_or(true, |framing| framing.is_persistent());

                    match framing {
                        Some(framing) => {
                            active.response = ResponsePhase::Body {
                                head,
                                reader: BodyReader::new(
                                    framing,
                                    self.config.max_header_count,
                                    self.config.max_body_size,
                                )?,
                                persistent,
                            };
                        }
                        None => {
                            let response = Response {
                                head,
                                body: Default::default(),
                                trailers: Default::default(),
                            };
                            self.finish(session, response, persistent);
                            return Ok(());
                        }
                    }
                }
                ResponsePhase::Body { reader, .. } => {
                    if !reader.read(session.channel(), &mut self.input)? {
                        return Ok(());
                    }

                    let ResponsePhase::Body {
                        head,
                        reader,
                        persistent,
                    } = std::mem::replace(&mut active.response, ResponsePhase::Head)
                    else {
                        return Ok(());
                    };
                    let (body, trailers) = reader.finish();
                    self.finish(session, Response { head, body, trailers }, persistent);
                    return Ok(());
                }
            }
        }
    }

    fn finish(&mut self, session: &mut Session, response: Response, persistent: bool) {
        let Some(active) = self.active.take() else {
            return;
        };

        let persistent = persistent
            && matches!(active.request, RequestPhase::Done)
            && self.input.is_empty();
        trace!(status = %response.head.status, persistent, "response complete");

        if !persistent {
            session.close(CloseMode::Graceful);
        } else if let Some(mode) = self.shutdown.take() {
            session.close(mode);
        } else if session.has_commands() {
            session.request_output();
        }

        if active.tx.send(Ok(response)).is_err() {
            trace!("response receiver dropped");
        }
    }

    fn fail(&mut self, error: Error) {
        match self.active.take() {
            Some(active) => {
                debug!(%error, "exchange failed");
                let _ = active.tx.send(Err(error));
            }
            None => debug!(%error, "idle connection failed"),
        }
    }
}

impl EventHandler for ClientDuplexer {
    fn input_ready(&mut self, session: &mut Session) -> Result<(), Error> {
        if self.active.is_some() {
            return self.read_response(session);
        }

        match self.input.fill(session.channel())? {
            None => {
                trace!(session = %session.id(), "peer closed idle connection");
                session.close(CloseMode::Immediate);
                Ok(())
            }
            Some(0) if self.input.is_empty() => Ok(()),
            Some(_) => Err(ProtocolError::UnexpectedData.into()),
        }
    }

    fn output_ready(&mut self, session: &mut Session) -> Result<(), Error> {
        while self.active.is_none() {
            match session.poll_command() {
                Some(Command::Execute(exchange)) if exchange.is_cancelled() => {
                    trace!("skipping cancelled exchange");
                }
                Some(Command::Execute(exchange)) => self.begin(session, exchange)?,
                Some(Command::Shutdown(mode)) => {
                    session.close(mode);
                    return Ok(());
                }
                None => break,
            }
        }

        self.write_request(session)
    }

    fn timeout(&mut self, session: &mut Session) -> Result<(), Error> {
        let Some(active) = self.active.as_mut() else {
            session.close(CloseMode::Graceful);
            return Ok(());
        };

        if let RequestPhase::Continue(saved) = active.request {
            trace!("no 100 continue received, sending body");
            session.set_socket_timeout(saved);
            active.request = RequestPhase::Body;
            session.request_output();
            return Ok(());
        }

        Err(Error::Timeout(session.socket_timeout().unwrap_or_default()))
    }

    fn shutdown(&mut self, session: &mut Session, mode: CloseMode) -> Result<(), Error> {
        if mode == CloseMode::Graceful && self.active.is_some() {
            trace!(session = %session.id(), "deferring shutdown until the exchange completes");
            self.shutdown = Some(mode);
        } else {
            session.close(mode);
        }
        Ok(())
    }

    fn exception(&mut self, session: &mut Session, error: Error) {
        trace!(session = %session.id(), "client session failed");
        self.fail(error);
    }

    fn disconnected(&mut self, _session: &mut Session) {
        if self.active.is_some() {
            self.fail(Error::ConnectionClosed);
        }
    }
}

/// Creates a [`ClientDuplexer`] for every session.
#[derive(Debug, Clone, Default)]
pub struct ClientHandlerFactory {
    config: Http1Config,
}

impl ClientHandlerFactory {
    /// Create a factory whose duplexers use `config`.
    pub fn new(config: Http1Config) -> Self {
        Self { config }
    }
}

impl HandlerFactory for ClientHandlerFactory {
    fn create(
        &self,
        _session: &mut Session,
        _attachment: Option<Attachment>,
    ) -> Box<dyn EventHandler> {
        Box::new(ClientDuplexer::new(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use futures_util::FutureExt;
    use tokio::sync::oneshot;

    use crate::channel::mock::MockChannel;
    use crate::http1::Body;
    use crate::reactor::SessionId;

    type ResponseRx = oneshot::Receiver<Result<Response, Error>>;

    fn session(channel: MockChannel) -> Session {
        Session::new(SessionId(7), Box::new(channel), None).0
    }

    fn execute(session: &mut Session, request: Request) -> ResponseRx {
        let (exchange, rx) = Exchange::new(request);
        session.enqueue(Command::Execute(exchange));
        rx
    }

    fn response(rx: ResponseRx) -> Result<Response, Error> {
        rx.now_or_never().expect("response delivered").expect("sender kept")
    }

    #[test]
    fn simple_exchange() {
        let _ = tracing_subscriber::fmt::try_init();

        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/index").with_header("Host", "example.com"));
        duplexer.output_ready(&mut session).unwrap();
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"GET /index HTTP/1.1\r\nHost: example.com\r\n\r\n")
        );
        assert!(!session.interest().is_writable());

        channel.push_input("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel");
        duplexer.input_ready(&mut session).unwrap();
        assert!(duplexer.is_busy());

        channel.push_input("lo");
        duplexer.input_ready(&mut session).unwrap();
        assert!(!duplexer.is_busy());

        let response = response(rx).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().to_bytes(), Bytes::from_static(b"hello"));
        assert!(!session.is_closed());
    }

    #[test]
    fn chunked_request_and_response_with_trailers() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let request = Request::new(Method::PUT, "/upload")
            .with_body(Body::streamed(["abc", "de"]))
            .with_trailer("Checksum", "1234");
        let rx = execute(&mut session, request);
        duplexer.output_ready(&mut session).unwrap();
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(
                b"PUT /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\nChecksum: 1234\r\n\r\n"
            )
        );

        channel.push_input(
            "HTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\nX-Done: yes\r\n\r\n",
        );
        duplexer.input_ready(&mut session).unwrap();

        let response = response(rx).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.body().to_bytes(), Bytes::from_static(b"ok"));
        assert_eq!(response.trailers().value("x-done"), Some("yes"));
        assert!(!session.is_closed());
    }

    #[test]
    fn interim_responses_are_skipped() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();

        channel.push_input(
            "HTTP/1.1 103 Early Hints\r\nLink: </style.css>\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
        );
        duplexer.input_ready(&mut session).unwrap();

        let response = response(rx).unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.body(), &Body::Empty);
    }

    #[test]
    fn expect_continue_waits_for_interim_response() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let request = Request::post("/submit", "payload").with_header("Expect", "100-continue");
        let rx = execute(&mut session, request);
        duplexer.output_ready(&mut session).unwrap();
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"POST /submit HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 7\r\n\r\n")
        );
        assert_eq!(session.socket_timeout(), Some(Duration::from_secs(3)));

        channel.push_input("HTTP/1.1 100 Continue\r\n\r\n");
        duplexer.input_ready(&mut session).unwrap();
        assert_eq!(session.socket_timeout(), None);
        assert!(session.interest().is_writable());

        duplexer.output_ready(&mut session).unwrap();
        assert_eq!(channel.take_written(), Bytes::from_static(b"payload"));

        channel.push_input("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        duplexer.input_ready(&mut session).unwrap();
        assert_eq!(response(rx).unwrap().status(), StatusCode::OK);
        assert!(!session.is_closed());
    }

    #[test]
    fn continue_timeout_sends_body() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let request = Request::post("/submit", "payload").with_header("Expect", "100-continue");
        let _rx = execute(&mut session, request);
        duplexer.output_ready(&mut session).unwrap();
        channel.take_written();

        duplexer.timeout(&mut session).unwrap();
        duplexer.output_ready(&mut session).unwrap();
        assert_eq!(channel.take_written(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn early_final_response_abandons_body() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let request = Request::post("/submit", "payload").with_header("Expect", "100-continue");
        let rx = execute(&mut session, request);
        duplexer.output_ready(&mut session).unwrap();

        channel.push_input("HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\n\r\n");
        duplexer.input_ready(&mut session).unwrap();
        assert_eq!(response(rx).unwrap().status(), StatusCode::EXPECTATION_FAILED);
        assert!(session.is_closed());
    }

    #[test]
    fn identity_body_closes_the_session() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();

        channel.push_input("HTTP/1.1 200 OK\r\n\r\nuntil the end");
        duplexer.input_ready(&mut session).unwrap();
        assert!(duplexer.is_busy());

        channel.finish_input();
        duplexer.input_ready(&mut session).unwrap();
        let response = response(rx).unwrap();
        assert_eq!(response.body().to_bytes(), Bytes::from_static(b"until the end"));
        assert!(session.is_closed());
    }

    #[test]
    fn connection_close_is_honoured() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();
        channel.push_input("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        duplexer.input_ready(&mut session).unwrap();

        assert!(response(rx).is_ok());
        assert!(session.is_closed());
    }

    #[test]
    fn http10_responses_need_keep_alive() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();
        channel.push_input("HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n");
        duplexer.input_ready(&mut session).unwrap();

        assert!(response(rx).is_ok());
        assert!(session.is_closed());
    }

    #[test]
    fn unexpected_data_on_idle_connection() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        channel.push_input("HTTP/1.1 200 OK\r\n\r\n");
        let error = duplexer.input_ready(&mut session).unwrap_err();
        assert!(matches!(error, Error::Protocol(ProtocolError::UnexpectedData)));
    }

    #[test]
    fn truncated_response_fails_the_exchange() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();
        channel.push_input("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        channel.finish_input();

        let error = duplexer.input_ready(&mut session).unwrap_err();
        duplexer.exception(&mut session, error);
        assert!(matches!(
            response(rx),
            Err(Error::Protocol(ProtocolError::TruncatedContent { .. }))
        ));
    }

    #[test]
    fn timeout_fails_the_active_exchange() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        session.set_socket_timeout(Some(Duration::from_secs(1)));
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();

        let error = duplexer.timeout(&mut session).unwrap_err();
        assert!(error.is_timeout());
        duplexer.exception(&mut session, error);
        assert!(matches!(response(rx), Err(Error::Timeout(_))));
    }

    #[test]
    fn graceful_shutdown_waits_for_the_exchange() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();
        duplexer.shutdown(&mut session, CloseMode::Graceful).unwrap();
        assert!(!session.is_closed());

        channel.push_input("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        duplexer.input_ready(&mut session).unwrap();
        assert!(response(rx).is_ok());
        assert!(session.is_closed());
    }

    #[test]
    fn disconnect_fails_the_active_exchange() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ClientDuplexer::new(Http1Config::default());

        let rx = execute(&mut session, Request::get("/"));
        duplexer.output_ready(&mut session).unwrap();
        duplexer.disconnected(&mut session);
        assert!(matches!(response(rx), Err(Error::ConnectionClosed)));
    }
}

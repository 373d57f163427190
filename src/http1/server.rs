use std::fmt;
use std::sync::Arc;

use http::{Method, StatusCode, Version};
use tracing::{debug, trace, warn};

use super::{keep_alive, Body, BodyReader, BodyWriter, Http1Config, Request, Response};
use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::codec::{response_has_body, FramingMode};
use crate::message::{Headers, MessageWriter, RequestHead, RequestParser, ResponseHead};
use crate::reactor::{Attachment, CloseMode, EventHandler, HandlerFactory, Session};
use crate::{BoxError, Error, ProtocolError};

/// Produces the response to a request.
///
/// Handlers run on the reactor thread which owns the session, so they should not
/// block. An error becomes a `500 Internal Server Error` response.
pub trait RequestHandler: Send + Sync + 'static {
    /// Answer `request`.
    fn handle(&self, request: Request) -> Result<Response, BoxError>;
}

impl<F> RequestHandler for F
where
    F: Fn(Request) -> Result<Response, BoxError> + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Result<Response, BoxError> {
        (self)(request)
    }
}

enum State {
    Head,
    Body { head: RequestHead, reader: BodyReader },
    Respond { body: BodyWriter, persistent: bool },
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Head => f.write_str("Head"),
            State::Body { head, .. } => f
                .debug_struct("Body")
                .field("target", &head.target)
                .finish(),
            State::Respond { persistent, .. } => f
                .debug_struct("Respond")
                .field("persistent", persistent)
                .finish(),
        }
    }
}

/// Answers HTTP/1.x requests on an accepted session.
///
/// Requests are read in full before the handler runs. Pipelined requests which
/// are already buffered are answered in order once the previous response has been
/// written.
pub struct ServerDuplexer {
    handler: Arc<dyn RequestHandler>,
    max_header_count: usize,
    max_body_size: usize,
    input: SessionInputBuffer,
    output: SessionOutputBuffer,
    writer: MessageWriter,
    parser: RequestParser,
    state: State,
    closing: bool,
}

impl ServerDuplexer {
    /// Create a duplexer answering with `handler`.
    pub fn new(config: &Http1Config, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            handler,
            max_header_count: config.max_header_count,
            max_body_size: config.max_body_size,
            input: config.input_buffer(),
            output: config.output_buffer(),
            writer: MessageWriter::new(),
            parser: RequestParser::new(config.max_header_count),
            state: State::Head,
            closing: false,
        }
    }

    fn process(&mut self, session: &mut Session) -> Result<(), Error> {
        loop {
            match &mut self.state {
                State::Head => {
                    let head = match self.parser.parse(&mut self.input, session.channel()) {
                        Ok(Some(head)) => head,
                        Ok(None) => return Ok(()),
                        Err(Error::ConnectionClosed) => {
                            trace!(session = %session.id(), "peer closed connection");
                            session.close(CloseMode::Graceful);
                            return Ok(());
                        }
                        Err(Error::Protocol(error)) => return self.reject(session, error),
                        Err(error) => return Err(error),
                    };
                    self.parser.reset();
                    trace!(method = %head.method, path = %head.target, "request received");

                    let framing = match FramingMode::for_request(&head) {
                        Ok(framing) => framing,
                        Err(error) => return self.reject(session, error),
                    };

                    if head.expects_continue() && framing != FramingMode::Length(0) {
                        self.writer
                            .write(&ResponseHead::new(StatusCode::CONTINUE), &mut self.output)?;
                        session.request_output();
                    }

                    let limit = self.max_body_size;
                    let reader = match BodyReader::new(framing, self.max_header_count, limit) {
                        Ok(reader) => reader,
                        Err(error) => return self.reject(session, error),
                    };
                    self.state = State::Body { head, reader };
                }
                State::Body { reader, .. } => {
                    match reader.read(session.channel(), &mut self.input) {
                        Ok(true) => {}
                        Ok(false) => return Ok(()),
                        Err(Error::Protocol(error)) => return self.reject(session, error),
                        Err(error) => return Err(error),
                    }

                    let state = std::mem::replace(&mut self.state, State::Head);
                    let State::Body { head, reader } = state else {
                        return Ok(());
                    };
                    let (body, trailers) = reader.finish();
                    self.respond(session, Request { head, body, trailers })?;
                }
                State::Respond { .. } => {
                    session.suspend_input();
                    return Ok(());
                }
            }
        }
    }

    fn respond(&mut self, session: &mut Session, request: Request) -> Result<(), Error> {
        let method = request.head.method.clone();
        let version = request.head.version;
        let persistent = keep_alive(version, &request.head.headers);

        let response = match self.handler.handle(request) {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "request handler failed");
                Response::new(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        self.start_response(session, &method, version, response, persistent)
    }

    fn start_response(
        &mut self,
        session: &mut Session,
        method: &Method,
        version: Version,
        response: Response,
        persistent: bool,
    ) -> Result<(), Error> {
        let Response {
            mut head,
            body,
            trailers,
        } = response;
        head.version = if version >= Version::HTTP_11 {
            Version::HTTP_11
        } else {
            Version::HTTP_10
        };

        let framing = if response_has_body(method, head.status) {
            let framing = FramingMode::outgoing(head.version, body.len());
            framing.apply(&mut head.headers);
            Some(framing)
        } else {
            if *method == Method::HEAD {
                if let Some(length) = body.len() {
                    FramingMode::Length(length).apply(&mut head.headers);
                }
            } else {
                head.headers.remove("transfer-encoding");
                if head.status == StatusCode::NO_CONTENT || head.is_informational() {
                    head.headers.remove("content-length");
                }
            }
            None
        };

        let persistent = persistent
            && !self.closing
            && keep_alive(head.version, &head.headers)
            && framing.map_or(true, |framing| framing.is_persistent());

        if !persistent {
            head.headers.set("Connection", "close");
        } else if head.version < Version::HTTP_11 {
            head.headers.set("Connection", "keep-alive");
        }

        trace!(status = %head.status, ?framing, persistent, "sending response");
        self.writer.write(&head, &mut self.output)?;
        self.state = State::Respond {
            body: BodyWriter::new(framing, body, trailers),
            persistent,
        };
        session.suspend_input();
        session.request_output();
        Ok(())
    }

    /// Answer a malformed request with `400 Bad Request` and close afterwards.
    fn reject(&mut self, session: &mut Session, error: ProtocolError) -> Result<(), Error> {
        debug!(session = %session.id(), %error, "rejecting malformed request");
        self.parser.reset();
        self.input.clear();
        self.closing = true;

        let status = match error {
            ProtocolError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        let mut head = ResponseHead::new(status);
        head.headers.set("Content-Length", "0");
        head.headers.set("Connection", "close");
        self.writer.write(&head, &mut self.output)?;
        self.state = State::Respond {
            body: BodyWriter::new(None, Body::Empty, Headers::new()),
            persistent: false,
        };
        session.suspend_input();
        session.request_output();
        Ok(())
    }
}

impl EventHandler for ServerDuplexer {
    fn input_ready(&mut self, session: &mut Session) -> Result<(), Error> {
        self.process(session)
    }

    fn output_ready(&mut self, session: &mut Session) -> Result<(), Error> {
        let channel = session.channel();
        let mut complete = None;
        if let State::Respond { body, persistent } = &mut self.state {
            if body.write(channel, &mut self.output)? {
                complete = Some(*persistent);
            }
        }

        self.output.flush(channel)?;
        if !self.output.is_empty() {
            return Ok(());
        }
        session.suspend_output();

        match complete {
            Some(false) => {
                session.close(CloseMode::Graceful);
                Ok(())
            }
            Some(true) => {
                self.state = State::Head;
                session.request_input();
                if self.input.is_empty() {
                    Ok(())
                } else {
                    self.process(session)
                }
            }
            None => Ok(()),
        }
    }

    fn shutdown(&mut self, session: &mut Session, mode: CloseMode) -> Result<(), Error> {
        let idle = matches!(self.state, State::Head)
            && !self.parser.in_progress()
            && self.input.is_empty();
        if mode == CloseMode::Immediate || idle {
            session.close(mode);
        } else {
            trace!(session = %session.id(), "closing after the current response");
            self.closing = true;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerDuplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDuplexer")
            .field("state", &self.state)
            .field("closing", &self.closing)
            .finish()
    }
}

/// Creates a [`ServerDuplexer`] for every accepted session.
#[derive(Clone)]
pub struct ServerHandlerFactory {
    config: Http1Config,
    handler: Arc<dyn RequestHandler>,
}

impl ServerHandlerFactory {
    /// Create a factory answering every request with `handler`.
    pub fn new<H: RequestHandler>(handler: H) -> Self {
        Self {
            config: Http1Config::default(),
            handler: Arc::new(handler),
        }
    }

    /// Use `config` for new sessions.
    pub fn with_config(mut self, config: Http1Config) -> Self {
        self.config = config;
        self
    }
}

impl HandlerFactory for ServerHandlerFactory {
    fn create(
        &self,
        _session: &mut Session,
        _attachment: Option<Attachment>,
    ) -> Box<dyn EventHandler> {
        Box::new(ServerDuplexer::new(&self.config, self.handler.clone()))
    }
}

impl fmt::Debug for ServerHandlerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandlerFactory")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::channel::mock::MockChannel;
    use crate::reactor::SessionId;

    fn session(channel: MockChannel) -> Session {
        Session::new(SessionId(3), Box::new(channel), None).0
    }

    fn echo(request: Request) -> Result<Response, BoxError> {
        if request.target() == "/fail" {
            return Err("handler failure".into());
        }
        let body = request.body.to_bytes();
        Ok(Response::new(StatusCode::OK)
            .with_header("X-Target", request.target())
            .with_body(body))
    }

    fn duplexer() -> ServerDuplexer {
        ServerDuplexer::new(&Http1Config::default(), Arc::new(echo))
    }

    /// Drive the duplexer the way the reactor would until it has nothing to do.
    fn drive(duplexer: &mut ServerDuplexer, session: &mut Session) {
        for _ in 0..16 {
            if session.is_closed() {
                return;
            }
            let interest = session.interest();
            if interest.is_writable() {
                duplexer.output_ready(session).unwrap();
            } else if interest.is_readable() {
                duplexer.input_ready(session).unwrap();
                if !session.interest().is_writable() {
                    return;
                }
            } else {
                return;
            }
        }
    }

    #[test]
    fn answers_a_request() {
        let _ = tracing_subscriber::fmt::try_init();

        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nping");
        drive(&mut duplexer, &mut session);

        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nX-Target: /echo\r\nContent-Length: 4\r\n\r\nping")
        );
        assert!(!session.is_closed());
        assert!(session.interest().is_readable());
    }

    #[test]
    fn pipelined_requests_are_answered_in_order() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n");
        drive(&mut duplexer, &mut session);

        assert_eq!(
            channel.take_written(),
            Bytes::from_static(
                b"HTTP/1.1 200 OK\r\nX-Target: /one\r\nContent-Length: 0\r\n\r\nHTTP/1.1 200 OK\r\nX-Target: /two\r\nContent-Length: 0\r\n\r\n"
            )
        );
    }

    #[test]
    fn chunked_request_body() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n");
        drive(&mut duplexer, &mut session);
        assert!(channel.written().is_empty());

        channel.push_input("0\r\n\r\n");
        drive(&mut duplexer, &mut session);
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nX-Target: /c\r\nContent-Length: 3\r\n\r\nabc")
        );
    }

    #[test]
    fn head_responses_have_no_body() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ServerDuplexer::new(
            &Http1Config::default(),
            Arc::new(|_: Request| -> Result<Response, BoxError> {
                Ok(Response::new(StatusCode::OK).with_body("hidden"))
            }),
        );

        channel.push_input("HEAD / HTTP/1.1\r\n\r\n");
        drive(&mut duplexer, &mut session);
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\n")
        );
    }

    #[test]
    fn expect_continue_is_answered() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("PUT /x HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n");
        drive(&mut duplexer, &mut session);
        assert_eq!(channel.take_written(), Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"));

        channel.push_input("ok");
        drive(&mut duplexer, &mut session);
        assert!(channel
            .take_written()
            .starts_with(b"HTTP/1.1 200 OK\r\nX-Target: /x\r\nContent-Length: 2\r\n\r\n"));
    }

    #[test]
    fn http10_closes_without_keep_alive() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("GET /old HTTP/1.0\r\n\r\n");
        drive(&mut duplexer, &mut session);
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"HTTP/1.0 200 OK\r\nX-Target: /old\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        );
        assert!(session.is_closed());
        assert!(channel.is_output_shutdown());
    }

    #[test]
    fn malformed_requests_get_bad_request() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("NOT A REQUEST LINE AT ALL\r\n\r\n");
        drive(&mut duplexer, &mut session);
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        );
        assert!(session.is_closed());
    }

    #[test]
    fn oversized_bodies_are_refused() {
        let config = Http1Config::default().with_max_body_size(4);

        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = ServerDuplexer::new(&config, Arc::new(echo));
        channel.push_input("POST /big HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        drive(&mut duplexer, &mut session);
        assert_eq!(
            channel.take_written(),
            Bytes::from_static(b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        );
        assert!(session.is_closed());

        let channel = MockChannel::new();
        let mut session = self::session(channel.clone());
        let mut duplexer = ServerDuplexer::new(&config, Arc::new(echo));
        channel.push_input(
            "POST /big HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n",
        );
        drive(&mut duplexer, &mut session);
        assert!(channel
            .take_written()
            .starts_with(b"HTTP/1.1 413 Payload Too Large\r\n"));

        let channel = MockChannel::new();
        let mut session = self::session(channel.clone());
        let mut duplexer = ServerDuplexer::new(&config, Arc::new(echo));
        channel.push_input("POST /fits HTTP/1.1\r\nContent-Length: 4\r\n\r\nfour");
        drive(&mut duplexer, &mut session);
        assert!(channel.take_written().ends_with(b"\r\n\r\nfour"));
    }

    #[test]
    fn handler_errors_become_server_errors() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("GET /fail HTTP/1.1\r\n\r\n");
        drive(&mut duplexer, &mut session);
        assert!(channel
            .take_written()
            .starts_with(b"HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!session.is_closed());
    }

    #[test]
    fn idle_peer_close_is_graceful() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.finish_input();
        duplexer.input_ready(&mut session).unwrap();
        assert!(session.is_closed());
    }

    #[test]
    fn shutdown_waits_for_the_response() {
        let channel = MockChannel::new();
        let mut session = session(channel.clone());
        let mut duplexer = duplexer();

        channel.push_input("POST /slow HTTP/1.1\r\nContent-Length: 4\r\n\r\npi");
        drive(&mut duplexer, &mut session);
        duplexer.shutdown(&mut session, CloseMode::Graceful).unwrap();
        assert!(!session.is_closed());

        channel.push_input("ng");
        drive(&mut duplexer, &mut session);
        let written = channel.take_written();
        assert!(written.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(written.ends_with(b"Connection: close\r\n\r\nping"));
        assert!(session.is_closed());
    }
}

//! HTTP/1.x protocol handlers for reactor sessions.
//!
//! [`ClientDuplexer`] runs request/response exchanges on an outgoing session, one
//! at a time. [`ServerDuplexer`] answers requests on an accepted session with a
//! synchronous [`RequestHandler`]. Both are [`EventHandler`](crate::reactor::EventHandler)s
//! and move bytes only through the session buffers and framing codecs.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use tokio::sync::oneshot;

use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::channel::Channel;
use crate::charset::CharCodingConfig;
use crate::codec::{ContentDecoder, ContentEncoder, FramingMode};
use crate::message::{Headers, RequestHead, ResponseHead};
use crate::{Error, ProtocolError};

mod client;
#[cfg(feature = "server")]
mod server;

pub use self::client::{ClientDuplexer, ClientHandlerFactory};
#[cfg(feature = "server")]
pub use self::server::{RequestHandler, ServerDuplexer, ServerHandlerFactory};

/// Buffer sizes, limits and coding for HTTP/1.x sessions.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Http1Config {
    /// Size of the session input and output buffers.
    pub buffer_size: usize,

    /// Body writes larger than this bypass the output buffer when it is empty.
    pub fragment_size_hint: usize,

    /// Longest accepted head line. Zero disables the limit.
    pub max_line_length: usize,

    /// Most headers (or trailers) accepted in one message. Zero disables the limit.
    pub max_header_count: usize,

    /// Largest incoming body held in memory. Zero disables the limit.
    pub max_body_size: usize,

    /// Charset and error policy for head lines.
    pub char_coding: CharCodingConfig,

    /// How long a client waits for `100 Continue` before sending the body anyway.
    pub wait_for_continue: Duration,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            fragment_size_hint: 512,
            max_line_length: 8 * 1024,
            max_header_count: 100,
            max_body_size: 32 * 1024 * 1024,
            char_coding: CharCodingConfig::default(),
            wait_for_continue: Duration::from_secs(3),
        }
    }
}

impl Http1Config {
    /// Set the session buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the fragment size hint.
    pub fn with_fragment_size_hint(mut self, size: usize) -> Self {
        self.fragment_size_hint = size;
        self
    }

    /// Set the maximum line length.
    pub fn with_max_line_length(mut self, length: usize) -> Self {
        self.max_line_length = length;
        self
    }

    /// Set the maximum header count.
    pub fn with_max_header_count(mut self, count: usize) -> Self {
        self.max_header_count = count;
        self
    }

    /// Set the largest incoming body accepted.
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set the head line coding.
    pub fn with_char_coding(mut self, coding: CharCodingConfig) -> Self {
        self.char_coding = coding;
        self
    }

    /// Set how long to wait for `100 Continue`.
    pub fn with_wait_for_continue(mut self, wait: Duration) -> Self {
        self.wait_for_continue = wait;
        self
    }

    fn input_buffer(&self) -> SessionInputBuffer {
        SessionInputBuffer::new(self.buffer_size, self.max_line_length, self.char_coding)
    }

    fn output_buffer(&self) -> SessionOutputBuffer {
        SessionOutputBuffer::new(self.buffer_size, self.fragment_size_hint, self.char_coding)
    }
}

/// A message body held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    /// No body.
    #[default]
    Empty,

    /// A body of known length.
    Full(Bytes),

    /// A body sent as a series of chunks, without declaring its length up front.
    Streamed(VecDeque<Bytes>),
}

impl Body {
    /// Create a streamed body from a series of chunks.
    pub fn streamed<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Body::Streamed(chunks.into_iter().map(Into::into).collect())
    }

    /// The length declared up front, if any.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Streamed(_) => None,
        }
    }

    /// Returns `true` if the body holds no bytes.
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(bytes) => bytes.is_empty(),
            Body::Streamed(chunks) => chunks.iter().all(Bytes::is_empty),
        }
    }

    /// The total number of bytes held.
    pub fn size(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Full(bytes) => bytes.len() as u64,
            Body::Streamed(chunks) => chunks.iter().map(|chunk| chunk.len() as u64).sum(),
        }
    }

    /// The whole body as contiguous bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Full(bytes) => bytes.clone(),
            Body::Streamed(chunks) => {
                let mut buf = BytesMut::new();
                for chunk in chunks {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    fn into_chunks(self) -> VecDeque<Bytes> {
        match self {
            Body::Empty => VecDeque::new(),
            Body::Full(bytes) => VecDeque::from([bytes]),
            Body::Streamed(chunks) => chunks,
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Full(bytes)
        }
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Bytes::from_static(value.as_bytes()).into()
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Bytes::from(value).into()
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Bytes::from(value).into()
    }
}

/// An HTTP request: head, body and trailers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The request line and headers.
    pub head: RequestHead,

    /// The request body.
    pub body: Body,

    /// Trailer fields, sent only with chunked bodies.
    pub trailers: Headers,
}

impl Request {
    /// Create an HTTP/1.1 request with no body.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            head: RequestHead::new(method, target),
            body: Body::Empty,
            trailers: Headers::new(),
        }
    }

    /// Create a `GET` request.
    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    /// Create a `POST` request with a body.
    pub fn post(target: impl Into<String>, body: impl Into<Body>) -> Self {
        Self::new(Method::POST, target).with_body(body)
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.head.headers.append(name, value);
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a trailer field.
    pub fn with_trailer(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.trailers.append(name, value);
        self
    }

    /// Set the protocol version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.head.version = version;
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// The request target.
    pub fn target(&self) -> &str {
        &self.head.target
    }

    /// The request headers.
    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }
}

/// An HTTP response: head, body and trailers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The status line and headers.
    pub head: ResponseHead,

    /// The response body.
    pub body: Body,

    /// Trailer fields received with, or sent with, a chunked body.
    pub trailers: Headers,
}

impl Response {
    /// Create an HTTP/1.1 response with no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            head: ResponseHead::new(status),
            body: Body::Empty,
            trailers: Headers::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.head.headers.append(name, value);
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a trailer field.
    pub fn with_trailer(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.trailers.append(name, value);
        self
    }

    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// The response headers.
    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// The response body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Trailer fields received after a chunked body.
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }
}

type Responder = oneshot::Sender<Result<Response, Error>>;

/// A request waiting to be executed on a session, with the channel its response
/// is delivered on.
pub struct Exchange {
    request: Request,
    tx: Responder,
}

impl Exchange {
    /// Create an exchange, returning the receiver for its response.
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Result<Response, Error>>) {
        let (tx, rx) = oneshot::channel();
        (Self { request, tx }, rx)
    }

    /// The request to send.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Returns `true` if nobody is waiting for the response any more.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolve the exchange with an error.
    pub fn fail(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    fn into_parts(self) -> (Request, Responder) {
        (self.request, self.tx)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("method", &self.request.head.method)
            .field("target", &self.request.head.target)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Returns `true` if the connection may carry another message after one with this
/// version and these headers.
///
/// HTTP/1.0 connections persist only with `Connection: keep-alive`; HTTP/1.1
/// connections persist unless `Connection: close` is present.
pub fn keep_alive(version: Version, headers: &Headers) -> bool {
    if headers.contains_token("connection", "close") {
        return false;
    }
    if version >= Version::HTTP_11 {
        true
    } else {
        headers.contains_token("connection", "keep-alive")
    }
}

/// The `timeout` parameter of a `Keep-Alive` header.
pub fn keep_alive_timeout(headers: &Headers) -> Option<Duration> {
    headers
        .get_all("keep-alive")
        .flat_map(|header| header.elements())
        .filter_map(|element| element.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("timeout"))
        .and_then(|(_, value)| value.trim().trim_matches('"').parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Writes an outgoing body through its encoder.
#[derive(Debug)]
struct BodyWriter {
    encoder: Option<ContentEncoder>,
    chunks: VecDeque<Bytes>,
    trailers: Headers,
}

impl BodyWriter {
    /// A writer for `body` in `framing`. Without framing the body is dropped.
    fn new(framing: Option<FramingMode>, body: Body, trailers: Headers) -> Self {
        match framing {
            Some(framing) => Self {
                encoder: Some(ContentEncoder::new(framing)),
                chunks: body.into_chunks(),
                trailers,
            },
            None => Self::empty(),
        }
    }

    fn empty() -> Self {
        Self {
            encoder: None,
            chunks: VecDeque::new(),
            trailers: Headers::new(),
        }
    }

    /// Write as much of the body as the channel accepts. Returns `true` once the
    /// body has been completed; the output buffer may still need flushing.
    fn write<C>(&mut self, channel: &mut C, output: &mut SessionOutputBuffer) -> Result<bool, Error>
    where
        C: Channel + ?Sized,
    {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(true);
        };

        while let Some(chunk) = self.chunks.front_mut() {
            if chunk.is_empty() {
                self.chunks.pop_front();
                continue;
            }
            let n = encoder.write(channel, output, chunk)?;
            if n == 0 {
                return Ok(false);
            }
            chunk.advance(n);
        }

        if !encoder.is_completed() {
            encoder.complete(output, &self.trailers)?;
        }
        Ok(true)
    }
}

/// Reads an incoming body through its decoder, up to a size limit.
#[derive(Debug)]
struct BodyReader {
    decoder: ContentDecoder,
    body: BytesMut,
    limit: usize,
}

impl BodyReader {
    /// A declared length over `limit` is refused before any of the body is read.
    fn new(
        framing: FramingMode,
        max_trailer_count: usize,
        limit: usize,
    ) -> Result<Self, ProtocolError> {
        if let FramingMode::Length(length) = framing {
            if limit > 0 && length > limit as u64 {
                return Err(ProtocolError::BodyTooLarge { limit });
            }
        }

        Ok(Self {
            decoder: ContentDecoder::new(framing, max_trailer_count),
            body: BytesMut::new(),
            limit,
        })
    }

    /// Read what is available. Returns `true` once the body is complete.
    fn read<C>(&mut self, channel: &mut C, input: &mut SessionInputBuffer) -> Result<bool, Error>
    where
        C: Channel + ?Sized,
    {
        let mut buf = [0u8; 4096];
        loop {
            match self.decoder.read(channel, input, &mut buf)? {
                Some(0) => return Ok(false),
                Some(n) if self.limit > 0 && self.body.len() + n > self.limit => {
                    return Err(ProtocolError::BodyTooLarge { limit: self.limit }.into());
                }
                Some(n) => self.body.extend_from_slice(&buf[..n]),
                None => return Ok(true),
            }
        }
    }

    fn finish(mut self) -> (Body, Headers) {
        let trailers = self.decoder.take_trailers();
        (self.body.freeze().into(), trailers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(values: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in values {
            headers.append(name, value);
        }
        headers
    }

    #[test]
    fn persistence_by_version() {
        assert!(keep_alive(Version::HTTP_11, &Headers::new()));
        assert!(!keep_alive(Version::HTTP_11, &headers(&[("Connection", "close")])));
        assert!(!keep_alive(Version::HTTP_10, &Headers::new()));
        assert!(keep_alive(Version::HTTP_10, &headers(&[("Connection", "Keep-Alive")])));
        assert!(!keep_alive(
            Version::HTTP_10,
            &headers(&[("Connection", "keep-alive, close")])
        ));
    }

    #[test]
    fn keep_alive_timeout_parameter() {
        assert_eq!(
            keep_alive_timeout(&headers(&[("Keep-Alive", "timeout=5, max=100")])),
            Some(Duration::from_secs(5))
        );
        assert_eq!(keep_alive_timeout(&headers(&[("Keep-Alive", "max=100")])), None);
        assert_eq!(keep_alive_timeout(&Headers::new()), None);
    }

    #[test]
    fn body_lengths() {
        assert_eq!(Body::Empty.len(), Some(0));
        assert_eq!(Body::from("hello").len(), Some(5));
        assert_eq!(Body::from(""), Body::Empty);

        let body = Body::streamed(["ab", "cde"]);
        assert_eq!(body.len(), None);
        assert_eq!(body.size(), 5);
        assert_eq!(body.to_bytes(), Bytes::from_static(b"abcde"));
    }

    #[test]
    fn exchange_reports_cancellation() {
        let (exchange, rx) = Exchange::new(Request::get("/"));
        assert!(!exchange.is_cancelled());
        drop(rx);
        assert!(exchange.is_cancelled());
    }
}

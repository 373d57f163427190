//! HTTP/1.x message heads.
//!
//! A message head is the start line (request line or status line) plus the header
//! list. Heads are parsed off a [`SessionInputBuffer`](crate::buffer::SessionInputBuffer)
//! by a [`MessageParser`] and written to a
//! [`SessionOutputBuffer`](crate::buffer::SessionOutputBuffer) by a [`MessageWriter`].
//! Bodies are handled separately, by the [`codec`](crate::codec) module.

use std::fmt;

use http::{Method, StatusCode, Version};

use crate::ProtocolError;

mod header;
mod parser;
mod writer;

pub use self::header::{Header, Headers};
pub use self::parser::{MessageParser, ParserState, RequestParser, ResponseParser};
pub use self::writer::MessageWriter;

/// The parts of a message head common to requests and responses.
///
/// This trait is sealed: it is implemented only by [`RequestHead`] and
/// [`ResponseHead`].
pub trait MessageHead: crate::private::Sealed + fmt::Debug + Send + Sized + 'static {
    /// Parse the start line.
    fn parse_start_line(line: &str) -> Result<Self, ProtocolError>;

    /// Format the start line, without a terminator, into `dst`.
    fn format_start_line(&self, dst: &mut String);

    /// The protocol version.
    fn version(&self) -> Version;

    /// The header list.
    fn headers(&self) -> &Headers;

    /// The header list, mutably.
    fn headers_mut(&mut self) -> &mut Headers;
}

/// A request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// The request method.
    pub method: Method,

    /// The request target, exactly as it appears on the request line.
    pub target: String,

    /// The protocol version.
    pub version: Version,

    /// The request headers.
    pub headers: Headers,
}

impl RequestHead {
    /// Create an HTTP/1.1 request head with no headers.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers: Headers::new(),
        }
    }

    /// Returns `true` if the request asks for a `100 Continue` interim response.
    pub fn expects_continue(&self) -> bool {
        self.version >= Version::HTTP_11 && self.headers.contains_token("expect", "100-continue")
    }
}

impl crate::private::Sealed for RequestHead {}

impl MessageHead for RequestHead {
    fn parse_start_line(line: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidRequestLine(line.to_owned());

        let mut parts = line.split([' ', '\t']).filter(|part| !part.is_empty());
        let method = parts.next().ok_or_else(invalid)?;
        let target = parts.next().ok_or_else(invalid)?;
        let version = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        let method = Method::from_bytes(method.as_bytes()).map_err(|_| invalid())?;
        let version = parse_version(version)?;

        Ok(Self {
            method,
            target: target.to_owned(),
            version,
            headers: Headers::new(),
        })
    }

    fn format_start_line(&self, dst: &mut String) {
        dst.push_str(self.method.as_str());
        dst.push(' ');
        dst.push_str(&self.target);
        dst.push(' ');
        dst.push_str(version_str(self.version));
    }

    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// A status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// The protocol version.
    pub version: Version,

    /// The status code.
    pub status: StatusCode,

    /// The reason phrase, which may be empty.
    pub reason: String,

    /// The response headers.
    pub headers: Headers,
}

impl ResponseHead {
    /// Create an HTTP/1.1 response head with the canonical reason phrase.
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: Headers::new(),
        }
    }

    /// Returns `true` for `1xx` interim responses.
    pub fn is_informational(&self) -> bool {
        self.status.is_informational()
    }
}

impl crate::private::Sealed for ResponseHead {}

impl MessageHead for ResponseHead {
    fn parse_start_line(line: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidStatusLine(line.to_owned());

        let mut parts = line.splitn(3, ' ');
        let version = parts.next().ok_or_else(invalid)?;
        let status = parts.next().ok_or_else(invalid)?;
        let reason = parts.next().unwrap_or_default();

        let version = parse_version(version)?;
        if status.len() != 3 {
            return Err(invalid());
        }
        let status = StatusCode::from_bytes(status.as_bytes()).map_err(|_| invalid())?;

        Ok(Self {
            version,
            status,
            reason: reason.trim().to_owned(),
            headers: Headers::new(),
        })
    }

    fn format_start_line(&self, dst: &mut String) {
        dst.push_str(version_str(self.version));
        dst.push(' ');
        dst.push_str(self.status.as_str());
        dst.push(' ');
        dst.push_str(&self.reason);
    }

    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// Parse an `HTTP/major.minor` protocol version.
///
/// Any `1.x` minor version above zero is treated as HTTP/1.1.
pub fn parse_version(version: &str) -> Result<Version, ProtocolError> {
    let invalid = || ProtocolError::InvalidVersion(version.to_owned());

    let numbers = version.strip_prefix("HTTP/").ok_or_else(invalid)?;
    let (major, minor) = numbers.split_once('.').ok_or_else(invalid)?;
    let major: u8 = major.parse().map_err(|_| invalid())?;
    let minor: u8 = minor.parse().map_err(|_| invalid())?;

    match (major, minor) {
        (1, 0) => Ok(Version::HTTP_10),
        (1, _) => Ok(Version::HTTP_11),
        (0, 9) => Ok(Version::HTTP_09),
        _ => Err(invalid()),
    }
}

/// The wire form of a protocol version.
pub fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::pool;

/// Errors raised by the transport engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer violated the HTTP/1.x framing rules. The connection can no
    /// longer be trusted and is closed.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// The underlying channel failed.
    #[error("transport: {0}")]
    Io(#[from] io::Error),

    /// The connection was closed before the exchange completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No activity was seen on the connection (or the pool) within the timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection pool rejected the operation.
    #[error("pool: {0}")]
    Pool(#[from] pool::Error),

    /// The component was used in a state which does not permit the operation.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The reactor is shutting down or has shut down.
    #[error("reactor shut down")]
    Shutdown,
}

impl Error {
    /// Returns `true` if this error is a timeout, and so may be retried.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Pool(pool::Error::Timeout(_)))
            || matches!(self, Error::Io(error) if error.kind() == io::ErrorKind::TimedOut)
    }

    /// Returns `true` if this error was caused by a peer violating the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Returns `true` if this error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Pool(pool::Error::Cancelled))
    }
}

/// Violations of the HTTP/1.x wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A line exceeded the configured maximum length.
    #[error("maximum line length limit ({limit}) exceeded")]
    LineTooLong {
        /// The configured limit.
        limit: usize,
    },

    /// A message carried more headers than the configured maximum.
    #[error("maximum header count ({limit}) exceeded")]
    TooManyHeaders {
        /// The configured limit.
        limit: usize,
    },

    /// Too many blank lines arrived ahead of a start line.
    #[error("maximum empty line count ({limit}) exceeded before the start line")]
    TooManyEmptyLines {
        /// The limit in force.
        limit: usize,
    },

    /// A message body was larger than the configured maximum.
    #[error("maximum body size ({limit} bytes) exceeded")]
    BodyTooLarge {
        /// The configured limit.
        limit: usize,
    },

    /// The request line could not be parsed.
    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),

    /// The status line could not be parsed.
    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(String),

    /// The protocol version could not be parsed or is not supported.
    #[error("invalid protocol version: {0:?}")]
    InvalidVersion(String),

    /// A header line could not be parsed.
    #[error("invalid header: {0:?}")]
    InvalidHeader(String),

    /// A chunk size line could not be parsed.
    #[error("invalid chunk size: {0:?}")]
    InvalidChunkSize(String),

    /// A chunk was not followed by CRLF.
    #[error("CRLF expected at end of chunk")]
    MissingChunkTerminator,

    /// The stream ended in the middle of a chunk.
    #[error("truncated chunk (expected {expected} bytes, received {received})")]
    TruncatedChunk {
        /// Size declared by the chunk header.
        expected: u64,
        /// Bytes received before the stream ended.
        received: u64,
    },

    /// The stream ended before a content-length delimited body was complete.
    #[error("premature end of content-length delimited body (expected {expected} bytes, received {received})")]
    TruncatedContent {
        /// Declared content length.
        expected: u64,
        /// Bytes received before the stream ended.
        received: u64,
    },

    /// An encoder was completed before it wrote the declared content length.
    #[error("content length mismatch (declared {declared} bytes, wrote {written})")]
    IncompleteContent {
        /// Declared content length.
        declared: u64,
        /// Bytes written before completion.
        written: u64,
    },

    /// The stream ended in the middle of a message head.
    #[error("connection closed while reading the message head")]
    IncompleteHead,

    /// The Content-Length header was invalid or ambiguous.
    #[error("invalid content length: {0:?}")]
    InvalidContentLength(String),

    /// The Transfer-Encoding header named a coding this engine does not support.
    #[error("unsupported transfer encoding: {0:?}")]
    UnsupportedTransferEncoding(String),

    /// Input bytes were not valid in the configured charset.
    #[error("malformed input for charset {charset}")]
    MalformedInput {
        /// Name of the configured charset.
        charset: &'static str,
    },

    /// Output characters cannot be represented in the configured charset.
    #[error("unmappable character {character:?} for charset {charset}")]
    UnmappableCharacter {
        /// Name of the configured charset.
        charset: &'static str,
        /// The offending character.
        character: char,
    },

    /// Bytes arrived on a connection with no exchange in progress.
    #[error("unexpected data on idle connection")]
    UnexpectedData,
}

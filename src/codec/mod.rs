//! Content framing codecs.
//!
//! An HTTP/1.x body is framed in one of three ways, chosen once per message from
//! its head:
//!
//! - [`FramingMode::Length`]: exactly `Content-Length` bytes,
//! - [`FramingMode::Chunked`]: `Transfer-Encoding: chunked`,
//! - [`FramingMode::Identity`]: everything until the connection closes.
//!
//! [`ContentDecoder`] and [`ContentEncoder`] wrap the three strategies behind a
//! single `read` / `write` interface with `is_completed`, so the protocol drivers
//! never need to know which one is in use.

use http::{Method, StatusCode, Version};

use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::channel::Channel;
use crate::message::{Header, Headers, RequestHead, ResponseHead};
use crate::{Error, ProtocolError};

mod chunked;
mod identity;
mod length;

pub use self::chunked::{ChunkedDecoder, ChunkedEncoder};
pub use self::identity::{IdentityDecoder, IdentityEncoder};
pub use self::length::{LengthDelimitedDecoder, LengthDelimitedEncoder};

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// A body of exactly this many bytes.
    Length(u64),

    /// A chunked body.
    Chunked,

    /// A body which ends when the connection closes.
    Identity,
}

impl FramingMode {
    /// Framing of an incoming request body.
    ///
    /// A request without `Transfer-Encoding` or `Content-Length` has no body.
    pub fn for_request(head: &RequestHead) -> Result<Self, ProtocolError> {
        if let Some(coding) = transfer_coding(&head.headers)? {
            return if coding.eq_ignore_ascii_case("chunked") {
                Ok(FramingMode::Chunked)
            } else {
                Err(ProtocolError::UnsupportedTransferEncoding(coding.to_owned()))
            };
        }

        Ok(FramingMode::Length(content_length(&head.headers)?.unwrap_or(0)))
    }

    /// Framing of an incoming response body, given the method of the request it
    /// answers. Returns `None` for responses which never carry a body.
    pub fn for_response(
        method: &Method,
        head: &ResponseHead,
    ) -> Result<Option<Self>, ProtocolError> {
        if !response_has_body(method, head.status) {
            return Ok(None);
        }

        if let Some(coding) = transfer_coding(&head.headers)? {
            return if coding.eq_ignore_ascii_case("chunked") {
                Ok(Some(FramingMode::Chunked))
            } else {
                Ok(Some(FramingMode::Identity))
            };
        }

        Ok(Some(match content_length(&head.headers)? {
            Some(length) => FramingMode::Length(length),
            None => FramingMode::Identity,
        }))
    }

    /// Framing for an outgoing body of known or unknown length.
    ///
    /// HTTP/1.0 peers do not understand chunked coding, so an unknown length is
    /// delimited by closing the connection.
    pub fn outgoing(version: Version, length: Option<u64>) -> Self {
        match length {
            Some(length) => FramingMode::Length(length),
            None if version >= Version::HTTP_11 => FramingMode::Chunked,
            None => FramingMode::Identity,
        }
    }

    /// Set the framing headers for this mode, replacing any existing ones.
    pub fn apply(&self, headers: &mut Headers) {
        headers.remove("content-length");
        headers.remove("transfer-encoding");
        match self {
            FramingMode::Length(length) => {
                headers.push(Header::new("Content-Length", length.to_string()))
            }
            FramingMode::Chunked => headers.push(Header::new("Transfer-Encoding", "chunked")),
            FramingMode::Identity => {}
        }
    }

    /// Returns `true` if the connection can carry another message after this body.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, FramingMode::Identity)
    }
}

/// Returns `true` if a response with this status, to a request with this method,
/// carries a body.
pub fn response_has_body(method: &Method, status: StatusCode) -> bool {
    if *method == Method::HEAD || status.is_informational() {
        return false;
    }
    if *method == Method::CONNECT && status.is_success() {
        return false;
    }
    !matches!(status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED)
}

/// The final transfer coding, if a `Transfer-Encoding` header is present.
fn transfer_coding(headers: &Headers) -> Result<Option<&str>, ProtocolError> {
    if !headers.contains("transfer-encoding") {
        return Ok(None);
    }

    headers
        .get_all("transfer-encoding")
        .flat_map(Header::elements)
        .last()
        .map(Some)
        .ok_or_else(|| ProtocolError::UnsupportedTransferEncoding(String::new()))
}

/// The declared content length. Repeated values must agree.
fn content_length(headers: &Headers) -> Result<Option<u64>, ProtocolError> {
    let mut length = None;
    for header in headers.get_all("content-length") {
        let mut elements = header.elements().peekable();
        if elements.peek().is_none() {
            return Err(ProtocolError::InvalidContentLength(header.value().to_owned()));
        }

        for element in elements {
            if !element.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::InvalidContentLength(element.to_owned()));
            }
            let value: u64 = element
                .parse()
                .map_err(|_| ProtocolError::InvalidContentLength(element.to_owned()))?;
            match length {
                Some(previous) if previous != value => {
                    return Err(ProtocolError::InvalidContentLength(header.value().to_owned()))
                }
                _ => length = Some(value),
            }
        }
    }
    Ok(length)
}

/// Reads a message body in whichever framing the message uses.
#[derive(Debug)]
pub enum ContentDecoder {
    /// `Content-Length` framing.
    LengthDelimited(LengthDelimitedDecoder),

    /// Chunked framing.
    Chunked(ChunkedDecoder),

    /// Read until end of stream.
    Identity(IdentityDecoder),
}

impl ContentDecoder {
    /// Create the decoder for a framing mode.
    pub fn new(mode: FramingMode, max_trailer_count: usize) -> Self {
        match mode {
            FramingMode::Length(length) => {
                ContentDecoder::LengthDelimited(LengthDelimitedDecoder::new(length))
            }
            FramingMode::Chunked => ContentDecoder::Chunked(ChunkedDecoder::new(max_trailer_count)),
            FramingMode::Identity => ContentDecoder::Identity(IdentityDecoder::new()),
        }
    }

    /// Read decoded body bytes into `dst`.
    ///
    /// Returns `None` once the body is complete and `Some(0)` when the channel has
    /// nothing more to offer yet.
    pub fn read<C>(
        &mut self,
        channel: &mut C,
        input: &mut SessionInputBuffer,
        dst: &mut [u8],
    ) -> Result<Option<usize>, Error>
    where
        C: Channel + ?Sized,
    {
        match self {
            ContentDecoder::LengthDelimited(decoder) => decoder.read(channel, input, dst),
            ContentDecoder::Chunked(decoder) => decoder.read(channel, input, dst),
            ContentDecoder::Identity(decoder) => decoder.read(channel, input, dst),
        }
    }

    /// Returns `true` once the whole body has been read.
    pub fn is_completed(&self) -> bool {
        match self {
            ContentDecoder::LengthDelimited(decoder) => decoder.is_completed(),
            ContentDecoder::Chunked(decoder) => decoder.is_completed(),
            ContentDecoder::Identity(decoder) => decoder.is_completed(),
        }
    }

    /// Take any trailer fields received with a chunked body.
    pub fn take_trailers(&mut self) -> Headers {
        match self {
            ContentDecoder::Chunked(decoder) => decoder.take_trailers(),
            _ => Headers::new(),
        }
    }
}

/// Writes a message body in whichever framing the message uses.
#[derive(Debug)]
pub enum ContentEncoder {
    /// `Content-Length` framing.
    LengthDelimited(LengthDelimitedEncoder),

    /// Chunked framing.
    Chunked(ChunkedEncoder),

    /// Write until the connection is closed.
    Identity(IdentityEncoder),
}

impl ContentEncoder {
    /// Create the encoder for a framing mode.
    pub fn new(mode: FramingMode) -> Self {
        match mode {
            FramingMode::Length(length) => {
                ContentEncoder::LengthDelimited(LengthDelimitedEncoder::new(length))
            }
            FramingMode::Chunked => ContentEncoder::Chunked(ChunkedEncoder::new()),
            FramingMode::Identity => ContentEncoder::Identity(IdentityEncoder::new()),
        }
    }

    /// Write body bytes, returning how many bytes of `src` were consumed.
    pub fn write<C>(
        &mut self,
        channel: &mut C,
        output: &mut SessionOutputBuffer,
        src: &[u8],
    ) -> Result<usize, Error>
    where
        C: Channel + ?Sized,
    {
        match self {
            ContentEncoder::LengthDelimited(encoder) => encoder.write(channel, output, src),
            ContentEncoder::Chunked(encoder) => encoder.write(channel, output, src),
            ContentEncoder::Identity(encoder) => encoder.write(channel, output, src),
        }
    }

    /// Finish the body. Trailers are only sent with chunked framing.
    pub fn complete(
        &mut self,
        output: &mut SessionOutputBuffer,
        trailers: &Headers,
    ) -> Result<(), Error> {
        match self {
            ContentEncoder::LengthDelimited(encoder) => encoder.complete(),
            ContentEncoder::Chunked(encoder) => encoder.complete(output, trailers),
            ContentEncoder::Identity(encoder) => encoder.complete(),
        }
    }

    /// Returns `true` once the body has been completed.
    pub fn is_completed(&self) -> bool {
        match self {
            ContentEncoder::LengthDelimited(encoder) => encoder.is_completed(),
            ContentEncoder::Chunked(encoder) => encoder.is_completed(),
            ContentEncoder::Identity(encoder) => encoder.is_completed(),
        }
    }
}

use std::fmt;

use crate::buffer::{LineRead, SessionInputBuffer};
use crate::channel::Channel;
use crate::{Error, ProtocolError};

use super::{Header, MessageHead, RequestHead, ResponseHead};

/// Progress of a [`MessageParser`] through a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for the request line or status line.
    ReadHeadLine,

    /// Reading header lines until the blank line.
    ReadHeaders,

    /// A head was returned; the parser must be [reset](MessageParser::reset).
    Completed,
}

/// Blank lines tolerated ahead of a start line when the header count is not limited.
const MAX_EMPTY_LINES: usize = 100;

/// Incremental parser for message heads.
///
/// The parser consumes one line at a time, so a head split across any number of
/// reads is assembled without buffering the whole head up front.
pub struct MessageParser<H> {
    state: ParserState,
    head: Option<H>,
    max_header_count: usize,
    empty_lines: usize,
    line: String,
}

/// Parser for request heads, used by servers.
pub type RequestParser = MessageParser<RequestHead>;

/// Parser for response heads, used by clients.
pub type ResponseParser = MessageParser<ResponseHead>;

impl<H: MessageHead> MessageParser<H> {
    /// Create a parser. A `max_header_count` of zero disables the header limit.
    ///
    /// Blank lines ahead of the start line are skipped, up to `max_header_count`
    /// of them (or 100 without a header limit).
    pub fn new(max_header_count: usize) -> Self {
        Self {
            state: ParserState::ReadHeadLine,
            head: None,
            max_header_count,
            empty_lines: 0,
            line: String::new(),
        }
    }

    /// The current parser state.
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Returns `true` once at least part of a head has been consumed.
    pub fn in_progress(&self) -> bool {
        self.state == ParserState::ReadHeaders
    }

    /// Prepare to parse the next message head.
    pub fn reset(&mut self) {
        self.state = ParserState::ReadHeadLine;
        self.head = None;
        self.empty_lines = 0;
        self.line.clear();
    }

    /// Consume lines from the input buffer, pulling from the channel as needed.
    ///
    /// Returns the head once the blank line has been read, or `None` if the channel
    /// has no more bytes to offer yet. End of stream before the start line is a
    /// [`Error::ConnectionClosed`]; end of stream inside a head is a protocol error.
    pub fn parse<C>(
        &mut self,
        input: &mut SessionInputBuffer,
        channel: &mut C,
    ) -> Result<Option<H>, Error>
    where
        C: Channel + ?Sized,
    {
        if self.state == ParserState::Completed {
            return Err(Error::IllegalState("message parser must be reset before reuse"));
        }

        loop {
            self.line.clear();
            match input.read_line_from(channel, &mut self.line)? {
                LineRead::Line => {
                    let line = std::mem::take(&mut self.line);
                    if let Some(head) = self.parse_line(line)? {
                        return Ok(Some(head));
                    }
                }
                LineRead::Incomplete => return Ok(None),
                LineRead::EndOfStream if self.state == ParserState::ReadHeadLine => {
                    return Err(Error::ConnectionClosed)
                }
                LineRead::EndOfStream => return Err(ProtocolError::IncompleteHead.into()),
            }
        }
    }

    /// Feed one complete line, without its terminator, to the parser.
    pub fn parse_line(&mut self, line: String) -> Result<Option<H>, ProtocolError> {
        match self.state {
            ParserState::ReadHeadLine => {
                if line.is_empty() {
                    let limit = match self.max_header_count {
                        0 => MAX_EMPTY_LINES,
                        limit => limit,
                    };
                    self.empty_lines += 1;
                    if self.empty_lines > limit {
                        return Err(ProtocolError::TooManyEmptyLines { limit });
                    }
                    return Ok(None);
                }

                self.head = Some(H::parse_start_line(&line)?);
                self.state = ParserState::ReadHeaders;
                Ok(None)
            }
            ParserState::ReadHeaders => {
                let Some(head) = self.head.as_mut() else {
                    self.state = ParserState::ReadHeadLine;
                    return Ok(None);
                };

                if line.is_empty() {
                    self.state = ParserState::Completed;
                    return Ok(self.head.take());
                }

                let headers = head.headers_mut();
                if line.starts_with([' ', '\t']) {
                    match headers.last_mut() {
                        Some(previous) => previous.fold(&line),
                        None => return Err(ProtocolError::InvalidHeader(line)),
                    }
                    return Ok(None);
                }

                if self.max_header_count > 0 && headers.len() >= self.max_header_count {
                    return Err(ProtocolError::TooManyHeaders {
                        limit: self.max_header_count,
                    });
                }
                headers.push(Header::parse(line)?);
                Ok(None)
            }
            ParserState::Completed => Ok(None),
        }
    }
}

impl<H> fmt::Debug for MessageParser<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageParser")
            .field("state", &self.state)
            .field("max_header_count", &self.max_header_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{Method, StatusCode};

    use crate::channel::mock::MockChannel;
    use crate::charset::CharCodingConfig;
    use crate::message::Headers;

    fn parse_request(
        chunks: &[&'static [u8]],
        max_header_count: usize,
    ) -> Result<RequestHead, Error> {
        let mut channel = MockChannel::with_input(chunks.iter().copied());
        let mut input = SessionInputBuffer::new(64, 256, CharCodingConfig::default());
        let mut parser = RequestParser::new(max_header_count);
        loop {
            if let Some(head) = parser.parse(&mut input, &mut channel)? {
                return Ok(head);
            }
        }
    }

    fn values(headers: &Headers) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|header| (header.name().to_owned(), header.value().to_owned()))
            .collect()
    }

    #[test]
    fn request_head() {
        let _ = tracing_subscriber::fmt::try_init();

        let head = parse_request(
            &[b"POST /submit HTTP/1.1\r\nHost: example.com\r\n", b"Content-Length: 3\r\n\r\nabc"],
            0,
        )
        .unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.target, "/submit");
        assert_eq!(
            values(&head.headers),
            [
                ("Host".to_owned(), "example.com".to_owned()),
                ("Content-Length".to_owned(), "3".to_owned())
            ]
        );
    }

    #[test]
    fn head_split_at_every_byte() {
        let raw: &'static [u8] = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\n\r\n";
        let chunks: Vec<&'static [u8]> = raw.chunks(1).collect();
        let head = parse_request(&chunks, 0).unwrap();
        assert_eq!(head.headers.len(), 2);
    }

    #[test]
    fn folded_header() {
        let wire: &[u8] = b"GET / HTTP/1.1\r\nX-A: foo\r\n  bar\r\nX-B: baz\r\n\r\n";
        let head = parse_request(&[wire], 0).unwrap();
        assert_eq!(head.headers.value("x-a"), Some("foo bar"));
        assert_eq!(head.headers.value("x-b"), Some("baz"));
        assert_eq!(head.headers.len(), 2);
    }

    #[test]
    fn continuation_without_header() {
        let error = parse_request(&[b"GET / HTTP/1.1\r\n  bar\r\n\r\n"], 0).unwrap_err();
        assert!(matches!(
            error,
            Error::Protocol(ProtocolError::InvalidHeader(_))
        ));
    }

    #[test]
    fn duplicates_in_order() {
        let wire: &[u8] = b"GET / HTTP/1.1\r\nVia: a\r\nHost: h\r\nvia: b\r\n\r\n";
        let head = parse_request(&[wire], 0).unwrap();
        let via: Vec<_> = head.headers.get_all("VIA").map(Header::value).collect();
        assert_eq!(via, ["a", "b"]);
    }

    #[test]
    fn too_many_headers() {
        let wire: &[u8] = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        let error = parse_request(&[wire], 2).unwrap_err();
        assert!(matches!(
            error,
            Error::Protocol(ProtocolError::TooManyHeaders { limit: 2 })
        ));

        // Folded lines extend an existing header rather than adding one.
        parse_request(&[b"GET / HTTP/1.1\r\nA: 1\r\n 1\r\nB: 2\r\n\r\n"], 2).unwrap();
    }

    #[test]
    fn leading_blank_lines_are_skipped() {
        let head = parse_request(&[b"\r\n\r\nGET / HTTP/1.1\r\n\r\n"], 0).unwrap();
        assert_eq!(head.method, Method::GET);
    }

    #[test]
    fn leading_blank_lines_are_limited() {
        parse_request(&[b"\r\n\r\nGET / HTTP/1.1\r\n\r\n"], 2).unwrap();

        let error = parse_request(&[b"\r\n\r\n\r\nGET / HTTP/1.1\r\n\r\n"], 2).unwrap_err();
        assert!(matches!(
            error,
            Error::Protocol(ProtocolError::TooManyEmptyLines { limit: 2 })
        ));

        let blank: &'static [u8] = Vec::leak(b"\r\n".repeat(101));
        let error = parse_request(&[blank], 0).unwrap_err();
        assert!(matches!(
            error,
            Error::Protocol(ProtocolError::TooManyEmptyLines { limit: 100 })
        ));
    }

    #[test]
    fn end_of_stream() {
        assert!(matches!(
            parse_request(&[], 0).unwrap_err(),
            Error::ConnectionClosed
        ));
        assert!(matches!(
            parse_request(&[b"GET / HTTP/1.1\r\nHost: x\r\n"], 0).unwrap_err(),
            Error::Protocol(ProtocolError::IncompleteHead)
        ));
    }

    #[test]
    fn incomplete_then_reset() {
        let mut channel = MockChannel::new();
        let mut input = SessionInputBuffer::new(64, 256, CharCodingConfig::default());
        let mut parser = ResponseParser::new(0);

        channel.push_input(&b"HTTP/1.1 200 OK\r\nConn"[..]);
        assert!(parser.parse(&mut input, &mut channel).unwrap().is_none());
        assert!(parser.in_progress());

        channel.push_input(&b"ection: close\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n"[..]);
        let head = parser.parse(&mut input, &mut channel).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert!(head.headers.contains_token("connection", "close"));
        assert_eq!(parser.state(), ParserState::Completed);
        assert!(matches!(
            parser.parse(&mut input, &mut channel),
            Err(Error::IllegalState(_))
        ));

        parser.reset();
        let head = parser.parse(&mut input, &mut channel).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);
    }
}

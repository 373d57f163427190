use std::fmt::Write as _;

use tracing::trace;

use crate::buffer::{LineRead, SessionInputBuffer, SessionOutputBuffer};
use crate::channel::Channel;
use crate::message::{Header, Headers};
use crate::{Error, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadSize,
    ReadData { size: u64, remaining: u64 },
    ReadCrlf,
    Trailers,
    Done,
}

/// Decodes a `Transfer-Encoding: chunked` body.
///
/// Chunk extensions after the size are ignored. Trailer fields following the
/// last chunk are collected and available from [`trailers`](Self::trailers) once
/// the body is complete.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line: String,
    trailers: Headers,
    max_trailer_count: usize,
}

impl ChunkedDecoder {
    /// Create a decoder. A `max_trailer_count` of zero disables the trailer limit.
    pub fn new(max_trailer_count: usize) -> Self {
        Self {
            state: State::ReadSize,
            line: String::new(),
            trailers: Headers::new(),
            max_trailer_count,
        }
    }

    /// Returns `true` once the last chunk and trailers have been read.
    pub fn is_completed(&self) -> bool {
        self.state == State::Done
    }

    /// Trailer fields received after the last chunk.
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    /// Take the trailer fields, leaving an empty list.
    pub fn take_trailers(&mut self) -> Headers {
        std::mem::take(&mut self.trailers)
    }

    /// Read decoded body bytes into `dst`.
    ///
    /// Returns `None` once the body is complete, and `Some(0)` if the channel has no
    /// more bytes to offer yet.
    pub fn read<C>(
        &mut self,
        channel: &mut C,
        input: &mut SessionInputBuffer,
        dst: &mut [u8],
    ) -> Result<Option<usize>, Error>
    where
        C: Channel + ?Sized,
    {
        loop {
            match self.state {
                State::ReadSize => {
                    if !self.next_line(channel, input, Error::ConnectionClosed)? {
                        return Ok(Some(0));
                    }
                    let size = parse_chunk_size(&self.line)?;
                    trace!(size, "chunk");
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ReadData {
                            size,
                            remaining: size,
                        }
                    };
                }
                State::ReadData { size, remaining } => {
                    if dst.is_empty() {
                        return Ok(Some(0));
                    }

                    if input.is_empty() {
                        match input.fill(channel)? {
                            Some(0) => return Ok(Some(0)),
                            Some(_) => {}
                            None => {
                                return Err(ProtocolError::TruncatedChunk {
                                    expected: size,
                                    received: size - remaining,
                                }
                                .into())
                            }
                        }
                    }

                    let max = usize::try_from(remaining).map_or(dst.len(), |r| dst.len().min(r));
                    let n = input.read(&mut dst[..max]);
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::ReadCrlf
                    } else {
                        State::ReadData { size, remaining }
                    };
                    return Ok(Some(n));
                }
                State::ReadCrlf => {
                    let missing = ProtocolError::MissingChunkTerminator.into();
                    if !self.next_line(channel, input, missing)? {
                        return Ok(Some(0));
                    }
                    if !self.line.is_empty() {
                        return Err(ProtocolError::MissingChunkTerminator.into());
                    }
                    self.state = State::ReadSize;
                }
                State::Trailers => {
                    if !self.next_line(channel, input, Error::ConnectionClosed)? {
                        return Ok(Some(0));
                    }
                    if self.line.is_empty() {
                        self.state = State::Done;
                        continue;
                    }
                    self.trailer()?;
                }
                State::Done => return Ok(None),
            }
        }
    }

    /// Read the next line into `self.line`, returning `false` if it is incomplete.
    fn next_line<C>(
        &mut self,
        channel: &mut C,
        input: &mut SessionInputBuffer,
        end_of_stream: Error,
    ) -> Result<bool, Error>
    where
        C: Channel + ?Sized,
    {
        self.line.clear();
        match input.read_line_from(channel, &mut self.line)? {
            LineRead::Line => Ok(true),
            LineRead::Incomplete => Ok(false),
            LineRead::EndOfStream => Err(end_of_stream),
        }
    }

    fn trailer(&mut self) -> Result<(), ProtocolError> {
        let line = std::mem::take(&mut self.line);
        if line.starts_with([' ', '\t']) {
            return match self.trailers.last_mut() {
                Some(previous) => {
                    previous.fold(&line);
                    Ok(())
                }
                None => Err(ProtocolError::InvalidHeader(line)),
            };
        }

        if self.max_trailer_count > 0 && self.trailers.len() >= self.max_trailer_count {
            return Err(ProtocolError::TooManyHeaders {
                limit: self.max_trailer_count,
            });
        }
        self.trailers.push(Header::parse(line)?);
        Ok(())
    }
}

fn parse_chunk_size(line: &str) -> Result<u64, ProtocolError> {
    let invalid = || ProtocolError::InvalidChunkSize(line.to_owned());

    let size = match line.split_once(';') {
        Some((size, _extensions)) => size,
        None => line,
    };
    let size = size.trim_matches([' ', '\t']);
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    u64::from_str_radix(size, 16).map_err(|_| invalid())
}

/// Smallest chunk written when an empty output buffer is too small for framing.
const MIN_CHUNK_SIZE: usize = 16;

/// Encodes a body with `Transfer-Encoding: chunked`.
///
/// Each write becomes one chunk, sized to fit the free space in the output buffer.
/// An empty buffer too small to hold the framing still takes a small chunk, past
/// its nominal size.
#[derive(Debug, Default)]
pub struct ChunkedEncoder {
    completed: bool,
    line: String,
}

impl ChunkedEncoder {
    /// Create an encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the last chunk has been written.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Write as much of `src` as fits in one chunk.
    ///
    /// Returns how many bytes of `src` were consumed, which is zero if the output
    /// buffer is full and the channel accepts nothing.
    pub fn write<C>(
        &mut self,
        channel: &mut C,
        output: &mut SessionOutputBuffer,
        src: &[u8],
    ) -> Result<usize, Error>
    where
        C: Channel + ?Sized,
    {
        if self.completed {
            return Err(Error::IllegalState("chunked body is already complete"));
        }
        if src.is_empty() {
            return Ok(0);
        }

        let mut available = output.available();
        if available < src.len() + overhead(available) {
            output.flush(channel)?;
            available = output.available();
        }

        let overhead = overhead(available);
        let room = if available > overhead {
            available - overhead
        } else if output.is_empty() {
            MIN_CHUNK_SIZE
        } else {
            return Ok(0);
        };

        let chunk = src.len().min(room);
        self.line.clear();
        let _ = write!(self.line, "{chunk:x}");
        output.write_line(&self.line)?;
        output.write(&src[..chunk]);
        output.write(b"\r\n");
        Ok(chunk)
    }

    /// Write the last chunk, any trailers, and the terminating blank line.
    pub fn complete(
        &mut self,
        output: &mut SessionOutputBuffer,
        trailers: &Headers,
    ) -> Result<(), Error> {
        if self.completed {
            return Err(Error::IllegalState("chunked body is already complete"));
        }

        for trailer in trailers {
            trailer.validate()?;
        }

        output.write_line("0")?;
        for trailer in trailers {
            match trailer.line() {
                Some(line) => output.write_line(line)?,
                None => {
                    self.line.clear();
                    let _ = write!(self.line, "{trailer}");
                    output.write_line(&self.line)?;
                }
            }
        }
        output.write_line("")?;
        self.completed = true;
        Ok(())
    }
}

/// Bytes around a chunk of at most `available` bytes: the size digits and two CRLFs.
fn overhead(available: usize) -> usize {
    let digits = (usize::BITS - available.leading_zeros()).div_ceil(4).max(1) as usize;
    digits + 4
}

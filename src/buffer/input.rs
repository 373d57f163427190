use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::channel::{self, Channel};
use crate::charset::CharCodingConfig;
use crate::{Error, ProtocolError};

/// Outcome of [`SessionInputBuffer::read_line_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line was appended to the destination.
    Line,

    /// No complete line is available until the channel becomes readable again.
    Incomplete,

    /// The channel reached end of stream with no partial line pending.
    EndOfStream,
}

/// The inbound half of a session: a byte buffer with line-oriented reads.
///
/// Bytes pulled from the channel by [`fill`](Self::fill) sit in the buffer until
/// they are consumed as lines (for message heads) or as raw bytes (for bodies).
/// A line which spans several fills is accumulated in a side line buffer, so the
/// main buffer never has to grow to hold a long line; the line length limit is
/// checked after every partial accumulation.
#[derive(Debug)]
pub struct SessionInputBuffer {
    buffer: BytesMut,
    buffer_size: usize,
    line_buffer: BytesMut,
    max_line_length: usize,
    coding: CharCodingConfig,
}

impl SessionInputBuffer {
    /// Create an input buffer.
    ///
    /// `max_line_length` of zero disables the line length limit.
    pub fn new(buffer_size: usize, max_line_length: usize, coding: CharCodingConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            line_buffer: BytesMut::new(),
            max_line_length,
            coding,
        }
    }

    /// Number of buffered bytes which have not been consumed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if no unconsumed bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns `true` if a partial line is waiting for its terminator.
    pub fn has_partial_line(&self) -> bool {
        !self.line_buffer.is_empty()
    }

    /// The maximum number of unconsumed bytes held at once.
    pub fn capacity(&self) -> usize {
        self.buffer_size
    }

    /// Pull bytes from the channel into the buffer.
    ///
    /// Returns the number of bytes read, zero if the channel had nothing to offer
    /// or the buffer is full, and `None` at end of stream.
    pub fn fill<C>(&mut self, channel: &mut C) -> std::io::Result<Option<usize>>
    where
        C: Channel + ?Sized,
    {
        let start = self.buffer.len();
        let space = self.buffer_size.saturating_sub(start);
        if space == 0 {
            return Ok(Some(0));
        }

        self.buffer.resize(start + space, 0);
        let result = channel::read_some(channel, &mut self.buffer[start..]);
        let read = match result {
            Ok(Some(n)) => n,
            _ => 0,
        };
        self.buffer.truncate(start + read);

        trace!(read, buffered = self.buffer.len(), "fill");
        result
    }

    /// Copy buffered bytes into `dst`, returning how many were copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buffer.len());
        self.buffer.copy_to_slice(&mut dst[..n]);
        n
    }

    /// Split up to `max` buffered bytes off the front of the buffer without copying.
    pub fn read_bytes(&mut self, max: usize) -> Bytes {
        let n = max.min(self.buffer.len());
        self.buffer.split_to(n).freeze()
    }

    /// Take a complete line from the buffered bytes.
    ///
    /// On success the decoded line, without its LF or CRLF terminator, is appended
    /// to `dst` and `true` is returned. If no terminator is buffered, the partial
    /// line is retained and `false` is returned, unless `end_of_stream` is set, in
    /// which case a pending partial line is returned as the final line.
    pub fn read_line(
        &mut self,
        dst: &mut String,
        end_of_stream: bool,
    ) -> Result<bool, ProtocolError> {
        let terminated = match self.buffer.iter().position(|&b| b == b'\n') {
            Some(position) => {
                let chunk = self.buffer.split_to(position + 1);
                self.line_buffer.extend_from_slice(&chunk);
                true
            }
            None => {
                self.line_buffer.extend_from_slice(&self.buffer);
                self.buffer.clear();
                false
            }
        };

        let mut end = self.line_buffer.len();
        if terminated {
            end -= 1;
        }
        if end > 0 && self.line_buffer[end - 1] == b'\r' {
            end -= 1;
        }

        if self.max_line_length > 0 && end > self.max_line_length {
            self.line_buffer.clear();
            return Err(ProtocolError::LineTooLong {
                limit: self.max_line_length,
            });
        }

        if !terminated && !(end_of_stream && !self.line_buffer.is_empty()) {
            return Ok(false);
        }

        let decoded = self.coding.decode(&self.line_buffer[..end]).map(|line| {
            dst.push_str(&line);
        });
        self.line_buffer.clear();
        decoded.map(|_| true)
    }

    /// Read a line, pulling from the channel until a line is complete, the channel
    /// has nothing more to offer, or it reaches end of stream.
    pub fn read_line_from<C>(
        &mut self,
        channel: &mut C,
        dst: &mut String,
    ) -> Result<LineRead, Error>
    where
        C: Channel + ?Sized,
    {
        loop {
            if self.read_line(dst, false)? {
                return Ok(LineRead::Line);
            }

            match self.fill(channel)? {
                Some(0) => return Ok(LineRead::Incomplete),
                Some(_) => continue,
                None => {
                    return if self.read_line(dst, true)? {
                        Ok(LineRead::Line)
                    } else {
                        Ok(LineRead::EndOfStream)
                    }
                }
            }
        }
    }

    /// Discard all buffered bytes and any partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.line_buffer.clear();
    }
}

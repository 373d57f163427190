use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::channel::{self, Channel};
use crate::charset::CharCodingConfig;
use crate::ProtocolError;

const CRLF: &[u8] = b"\r\n";

/// The outbound half of a session.
///
/// Head lines and small body fragments are accumulated and written to the
/// channel in as few calls as possible. Writes larger than the fragment size hint
/// bypass the buffer once it has been flushed.
#[derive(Debug)]
pub struct SessionOutputBuffer {
    buffer: BytesMut,
    buffer_size: usize,
    fragment_size_hint: usize,
    coding: CharCodingConfig,
}

impl SessionOutputBuffer {
    /// Create an output buffer.
    pub fn new(buffer_size: usize, fragment_size_hint: usize, coding: CharCodingConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            fragment_size_hint,
            coding,
        }
    }

    /// Number of bytes waiting to be flushed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing is waiting to be flushed.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Free space before the buffer reaches its nominal size.
    pub fn available(&self) -> usize {
        self.buffer_size.saturating_sub(self.buffer.len())
    }

    /// The nominal size of the buffer.
    pub fn capacity(&self) -> usize {
        self.buffer_size
    }

    /// Encode a line and append it, followed by CRLF.
    ///
    /// Head lines are always buffered in full, even past the nominal size, so that a
    /// head is never interleaved with a partial flush.
    pub fn write_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        let mark = self.buffer.len();
        if let Err(error) = self.coding.encode(line, &mut self.buffer) {
            self.buffer.truncate(mark);
            return Err(error);
        }
        self.buffer.extend_from_slice(CRLF);
        Ok(())
    }

    /// Append raw bytes, regardless of the nominal size.
    pub fn write(&mut self, src: &[u8]) {
        self.buffer.extend_from_slice(src);
    }

    /// Write buffered bytes to the channel until it stops accepting them.
    ///
    /// Returns the number of bytes written.
    pub fn flush<C>(&mut self, channel: &mut C) -> std::io::Result<usize>
    where
        C: Channel + ?Sized,
    {
        let mut written = 0;
        while !self.buffer.is_empty() {
            let n = channel::write_some(channel, &self.buffer)?;
            if n == 0 {
                break;
            }
            self.buffer.advance(n);
            written += n;
        }

        trace!(written, remaining = self.buffer.len(), "flush");
        Ok(written)
    }

    /// Accept as much of `src` as possible without blocking.
    ///
    /// Small writes are copied into free buffer space. Once the buffer is empty,
    /// a write larger than the fragment size hint goes straight to the channel, and
    /// is only buffered if the channel accepts nothing. Returns how many bytes of
    /// `src` were accepted.
    pub fn write_through<C>(&mut self, channel: &mut C, src: &[u8]) -> std::io::Result<usize>
    where
        C: Channel + ?Sized,
    {
        if src.len() > self.fragment_size_hint || src.len() > self.available() {
            self.flush(channel)?;
        }

        if self.buffer.is_empty() && src.len() > self.fragment_size_hint {
            let n = channel::write_some(channel, src)?;
            if n > 0 {
                return Ok(n);
            }
        }

        let n = src.len().min(self.available());
        self.buffer.extend_from_slice(&src[..n]);
        Ok(n)
    }

    /// Discard anything waiting to be flushed.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

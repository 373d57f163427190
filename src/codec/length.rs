use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::channel::Channel;
use crate::{Error, ProtocolError};

/// Decodes a body of exactly `length` bytes.
#[derive(Debug, Clone)]
pub struct LengthDelimitedDecoder {
    length: u64,
    remaining: u64,
}

impl LengthDelimitedDecoder {
    /// Create a decoder for a body of `length` bytes.
    pub fn new(length: u64) -> Self {
        Self {
            length,
            remaining: length,
        }
    }

    /// Returns `true` once every byte has been read.
    pub fn is_completed(&self) -> bool {
        self.remaining == 0
    }

    /// Bytes still to be read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read body bytes into `dst`, never past the end of the body.
    ///
    /// Returns `None` once the body is complete.
    pub fn read<C>(
        &mut self,
        channel: &mut C,
        input: &mut SessionInputBuffer,
        dst: &mut [u8],
    ) -> Result<Option<usize>, Error>
    where
        C: Channel + ?Sized,
    {
        if self.remaining == 0 {
            return Ok(None);
        }

        if input.is_empty() {
            match input.fill(channel)? {
                Some(0) => return Ok(Some(0)),
                Some(_) => {}
                None => {
                    return Err(ProtocolError::TruncatedContent {
                        expected: self.length,
                        received: self.length - self.remaining,
                    }
                    .into())
                }
            }
        }

        let max = clamp(dst.len(), self.remaining);
        let n = input.read(&mut dst[..max]);
        self.remaining -= n as u64;
        Ok(Some(n))
    }
}

/// Encodes a body of exactly `length` bytes.
#[derive(Debug, Clone)]
pub struct LengthDelimitedEncoder {
    length: u64,
    remaining: u64,
    completed: bool,
    finished: bool,
}

impl LengthDelimitedEncoder {
    /// Create an encoder for a body of `length` bytes.
    pub fn new(length: u64) -> Self {
        Self {
            length,
            remaining: length,
            completed: length == 0,
            finished: false,
        }
    }

    /// Returns `true` once every declared byte has been written.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Write body bytes, accepting no more than the remaining length.
    ///
    /// Returns how many bytes of `src` were consumed; writing to a completed
    /// encoder is an error.
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
            return Err(Error::IllegalState("content-length delimited body is already complete"));
        }

        let max = clamp(src.len(), self.remaining);
        let n = output.write_through(channel, &src[..max])?;
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.completed = true;
        }
        Ok(n)
    }

    /// Finish the body, which must have been written in full.
    ///
    /// A short body keeps failing until the rest is written; finishing twice is an
    /// error.
    pub fn complete(&mut self) -> Result<(), Error> {
        if self.finished {
            return Err(Error::IllegalState("content-length delimited body is already complete"));
        }
        if self.remaining > 0 {
            return Err(ProtocolError::IncompleteContent {
                declared: self.length,
                written: self.length - self.remaining,
            }
            .into());
        }
        self.completed = true;
        self.finished = true;
        Ok(())
    }
}

fn clamp(len: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(len, |remaining| len.min(remaining))
}

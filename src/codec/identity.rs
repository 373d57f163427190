use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::channel::Channel;
use crate::Error;

/// Decodes a body delimited by the end of the stream.
#[derive(Debug, Clone, Default)]
pub struct IdentityDecoder {
    completed: bool,
}

impl IdentityDecoder {
    /// Create a decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the channel has reached end of stream.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Read body bytes into `dst`. Returns `None` at end of stream.
    pub fn read<C>(
        &mut self,
        channel: &mut C,
        input: &mut SessionInputBuffer,
        dst: &mut [u8],
    ) -> Result<Option<usize>, Error>
    where
        C: Channel + ?Sized,
    {
        if self.completed {
            return Ok(None);
        }

        if input.is_empty() {
            match input.fill(channel)? {
                Some(0) => return Ok(Some(0)),
                Some(_) => {}
                None => {
                    self.completed = true;
                    return Ok(None);
                }
            }
        }

        Ok(Some(input.read(dst)))
    }
}

/// Encodes a body delimited by closing the connection.
#[derive(Debug, Clone, Default)]
pub struct IdentityEncoder {
    completed: bool,
}

impl IdentityEncoder {
    /// Create an encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once [`complete`](Self::complete) has been called.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Write body bytes, returning how many were consumed.
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
            return Err(Error::IllegalState("identity body is already complete"));
        }
        Ok(output.write_through(channel, src)?)
    }

    /// Mark the body complete. The connection must be closed once output is flushed.
    pub fn complete(&mut self) -> Result<(), Error> {
        if self.completed {
            return Err(Error::IllegalState("identity body is already complete"));
        }
        self.completed = true;
        Ok(())
    }
}

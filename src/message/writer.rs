use crate::buffer::SessionOutputBuffer;
use crate::ProtocolError;

use super::MessageHead;

/// Serializes message heads into a session output buffer.
///
/// Headers which were parsed off the wire are written back from their original
/// line; headers built in code are formatted as `name: value`.
#[derive(Debug, Default)]
pub struct MessageWriter {
    line: String,
}

impl MessageWriter {
    /// Create a writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the start line, every header and the terminating blank line.
    ///
    /// The head is only buffered; the caller flushes the output buffer.
    pub fn write<H: MessageHead>(
        &mut self,
        head: &H,
        output: &mut SessionOutputBuffer,
    ) -> Result<(), ProtocolError> {
        for header in head.headers() {
            header.validate()?;
        }

        self.line.clear();
        head.format_start_line(&mut self.line);
        output.write_line(&self.line)?;

        for header in head.headers() {
            match header.line() {
                Some(line) => output.write_line(line)?,
                None => {
                    self.line.clear();
                    self.line.push_str(header.name());
                    self.line.push_str(": ");
                    self.line.push_str(header.value());
                    output.write_line(&self.line)?;
                }
            }
        }

        output.write_line("")
    }
}

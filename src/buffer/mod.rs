//! Session buffers.
//!
//! Each connection owns one [`SessionInputBuffer`] and one [`SessionOutputBuffer`].
//! They sit between the non-blocking [`Channel`](crate::channel::Channel) and the
//! message parser / framing codecs, absorbing partial reads and short writes so that
//! nothing above them ever has to retry I/O by hand.
//!
//! Buffers are never shared between connections and are only touched by the
//! reactor worker which owns the session, so they carry no internal locking.

mod input;
mod output;

pub use self::input::{LineRead, SessionInputBuffer};
pub use self::output::SessionOutputBuffer;

#[cfg(test)]
mod tests {
    use super::*;

    use crate::channel::mock::MockChannel;
    use crate::charset::CharCodingConfig;

    fn roundtrip(lines: &[&str], split: usize) -> Vec<String> {
        let mut sink = MockChannel::new();
        let mut output = SessionOutputBuffer::new(64, 16, CharCodingConfig::default());
        for line in lines {
            output.write_line(line).unwrap();
        }
        output.flush(&mut sink).unwrap();
        assert!(output.is_empty());

        let written = sink.written();
        let mut source = MockChannel::with_input(
            written
                .chunks(split)
                .map(bytes::Bytes::copy_from_slice)
                .collect::<Vec<_>>(),
        );
        let mut input = SessionInputBuffer::new(16, 0, CharCodingConfig::default());

        let mut decoded = Vec::new();
        loop {
            let mut line = String::new();
            match input.read_line_from(&mut source, &mut line).unwrap() {
                LineRead::Line => decoded.push(line),
                LineRead::Incomplete => continue,
                LineRead::EndOfStream => break,
            }
        }
        decoded
    }

    #[test]
    fn line_roundtrip() {
        let _ = tracing_subscriber::fmt::try_init();

        let lines = [
            "GET / HTTP/1.1",
            "",
            "Host: example.com",
            "a line which is longer than the buffer itself",
            "",
        ];

        for split in [1, 2, 5, 7, 64] {
            assert_eq!(roundtrip(&lines, split), lines, "split at {split}");
        }
    }

    #[test]
    fn end_of_stream_is_distinct_from_empty_line() {
        let mut source = MockChannel::with_input([&b"\r\n"[..]]);
        let mut input = SessionInputBuffer::new(16, 0, CharCodingConfig::default());

        let mut line = String::new();
        assert_eq!(
            input.read_line_from(&mut source, &mut line).unwrap(),
            LineRead::Line
        );
        assert_eq!(line, "");

        assert_eq!(
            input.read_line_from(&mut source, &mut line).unwrap(),
            LineRead::EndOfStream
        );
    }
}

//! Character coding for message heads.
//!
//! HTTP/1.x heads are nominally US-ASCII, but peers routinely send ISO-8859-1 or
//! UTF-8 in header values. Session buffers decode each complete line with a
//! [`CharCodingConfig`], which names the charset and what to do with bytes (or
//! characters) that do not fit it.

use std::borrow::Cow;
use std::fmt;

use bytes::BufMut;
use bytes::BytesMut;

use crate::ProtocolError;

/// Character sets supported for message heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Charset {
    /// 7-bit US-ASCII.
    #[default]
    Ascii,

    /// ISO-8859-1, where every byte maps to the code point of the same value.
    Latin1,

    /// UTF-8.
    Utf8,
}

impl Charset {
    /// The IANA name of this charset.
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Ascii => "US-ASCII",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Utf8 => "UTF-8",
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with input that cannot be decoded, or output that cannot be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodingErrorAction {
    /// Fail with a protocol error.
    #[default]
    Report,

    /// Substitute a replacement character (`U+FFFD` when decoding, `?` when encoding).
    Replace,

    /// Drop the offending input.
    Ignore,
}

/// Charset and error policy used to decode and encode head lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct CharCodingConfig {
    /// The charset used on the wire.
    pub charset: Charset,

    /// Policy for bytes which are not valid in the charset.
    pub malformed_input_action: CodingErrorAction,

    /// Policy for characters which the charset cannot represent.
    pub unmappable_input_action: CodingErrorAction,
}

impl CharCodingConfig {
    /// Create a coding configuration for a charset, reporting all coding errors.
    pub fn new(charset: Charset) -> Self {
        Self {
            charset,
            ..Default::default()
        }
    }

    /// Set the policy for malformed input.
    pub fn with_malformed_input_action(mut self, action: CodingErrorAction) -> Self {
        self.malformed_input_action = action;
        self
    }

    /// Set the policy for unmappable characters.
    pub fn with_unmappable_input_action(mut self, action: CodingErrorAction) -> Self {
        self.unmappable_input_action = action;
        self
    }

    /// Decode one line worth of bytes.
    ///
    /// Pure ASCII input is valid in every supported charset and is returned
    /// borrowed, without allocating.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, ProtocolError> {
        if bytes.is_ascii() {
            if let Ok(line) = std::str::from_utf8(bytes) {
                return Ok(Cow::Borrowed(line));
            }
        }

        match self.charset {
            Charset::Utf8 => match std::str::from_utf8(bytes) {
                Ok(line) => Ok(Cow::Borrowed(line)),
                Err(_) => match self.malformed_input_action {
                    CodingErrorAction::Report => Err(self.malformed()),
                    CodingErrorAction::Replace => Ok(String::from_utf8_lossy(bytes)),
                    CodingErrorAction::Ignore => Ok(Cow::Owned(utf8_ignoring_invalid(bytes))),
                },
            },
            Charset::Latin1 => Ok(Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect())),
            Charset::Ascii => {
                let mut line = String::with_capacity(bytes.len());
                for &byte in bytes {
                    if byte.is_ascii() {
                        line.push(char::from(byte));
                        continue;
                    }
                    match self.malformed_input_action {
                        CodingErrorAction::Report => return Err(self.malformed()),
                        CodingErrorAction::Replace => line.push(char::REPLACEMENT_CHARACTER),
                        CodingErrorAction::Ignore => {}
                    }
                }
                Ok(Cow::Owned(line))
            }
        }
    }

    /// Encode a line into `out`, without a line terminator.
    pub fn encode(&self, line: &str, out: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.charset == Charset::Utf8 || line.is_ascii() {
            out.extend_from_slice(line.as_bytes());
            return Ok(());
        }

        out.reserve(line.len());
        for character in line.chars() {
            let code = u32::from(character);
            let representable = match self.charset {
                Charset::Ascii => code < 0x80,
                _ => code <= 0xFF,
            };

            if representable {
                out.put_u8(code as u8);
                continue;
            }

            match self.unmappable_input_action {
                CodingErrorAction::Report => {
                    return Err(ProtocolError::UnmappableCharacter {
                        charset: self.charset.name(),
                        character,
                    })
                }
                CodingErrorAction::Replace => out.put_u8(b'?'),
                CodingErrorAction::Ignore => {}
            }
        }
        Ok(())
    }

    fn malformed(&self) -> ProtocolError {
        ProtocolError::MalformedInput {
            charset: self.charset.name(),
        }
    }
}

fn utf8_ignoring_invalid(mut bytes: &[u8]) -> String {
    let mut line = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                line.push_str(valid);
                return line;
            }
            Err(error) => {
                let (valid, rest) = bytes.split_at(error.valid_up_to());
                line.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let skip = error.error_len().unwrap_or(rest.len());
                bytes = &rest[skip..];
            }
        }
    }
}

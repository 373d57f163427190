use std::fmt;
use std::ops::Range;

use crate::ProtocolError;

/// A single header field.
///
/// A header parsed off the wire keeps the complete line it was parsed from, and is
/// written back out verbatim. A header built in code stores its name and value and
/// is formatted as `name: value` when written; its name is checked before it goes
/// out, and control characters in its value are replaced with spaces.
#[derive(Clone)]
pub struct Header {
    buffer: String,
    name: Range<usize>,
    value: Range<usize>,
    buffered: bool,
}

impl Header {
    /// Create a header from a name and value.
    ///
    /// CR, LF and other control characters other than tab in `value` become
    /// spaces, so a value can never end the header line early.
    pub fn new(name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        let value: String = value
            .as_ref()
            .chars()
            .map(|c| if c.is_control() && c != '\t' { ' ' } else { c })
            .collect();
        let value = value.trim();

        let mut buffer = String::with_capacity(name.len() + value.len());
        buffer.push_str(name);
        buffer.push_str(value);
        Self {
            value: name.len()..buffer.len(),
            name: 0..name.len(),
            buffered: false,
            buffer,
        }
    }

    /// Check that a header built in code can be written as a single line.
    ///
    /// Parsed headers were checked when they were read.
    pub(crate) fn validate(&self) -> Result<(), ProtocolError> {
        if self.buffered || is_valid_name(self.name()) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidHeader(self.name().to_owned()))
        }
    }

    /// Parse a `name: value` line, taking ownership of the line.
    ///
    /// Whitespace around the value is excluded from [`value`](Self::value) but kept
    /// in the line itself.
    pub fn parse(line: String) -> Result<Self, ProtocolError> {
        let Some(colon) = line.find(':') else {
            return Err(ProtocolError::InvalidHeader(line));
        };

        if !is_valid_name(&line[..colon]) {
            return Err(ProtocolError::InvalidHeader(line));
        }

        let raw = &line[colon + 1..];
        let leading = raw.len() - raw.trim_start_matches([' ', '\t']).len();
        let value = raw.trim_matches([' ', '\t']);
        let start = colon + 1 + leading;

        Ok(Self {
            name: 0..colon,
            value: start..start + value.len(),
            buffered: true,
            buffer: line,
        })
    }

    /// The header name, as sent.
    pub fn name(&self) -> &str {
        &self.buffer[self.name.clone()]
    }

    /// The header value, without surrounding whitespace.
    pub fn value(&self) -> &str {
        &self.buffer[self.value.clone()]
    }

    /// Returns `true` if this header's name matches `name`, ignoring ASCII case.
    pub fn is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }

    /// The original line this header was parsed from, if any.
    pub fn line(&self) -> Option<&str> {
        self.buffered.then_some(self.buffer.as_str())
    }

    /// Append an obsolete line-folding continuation to the value.
    ///
    /// The fold and any leading whitespace on the continuation collapse into a single
    /// space. The header's line is rewritten to match.
    pub(crate) fn fold(&mut self, continuation: &str) {
        let continuation = continuation.trim_matches([' ', '\t']);
        self.buffer.truncate(self.value.end);
        if continuation.is_empty() {
            return;
        }

        if !self.value.is_empty() {
            self.buffer.push(' ');
        } else if self.buffered {
            self.buffer.truncate(self.name.end + 1);
            self.buffer.push(' ');
            self.value = self.buffer.len()..self.buffer.len();
        }
        self.buffer.push_str(continuation);
        self.value.end = self.buffer.len();
    }

    /// Split the value on commas, yielding trimmed, non-empty elements.
    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.value()
            .split(',')
            .map(|element| element.trim_matches([' ', '\t']))
            .filter(|element| !element.is_empty())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .bytes()
            .any(|b| b == b':' || b.is_ascii_whitespace() || b.is_ascii_control())
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Header")
            .field(&self.name())
            .field(&self.value())
            .finish()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.value())
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.name().eq_ignore_ascii_case(other.name()) && self.value() == other.value()
    }
}

impl Eq for Header {}

/// An ordered list of headers.
///
/// Lookups ignore ASCII case. Duplicate headers are kept, in the order they were
/// received or added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// An empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of headers, counting duplicates.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a header, keeping any existing headers with the same name.
    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Append a header built from a name and value.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) {
        self.push(Header::new(name, value));
    }

    /// Replace every header named `name` with a single header.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) {
        let header = Header::new(name, value);
        match self.0.iter().position(|existing| existing.is(header.name())) {
            Some(position) => {
                let name = header.name().to_owned();
                self.0[position] = header;
                let mut index = 0;
                self.0.retain(|existing| {
                    let keep = index <= position || !existing.is(&name);
                    index += 1;
                    keep
                });
            }
            None => self.0.push(header),
        }
    }

    /// Remove every header named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|header| !header.is(name));
        before - self.0.len()
    }

    /// The first header named `name`.
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.0.iter().find(|header| header.is(name))
    }

    /// The value of the first header named `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(Header::value)
    }

    /// The last header named `name`.
    pub fn last(&self, name: &str) -> Option<&Header> {
        self.0.iter().rev().find(|header| header.is(name))
    }

    /// Every header named `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |header| header.is(name))
    }

    /// Returns `true` if any header named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns `true` if any comma separated element of a header named `name`
    /// matches `token`, ignoring ASCII case.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(Header::elements)
            .any(|element| element.eq_ignore_ascii_case(token))
    }

    /// Iterate over all headers in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut Header> {
        self.0.last_mut()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Header> for Headers {
    fn from_iter<T: IntoIterator<Item = Header>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Header> for Headers {
    fn extend<T: IntoIterator<Item = Header>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_value() {
        let header = Header::parse("Content-Type: \t text/plain  ".to_owned()).unwrap();
        assert_eq!(header.name(), "Content-Type");
        assert_eq!(header.value(), "text/plain");
        assert_eq!(header.line(), Some("Content-Type: \t text/plain  "));
    }

    #[test]
    fn parse_rejects_malformed() {
        for line in ["no colon here", ": empty name", "Bad Name: value", "Name : value"] {
            assert!(
                matches!(
                    Header::parse(line.to_owned()),
                    Err(ProtocolError::InvalidHeader(_))
                ),
                "{line:?}"
            );
        }
    }

    #[test]
    fn empty_value() {
        let header = Header::parse("X-Empty:".to_owned()).unwrap();
        assert_eq!(header.value(), "");
    }

    #[test]
    fn fold_collapses_whitespace() {
        let mut header = Header::parse("X-A: foo".to_owned()).unwrap();
        header.fold("  bar");
        assert_eq!(header.value(), "foo bar");
        assert_eq!(header.line(), Some("X-A: foo bar"));

        header.fold("\tbaz  ");
        assert_eq!(header.value(), "foo bar baz");
    }

    #[test]
    fn fold_into_empty_value() {
        let mut header = Header::parse("X-A:".to_owned()).unwrap();
        header.fold("  bar");
        assert_eq!(header.value(), "bar");
        assert_eq!(header.line(), Some("X-A: bar"));
    }

    #[test]
    fn built_headers_are_not_buffered() {
        let header = Header::new("Host", " example.com ");
        assert_eq!(header.name(), "Host");
        assert_eq!(header.value(), "example.com");
        assert_eq!(header.line(), None);
        assert_eq!(header.to_string(), "Host: example.com");
    }

    #[test]
    fn built_values_stay_on_one_line() {
        let header = Header::new("X-Note", "a\r\nInjected: yes\0");
        assert_eq!(header.value(), "a  Injected: yes");
        assert!(header.validate().is_ok());

        let header = Header::new("X-Tab", "a\tb\r\n");
        assert_eq!(header.value(), "a\tb");
    }

    #[test]
    fn built_names_are_validated() {
        for name in ["", "Bad Name", "X-A\r\nX-B", "X:Y"] {
            assert!(
                matches!(
                    Header::new(name, "value").validate(),
                    Err(ProtocolError::InvalidHeader(_))
                ),
                "{name:?}"
            );
        }
        assert!(Header::new("X-Good", "").validate().is_ok());
    }

    #[test]
    fn lookups_ignore_case_and_keep_duplicates() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("Host", "example.com");
        headers.append("set-cookie", "b=2");

        assert_eq!(headers.value("HOST"), Some("example.com"));
        let cookies: Vec<_> = headers.get_all("Set-Cookie").map(Header::value).collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert_eq!(headers.last("set-cookie").map(Header::value), Some("b=2"));

        headers.set("SET-COOKIE", "c=3");
        let cookies: Vec<_> = headers.get_all("set-cookie").map(Header::value).collect();
        assert_eq!(cookies, ["c=3"]);
        assert_eq!(headers.iter().next().map(Header::name), Some("SET-COOKIE"));

        assert_eq!(headers.remove("set-cookie"), 1);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn tokens() {
        let mut headers = Headers::new();
        headers.append("Connection", "Upgrade, Keep-Alive");
        headers.append("Connection", "close");
        assert!(headers.contains_token("connection", "keep-alive"));
        assert!(headers.contains_token("connection", "CLOSE"));
        assert!(!headers.contains_token("connection", "te"));
    }
}

//! Non-blocking byte channels.
//!
//! A [`Channel`] is the raw, bidirectional byte stream underneath a session. It
//! never blocks: reads and writes transfer whatever the operating system accepts
//! right now, and readiness is awaited separately through
//! [`Channel::poll_read_ready`] and [`Channel::poll_write_ready`], which is what
//! lets a single reactor thread multiplex many connections.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::task::{Context, Poll};

#[cfg(any(test, feature = "mocks"))]
pub mod mock;
mod stream;

pub use self::stream::RawStream;

/// A non-blocking, bidirectional byte stream.
///
/// Reads follow the standard library convention: `Ok(0)` signals end of stream,
/// and [`io::ErrorKind::WouldBlock`] signals that no bytes are available yet.
pub trait Channel: Send + 'static {
    /// Poll for read readiness.
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Poll for write readiness.
    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Read into `buf` without blocking.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf` without blocking, returning how many bytes were accepted.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the write half of the channel.
    fn shutdown_output(&mut self) -> io::Result<()>;

    /// A description of the local address, if known.
    fn local_addr(&self) -> Option<String> {
        None
    }

    /// A description of the remote address, if known.
    fn peer_addr(&self) -> Option<String> {
        None
    }
}

impl<C> Channel for Box<C>
where
    C: Channel + ?Sized,
{
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_read_ready(cx)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        (**self).poll_write_ready(cx)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        (**self).shutdown_output()
    }

    fn local_addr(&self) -> Option<String> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> Option<String> {
        (**self).peer_addr()
    }
}

/// Read once from a channel, folding "would block" into zero bytes.
///
/// Returns `None` at end of stream.
pub(crate) fn read_some<C>(channel: &mut C, buf: &mut [u8]) -> io::Result<Option<usize>>
where
    C: Channel + ?Sized,
{
    match channel.try_read(buf) {
        Ok(0) if !buf.is_empty() => Ok(None),
        Ok(n) => Ok(Some(n)),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(Some(0))
        }
        Err(error) => Err(error),
    }
}

/// Write once to a channel, folding "would block" into zero bytes.
pub(crate) fn write_some<C>(channel: &mut C, buf: &[u8]) -> io::Result<usize>
where
    C: Channel + ?Sized,
{
    match channel.try_write(buf) {
        Ok(n) => Ok(n),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        Err(error) => Err(error),
    }
}

/// Poll a channel for any of the events in `interest`.
///
/// Resolves with the subset of `interest` which is ready.
pub fn poll_ready<C>(
    channel: &C,
    cx: &mut Context<'_>,
    interest: Interest,
) -> Poll<io::Result<Interest>>
where
    C: Channel + ?Sized,
{
    let mut ready = Interest::NONE;

    if interest.is_readable() {
        match channel.poll_read_ready(cx) {
            Poll::Ready(Ok(())) => ready |= Interest::READ,
            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
            Poll::Pending => {}
        }
    }

    if interest.is_writable() {
        match channel.poll_write_ready(cx) {
            Poll::Ready(Ok(())) => ready |= Interest::WRITE,
            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
            Poll::Pending => {}
        }
    }

    if ready.is_empty() {
        Poll::Pending
    } else {
        Poll::Ready(Ok(ready))
    }
}

/// A set of I/O events: readable, writable, both, or neither.
///
/// Used both as the interest mask of a session and as the set of events which
/// fired on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No events.
    pub const NONE: Interest = Interest(0);

    /// The channel can be read.
    pub const READ: Interest = Interest(0b01);

    /// The channel can be written.
    pub const WRITE: Interest = Interest(0b10);

    /// The channel can be read and written.
    pub const BOTH: Interest = Interest(0b11);

    /// Rebuild an interest set from its bit representation.
    pub const fn from_bits(bits: u8) -> Self {
        Interest(bits & Self::BOTH.0)
    }

    /// The bit representation of this set.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if no events are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the set includes [`Interest::READ`].
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Returns `true` if the set includes [`Interest::WRITE`].
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Add events to the set.
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Remove events from the set.
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.add(rhs)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (false, false) => write!(f, "Interest(NONE)"),
            (true, false) => write!(f, "Interest(READ)"),
            (false, true) => write!(f, "Interest(WRITE)"),
            (true, true) => write!(f, "Interest(READ | WRITE)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_set_operations() {
        let interest = Interest::READ | Interest::WRITE;
        assert_eq!(interest, Interest::BOTH);
        assert!(interest.is_readable());
        assert!(interest.is_writable());

        let interest = interest.remove(Interest::WRITE);
        assert_eq!(interest, Interest::READ);
        assert!(!interest.is_writable());

        assert!(Interest::NONE.is_empty());
        assert_eq!(Interest::from_bits(0xff), Interest::BOTH);
    }

    #[test]
    fn interest_debug() {
        assert_eq!(format!("{:?}", Interest::NONE), "Interest(NONE)");
        assert_eq!(format!("{:?}", Interest::BOTH), "Interest(READ | WRITE)");
    }

    #[test]
    fn read_some_maps_would_block_and_eof() {
        let mut channel = mock::MockChannel::new();
        let mut buf = [0u8; 8];
        assert_eq!(read_some(&mut channel, &mut buf).unwrap(), Some(0));

        channel.push_input(&b"abc"[..]);
        assert_eq!(read_some(&mut channel, &mut buf).unwrap(), Some(3));

        channel.finish_input();
        assert_eq!(read_some(&mut channel, &mut buf).unwrap(), None);
    }
}

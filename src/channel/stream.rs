use std::io;
use std::net::Shutdown;
use std::task::{Context, Poll};

use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use super::Channel;

impl Channel for TcpStream {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_read_ready(self, cx)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        TcpStream::poll_write_ready(self, cx)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        socket2::SockRef::from(&*self).shutdown(Shutdown::Write)
    }

    fn local_addr(&self) -> Option<String> {
        TcpStream::local_addr(self).ok().map(|addr| addr.to_string())
    }

    fn peer_addr(&self) -> Option<String> {
        TcpStream::peer_addr(self).ok().map(|addr| addr.to_string())
    }
}

#[cfg(unix)]
impl Channel for UnixStream {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        UnixStream::poll_read_ready(self, cx)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        UnixStream::poll_write_ready(self, cx)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        UnixStream::try_read(self, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        UnixStream::try_write(self, buf)
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        socket2::SockRef::from(&*self).shutdown(Shutdown::Write)
    }

    fn local_addr(&self) -> Option<String> {
        UnixStream::local_addr(self)
            .ok()
            .and_then(|addr| addr.as_pathname().map(|path| path.display().to_string()))
    }

    fn peer_addr(&self) -> Option<String> {
        UnixStream::peer_addr(self)
            .ok()
            .and_then(|addr| addr.as_pathname().map(|path| path.display().to_string()))
    }
}

/// A connected socket which has not yet been bound to a reactor worker.
///
/// Tokio sockets belong to the runtime that registered them, so sockets travel
/// between reactor threads in their standard library form and are converted to a
/// [`Channel`] by the worker which will own the session.
#[derive(Debug)]
#[non_exhaustive]
pub enum RawStream {
    /// A TCP socket.
    Tcp(std::net::TcpStream),

    /// A Unix domain socket.
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl RawStream {
    /// Apply socket options through `socket2`.
    pub(crate) fn sock_ref(&self) -> socket2::SockRef<'_> {
        match self {
            RawStream::Tcp(stream) => socket2::SockRef::from(stream),
            #[cfg(unix)]
            RawStream::Unix(stream) => socket2::SockRef::from(stream),
        }
    }

    /// Returns `true` for TCP sockets.
    pub(crate) fn is_tcp(&self) -> bool {
        matches!(self, RawStream::Tcp(_))
    }

    /// Register the socket with the current tokio runtime.
    ///
    /// Must be called from within the runtime of the worker that will own it.
    pub(crate) fn into_channel(self) -> io::Result<Box<dyn Channel>> {
        match self {
            RawStream::Tcp(stream) => {
                stream.set_nonblocking(true)?;
                Ok(Box::new(TcpStream::from_std(stream)?))
            }
            #[cfg(unix)]
            RawStream::Unix(stream) => {
                stream.set_nonblocking(true)?;
                Ok(Box::new(UnixStream::from_std(stream)?))
            }
        }
    }
}

impl From<std::net::TcpStream> for RawStream {
    fn from(stream: std::net::TcpStream) -> Self {
        RawStream::Tcp(stream)
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixStream> for RawStream {
    fn from(stream: std::os::unix::net::UnixStream) -> Self {
        RawStream::Unix(stream)
    }
}

impl TryFrom<TcpStream> for RawStream {
    type Error = io::Error;

    fn try_from(stream: TcpStream) -> Result<Self, Self::Error> {
        Ok(RawStream::Tcp(stream.into_std()?))
    }
}

//! Mock channel for testing.
//!
//! The mock channel replays scripted input one chunk per read, so tests can
//! reproduce every way a socket splits a byte stream, and records output with
//! optional limits which force short writes and "would block" results.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::Channel;

#[derive(Debug, Default)]
struct MockState {
    incoming: VecDeque<Bytes>,
    eof: bool,
    read_waker: Option<Waker>,
    outgoing: BytesMut,
    write_limit: Option<usize>,
    write_budget: Option<usize>,
    output_shutdown: bool,
}

/// A scripted, in-memory [`Channel`].
///
/// Clones share the same state, so a test can keep a handle to inspect what was
/// written after handing the channel to the code under test.
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    /// Create a mock channel with no input.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock channel which will return each chunk from a separate read,
    /// then signal end of stream.
    pub fn with_input<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let channel = Self::new();
        for chunk in chunks {
            channel.push_input(chunk);
        }
        channel.finish_input();
        channel
    }

    /// Queue a chunk which will be returned by a later read.
    pub fn push_input(&self, chunk: impl Into<Bytes>) {
        let mut state = self.state.lock();
        state.incoming.push_back(chunk.into());
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    /// Signal end of stream once the queued input has been read.
    pub fn finish_input(&self) {
        let mut state = self.state.lock();
        state.eof = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    /// Limit the number of bytes accepted by each write call.
    pub fn set_write_limit(&self, limit: usize) {
        self.state.lock().write_limit = Some(limit);
    }

    /// Limit the total number of bytes accepted before writes would block.
    ///
    /// `None` removes the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.lock().write_budget = budget;
    }

    /// A copy of everything written so far.
    pub fn written(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().outgoing)
    }

    /// Take everything written so far, clearing the record.
    pub fn take_written(&self) -> Bytes {
        self.state.lock().outgoing.split().freeze()
    }

    /// Returns `true` once the write half has been shut down.
    pub fn is_output_shutdown(&self) -> bool {
        self.state.lock().output_shutdown
    }
}

impl Channel for MockChannel {
    fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.state.lock();
        if state.eof || !state.incoming.is_empty() {
            Poll::Ready(Ok(()))
        } else {
            state.read_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }

    fn poll_write_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        match state.incoming.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk.split_to(n));
                if !chunk.is_empty() {
                    state.incoming.push_front(chunk);
                }
                Ok(n)
            }
            None if state.eof => Ok(0),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.output_shutdown {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let mut n = buf.len();
        if let Some(limit) = state.write_limit {
            n = n.min(limit);
        }
        if let Some(budget) = state.write_budget {
            n = n.min(budget);
            state.write_budget = Some(budget - n);
        }

        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        state.outgoing.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown_output(&mut self) -> io::Result<()> {
        self.state.lock().output_shutdown = true;
        Ok(())
    }

    fn peer_addr(&self) -> Option<String> {
        Some("mock://".to_owned())
    }
}

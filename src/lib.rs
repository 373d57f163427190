//! Warpcore
//!
//! The transport engine underneath an HTTP/1.x client and server: an event-driven
//! reactor which multiplexes many non-blocking connections over a small, fixed set of
//! worker threads, the session buffers and framing codecs which turn those byte
//! streams into HTTP messages, and a per-route connection pool which leases persistent
//! connections to callers.
//!
//! The pieces stack from leaf to root:
//!
//! - [`buffer`] holds the line-oriented session buffers,
//! - [`codec`] slices message bodies (chunked, content-length, identity),
//! - [`message`] parses and writes message heads,
//! - [`pool`] tracks available, leased and pending connections per route,
//! - [`reactor`] polls sessions for readiness and dispatches events,
//! - [`http1`] drives the protocol on each session.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod buffer;
pub mod cancel;
pub mod channel;
pub mod charset;
#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub use client::Client;
pub mod codec;
mod error;
pub use error::{Error, ProtocolError};
pub mod http1;
pub mod message;
mod notify;
pub mod pool;
pub mod reactor;
pub use reactor::CloseMode;

/// A type-erased error, used for failures reported by user supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) mod private {

    pub trait Sealed {}
}

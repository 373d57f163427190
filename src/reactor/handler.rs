use std::any::Any;

use tracing::debug;

use super::{CloseMode, Session};
use crate::Error;

/// Opaque data handed from [`IOReactor::connect`](super::IOReactor::connect) to the
/// handler factory.
pub type Attachment = Box<dyn Any + Send>;

/// Reacts to the events of a single session.
///
/// A handler lives on the reactor thread which owns its session and is never
/// shared, so it does not need to be `Send`. Every callback receives the session
/// mutably; an `Err` from any callback is reported to
/// [`exception`](Self::exception) and the session is closed.
pub trait EventHandler: 'static {
    /// The session was created.
    fn connected(&mut self, session: &mut Session) -> Result<(), Error> {
        let _ = session;
        Ok(())
    }

    /// The channel is readable.
    fn input_ready(&mut self, session: &mut Session) -> Result<(), Error>;

    /// The channel is writable, or commands are waiting.
    fn output_ready(&mut self, session: &mut Session) -> Result<(), Error>;

    /// The session saw no activity for its socket timeout.
    fn timeout(&mut self, session: &mut Session) -> Result<(), Error> {
        session.close(CloseMode::Graceful);
        Ok(())
    }

    /// A graceful shutdown was requested. Handlers with work in flight may defer
    /// closing the session until it completes.
    fn shutdown(&mut self, session: &mut Session, mode: CloseMode) -> Result<(), Error> {
        session.close(mode);
        Ok(())
    }

    /// A callback failed. The session is closed afterwards.
    fn exception(&mut self, session: &mut Session, error: Error) {
        debug!(session = %session.id(), %error, "session failed");
    }

    /// The session closed. Called exactly once, last.
    fn disconnected(&mut self, session: &mut Session) {
        let _ = session;
    }
}

/// Creates the event handler for each new session.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Create a handler for `session`, with the attachment passed to connect, if any.
    fn create(
        &self,
        session: &mut Session,
        attachment: Option<Attachment>,
    ) -> Box<dyn EventHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&mut Session, Option<Attachment>) -> Box<dyn EventHandler> + Send + Sync + 'static,
{
    fn create(
        &self,
        session: &mut Session,
        attachment: Option<Attachment>,
    ) -> Box<dyn EventHandler> {
        (self)(session, attachment)
    }
}

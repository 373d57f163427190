use std::fmt;

use crate::http1::Exchange;
use crate::Error;

/// How a session, pool or reactor should close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseMode {
    /// Finish in-flight work, flush pending output and then close.
    Graceful,

    /// Close at once, abandoning in-flight work.
    Immediate,
}

impl fmt::Display for CloseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseMode::Graceful => f.write_str("graceful"),
            CloseMode::Immediate => f.write_str("immediate"),
        }
    }
}

/// Work enqueued on a session from outside its reactor thread.
///
/// Commands are drained once per loop iteration, in the order they were sent.
#[derive(Debug)]
pub enum Command {
    /// Close the session.
    Shutdown(CloseMode),

    /// Run a request/response exchange on the session.
    Execute(Exchange),
}

impl Command {
    /// Resolve the command as failed, if it is waiting on a result.
    pub fn fail(self, error: Error) {
        if let Command::Execute(exchange) = self {
            exchange.fail(error);
        }
    }
}

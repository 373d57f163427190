//! One-shot completion signals with any number of observers.
//!
//! Reactor workers hold a [`Signal`] for their whole lifetime; it fires when the
//! worker finishes, even if the worker thread unwinds. Observers hold a cloneable
//! [`Completion`] and can either poll it or await it.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;

#[derive(Debug)]
pub(crate) struct Signal(Option<tokio::sync::watch::Receiver<()>>);

impl Signal {
    pub(crate) fn fire(&mut self) {
        if self.0.take().is_some() {
            tracing::trace!("completion signalled");
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.fire();
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Completion(Arc<tokio::sync::watch::Sender<()>>);

impl Completion {
    pub(crate) fn is_complete(&self) -> bool {
        self.0.is_closed()
    }
}

impl IntoFuture for Completion {
    type IntoFuture = Completed;
    type Output = ();

    fn into_future(self) -> Self::IntoFuture {
        Completed(Box::pin(async move {
            self.0.closed().await;
        }))
    }
}

#[pin_project::pin_project]
pub(crate) struct Completed(#[pin] BoxFuture<'static, ()>);

impl Future for Completed {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

pub(crate) fn signal() -> (Signal, Completion) {
    let (tx, rx) = tokio::sync::watch::channel(());
    (Signal(Some(rx)), Completion(Arc::new(tx)))
}

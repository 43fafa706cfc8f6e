//! Close-once latch shared by a flow, its owner and the pairing watcher.
//!
//! The first close wins: its error becomes the flow's terminal error and the
//! closed signal fires. Every later close is a no-op.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::Error;

/// Sticky first-error latch with a one-shot closed signal.
///
/// Clones share the same state.
#[derive(Clone, Debug)]
pub struct CloseLatch {
    terminal: Arc<watch::Sender<Option<Error>>>,
}

impl CloseLatch {
    /// Create an open latch.
    pub fn new() -> Self {
        let (terminal, _) = watch::channel(None);
        Self {
            terminal: Arc::new(terminal),
        }
    }

    /// Close with `err` unless already closed.
    ///
    /// Returns `true` if this call performed the close.
    pub fn close_with_error_once(&self, err: Error) -> bool {
        let mut err = Some(err);
        self.terminal.send_if_modified(|terminal| {
            if terminal.is_some() {
                return false;
            }
            *terminal = err.take();
            true
        })
    }

    /// Check whether the latch has been closed.
    pub fn is_closed(&self) -> bool {
        self.terminal.borrow().is_some()
    }

    /// The terminal error, once closed.
    pub fn close_err(&self) -> Option<Error> {
        self.terminal.borrow().clone()
    }

    /// Wait until the latch is closed and return its terminal error.
    pub async fn closed(&self) -> Error {
        let mut rx = self.terminal.subscribe();
        let terminal = rx
            .wait_for(Option::is_some)
            .await
            .map(|terminal| (*terminal).clone());
        match terminal {
            Ok(Some(err)) => err,
            // The sender lives as long as `self`, so this is unreachable.
            _ => Error::ClosedByApplication,
        }
    }

    /// Owned variant of [`closed`](Self::closed) for storing in poll-based state.
    pub fn closed_owned(self) -> BoxFuture<'static, Error> {
        Box::pin(async move { self.closed().await })
    }
}

impl Default for CloseLatch {
    fn default() -> Self {
        Self::new()
    }
}

//! Session numbering for diagnostics.
//!
//! Session ids never reach the wire; they only tie together the log lines of
//! the two flows that make up one paired connection.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique session identifier.
pub type SessionId = u64;

/// Monotonic source of session ids.
#[derive(Debug, Default)]
pub struct SessionCounter {
    next: AtomicU64,
}

impl SessionCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a counter whose first id is `first`.
    pub fn starting_at(first: SessionId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Return the next id and advance the counter.
    pub fn get_and_increment(&self) -> SessionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the id the next call will hand out.
    pub fn peek(&self) -> SessionId {
        self.next.load(Ordering::Relaxed)
    }
}

/// Log prefix for a session, e.g. `[Session 42]`.
pub fn id_str(session_id: SessionId) -> String {
    format!("[Session {}]", session_id)
}

//! Error types for split-flow connections.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::flow::{FlowRole, TagKind};

/// Result type alias for split-flow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Step of the two-flow handshake that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Wrapping the raw reader into a read-only flow
    ReaderWrap,
    /// Dialing the reader flow
    ReaderDial,
    /// Reader yielding the upload direction
    ReaderYield,
    /// Wrapping the raw writer into an upload flow
    WriterWrap,
    /// Dialing the writer flow
    WriterDial,
    /// Writer acquiring the upload direction
    WriterAcquire,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStep::ReaderWrap => "reader-wrap",
            HandshakeStep::ReaderDial => "reader-dial",
            HandshakeStep::ReaderYield => "reader-yield",
            HandshakeStep::WriterWrap => "writer-wrap",
            HandshakeStep::WriterDial => "writer-dial",
            HandshakeStep::WriterAcquire => "writer-acquire",
        };
        f.write_str(name)
    }
}

/// Errors that can occur on a flow or a paired connection.
///
/// Errors are cheap to clone: a flow's terminal error is shared between its
/// close latch, its partner, and every later `close` caller.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(Arc<io::Error>),

    /// Failure reported by a flow collaborator, displayed verbatim
    #[error("{0}")]
    Flow(String),

    /// A handshake step failed; displays the collaborator error unchanged
    #[error("{cause}")]
    Handshake {
        /// Step that failed
        step: HandshakeStep,
        /// Error reported by the collaborator
        #[source]
        cause: Box<Error>,
    },

    /// The partner flow closed first and took this flow down with it
    #[error("in paired {}Conn: {}", .role.conn_name(), .cause)]
    PartnerClosed {
        /// Role of the partner that closed first
        role: FlowRole,
        /// Error the partner closed with
        #[source]
        cause: Box<Error>,
    },

    /// Connection was already closed; carries the first terminal error
    #[error("already closed: {0}")]
    AlreadyClosed(Box<Error>),

    /// Closed by the application layer
    #[error("closed by application layer")]
    ClosedByApplication,

    /// Remote end closed the flow
    #[error("EOF")]
    Eof,

    /// Read or write deadline exceeded
    #[error("i/o timeout")]
    Timeout,

    /// Flow role and tag kind do not belong together
    #[error("flow role {role} cannot carry tag {tag}")]
    RoleMismatch {
        /// Requested role
        role: FlowRole,
        /// Tag kind of the raw flow
        tag: TagKind,
    },

    /// Operation not valid in the flow's current state
    #[error("invalid flow state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new collaborator error
    pub fn flow(msg: impl Into<String>) -> Self {
        Error::Flow(msg.into())
    }

    /// Create a new invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Tag a collaborator error with the handshake step it came from.
    pub fn handshake(step: HandshakeStep, cause: Error) -> Self {
        Error::Handshake {
            step,
            cause: Box::new(cause),
        }
    }

    /// Error delivered to a flow whose partner closed with `cause`.
    pub fn partner_closed(role: FlowRole, cause: Error) -> Self {
        Error::PartnerClosed {
            role,
            cause: Box::new(cause),
        }
    }

    /// Handshake step that failed, if this is a handshake error.
    pub fn step(&self) -> Option<HandshakeStep> {
        match self {
            Error::Handshake { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// The underlying collaborator error, with handshake tagging removed.
    pub fn cause(&self) -> &Error {
        match self {
            Error::Handshake { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// Check if this error was cascaded from a partner flow
    pub fn is_partner_closed(&self) -> bool {
        matches!(self, Error::PartnerClosed { .. })
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Network(e) => e.kind(),
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Eof => io::ErrorKind::UnexpectedEof,
            Error::ClosedByApplication | Error::AlreadyClosed(_) => io::ErrorKind::NotConnected,
            Error::PartnerClosed { .. } => io::ErrorKind::ConnectionAborted,
            Error::InvalidState(_) | Error::RoleMismatch { .. } => io::ErrorKind::InvalidInput,
            Error::Handshake { cause, .. } => cause.io_kind(),
            Error::Flow(_) | Error::Config(_) => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            return Error::Timeout;
        }
        Error::Network(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

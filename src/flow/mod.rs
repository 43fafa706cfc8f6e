//! Flows: the single-direction connections a paired session is made of.
//!
//! A flow starts life as a [`RawFlow`], a bag of parameters for the raw-flow
//! layer (tag kind, station key, correlation id, decoy). A [`FlowFactory`]
//! wraps it into a [`Flow`] with a role, which can then be dialed and take
//! part in the upload hand-over.
//!
//! ```text
//!            RawFlow ──wrap(role)──▶ Flow ──dial──▶ yield_upload   (ReadOnly)
//!                                              └──▶ acquire_upload (Upload)
//! ```

mod stream;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::crypto::{PublicKey, SecureRandom};
use crate::error::{Error, Result};
use crate::latch::CloseLatch;
use crate::session::SessionId;

pub use stream::{SharedStream, StationTransport, StreamFlow, StreamFlowFactory};

/// Size of the correlation id shared by both flows of a session.
pub const CORRELATION_ID_SIZE: usize = 16;

/// Which direction of the logical stream a flow carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowRole {
    /// Carries station→client data only; yields its upload direction
    ReadOnly,
    /// Carries client→station data; acquires the yielded upload direction
    Upload,
}

impl FlowRole {
    /// Name used when reporting a cascaded close, e.g. `readerConn`.
    pub fn conn_name(&self) -> &'static str {
        match self {
            FlowRole::ReadOnly => "reader",
            FlowRole::Upload => "writer",
        }
    }

    /// Short direction label used in log prefixes.
    pub fn label(&self) -> &'static str {
        match self {
            FlowRole::ReadOnly => "R",
            FlowRole::Upload => "W",
        }
    }

    /// Tag kind a flow of this role is marked with.
    pub fn tag_kind(&self) -> TagKind {
        match self {
            FlowRole::ReadOnly => TagKind::HttpGetIncomplete,
            FlowRole::Upload => TagKind::HttpPostIncomplete,
        }
    }
}

impl fmt::Display for FlowRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowRole::ReadOnly => f.write_str("read-only"),
            FlowRole::Upload => f.write_str("upload"),
        }
    }
}

/// How the raw-flow layer marks a flow for station recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// Incomplete HTTP GET; used by the reader
    HttpGetIncomplete,
    /// Incomplete HTTP POST; used by the writer
    HttpPostIncomplete,
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKind::HttpGetIncomplete => f.write_str("http-get-incomplete"),
            TagKind::HttpPostIncomplete => f.write_str("http-post-incomplete"),
        }
    }
}

/// Decoy host a flow is sent towards. Opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoySpec {
    /// SNI hostname presented to the decoy
    pub hostname: String,
    /// Address the underlying TCP connection goes to
    pub address: SocketAddr,
}

impl DecoySpec {
    /// Create a decoy descriptor.
    pub fn new(hostname: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            hostname: hostname.into(),
            address,
        }
    }
}

/// Random id shared by both flows so the station can pair them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId([u8; CORRELATION_ID_SIZE]);

impl CorrelationId {
    /// Generate a fresh id from OS entropy.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; CORRELATION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", hex::encode(self.0))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Replacement for the default TCP dialer: `(network, address) -> socket`.
///
/// When set, both flows of a session use it so they share one underlay.
pub type CustomDialer =
    Arc<dyn Fn(String, String) -> BoxFuture<'static, io::Result<TcpStream>> + Send + Sync>;

/// Parameters for one raw flow, filled in by the coordinator before wrapping.
#[derive(Clone)]
pub struct RawFlow {
    /// Tag kind used to mark the flow
    pub tag: TagKind,
    /// Station key the tag is computed against
    pub station_key: PublicKey,
    /// Pairing id, identical on both flows of a session
    pub correlation_id: CorrelationId,
    /// Dialer override; `None` means plain TCP
    pub custom_dialer: Option<CustomDialer>,
    /// Session the flow belongs to (logging only)
    pub session_id: SessionId,
    /// Direction label appended to log prefixes
    pub str_id_suffix: String,
    /// Decoy chosen during dial, or supplied by the partner when pinned
    pub decoy_spec: Option<DecoySpec>,
    /// Use `decoy_spec` as given instead of choosing a decoy
    pub pin_decoy_spec: bool,
}

impl RawFlow {
    /// Create raw flow parameters with no dialer, decoy or session attached.
    pub fn new(tag: TagKind, station_key: PublicKey, correlation_id: CorrelationId) -> Self {
        Self {
            tag,
            station_key,
            correlation_id,
            custom_dialer: None,
            session_id: 0,
            str_id_suffix: String::new(),
            decoy_spec: None,
            pin_decoy_spec: false,
        }
    }

    /// Log prefix, e.g. `[Session 42 R]`.
    pub fn id_str(&self) -> String {
        if self.str_id_suffix.is_empty() {
            crate::session::id_str(self.session_id)
        } else {
            format!("[Session {} {}]", self.session_id, self.str_id_suffix)
        }
    }

    /// Open the underlying TCP connection through the custom dialer, if any.
    pub async fn dial_underlay(&self, address: &str) -> io::Result<TcpStream> {
        match &self.custom_dialer {
            Some(dialer) => dialer("tcp".to_string(), address.to_string()).await,
            None => TcpStream::connect(address).await,
        }
    }
}

impl fmt::Debug for RawFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFlow")
            .field("tag", &self.tag)
            .field("correlation_id", &self.correlation_id)
            .field("custom_dialer", &self.custom_dialer.is_some())
            .field("session_id", &self.session_id)
            .field("str_id_suffix", &self.str_id_suffix)
            .field("decoy_spec", &self.decoy_spec)
            .field("pin_decoy_spec", &self.pin_decoy_spec)
            .finish()
    }
}

/// A wrapped flow: a duplex byte stream with a role and a close-once latch.
#[async_trait]
pub trait Flow: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Underlying network connection type.
    type Underlay;

    /// Role this flow was wrapped with.
    fn role(&self) -> FlowRole;

    /// Raw parameters; `decoy_spec` is filled in once dialed.
    fn raw(&self) -> &RawFlow;

    /// Establish the tagged session with the station.
    async fn dial(&mut self) -> Result<()>;

    /// Tell the station a partner flow will carry the upload direction.
    async fn yield_upload(&mut self) -> Result<()>;

    /// Claim the upload direction yielded by the partner flow.
    async fn acquire_upload(&mut self) -> Result<()>;

    /// The flow's close-once latch.
    fn latch(&self) -> &CloseLatch;

    /// Local address of the underlying connection.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Remote address of the underlying connection.
    fn remote_addr(&self) -> io::Result<SocketAddr>;

    /// Set the read deadline; `None` clears it.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Set the write deadline; `None` clears it.
    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    /// Underlying network connection, once dialed and until closed.
    fn network_conn(&self) -> Option<&Self::Underlay>;

    /// Set both deadlines.
    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Close with `err` unless already closed. Returns `true` if this call closed it.
    fn close_with_error_once(&self, err: Error) -> bool {
        self.latch().close_with_error_once(err)
    }

    /// Whether the flow has been closed.
    fn is_closed(&self) -> bool {
        self.latch().is_closed()
    }
}

/// Wraps raw flows into role-bearing flows.
pub trait FlowFactory: Send + Sync {
    /// Flow type produced.
    type Flow: Flow;

    /// Wrap `raw` as a flow with `role`.
    fn wrap(&self, role: FlowRole, raw: RawFlow) -> Result<Self::Flow>;
}

//! Split-flow dialing: one logical connection over two paired flows.
//!
//! The reader flow carries station→client bytes, the writer flow carries
//! client→station bytes. Both are tagged with the same correlation id and
//! sent to the same decoy so the station can pair them.
//!
//! ## Handshake
//!
//! ```text
//! Client                                          Station
//!   |  reader: dial (GET-incomplete, conn id C)     |
//!   |---------------------------------------------->|
//!   |  reader: yield upload                         |
//!   |---------------------------------------------->|  waits for partner
//!   |  writer: dial (POST-incomplete, C, same decoy)|
//!   |---------------------------------------------->|
//!   |  writer: acquire upload                       |
//!   |---------------------------------------------->|  pairs reader + writer
//! ```
//!
//! The reader must have yielded before the writer exists, otherwise the
//! writer can reach the station before it knows to expect a partner.
//!
//! Once paired, a watcher task ties the flows' lifetimes together: whichever
//! closes first takes the other down with a `PartnerClosed` error.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::assets::AssetStore;
use crate::error::{Error, HandshakeStep, Result};
use crate::flow::{CorrelationId, CustomDialer, Flow, FlowFactory, FlowRole, RawFlow, TagKind};
use crate::latch::CloseLatch;
use crate::session::{self, SessionCounter, SessionId};

/// Dials [`DualConn`]s through a flow factory.
pub struct DualDialer<F: FlowFactory> {
    factory: F,
    assets: Arc<dyn AssetStore>,
    sessions: Arc<SessionCounter>,
}

impl<F: FlowFactory> DualDialer<F> {
    /// Create a dialer with its own session counter.
    pub fn new(factory: F, assets: Arc<dyn AssetStore>) -> Self {
        Self {
            factory,
            assets,
            sessions: Arc::new(SessionCounter::new()),
        }
    }

    /// Share a session counter with other dialers.
    pub fn with_sessions(mut self, sessions: Arc<SessionCounter>) -> Self {
        self.sessions = sessions;
        self
    }

    /// The flow factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Establish a paired connection.
    ///
    /// `custom_dialer`, when given, is used by both flows. On error every
    /// flow opened for this attempt has been closed and no task is left
    /// running.
    pub async fn dial(&self, custom_dialer: Option<CustomDialer>) -> Result<DualConn<F::Flow>> {
        let session_id = self.sessions.get_and_increment();
        self.dial_session(custom_dialer, session_id, CorrelationId::random())
            .await
    }

    pub(crate) async fn dial_session(
        &self,
        custom_dialer: Option<CustomDialer>,
        session_id: SessionId,
        correlation_id: CorrelationId,
    ) -> Result<DualConn<F::Flow>> {
        let id = session::id_str(session_id);
        let station_key = self.assets.station_pubkey();
        tracing::debug!("{} dialing split flow, correlation id {}", id, correlation_id);

        let mut raw_reader = RawFlow::new(TagKind::HttpGetIncomplete, station_key, correlation_id);
        raw_reader.custom_dialer = custom_dialer.clone();
        raw_reader.session_id = session_id;
        raw_reader.str_id_suffix = FlowRole::ReadOnly.label().to_string();

        let mut reader = self
            .factory
            .wrap(FlowRole::ReadOnly, raw_reader)
            .map_err(|e| handshake_failed(&id, HandshakeStep::ReaderWrap, e))?;
        reader
            .dial()
            .await
            .map_err(|e| handshake_failed(&id, HandshakeStep::ReaderDial, e))?;
        tracing::debug!("{} reader flow dialed", id);

        // TODO: the yield and the writer dial that follows are observable as a
        // dependent pair of flows; needs jitter or cover traffic in the raw layer.
        if let Err(err) = reader.yield_upload().await {
            reader.close_with_error_once(err.clone());
            return Err(handshake_failed(&id, HandshakeStep::ReaderYield, err));
        }

        let mut raw_writer = RawFlow::new(TagKind::HttpPostIncomplete, station_key, correlation_id);
        raw_writer.custom_dialer = custom_dialer;
        raw_writer.session_id = session_id;
        raw_writer.str_id_suffix = FlowRole::Upload.label().to_string();
        raw_writer.decoy_spec = reader.raw().decoy_spec.clone();
        raw_writer.pin_decoy_spec = true;

        let mut writer = match self.factory.wrap(FlowRole::Upload, raw_writer) {
            Ok(writer) => writer,
            Err(err) => {
                reader.close_with_error_once(err.clone());
                return Err(handshake_failed(&id, HandshakeStep::WriterWrap, err));
            }
        };
        if let Err(err) = writer.dial().await {
            reader.close_with_error_once(err.clone());
            return Err(handshake_failed(&id, HandshakeStep::WriterDial, err));
        }
        tracing::debug!("{} writer flow dialed", id);

        if let Err(err) = writer.acquire_upload().await {
            reader.close_with_error_once(err.clone());
            writer.close_with_error_once(err.clone());
            return Err(handshake_failed(&id, HandshakeStep::WriterAcquire, err));
        }

        tracing::info!("{} split flow established", id);
        Ok(DualConn::new(session_id, correlation_id, reader, writer))
    }
}

fn handshake_failed(id: &str, step: HandshakeStep, cause: Error) -> Error {
    tracing::warn!("{} {} failed: {}", id, step, cause);
    Error::handshake(step, cause)
}

/// A duplex connection whose read half is one flow and write half another.
///
/// Reads, addresses and deadlines go to the reader flow; writes go to the
/// writer flow. `set_write_deadline` applies to both.
pub struct DualConn<F: Flow> {
    reader: F,
    writer: F,
    session_id: SessionId,
    correlation_id: CorrelationId,
    watcher: JoinHandle<()>,
}

impl<F: Flow> DualConn<F> {
    fn new(session_id: SessionId, correlation_id: CorrelationId, reader: F, writer: F) -> Self {
        let watcher = spawn_watcher(
            session::id_str(session_id),
            reader.latch().clone(),
            writer.latch().clone(),
        );
        Self {
            reader,
            writer,
            session_id,
            correlation_id,
            watcher,
        }
    }

    /// Close both flows.
    ///
    /// The first close wins. Once both flows are already closed this returns
    /// [`Error::AlreadyClosed`] carrying the error that started the teardown.
    pub fn close(&self) -> Result<()> {
        let reader_closed = self.reader.close_with_error_once(Error::ClosedByApplication);
        let writer_closed = self.writer.close_with_error_once(Error::ClosedByApplication);
        if reader_closed || writer_closed {
            tracing::debug!("{} closed by application", self.id_str());
            return Ok(());
        }
        Err(Error::AlreadyClosed(Box::new(self.first_close_err())))
    }

    fn first_close_err(&self) -> Error {
        let reader = self.reader.latch().close_err();
        let writer = self.writer.latch().close_err();
        match (reader, writer) {
            (Some(err), _) if !err.is_partner_closed() => err,
            (_, Some(err)) if !err.is_partner_closed() => err,
            (Some(err), _) | (_, Some(err)) => err,
            (None, None) => Error::ClosedByApplication,
        }
    }

    /// Whether either flow has closed.
    pub fn is_closed(&self) -> bool {
        self.reader.is_closed() || self.writer.is_closed()
    }

    /// Local address of the reader flow.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.reader.local_addr()
    }

    /// Remote address of the reader flow.
    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.reader.remote_addr()
    }

    /// Set the reader flow's read and write deadlines.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.reader.set_deadline(deadline);
    }

    /// Set the reader flow's read deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.reader.set_read_deadline(deadline);
    }

    /// Set the write deadline on both flows.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.reader.set_write_deadline(deadline);
        self.writer.set_write_deadline(deadline);
    }

    /// The reader flow's underlying connection.
    ///
    /// Two underlying connections exist; this is only the reader's. Use
    /// [`writer_network_conn`](Self::writer_network_conn) for the other.
    pub fn network_conn(&self) -> Option<&F::Underlay> {
        self.reader.network_conn()
    }

    /// The writer flow's underlying connection.
    pub fn writer_network_conn(&self) -> Option<&F::Underlay> {
        self.writer.network_conn()
    }

    /// Session id (diagnostics only).
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Correlation id shared by both flows.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Log prefix, `[Session <id>]`.
    pub fn id_str(&self) -> String {
        session::id_str(self.session_id)
    }

    /// The download flow.
    pub fn reader(&self) -> &F {
        &self.reader
    }

    /// The upload flow.
    pub fn writer(&self) -> &F {
        &self.writer
    }
}

impl<F: Flow> Drop for DualConn<F> {
    fn drop(&mut self) {
        // Closing the latches lets the watcher exit.
        self.reader.close_with_error_once(Error::ClosedByApplication);
        self.writer.close_with_error_once(Error::ClosedByApplication);
    }
}

/// Close the partner of whichever flow closes first.
fn spawn_watcher(id: String, reader: CloseLatch, writer: CloseLatch) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            cause = reader.closed() => {
                tracing::debug!("{} reader flow closed: {}", id, cause);
                writer.close_with_error_once(Error::partner_closed(FlowRole::ReadOnly, cause));
            }
            cause = writer.closed() => {
                tracing::debug!("{} writer flow closed: {}", id, cause);
                reader.close_with_error_once(Error::partner_closed(FlowRole::Upload, cause));
            }
        }
    })
}

impl<F: Flow> AsyncRead for DualConn<F> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<F: Flow> AsyncWrite for DualConn<F> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

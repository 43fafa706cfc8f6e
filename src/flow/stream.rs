//! Generic flow wrapper over a station transport.
//!
//! The transport owns everything that touches the wire: tagging, the station
//! handshake, decoy choice and the upload control messages. `StreamFlow`
//! adds the role state machine, deadlines and close-once teardown on top.
//!
//! A dialed flow's stream lives in a [`SharedStream`] slot. A teardown task
//! spawned at dial time empties the slot as soon as the flow's latch closes,
//! so closing a flow shuts its connection down without waiting for the next
//! read or write.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::error::{Error, Result};
use crate::flow::{Flow, FlowFactory, FlowRole, RawFlow};
use crate::latch::CloseLatch;

/// How long a released stream gets to shut down cleanly.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The raw-flow layer: establishes tagged sessions through a decoy.
#[async_trait]
pub trait StationTransport: Send + Sync + 'static {
    /// Connected stream type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Dial a decoy and tag the session for the station.
    ///
    /// Unless `raw.pin_decoy_spec` is set the transport picks the decoy and
    /// records it in `raw.decoy_spec`; when pinned it must use the given one.
    async fn connect(&self, raw: &mut RawFlow) -> Result<Self::Stream>;

    /// Send the reader's yield of the upload direction.
    async fn yield_upload(&self, raw: &RawFlow, stream: &mut Self::Stream) -> Result<()>;

    /// Send the writer's claim on the yielded upload direction.
    async fn acquire_upload(&self, raw: &RawFlow, stream: &mut Self::Stream) -> Result<()>;

    /// Local address of a connected stream.
    fn local_addr(&self, stream: &Self::Stream) -> io::Result<SocketAddr>;

    /// Remote address of a connected stream.
    fn peer_addr(&self, stream: &Self::Stream) -> io::Result<SocketAddr>;
}

/// A flow's connected stream, shared with the task that releases it on close.
pub struct SharedStream<S> {
    slot: Arc<Mutex<Option<S>>>,
}

impl<S> SharedStream<S> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Lock the stream, or `None` if it is not connected or was released.
    pub fn lock(&self) -> Option<MappedMutexGuard<'_, S>> {
        MutexGuard::try_map(self.slot.lock(), Option::as_mut).ok()
    }

    /// Whether no stream is held.
    pub fn is_released(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn take(&self) -> Option<S> {
        self.slot.lock().take()
    }

    /// Put `stream` back unless `latch` has closed meanwhile, in which case
    /// it is dropped. Checked under the lock so the teardown task cannot miss it.
    fn restore(&self, stream: S, latch: &CloseLatch) {
        let mut slot = self.slot.lock();
        if !latch.is_closed() {
            *slot = Some(stream);
        }
    }
}

impl<S> Clone for SharedStream<S> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    Created,
    Dialed,
    Yielded,
    Acquired,
}

/// A flow backed by a [`StationTransport`] stream.
///
/// Dropping the flow closes it.
pub struct StreamFlow<T: StationTransport> {
    transport: Arc<T>,
    role: FlowRole,
    raw: RawFlow,
    state: FlowState,
    stream: SharedStream<T::Stream>,
    latch: CloseLatch,
    // Fires once the latch closes; `None` after it has been observed.
    closed: Option<BoxFuture<'static, Error>>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<T: StationTransport> StreamFlow<T> {
    /// Wrap `raw` with `role`. The tag kind must match the role.
    pub fn new(transport: Arc<T>, role: FlowRole, raw: RawFlow) -> Result<Self> {
        if raw.tag != role.tag_kind() {
            return Err(Error::RoleMismatch { role, tag: raw.tag });
        }
        let latch = CloseLatch::new();
        Ok(Self {
            transport,
            role,
            raw,
            state: FlowState::Created,
            stream: SharedStream::new(),
            closed: Some(latch.clone().closed_owned()),
            latch,
            read_deadline: None,
            write_deadline: None,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        match self.latch.close_err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn take_stream(&self) -> Result<T::Stream> {
        self.stream
            .take()
            .ok_or_else(|| Error::invalid_state("flow is not dialed"))
    }

    fn write_deadline_at(&self) -> Option<Instant> {
        self.write_deadline.as_ref().map(|sleep| sleep.deadline())
    }

    /// Release the stream once the latch closes.
    fn spawn_teardown(&self) {
        let latch = self.latch.clone();
        let stream = self.stream.clone();
        let id = self.raw.id_str();
        tokio::spawn(async move {
            let cause = latch.closed().await;
            if let Some(mut stream) = stream.take() {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await;
                tracing::debug!("{} flow released: {}", id, cause);
            }
        });
    }

    /// Check the latch; once closed, drop the stream and report the terminal error.
    fn poll_terminal(&mut self, cx: &mut Context<'_>) -> Option<Error> {
        if let Some(closed) = self.closed.as_mut() {
            match closed.as_mut().poll(cx) {
                Poll::Ready(_) => {
                    self.closed = None;
                    self.stream.take();
                }
                Poll::Pending => return None,
            }
        }
        Some(self.latch.close_err().unwrap_or(Error::ClosedByApplication))
    }

    /// Close on an underlay failure and hand the error back to the caller.
    fn fail(&mut self, err: io::Error) -> io::Error {
        let kind = err.kind();
        let err = Error::from(err);
        if self.latch.close_with_error_once(err.clone()) {
            tracing::debug!("{} flow failed: {}", self.raw.id_str(), err);
        }
        self.stream.take();
        io::Error::new(kind, err)
    }
}

impl<T: StationTransport> Drop for StreamFlow<T> {
    fn drop(&mut self) {
        self.latch.close_with_error_once(Error::ClosedByApplication);
    }
}

fn deadline_sleep(deadline: Option<Instant>) -> Option<Pin<Box<Sleep>>> {
    deadline.map(|at| Box::pin(tokio::time::sleep_until(at)))
}

fn poll_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline.as_mut() {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

async fn with_deadline<F, R>(deadline: Option<Instant>, fut: F) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}

#[async_trait]
impl<T: StationTransport> Flow for StreamFlow<T> {
    type Underlay = SharedStream<T::Stream>;

    fn role(&self) -> FlowRole {
        self.role
    }

    fn raw(&self) -> &RawFlow {
        &self.raw
    }

    async fn dial(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state != FlowState::Created {
            return Err(Error::invalid_state("flow already dialed"));
        }

        let stream = self.transport.connect(&mut self.raw).await?;
        if let Some(decoy) = &self.raw.decoy_spec {
            tracing::debug!(
                "{} connected via decoy {} ({})",
                self.raw.id_str(),
                decoy.hostname,
                decoy.address
            );
        }
        self.stream.restore(stream, &self.latch);
        self.state = FlowState::Dialed;
        self.spawn_teardown();
        Ok(())
    }

    async fn yield_upload(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.role != FlowRole::ReadOnly {
            return Err(Error::invalid_state(format!(
                "{} flow cannot yield upload",
                self.role
            )));
        }
        if self.state != FlowState::Dialed {
            return Err(Error::invalid_state("yield requires a dialed flow"));
        }

        let deadline = self.write_deadline_at();
        let transport = Arc::clone(&self.transport);
        let raw = self.raw.clone();
        let mut stream = self.take_stream()?;
        let result = with_deadline(deadline, transport.yield_upload(&raw, &mut stream)).await;
        self.stream.restore(stream, &self.latch);
        result?;
        self.state = FlowState::Yielded;
        Ok(())
    }

    async fn acquire_upload(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.role != FlowRole::Upload {
            return Err(Error::invalid_state(format!(
                "{} flow cannot acquire upload",
                self.role
            )));
        }
        if self.state != FlowState::Dialed {
            return Err(Error::invalid_state("acquire requires a dialed flow"));
        }

        let deadline = self.write_deadline_at();
        let transport = Arc::clone(&self.transport);
        let raw = self.raw.clone();
        let mut stream = self.take_stream()?;
        let result = with_deadline(deadline, transport.acquire_upload(&raw, &mut stream)).await;
        self.stream.restore(stream, &self.latch);
        result?;
        self.state = FlowState::Acquired;
        Ok(())
    }

    fn latch(&self) -> &CloseLatch {
        &self.latch
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.stream.lock() {
            Some(stream) => self.transport.local_addr(&stream),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        match self.stream.lock() {
            Some(stream) => self.transport.peer_addr(&stream),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline_sleep(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline_sleep(deadline);
    }

    fn network_conn(&self) -> Option<&SharedStream<T::Stream>> {
        if self.latch.is_closed() || self.stream.is_released() {
            return None;
        }
        Some(&self.stream)
    }
}

impl<T: StationTransport> AsyncRead for StreamFlow<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_terminal(cx) {
            return Poll::Ready(Err(err.into()));
        }

        let wanted = buf.remaining();
        let before = buf.filled().len();
        let polled = match this.stream.lock() {
            Some(mut stream) => Pin::new(&mut *stream).poll_read(cx, buf),
            None => return Poll::Ready(Err(Error::invalid_state("flow is not dialed").into())),
        };
        match polled {
            Poll::Ready(Ok(())) => {
                if wanted > 0 && buf.filled().len() == before {
                    // Remote hung up: tear down so the partner follows.
                    if this.latch.close_with_error_once(Error::Eof) {
                        tracing::debug!("{} flow reached EOF", this.raw.id_str());
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.fail(e))),
            Poll::Pending => {
                if poll_deadline(&mut this.read_deadline, cx) {
                    return Poll::Ready(Err(Error::Timeout.into()));
                }
                Poll::Pending
            }
        }
    }
}

impl<T: StationTransport> AsyncWrite for StreamFlow<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_terminal(cx) {
            return Poll::Ready(Err(err.into()));
        }

        let polled = match this.stream.lock() {
            Some(mut stream) => Pin::new(&mut *stream).poll_write(cx, buf),
            None => return Poll::Ready(Err(Error::invalid_state("flow is not dialed").into())),
        };
        match polled {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.fail(e))),
            Poll::Pending => {
                if poll_deadline(&mut this.write_deadline, cx) {
                    return Poll::Ready(Err(Error::Timeout.into()));
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_terminal(cx) {
            return Poll::Ready(Err(err.into()));
        }
        let polled = match this.stream.lock() {
            Some(mut stream) => Pin::new(&mut *stream).poll_flush(cx),
            None => return Poll::Ready(Ok(())),
        };
        match polled {
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.fail(e))),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_terminal(cx).is_some() {
            return Poll::Ready(Ok(()));
        }
        match this.stream.lock() {
            Some(mut stream) => Pin::new(&mut *stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// [`FlowFactory`] producing [`StreamFlow`]s over a shared transport.
pub struct StreamFlowFactory<T: StationTransport> {
    transport: Arc<T>,
}

impl<T: StationTransport> StreamFlowFactory<T> {
    /// Create a factory over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// The shared transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

impl<T: StationTransport> FlowFactory for StreamFlowFactory<T> {
    type Flow = StreamFlow<T>;

    fn wrap(&self, role: FlowRole, raw: RawFlow) -> Result<StreamFlow<T>> {
        StreamFlow::new(Arc::clone(&self.transport), role, raw)
    }
}

//! Test doubles: scriptable mock flows and an in-memory station transport.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::flow::{DecoySpec, Flow, FlowFactory, FlowRole, RawFlow, StationTransport};
use crate::latch::CloseLatch;

/// Decoy number `n`, e.g. `decoy7.example` at 192.0.2.7:443.
pub(crate) fn loopback_decoy(n: u8) -> DecoySpec {
    DecoySpec::new(
        format!("decoy{}.example", n),
        SocketAddr::from(([192, 0, 2, n], 443)),
    )
}

/// Station transport over in-memory duplex pipes.
///
/// Each connect hands the far end of a new pipe to the test through
/// [`take_far_end`](Self::take_far_end).
pub(crate) struct LoopbackTransport {
    far_ends: Mutex<VecDeque<DuplexStream>>,
    connects: AtomicUsize,
    connected: Mutex<Vec<RawFlow>>,
    stall_acquire: bool,
}

impl LoopbackTransport {
    pub(crate) fn new() -> Self {
        Self {
            far_ends: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
            connected: Mutex::new(Vec::new()),
            stall_acquire: false,
        }
    }

    /// Never complete `acquire_upload`.
    pub(crate) fn with_stalled_acquire(mut self) -> Self {
        self.stall_acquire = true;
        self
    }

    /// Station side of the oldest untaken connection.
    pub(crate) fn take_far_end(&self) -> Option<DuplexStream> {
        self.far_ends.lock().pop_front()
    }

    /// Raw flows as they were when connected, in connect order.
    pub(crate) fn connected(&self) -> Vec<RawFlow> {
        self.connected.lock().clone()
    }
}

#[async_trait]
impl StationTransport for LoopbackTransport {
    type Stream = DuplexStream;

    async fn connect(&self, raw: &mut RawFlow) -> Result<DuplexStream> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if !raw.pin_decoy_spec {
            raw.decoy_spec = Some(loopback_decoy(n as u8));
        }
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.far_ends.lock().push_back(far);
        self.connected.lock().push(raw.clone());
        Ok(near)
    }

    async fn yield_upload(&self, _raw: &RawFlow, stream: &mut DuplexStream) -> Result<()> {
        stream.write_all(b"YIELD").await?;
        Ok(())
    }

    async fn acquire_upload(&self, _raw: &RawFlow, stream: &mut DuplexStream) -> Result<()> {
        if self.stall_acquire {
            std::future::pending::<()>().await;
        }
        stream.write_all(b"ACQUIRE").await?;
        Ok(())
    }

    fn local_addr(&self, _stream: &DuplexStream) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 40000)))
    }

    fn peer_addr(&self, _stream: &DuplexStream) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([192, 0, 2, 1], 443)))
    }
}

/// Outcome of each collaborator call; `Some(err)` makes that step fail.
#[derive(Clone, Default)]
pub(crate) struct MockScript {
    pub(crate) reader_wrap: Option<Error>,
    pub(crate) reader_dial: Option<Error>,
    pub(crate) reader_yield: Option<Error>,
    pub(crate) writer_wrap: Option<Error>,
    pub(crate) writer_dial: Option<Error>,
    pub(crate) writer_acquire: Option<Error>,
    /// Decoy the reader "chooses" while dialing
    pub(crate) reader_decoy: Option<DecoySpec>,
    /// Bytes the reader serves before EOF
    pub(crate) reader_input: Vec<u8>,
}

impl MockScript {
    fn step_result(
        &self,
        role: FlowRole,
        reader: &Option<Error>,
        writer: &Option<Error>,
    ) -> Result<()> {
        let scripted = match role {
            FlowRole::ReadOnly => reader,
            FlowRole::Upload => writer,
        };
        match scripted {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// What a test can observe about one wrapped mock flow.
#[derive(Clone)]
pub(crate) struct MockRecord {
    pub(crate) role: FlowRole,
    /// Raw flow exactly as handed to `wrap`
    pub(crate) raw_at_wrap: RawFlow,
    pub(crate) latch: CloseLatch,
    pub(crate) writes: Arc<Mutex<Vec<Bytes>>>,
    pub(crate) read_deadline: Arc<Mutex<Option<Instant>>>,
    pub(crate) write_deadline: Arc<Mutex<Option<Instant>>>,
}

impl MockRecord {
    pub(crate) fn written(&self) -> Vec<u8> {
        self.writes.lock().iter().flat_map(|b| b.iter().copied()).collect()
    }
}

/// Factory producing scripted [`MockFlow`]s and logging every call.
pub(crate) struct MockFactory {
    script: MockScript,
    log: Arc<Mutex<Vec<String>>>,
    records: Mutex<Vec<MockRecord>>,
}

impl MockFactory {
    pub(crate) fn new(script: MockScript) -> Self {
        Self {
            script,
            log: Arc::new(Mutex::new(Vec::new())),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Call log, e.g. `["wrap R", "dial R", "yield R", ...]`.
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn record(&self, role: FlowRole) -> Option<MockRecord> {
        self.records.lock().iter().find(|r| r.role == role).cloned()
    }

    pub(crate) fn wrapped(&self) -> usize {
        self.records.lock().len()
    }
}

impl FlowFactory for MockFactory {
    type Flow = MockFlow;

    fn wrap(&self, role: FlowRole, raw: RawFlow) -> Result<MockFlow> {
        self.log.lock().push(format!("wrap {}", role.label()));
        self.script
            .step_result(role, &self.script.reader_wrap, &self.script.writer_wrap)?;

        let flow = MockFlow {
            role,
            raw: raw.clone(),
            latch: CloseLatch::new(),
            script: self.script.clone(),
            log: Arc::clone(&self.log),
            input: match role {
                FlowRole::ReadOnly => self.script.reader_input.clone().into(),
                FlowRole::Upload => VecDeque::new(),
            },
            writes: Arc::new(Mutex::new(Vec::new())),
            read_deadline: Arc::new(Mutex::new(None)),
            write_deadline: Arc::new(Mutex::new(None)),
            underlay: None,
        };
        self.records.lock().push(MockRecord {
            role,
            raw_at_wrap: raw,
            latch: flow.latch.clone(),
            writes: Arc::clone(&flow.writes),
            read_deadline: Arc::clone(&flow.read_deadline),
            write_deadline: Arc::clone(&flow.write_deadline),
        });
        Ok(flow)
    }
}

/// Scripted flow. Its underlay is a label like `underlay-R`.
pub(crate) struct MockFlow {
    role: FlowRole,
    raw: RawFlow,
    latch: CloseLatch,
    script: MockScript,
    log: Arc<Mutex<Vec<String>>>,
    input: VecDeque<u8>,
    writes: Arc<Mutex<Vec<Bytes>>>,
    read_deadline: Arc<Mutex<Option<Instant>>>,
    write_deadline: Arc<Mutex<Option<Instant>>>,
    underlay: Option<String>,
}

impl MockFlow {
    fn log(&self, event: &str) {
        self.log.lock().push(format!("{} {}", event, self.role.label()));
    }
}

#[async_trait]
impl Flow for MockFlow {
    type Underlay = String;

    fn role(&self) -> FlowRole {
        self.role
    }

    fn raw(&self) -> &RawFlow {
        &self.raw
    }

    async fn dial(&mut self) -> Result<()> {
        self.log("dial");
        self.script
            .step_result(self.role, &self.script.reader_dial, &self.script.writer_dial)?;
        if !self.raw.pin_decoy_spec {
            self.raw.decoy_spec = self.script.reader_decoy.clone();
        }
        self.underlay = Some(format!("underlay-{}", self.role.label()));
        Ok(())
    }

    async fn yield_upload(&mut self) -> Result<()> {
        self.log("yield");
        self.script
            .step_result(self.role, &self.script.reader_yield, &None)
    }

    async fn acquire_upload(&mut self) -> Result<()> {
        self.log("acquire");
        self.script
            .step_result(self.role, &None, &self.script.writer_acquire)
    }

    fn latch(&self) -> &CloseLatch {
        &self.latch
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        let port = match self.role {
            FlowRole::ReadOnly => 1,
            FlowRole::Upload => 2,
        };
        Ok(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([192, 0, 2, 7], 443)))
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        *self.read_deadline.lock() = deadline;
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        *self.write_deadline.lock() = deadline;
    }

    fn network_conn(&self) -> Option<&String> {
        self.underlay.as_ref()
    }

    fn close_with_error_once(&self, err: Error) -> bool {
        self.log.lock().push(format!("close {}: {}", self.role.label(), err));
        self.latch.close_with_error_once(err)
    }
}

impl AsyncRead for MockFlow {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.latch.close_err() {
            return Poll::Ready(Err(err.into()));
        }
        let n = buf.remaining().min(this.input.len());
        let chunk: Vec<u8> = this.input.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockFlow {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.latch.close_err() {
            return Poll::Ready(Err(err.into()));
        }
        self.writes.lock().push(Bytes::copy_from_slice(buf));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

//! Shared scaffolding for the integration tests: deterministic collaborator
//! doubles (clock, timer, transport), a scripted protocol layer, and a
//! recording request client. Tests pump I/O completions by hand, so every
//! scenario runs single-threaded and fully deterministic.
#![allow(dead_code)]

use plcmux_core::runtime::{Clock, IoStatus, Timer, Transport, TransportFactory, WakeHandle};
use plcmux_core::{
    get, DriverError, DriverResult, FrameWindow, Layer, LayerFlow, PlcHandle, PlcOptions, RecvFlow,
    RequestClient, RequestId, WireCursor,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tracing::Level;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/* ---- clock ---- */

pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(1_000_000),
        })
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/* ---- timer ---- */

/// Records the armed deadline; tests fire ticks by hand.
pub struct FakeTimer {
    armed: Mutex<Option<(i64, WakeHandle)>>,
    snoozes: AtomicUsize,
}

impl FakeTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: Mutex::new(None),
            snoozes: AtomicUsize::new(0),
        })
    }

    /// Fire the armed wake-up, if any. The heartbeat re-arms itself during
    /// the call.
    pub fn fire(&self) -> bool {
        let armed = self.armed.lock().unwrap().take();
        match armed {
            Some((_, wake)) => {
                wake.wake();
                true
            }
            None => false,
        }
    }

    pub fn armed_deadline(&self) -> Option<i64> {
        self.armed.lock().unwrap().as_ref().map(|(at, _)| *at)
    }

    pub fn snoozes(&self) -> usize {
        self.snoozes.load(Ordering::SeqCst)
    }
}

impl Timer for FakeTimer {
    fn wake_at(&self, deadline_ms: i64, wake: WakeHandle) {
        *self.armed.lock().unwrap() = Some((deadline_ms, wake));
    }

    fn snooze(&self) {
        self.snoozes.fetch_add(1, Ordering::SeqCst);
        self.armed.lock().unwrap().take();
    }
}

/* ---- transport ---- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Connect,
    Write,
    Read,
}

struct TransportInner {
    status: IoStatus,
    wake: Option<WakeHandle>,
    op: Option<PendingOp>,
    writes: Vec<Vec<u8>>,
    rx_script: VecDeque<Vec<u8>>,
    rx: Vec<u8>,
    connect_results: VecDeque<bool>,
    connect_attempts: usize,
    closes: usize,
}

/// Scripted transport double. `begin_*` registers the operation; nothing
/// completes until the test calls [`FakeTransport::pump`], which flips the
/// status and fires the wake from the test thread.
pub struct FakeTransport {
    inner: Mutex<TransportInner>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TransportInner {
                status: IoStatus::Idle,
                wake: None,
                op: None,
                writes: Vec::new(),
                rx_script: VecDeque::new(),
                rx: Vec::new(),
                connect_results: VecDeque::new(),
                connect_attempts: 0,
                closes: 0,
            }),
        })
    }

    /// Queue inbound bytes for the next completed read.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().rx_script.push_back(bytes.to_vec());
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..count {
            inner.connect_results.push_back(false);
        }
    }

    /// Complete the pending operation and fire its wake. Returns false when
    /// nothing was completable (no operation pending, or a read with no
    /// scripted data).
    pub fn pump(&self) -> bool {
        let wake = {
            let mut inner = self.inner.lock().unwrap();
            let Some(op) = inner.op.take() else {
                return false;
            };
            match op {
                PendingOp::Connect => {
                    let ok = inner.connect_results.pop_front().unwrap_or(true);
                    inner.status = if ok { IoStatus::Ready } else { IoStatus::Failed };
                }
                PendingOp::Write => {
                    inner.status = IoStatus::Ready;
                }
                PendingOp::Read => {
                    if inner.rx.is_empty() {
                        match inner.rx_script.pop_front() {
                            Some(chunk) => inner.rx.extend_from_slice(&chunk),
                            None => {
                                // nothing to deliver yet; keep waiting
                                inner.op = Some(PendingOp::Read);
                                return false;
                            }
                        }
                    }
                    inner.status = IoStatus::Ready;
                }
            }
            inner.wake.take()
        };
        if let Some(wake) = wake {
            wake.wake();
        }
        true
    }

    /// Pump until nothing completes anymore.
    pub fn pump_all(&self) -> usize {
        let mut pumped = 0;
        while self.pump() {
            pumped += 1;
            assert!(pumped < 64, "transport pump did not settle");
        }
        pumped
    }

    /// Fire the registered wake without completing the operation.
    pub fn wake_spurious(&self) -> bool {
        let wake = self.inner.lock().unwrap().wake.clone();
        match wake {
            Some(wake) => {
                wake.wake();
                true
            }
            None => false,
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.lock().unwrap().connect_attempts
    }

    pub fn closes(&self) -> usize {
        self.inner.lock().unwrap().closes
    }

    pub fn has_pending_op(&self) -> bool {
        self.inner.lock().unwrap().op.is_some()
    }
}

impl Transport for FakeTransport {
    fn begin_connect(&self, _host: &str, _port: u16, wake: WakeHandle) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.connect_attempts += 1;
        inner.status = IoStatus::Pending;
        inner.wake = Some(wake);
        inner.op = Some(PendingOp::Connect);
        Ok(())
    }

    fn begin_write(&self, frame: &[u8], wake: WakeHandle) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.writes.push(frame.to_vec());
        inner.status = IoStatus::Pending;
        inner.wake = Some(wake);
        inner.op = Some(PendingOp::Write);
        Ok(())
    }

    fn begin_read(&self, wake: WakeHandle) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.status = IoStatus::Pending;
        inner.wake = Some(wake);
        inner.op = Some(PendingOp::Read);
        Ok(())
    }

    fn io_status(&self) -> IoStatus {
        self.inner.lock().unwrap().status
    }

    fn drain_received(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = dst.len().min(inner.rx.len());
        dst[..n].copy_from_slice(&inner.rx[..n]);
        inner.rx.drain(..n);
        n
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closes += 1;
        inner.status = IoStatus::Idle;
        inner.wake = None;
        inner.op = None;
        inner.rx.clear();
    }
}

pub struct FakeTransportFactory {
    transport: Arc<FakeTransport>,
    creates: AtomicUsize,
}

impl FakeTransportFactory {
    pub fn new(transport: Arc<FakeTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            creates: AtomicUsize::new(0),
        })
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(&self) -> DriverResult<Arc<dyn Transport>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(self.transport.clone())
    }
}

/* ---- scripted layer ---- */

pub const FRAME_HDR: usize = 4; // magic u16 + record count u16
pub const RECORD_HDR: usize = 10; // req_id i64 + payload len u16
pub const FRAME_MAGIC: u16 = 0xF00D;

/// Counters a [`TestLayer`] shares with its test after being moved into the
/// core.
#[derive(Default)]
pub struct LayerProbe {
    pub inits: AtomicUsize,
    pub aborted: Mutex<Vec<RequestId>>,
    pub accepted: Mutex<Vec<Vec<RequestId>>>,
}

#[derive(Debug, Clone, Copy)]
pub struct TestLayerConfig {
    /// Handshake exchanges required before the layer reports connected;
    /// 0 connects without touching the wire.
    pub handshake_rounds: u32,
    /// Whether disconnecting requires a frame exchange.
    pub disconnect_exchange: bool,
    /// Requests per frame before `build_layer` seals it.
    pub batch_limit: usize,
}

impl Default for TestLayerConfig {
    fn default() -> Self {
        Self {
            handshake_rounds: 0,
            disconnect_exchange: false,
            batch_limit: 1,
        }
    }
}

/// Single scripted layer speaking a toy wire format: a 4-byte frame header
/// (magic + record count) followed by `[req_id i64][len u16][payload]`
/// records, identical in both directions so a written frame can be echoed
/// straight back.
pub struct TestLayer {
    cfg: TestLayerConfig,
    probe: Arc<LayerProbe>,
    next_id: RequestId,
    rounds_done: u32,
    disconnect_awaiting: bool,
    // outbound frame state
    records_built: usize,
    record_start: usize,
    // inbound frame state
    rx_records_done: usize,
    rx_offset: usize,
}

impl TestLayer {
    pub fn new(cfg: TestLayerConfig) -> (Box<Self>, Arc<LayerProbe>) {
        let probe = Arc::new(LayerProbe::default());
        (
            Box::new(Self {
                cfg,
                probe: probe.clone(),
                next_id: 1,
                rounds_done: 0,
                disconnect_awaiting: false,
                records_built: 0,
                record_start: 0,
                rx_records_done: 0,
                rx_offset: 0,
            }),
            probe,
        )
    }

    fn handshaking(&self) -> bool {
        self.rounds_done < self.cfg.handshake_rounds
    }

    fn mint(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Layer for TestLayer {
    fn name(&self) -> &'static str {
        "test"
    }

    fn initialize(&mut self) -> DriverResult<()> {
        self.rounds_done = 0;
        self.disconnect_awaiting = false;
        self.records_built = 0;
        self.record_start = 0;
        self.rx_records_done = 0;
        self.rx_offset = 0;
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connect(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<LayerFlow> {
        if !self.handshaking() {
            return Ok(LayerFlow::Complete);
        }
        let mut cur = WireCursor::at(win.buf, win.start);
        cur.put_u8(0xC0)?;
        cur.put_u8(self.rounds_done as u8)?;
        win.end = cur.offset();
        Ok(LayerFlow::Pending)
    }

    fn disconnect(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<LayerFlow> {
        if !self.cfg.disconnect_exchange {
            return Ok(LayerFlow::Complete);
        }
        if self.disconnect_awaiting {
            return Ok(LayerFlow::Complete);
        }
        let mut cur = WireCursor::at(win.buf, win.start);
        cur.put_u8(0xD0)?;
        win.end = cur.offset();
        self.disconnect_awaiting = true;
        Ok(LayerFlow::Pending)
    }

    fn reserve_space(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<Option<RequestId>> {
        win.start = FRAME_HDR + RECORD_HDR;
        win.end = win.start;
        self.record_start = win.start;
        self.records_built = 0;
        self.rx_records_done = 0;
        self.rx_offset = 0;
        Ok(Some(self.mint()))
    }

    fn accept_requests(&mut self, req_ids: &[RequestId]) -> DriverResult<()> {
        self.probe.accepted.lock().unwrap().push(req_ids.to_vec());
        Ok(())
    }

    fn abort_request(&mut self, req_id: RequestId) {
        self.probe.aborted.lock().unwrap().push(req_id);
    }

    fn build_layer(
        &mut self,
        win: &mut FrameWindow<'_>,
        req_id: &mut RequestId,
    ) -> DriverResult<LayerFlow> {
        // connect/disconnect frames go out unwrapped
        if self.handshaking() || self.disconnect_awaiting {
            return Ok(LayerFlow::Complete);
        }

        self.records_built += 1;

        // header of the record just built
        let payload_len = win.end - self.record_start;
        let mut cur = WireCursor::at(win.buf, self.record_start - RECORD_HDR);
        cur.put_bytes(&req_id.to_le_bytes())?;
        cur.put_u16_le(payload_len as u16)?;

        // frame header covers everything built so far
        let mut cur = WireCursor::new(win.buf);
        cur.put_u16_le(FRAME_MAGIC)?;
        cur.put_u16_le(self.records_built as u16)?;

        *req_id = self.mint();

        if self.records_built >= self.cfg.batch_limit {
            return Ok(LayerFlow::Complete);
        }
        if win.end + RECORD_HDR > win.capacity() {
            return Ok(LayerFlow::Complete);
        }
        // set up the next record; the core drops this space again when no
        // request follows
        self.record_start = win.end + RECORD_HDR;
        win.end = self.record_start;
        Ok(LayerFlow::Pending)
    }

    fn process_response(
        &mut self,
        win: &mut FrameWindow<'_>,
        req_id: &mut RequestId,
    ) -> DriverResult<RecvFlow> {
        if self.handshaking() {
            if win.len() < 2 {
                return Ok(RecvFlow::Partial);
            }
            self.rounds_done += 1;
            return if self.handshaking() {
                Ok(RecvFlow::Retry)
            } else {
                Ok(RecvFlow::Complete)
            };
        }

        if self.disconnect_awaiting {
            if win.is_empty() {
                return Ok(RecvFlow::Partial);
            }
            self.disconnect_awaiting = false;
            return Ok(RecvFlow::Complete);
        }

        if win.end < FRAME_HDR {
            return Ok(RecvFlow::Partial);
        }
        let mut cur = WireCursor::at(win.buf, 0);
        let magic = cur.u16_le()?;
        if magic != FRAME_MAGIC {
            return Err(DriverError::io("bad frame magic"));
        }
        let count = cur.u16_le()? as usize;

        if self.rx_offset == 0 {
            self.rx_offset = FRAME_HDR;
        }
        if win.end < self.rx_offset + RECORD_HDR {
            return Ok(RecvFlow::Partial);
        }
        let mut cur = WireCursor::at(win.buf, self.rx_offset);
        let id = cur.u64_le()? as RequestId;
        let payload_len = cur.u16_le()? as usize;

        let payload_start = self.rx_offset + RECORD_HDR;
        let payload_end = payload_start + payload_len;
        if win.end < payload_end {
            return Ok(RecvFlow::Partial);
        }

        *req_id = id;
        win.start = payload_start;
        win.end = payload_end;
        self.rx_records_done += 1;
        self.rx_offset = payload_end;

        if self.rx_records_done < count {
            Ok(RecvFlow::Pending)
        } else {
            self.rx_records_done = 0;
            self.rx_offset = 0;
            Ok(RecvFlow::Complete)
        }
    }
}

/// Build an inbound frame in the [`TestLayer`] wire format.
pub fn response_frame(records: &[(RequestId, &[u8])]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(records.len() as u16).to_le_bytes());
    for (req_id, payload) in records {
        frame.extend_from_slice(&req_id.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
    }
    frame
}

/* ---- request client ---- */

/// Records everything that happens to it; fails the build when its payload
/// does not fit the remaining window.
pub struct TestClient {
    payload: Vec<u8>,
    pub responses: Mutex<Vec<(RequestId, Vec<u8>)>>,
    pub build_ids: Mutex<Vec<RequestId>>,
    fail_response: bool,
}

impl TestClient {
    pub fn new(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            payload: payload.to_vec(),
            responses: Mutex::new(Vec::new()),
            build_ids: Mutex::new(Vec::new()),
            fail_response: false,
        })
    }

    pub fn failing_response(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            payload: payload.to_vec(),
            responses: Mutex::new(Vec::new()),
            build_ids: Mutex::new(Vec::new()),
            fail_response: true,
        })
    }

    pub fn delivered(&self) -> Vec<(RequestId, Vec<u8>)> {
        self.responses.lock().unwrap().clone()
    }
}

impl RequestClient for TestClient {
    fn build_request(&self, win: &mut FrameWindow<'_>, req_id: RequestId) -> DriverResult<()> {
        if win.end + self.payload.len() > win.capacity() {
            return Err(DriverError::TooSmall);
        }
        let end = win.end;
        win.buf[end..end + self.payload.len()].copy_from_slice(&self.payload);
        win.end = end + self.payload.len();
        self.build_ids.lock().unwrap().push(req_id);
        Ok(())
    }

    fn process_response(&self, win: &mut FrameWindow<'_>, req_id: RequestId) -> DriverResult<()> {
        if self.fail_response {
            return Err(DriverError::io("client rejected the response"));
        }
        self.responses
            .lock()
            .unwrap()
            .push((req_id, win.payload().to_vec()));
        Ok(())
    }
}

/* ---- rig ---- */

/// Everything a scenario needs: the PLC handle plus the doubles behind it.
pub struct Rig {
    pub handle: PlcHandle,
    pub clock: Arc<FakeClock>,
    pub timer: Arc<FakeTimer>,
    pub transport: Arc<FakeTransport>,
    pub probe: Arc<LayerProbe>,
}

/// Intern a PLC over deterministic doubles. `gateway` doubles as the unique
/// key per test, since the registry is process-wide.
pub fn rig(gateway: &str, cfg: TestLayerConfig) -> Rig {
    rig_with_buffer(gateway, cfg, 256)
}

pub fn rig_with_buffer(gateway: &str, cfg: TestLayerConfig, buffer_size: usize) -> Rig {
    init_tracing();

    let clock = FakeClock::new();
    let timer = FakeTimer::new();
    let transport = FakeTransport::new();
    let factory = FakeTransportFactory::new(transport.clone());
    let (layer, probe) = TestLayer::new(cfg);

    let options = PlcOptions::new(gateway);
    let (clock2, timer2, factory2) = (clock.clone(), timer.clone(), factory);
    let handle = get("test", &options, move |configurator, _options| {
        configurator.set_layer_count(1);
        configurator.set_layer(0, layer)?;
        configurator.set_default_port(5000);
        configurator.set_buffer_size(buffer_size);
        configurator.set_clock(clock2);
        configurator.set_timer(timer2);
        configurator.set_transport_factory(factory2);
        Ok(())
    })
    .expect("failed to intern test PLC");

    Rig {
        handle,
        clock,
        timer,
        transport,
        probe,
    }
}

/// Pump the transport through connect and send until the machine sits
/// waiting for a response.
pub fn pump_to_response_wait(rig: &Rig) {
    rig.transport.pump_all();
}

use crate::options::{
    DESTROY_DISCONNECT_TIMEOUT_MS, DESTROY_POLL_INTERVAL_MS, MAX_IDLE_TIMEOUT_MS,
    MIN_RETRY_INTERVAL_MS, PLC_HEARTBEAT_INTERVAL_MS,
};
use crate::runtime::{Clock, Timer, Transport, TransportFactory, WakeHandle};
use crate::stack::LayerStack;
use crate::state::{self, PlcState};
use plcmux_sdk::{DriverError, DriverResult, RequestClient, RequestId, INVALID_REQUEST_ID};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One interned PLC connection. All mutable state lives behind the core
/// mutex; the state machine never waits while holding it.
pub struct Plc {
    key: String,
    host: String,
    port: u16,
    /// Explicit reference count; the registry removes and destroys the
    /// instance when it reaches zero.
    refs: AtomicUsize,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    transport_factory: Arc<dyn TransportFactory>,
    core: Mutex<PlcCore>,
}

pub(crate) struct PlcCore {
    pub(crate) state: PlcState,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) layers: LayerStack,
    pub(crate) queue: VecDeque<QueuedRequest>,
    pub(crate) buf: Vec<u8>,
    pub(crate) payload_start: usize,
    pub(crate) payload_end: usize,
    pub(crate) current_request_id: RequestId,
    pub(crate) retry_interval_ms: i64,
    pub(crate) next_retry_time: i64,
    pub(crate) idle_timeout_ms: u32,
    pub(crate) next_idle_timeout: i64,
    pub(crate) is_connected: bool,
    pub(crate) is_terminating: bool,
    context: Option<Box<dyn Any + Send>>,
}

pub(crate) struct QueuedRequest {
    pub(crate) client: Arc<dyn RequestClient>,
    pub(crate) req_id: RequestId,
}

/// Identity for queue membership: the client object itself, compared by
/// address.
pub(crate) fn same_client(a: &Arc<dyn RequestClient>, b: &Arc<dyn RequestClient>) -> bool {
    Arc::ptr_eq(a, b)
}

impl Plc {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: String,
        host: String,
        port: u16,
        layers: LayerStack,
        buffer_size: usize,
        idle_timeout_ms: u32,
        context: Option<Box<dyn Any + Send>>,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn Timer>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            key,
            host,
            port,
            refs: AtomicUsize::new(1),
            clock,
            timer,
            transport_factory,
            core: Mutex::new(PlcCore {
                state: PlcState::DispatchRequests,
                transport: None,
                layers,
                queue: VecDeque::new(),
                buf: vec![0; buffer_size],
                payload_start: 0,
                payload_end: 0,
                current_request_id: INVALID_REQUEST_ID,
                retry_interval_ms: MIN_RETRY_INTERVAL_MS,
                next_retry_time: 0,
                idle_timeout_ms,
                next_idle_timeout: 0,
                is_connected: false,
                is_terminating: false,
                context,
            }),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn transport_factory(&self) -> &Arc<dyn TransportFactory> {
        &self.transport_factory
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, PlcCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bump the reference count unless it already hit zero (the instance is
    /// being destroyed and must not be revived).
    pub(crate) fn try_add_ref(&self) -> bool {
        let mut refs = self.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => refs = current,
            }
        }
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, returning the previous count.
    pub(crate) fn drop_ref(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel)
    }

    /// Arm the recurring heartbeat; called once right after construction.
    pub(crate) fn start_heartbeat(plc: &Arc<Plc>) {
        let now = plc.clock.now_ms();
        plc.timer
            .wake_at(now + PLC_HEARTBEAT_INTERVAL_MS, WakeHandle::heartbeat(plc));
    }

    /// Heartbeat tick: run the machine only when it sits in dispatch, then
    /// re-arm. This is the sole wake source for idle disconnect and
    /// post-backoff retry.
    pub(crate) fn heartbeat_tick(plc: &Arc<Plc>) {
        let terminating = {
            let mut core = plc.lock_core();
            if core.state == PlcState::DispatchRequests {
                state::run_locked(plc, &mut core);
            }
            core.is_terminating
        };
        if !terminating {
            let now = plc.clock.now_ms();
            plc.timer
                .wake_at(now + PLC_HEARTBEAT_INTERVAL_MS, WakeHandle::heartbeat(plc));
        }
    }

    /// Hard reset: close the stream, re-initialize every layer, clear the
    /// connected flag.
    pub(crate) fn initialize(&self) {
        tracing::info!(key = %self.key, "resetting PLC");
        self.lock_core().reset();
    }

    pub(crate) fn start_request(
        plc: &Arc<Plc>,
        client: Arc<dyn RequestClient>,
    ) -> DriverResult<()> {
        let mut core = plc.lock_core();

        if core.queue.iter().any(|entry| same_client(&entry.client, &client)) {
            tracing::warn!(key = %plc.key, "request is already queued");
            return Err(DriverError::Busy);
        }

        core.queue.push_back(QueuedRequest {
            client,
            req_id: INVALID_REQUEST_ID,
        });
        tracing::debug!(key = %plc.key, queued = core.queue.len(), "request queued");

        // kick the machine only when it is idle in dispatch; an in-flight
        // frame is never preempted
        if core.state == PlcState::DispatchRequests {
            state::run_locked(plc, &mut core);
        }

        Ok(())
    }

    pub(crate) fn stop_request(&self, client: &Arc<dyn RequestClient>) -> DriverResult<()> {
        let mut core = self.lock_core();

        let Some(position) = core
            .queue
            .iter()
            .position(|entry| same_client(&entry.client, client))
        else {
            tracing::debug!(key = %self.key, "request not on the queue");
            return Err(DriverError::NotFound);
        };

        if let Some(entry) = core.queue.remove(position) {
            if entry.req_id != INVALID_REQUEST_ID {
                core.layers.abort_request(entry.req_id);
            }
        }

        Ok(())
    }

    pub(crate) fn idle_timeout_ms(&self) -> u32 {
        self.lock_core().idle_timeout_ms
    }

    /// Set the idle disconnect timeout, returning the previous value. Takes
    /// effect at the next heartbeat.
    pub(crate) fn set_idle_timeout_ms(&self, timeout_ms: u32) -> DriverResult<u32> {
        if timeout_ms > MAX_IDLE_TIMEOUT_MS {
            return Err(DriverError::OutOfBounds {
                offset: timeout_ms as usize,
                capacity: MAX_IDLE_TIMEOUT_MS as usize,
            });
        }
        let mut core = self.lock_core();
        let previous = core.idle_timeout_ms;
        core.idle_timeout_ms = timeout_ms;
        Ok(previous)
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.lock_core().buf.len()
    }

    /// Grow the frame buffer; requests to shrink are ignored.
    pub(crate) fn set_buffer_size(&self, size: usize) -> DriverResult<()> {
        if size == 0 {
            return Err(DriverError::TooSmall);
        }
        let mut core = self.lock_core();
        if size > core.buf.len() {
            tracing::debug!(key = %self.key, from = core.buf.len(), to = size, "growing buffer");
            core.buf.resize(size, 0);
        }
        Ok(())
    }

    pub(crate) fn set_context(&self, context: Box<dyn Any + Send>) {
        self.lock_core().context = Some(context);
    }

    pub(crate) fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.lock_core().context.take()
    }

    pub(crate) fn with_context<R>(
        &self,
        f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R,
    ) -> R {
        let mut core = self.lock_core();
        f(core.context.as_deref_mut())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock_core().is_connected
    }

    /// Final teardown, run when the last reference is released: stop the
    /// heartbeat, drive the machine toward disconnect, wait out the grace
    /// period, then drop everything the instance still holds.
    pub(crate) fn destroy(plc: &Arc<Plc>) {
        tracing::info!(key = %plc.key, "destroying PLC");

        plc.timer.snooze();

        let mut connected = {
            let mut core = plc.lock_core();
            core.is_terminating = true;
            state::run_locked(plc, &mut core);
            core.is_connected
        };

        if connected {
            tracing::debug!(key = %plc.key, "waiting for disconnect to finish");
            let deadline = plc.clock.now_ms() + DESTROY_DISCONNECT_TIMEOUT_MS;
            let max_polls = (DESTROY_DISCONNECT_TIMEOUT_MS / DESTROY_POLL_INTERVAL_MS as i64) as u32;
            for _ in 0..max_polls {
                connected = plc.lock_core().is_connected;
                if !connected || plc.clock.now_ms() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(DESTROY_POLL_INTERVAL_MS));
            }
            if connected {
                tracing::warn!(key = %plc.key, "disconnect did not finish in time, releasing anyway");
            }
        }

        let mut core = plc.lock_core();
        core.reset();
        if let Some(transport) = core.transport.take() {
            transport.close();
        }
        if !core.queue.is_empty() {
            tracing::warn!(key = %plc.key, abandoned = core.queue.len(), "abandoning queued requests");
            core.queue.clear();
        }
        core.context = None;
    }
}

impl PlcCore {
    /// Close the stream and reset every layer. The transport serializes
    /// `close()` against in-flight completions, so no layer callback fires
    /// against a reset PLC after this returns; a wake that already escaped
    /// is absorbed as a spurious wakeup.
    pub(crate) fn reset(&mut self) {
        if let Some(transport) = &self.transport {
            transport.close();
        }
        if let Err(err) = self.layers.initialize() {
            tracing::warn!(error = %err, "layer reset failed");
        }
        self.is_connected = false;
    }

    pub(crate) fn arm_idle_timeout(&mut self, now: i64) {
        self.next_idle_timeout = now + self.idle_timeout_ms as i64;
    }

    /// A completed request cycle ends the current backoff ramp.
    pub(crate) fn note_successful_cycle(&mut self) {
        self.retry_interval_ms = MIN_RETRY_INTERVAL_MS;
    }
}

//! Collaborator seams the core suspends against: the millisecond clock, the
//! one-shot timer behind the heartbeat, and the completion-callback
//! transport. Tokio-backed implementations live in [`self::tokio`];
//! deterministic doubles implement the same traits in the test suite.

pub mod tokio;

use crate::plc::Plc;
use plcmux_sdk::DriverResult;
use std::sync::{Arc, Weak};

pub use self::tokio::{SystemClock, TokioTimer, TokioTransport, TokioTransportFactory};

/// Millisecond clock all deadlines are computed against.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Completion status of a transport's most recent operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// No operation outstanding.
    Idle,
    /// The operation is still in flight; a wake arriving now is spurious.
    Pending,
    /// The operation completed.
    Ready,
    /// The operation failed; the connection must be torn down.
    Failed,
}

/// Non-blocking byte-stream transport with completion callbacks.
///
/// The core is half-duplex, so at most one operation is outstanding at a
/// time. Implementations fire `wake` from their own context once the
/// operation completes. `close()` cancels the pending completion under the
/// transport's internal lock; a wake that already escaped is absorbed by the
/// core as a spurious wakeup.
pub trait Transport: Send + Sync {
    fn begin_connect(&self, host: &str, port: u16, wake: WakeHandle) -> DriverResult<()>;

    /// Queue `frame` for transmission; the slice is copied before return.
    fn begin_write(&self, frame: &[u8], wake: WakeHandle) -> DriverResult<()>;

    /// Wake once at least one byte has been received.
    fn begin_read(&self, wake: WakeHandle) -> DriverResult<()>;

    fn io_status(&self) -> IoStatus;

    /// Move received bytes into `dst`, returning how many were copied.
    /// Bytes that do not fit stay buffered for the next drain.
    fn drain_received(&self, dst: &mut [u8]) -> usize;

    /// Close the underlying stream, dropping any pending completion. The
    /// transport object stays reusable; the next `begin_connect` opens a
    /// fresh stream.
    fn close(&self);
}

/// Creates the transport for a PLC the first time a connection is needed.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> DriverResult<Arc<dyn Transport>>;
}

/// One-shot wake-up service; the heartbeat re-arms it on every tick.
pub trait Timer: Send + Sync {
    /// Replace any armed wake-up with one at `deadline_ms`.
    fn wake_at(&self, deadline_ms: i64, wake: WakeHandle);

    /// Disarm without destroying the timer.
    fn snooze(&self);
}

/// Re-entry ticket into a PLC's state runner.
///
/// Holds a weak reference: waking a PLC that has since been destroyed finds
/// "gone" and is a no-op, which lets collaborators fire completions without
/// any lifecycle coordination of their own.
#[derive(Clone)]
pub struct WakeHandle {
    target: WakeTarget,
}

#[derive(Clone)]
enum WakeTarget {
    StateMachine(Weak<Plc>),
    Heartbeat(Weak<Plc>),
    /// Free-standing callback, used when a collaborator is driven outside a
    /// PLC (its own tests, mostly).
    Callback(Arc<dyn Fn() + Send + Sync>),
}

impl WakeHandle {
    pub(crate) fn runner(plc: &Arc<Plc>) -> Self {
        Self {
            target: WakeTarget::StateMachine(Arc::downgrade(plc)),
        }
    }

    pub(crate) fn heartbeat(plc: &Arc<Plc>) -> Self {
        Self {
            target: WakeTarget::Heartbeat(Arc::downgrade(plc)),
        }
    }

    /// Wrap an arbitrary callback.
    pub fn from_fn(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            target: WakeTarget::Callback(Arc::new(f)),
        }
    }

    /// Re-enter the owning PLC. Must not be called while the caller holds
    /// any lock the state machine may take.
    pub fn wake(&self) {
        match &self.target {
            WakeTarget::StateMachine(plc) => {
                if let Some(plc) = plc.upgrade() {
                    crate::state::run_state_machine(&plc);
                }
            }
            WakeTarget::Heartbeat(plc) => {
                if let Some(plc) = plc.upgrade() {
                    Plc::heartbeat_tick(&plc);
                }
            }
            WakeTarget::Callback(f) => f(),
        }
    }
}

impl std::fmt::Debug for WakeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.target {
            WakeTarget::StateMachine(_) => "state-machine",
            WakeTarget::Heartbeat(_) => "heartbeat",
            WakeTarget::Callback(_) => "callback",
        };
        f.debug_struct("WakeHandle").field("kind", &kind).finish()
    }
}

//! Tokio-backed collaborators: a monotonic clock, a one-shot timer, and a
//! TCP transport whose worker task turns async I/O completions into
//! [`WakeHandle`] callbacks.

use super::{Clock, IoStatus, Timer, Transport, TransportFactory, WakeHandle};
use bytes::{Buf, BytesMut};
use once_cell::sync::Lazy;
use plcmux_sdk::{DriverError, DriverResult};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic millisecond clock anchored at process start.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        EPOCH.elapsed().as_millis() as i64
    }
}

/// One-shot timer backed by a spawned task; re-arming replaces the pending
/// wake-up.
pub struct TokioTimer {
    handle: Handle,
    pending: Mutex<Option<tokio::task::AbortHandle>>,
}

impl TokioTimer {
    /// Capture the ambient tokio runtime; fails outside one.
    pub fn new() -> DriverResult<Self> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| DriverError::io("no tokio runtime available for timer"))
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            pending: Mutex::new(None),
        }
    }
}

impl Timer for TokioTimer {
    fn wake_at(&self, deadline_ms: i64, wake: WakeHandle) {
        let delay = (deadline_ms - SystemClock.now_ms()).max(0) as u64;
        let task = self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            wake.wake();
        });
        let previous = lock_ignore_poison(&self.pending).replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn snooze(&self) {
        if let Some(pending) = lock_ignore_poison(&self.pending).take() {
            pending.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.snooze();
    }
}

/// TCP transport driven by a worker task.
///
/// The worker owns the stream; callers enqueue one operation at a time over
/// an unbounded channel. Completions update the shared status under the
/// transport lock, then fire the registered wake after the lock is released,
/// so the PLC-lock -> transport-lock order is never inverted. `close()`
/// bumps the generation counter; a completion from a previous generation is
/// discarded without waking anyone.
pub struct TokioTransport {
    shared: Arc<Mutex<Shared>>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

struct Shared {
    status: IoStatus,
    rx: BytesMut,
    wake: Option<WakeHandle>,
    generation: u64,
}

enum Cmd {
    Connect {
        host: String,
        port: u16,
        generation: u64,
    },
    Write {
        frame: Vec<u8>,
        generation: u64,
    },
    Read {
        generation: u64,
    },
    Close,
}

impl TokioTransport {
    /// Spawn the worker on the ambient tokio runtime; fails outside one.
    pub fn new() -> DriverResult<Self> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| DriverError::io("no tokio runtime available for transport"))
    }

    pub fn with_handle(handle: Handle) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            status: IoStatus::Idle,
            rx: BytesMut::new(),
            wake: None,
            generation: 0,
        }));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        handle.spawn(worker(cmd_rx, Arc::clone(&shared)));
        Self { shared, cmd_tx }
    }

    fn begin(&self, make: impl FnOnce(u64) -> Cmd, wake: WakeHandle) -> DriverResult<()> {
        let generation = {
            let mut shared = lock_ignore_poison(&self.shared);
            shared.status = IoStatus::Pending;
            shared.wake = Some(wake);
            shared.generation
        };
        self.cmd_tx
            .send(make(generation))
            .map_err(|_| DriverError::io("transport worker is gone"))
    }
}

impl Transport for TokioTransport {
    fn begin_connect(&self, host: &str, port: u16, wake: WakeHandle) -> DriverResult<()> {
        let host = host.to_string();
        self.begin(
            move |generation| Cmd::Connect {
                host,
                port,
                generation,
            },
            wake,
        )
    }

    fn begin_write(&self, frame: &[u8], wake: WakeHandle) -> DriverResult<()> {
        let frame = frame.to_vec();
        self.begin(move |generation| Cmd::Write { frame, generation }, wake)
    }

    fn begin_read(&self, wake: WakeHandle) -> DriverResult<()> {
        self.begin(|generation| Cmd::Read { generation }, wake)
    }

    fn io_status(&self) -> IoStatus {
        lock_ignore_poison(&self.shared).status
    }

    fn drain_received(&self, dst: &mut [u8]) -> usize {
        let mut shared = lock_ignore_poison(&self.shared);
        let n = dst.len().min(shared.rx.len());
        dst[..n].copy_from_slice(&shared.rx[..n]);
        shared.rx.advance(n);
        n
    }

    fn close(&self) {
        {
            let mut shared = lock_ignore_poison(&self.shared);
            shared.generation += 1;
            shared.status = IoStatus::Idle;
            shared.wake = None;
            shared.rx.clear();
        }
        let _ = self.cmd_tx.send(Cmd::Close);
    }
}

async fn worker(mut cmd_rx: mpsc::UnboundedReceiver<Cmd>, shared: Arc<Mutex<Shared>>) {
    let mut stream: Option<TcpStream> = None;
    // a command that preempted a pending read and still has to run
    let mut carry: Option<Cmd> = None;

    loop {
        let cmd = match carry.take() {
            Some(cmd) => cmd,
            None => match cmd_rx.recv().await {
                Some(cmd) => cmd,
                None => return,
            },
        };

        match cmd {
            Cmd::Connect {
                host,
                port,
                generation,
            } => {
                let result = TcpStream::connect((host.as_str(), port)).await;
                match result {
                    Ok(new_stream) => {
                        stream = Some(new_stream);
                        complete(&shared, generation, IoStatus::Ready);
                    }
                    Err(err) => {
                        tracing::warn!(host = %host, port, error = %err, "TCP connect failed");
                        stream = None;
                        complete(&shared, generation, IoStatus::Failed);
                    }
                }
            }
            Cmd::Write { frame, generation } => {
                let result = match stream.as_mut() {
                    Some(stream) => stream.write_all(&frame).await,
                    None => Err(io::Error::new(io::ErrorKind::NotConnected, "no stream")),
                };
                match result {
                    Ok(()) => complete(&shared, generation, IoStatus::Ready),
                    Err(err) => {
                        tracing::warn!(error = %err, "TCP write failed");
                        complete(&shared, generation, IoStatus::Failed);
                    }
                }
            }
            Cmd::Read { generation } => {
                // a previous read may have left undrained bytes behind
                let buffered = lock_ignore_poison(&shared).rx.has_remaining();
                if buffered {
                    complete(&shared, generation, IoStatus::Ready);
                    continue;
                }
                let Some(open_stream) = stream.as_mut() else {
                    complete(
                        &shared,
                        generation,
                        IoStatus::Failed,
                    );
                    continue;
                };
                let mut chunk = [0u8; 4096];
                // let a close (and the reconnect behind it) preempt a read
                // that would otherwise block the command loop indefinitely
                let preempted = tokio::select! {
                    result = open_stream.read(&mut chunk) => {
                        match result {
                            Ok(0) => {
                                tracing::debug!("peer closed the connection");
                                complete(&shared, generation, IoStatus::Failed);
                            }
                            Ok(n) => {
                                lock_ignore_poison(&shared).rx.extend_from_slice(&chunk[..n]);
                                complete(&shared, generation, IoStatus::Ready);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "TCP read failed");
                                complete(&shared, generation, IoStatus::Failed);
                            }
                        }
                        None
                    }
                    next = cmd_rx.recv() => Some(next),
                };
                match preempted {
                    None => {}
                    Some(None) => return,
                    Some(Some(Cmd::Close)) => stream = None,
                    // half-duplex: anything else follows a close that already
                    // invalidated this read's generation
                    Some(Some(other)) => carry = Some(other),
                }
            }
            Cmd::Close => {
                stream = None;
            }
        }
    }
}

fn complete(shared: &Mutex<Shared>, generation: u64, status: IoStatus) {
    let wake = {
        let mut shared = lock_ignore_poison(shared);
        if shared.generation != generation {
            // closed while the operation was in flight
            return;
        }
        shared.status = status;
        shared.wake.take()
    };
    if let Some(wake) = wake {
        wake.wake();
    }
}

/// Default factory handed to PLCs that were not given one by their family
/// constructor.
pub struct TokioTransportFactory {
    handle: Handle,
}

impl TokioTransportFactory {
    pub fn new() -> DriverResult<Self> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| DriverError::io("no tokio runtime available for transport factory"))
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl TransportFactory for TokioTransportFactory {
    fn create(&self) -> DriverResult<Arc<dyn Transport>> {
        Ok(Arc::new(TokioTransport::with_handle(self.handle.clone())))
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

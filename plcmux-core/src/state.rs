//! The connection state machine: one dispatcher feeding three tracks
//! (request, connect, disconnect) plus the terminal sink. Every state either
//! makes progress immediately or registers a wake with a collaborator and
//! suspends; all re-entry points funnel through [`run_state_machine`] under
//! the PLC lock.

use crate::options::MAX_RETRY_INTERVAL_MS;
use crate::plc::{Plc, PlcCore};
use crate::runtime::{IoStatus, Transport, WakeHandle};
use plcmux_sdk::{
    DriverError, DriverResult, FrameWindow, LayerFlow, RecvFlow, RequestId, INVALID_REQUEST_ID,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlcState {
    DispatchRequests,
    ReserveRequestSpace,
    BuildRequest,
    RequestSent,
    ResponseReady,
    StartConnect,
    BuildConnectRequest,
    ConnectRequestSent,
    ConnectResponseReady,
    StartDisconnect,
    BuildDisconnectRequest,
    DisconnectRequestSent,
    DisconnectResponseReady,
    Terminate,
}

/// What a state function tells the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// A wake is registered (or there is nothing to do); stop running.
    Suspend,
    /// Re-enter the next state immediately.
    Continue,
}

/// Entry point for socket completions, timer ticks, and client calls.
pub(crate) fn run_state_machine(plc: &Arc<Plc>) {
    let mut core = plc.lock_core();
    run_locked(plc, &mut core);
}

/// Advance the machine until a state suspends. Callers already hold the
/// PLC lock.
pub(crate) fn run_locked(plc: &Arc<Plc>, core: &mut PlcCore) {
    loop {
        debug_assert!(
            core.payload_start <= core.payload_end && core.payload_end <= core.buf.len(),
            "payload cursors out of order"
        );
        tracing::trace!(key = %plc.key(), state = ?core.state, "entering state");
        let flow = match core.state {
            PlcState::DispatchRequests => state_dispatch_requests(plc, core),
            PlcState::ReserveRequestSpace => state_reserve_request_space(plc, core),
            PlcState::BuildRequest => state_build_request(plc, core),
            PlcState::RequestSent => state_request_sent(plc, core),
            PlcState::ResponseReady => state_response_ready(plc, core),
            PlcState::StartConnect => state_start_connect(plc, core),
            PlcState::BuildConnectRequest => state_build_connect_request(plc, core),
            PlcState::ConnectRequestSent => state_connect_request_sent(plc, core),
            PlcState::ConnectResponseReady => state_connect_response_ready(plc, core),
            PlcState::StartDisconnect => state_start_disconnect(plc, core),
            PlcState::BuildDisconnectRequest => state_build_disconnect_request(plc, core),
            PlcState::DisconnectRequestSent => state_disconnect_request_sent(plc, core),
            PlcState::DisconnectResponseReady => state_disconnect_response_ready(plc, core),
            PlcState::Terminate => Flow::Suspend,
        };
        if flow == Flow::Suspend {
            break;
        }
    }
}

/// Schedule the next attempt: wait out the current interval, then double it
/// up to the ceiling. A completed request cycle resets the ramp.
fn schedule_retry(plc: &Arc<Plc>, core: &mut PlcCore) {
    let now = plc.clock().now_ms();
    core.next_retry_time = now + core.retry_interval_ms;
    tracing::warn!(key = %plc.key(), retry_in_ms = core.retry_interval_ms, "scheduling retry");
    core.retry_interval_ms = (core.retry_interval_ms * 2).min(MAX_RETRY_INTERVAL_MS);
}

/// Transient failure on the connect or request track: back off, then tear
/// the connection down through the disconnect track.
fn disconnect_on_error(plc: &Arc<Plc>, core: &mut PlcCore, err: DriverError) -> Flow {
    tracing::warn!(key = %plc.key(), error = %err, "error, disconnecting");
    schedule_retry(plc, core);
    core.state = PlcState::StartDisconnect;
    Flow::Continue
}

/// Failure while already recovering: hard reset, back off, and let the next
/// heartbeat re-dispatch.
fn reset_on_error(plc: &Arc<Plc>, core: &mut PlcCore, err: DriverError) -> Flow {
    tracing::warn!(key = %plc.key(), error = %err, "error during recovery, resetting");
    core.reset();
    schedule_retry(plc, core);
    core.state = PlcState::DispatchRequests;
    Flow::Suspend
}

fn transport_of(core: &PlcCore) -> DriverResult<Arc<dyn Transport>> {
    core.transport
        .clone()
        .ok_or_else(|| DriverError::io("no transport"))
}

/// Check the most recent I/O completion. `Ok(true)` means the wake was
/// spurious and the state should keep waiting.
fn io_was_spurious(transport: &Arc<dyn Transport>) -> DriverResult<bool> {
    match transport.io_status() {
        IoStatus::Pending => Ok(true),
        IoStatus::Failed => Err(DriverError::io("transport operation failed")),
        IoStatus::Idle | IoStatus::Ready => Ok(false),
    }
}

/// Pull newly received bytes into the tail of the frame buffer.
fn drain_into_buffer(core: &mut PlcCore, transport: &Arc<dyn Transport>) {
    let filled = core.payload_end;
    let n = transport.drain_received(&mut core.buf[filled..]);
    core.payload_end = filled + n;
    tracing::trace!(received = n, total = core.payload_end, "drained received bytes");
}

fn state_dispatch_requests(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    let now = plc.clock().now_ms();

    if core.is_terminating {
        if core.is_connected {
            tracing::info!(key = %plc.key(), "terminating, starting disconnect");
            core.state = PlcState::StartDisconnect;
            return Flow::Continue;
        }
        core.state = PlcState::Terminate;
        return Flow::Suspend;
    }

    if core.is_connected && core.next_idle_timeout < now {
        tracing::info!(key = %plc.key(), "idle timeout, starting disconnect");
        core.state = PlcState::StartDisconnect;
        return Flow::Continue;
    }

    if core.next_retry_time > now {
        tracing::trace!(key = %plc.key(), "waiting out retry backoff");
        return Flow::Suspend;
    }

    if !core.queue.is_empty() {
        core.state = if core.is_connected {
            PlcState::ReserveRequestSpace
        } else {
            PlcState::StartConnect
        };
        return Flow::Continue;
    }

    // nothing to do; wait for the next heartbeat or client call
    Flow::Suspend
}

/* ---- connect track ---- */

fn state_start_connect(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    if core.is_terminating {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    if core.next_retry_time > plc.clock().now_ms() {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    if core.is_connected {
        tracing::info!(key = %plc.key(), "already connected");
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }

    let transport = match core.transport.clone() {
        Some(transport) => transport,
        None => match plc.transport_factory().create() {
            Ok(transport) => {
                core.transport = Some(Arc::clone(&transport));
                transport
            }
            Err(err) => return reset_on_error(plc, core, err),
        },
    };

    if let Err(err) = core.layers.initialize() {
        return disconnect_on_error(plc, core, err);
    }

    core.state = PlcState::BuildConnectRequest;
    if let Err(err) = transport.begin_connect(plc.host(), plc.port(), WakeHandle::runner(plc)) {
        return disconnect_on_error(plc, core, err);
    }
    Flow::Suspend
}

fn state_build_connect_request(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    if core.is_terminating {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return reset_on_error(plc, core, err),
    };
    match io_was_spurious(&transport) {
        Ok(true) => {
            tracing::trace!(key = %plc.key(), "spurious wakeup, connect still pending");
            return Flow::Suspend;
        }
        Ok(false) => {}
        Err(err) => return disconnect_on_error(plc, core, err),
    }

    core.payload_start = 0;
    core.payload_end = 0;

    let mut req_id = core.current_request_id;
    let outcome: DriverResult<Option<(usize, usize)>> = {
        let PlcCore { buf, layers, .. } = core;
        let mut win = FrameWindow::new(buf, 0, 0);
        (|| match layers.connect(&mut win)? {
            LayerFlow::Complete => Ok(None),
            LayerFlow::Pending => {
                layers.build_layer(&mut win, &mut req_id)?;
                Ok(Some((win.start, win.end)))
            }
        })()
    };
    core.current_request_id = req_id;

    match outcome {
        Err(err) => disconnect_on_error(plc, core, err),
        Ok(None) => {
            tracing::info!(key = %plc.key(), "all layers connected");
            core.is_connected = true;
            core.arm_idle_timeout(plc.clock().now_ms());
            core.state = PlcState::DispatchRequests;
            Flow::Continue
        }
        Ok(Some((start, end))) => {
            core.payload_start = start;
            core.payload_end = end;
            core.state = PlcState::ConnectRequestSent;
            if let Err(err) = transport.begin_write(&core.buf[..end], WakeHandle::runner(plc)) {
                return disconnect_on_error(plc, core, err);
            }
            Flow::Suspend
        }
    }
}

fn state_connect_request_sent(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    if core.is_terminating {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return reset_on_error(plc, core, err),
    };
    match io_was_spurious(&transport) {
        Ok(true) => return Flow::Suspend,
        Ok(false) => {}
        Err(err) => return disconnect_on_error(plc, core, err),
    }

    core.payload_start = 0;
    core.payload_end = 0;
    core.state = PlcState::ConnectResponseReady;
    if let Err(err) = transport.begin_read(WakeHandle::runner(plc)) {
        return disconnect_on_error(plc, core, err);
    }
    Flow::Suspend
}

fn state_connect_response_ready(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    if core.is_terminating {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return reset_on_error(plc, core, err),
    };
    match io_was_spurious(&transport) {
        Ok(true) => return Flow::Suspend,
        Ok(false) => {}
        Err(err) => return disconnect_on_error(plc, core, err),
    }

    drain_into_buffer(core, &transport);

    let mut req_id = core.current_request_id;
    let flow = {
        let payload_end = core.payload_end;
        let PlcCore { buf, layers, .. } = core;
        let mut win = FrameWindow::new(buf, 0, payload_end);
        layers.process_response(&mut win, &mut req_id)
    };
    core.current_request_id = req_id;

    match flow {
        Err(err) => disconnect_on_error(plc, core, err),
        Ok(RecvFlow::Partial) => {
            if core.payload_end == core.buf.len() {
                return disconnect_on_error(plc, core, DriverError::io("frame exceeds buffer"));
            }
            tracing::debug!(key = %plc.key(), "partial connect response, reading more");
            if let Err(err) = transport.begin_read(WakeHandle::runner(plc)) {
                return disconnect_on_error(plc, core, err);
            }
            Flow::Suspend
        }
        Ok(RecvFlow::Retry) => {
            tracing::info!(key = %plc.key(), "connect handshake needs another exchange");
            core.state = PlcState::BuildConnectRequest;
            Flow::Continue
        }
        // re-enter the build state: its connect pass either reports
        // all-connected or emits the next layer's handshake bytes
        Ok(RecvFlow::Complete) | Ok(RecvFlow::Pending) => {
            core.state = PlcState::BuildConnectRequest;
            Flow::Continue
        }
    }
}

/* ---- request track ---- */

fn state_reserve_request_space(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    let outcome = {
        let PlcCore { buf, layers, .. } = core;
        let mut win = FrameWindow::new(buf, 0, 0);
        layers.reserve_space(&mut win).map(|id| (id, win.start, win.end))
    };
    match outcome {
        Err(err) => disconnect_on_error(plc, core, err),
        Ok((req_id, start, end)) => {
            core.payload_start = start;
            core.payload_end = end;
            core.current_request_id = req_id;
            core.state = PlcState::BuildRequest;
            Flow::Continue
        }
    }
}

fn state_build_request(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    if core.is_terminating {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    if core.queue.is_empty() {
        tracing::info!(key = %plc.key(), "request removed from the queue before build");
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }

    let mut req_id = core.current_request_id;
    let mut packed = 0usize;
    let (outcome, end) = {
        let (p_start, p_end) = (core.payload_start, core.payload_end);
        let PlcCore {
            buf, layers, queue, ..
        } = core;
        let mut win = FrameWindow::new(buf, p_start, p_end);
        let mut old_end = win.end;
        let mut first_try = true;
        let mut index = 0usize;

        let outcome: DriverResult<()> = loop {
            let Some(client) = queue.get(index).map(|entry| Arc::clone(&entry.client)) else {
                // the tail of the queue vanished mid-batch
                win.end = old_end;
                break Ok(());
            };

            tracing::debug!(req_id, "building request");
            match client.build_request(&mut win, req_id) {
                Err(DriverError::TooSmall) if first_try => {
                    // a single request does not fit in the whole frame
                    break Err(DriverError::TooSmall);
                }
                Err(DriverError::TooSmall) => {
                    tracing::debug!(req_id, "frame full, stopping batching");
                    win.end = old_end;
                    break Ok(());
                }
                Err(err) => break Err(err),
                Ok(()) => {
                    old_end = win.end;
                    if let Some(entry) = queue.get_mut(index) {
                        entry.req_id = req_id;
                    }
                    packed += 1;
                }
            }
            first_try = false;

            match layers.build_layer(&mut win, &mut req_id) {
                Err(err) => break Err(err),
                Ok(LayerFlow::Complete) => {
                    tracing::debug!("layers report the frame full");
                    break Ok(());
                }
                Ok(LayerFlow::Pending) => {
                    index += 1;
                    if index >= queue.len() {
                        // ran out of requests; drop any space the layers
                        // pre-reserved for a next record
                        win.end = old_end;
                        break Ok(());
                    }
                }
            }
        };
        (outcome, win.end)
    };
    core.payload_end = end;

    if let Err(err) = outcome {
        return disconnect_on_error(plc, core, err);
    }

    // last check before committing the frame to the wire
    if core.is_terminating {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }

    let packed_ids: Vec<RequestId> = core
        .queue
        .iter()
        .take(packed)
        .map(|entry| entry.req_id)
        .collect();
    if let Err(err) = core.layers.accept_requests(&packed_ids) {
        return disconnect_on_error(plc, core, err);
    }

    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return disconnect_on_error(plc, core, err),
    };
    core.state = PlcState::RequestSent;
    tracing::debug!(key = %plc.key(), bytes = core.payload_end, requests = packed, "sending frame");
    if let Err(err) = transport.begin_write(&core.buf[..core.payload_end], WakeHandle::runner(plc))
    {
        return disconnect_on_error(plc, core, err);
    }
    Flow::Suspend
}

fn state_request_sent(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return disconnect_on_error(plc, core, err),
    };
    match io_was_spurious(&transport) {
        Ok(true) => {
            tracing::trace!(key = %plc.key(), "spurious wakeup, write still pending");
            return Flow::Suspend;
        }
        Ok(false) => {}
        Err(err) => return disconnect_on_error(plc, core, err),
    }

    // the frame is on the wire; let the layers set up their receive state
    // (the id minted here is discarded)
    let outcome = {
        let PlcCore { buf, layers, .. } = core;
        let mut win = FrameWindow::new(buf, 0, 0);
        layers.reserve_space(&mut win)
    };
    if let Err(err) = outcome {
        return disconnect_on_error(plc, core, err);
    }

    core.payload_start = 0;
    core.payload_end = 0;
    core.state = PlcState::ResponseReady;
    if let Err(err) = transport.begin_read(WakeHandle::runner(plc)) {
        return disconnect_on_error(plc, core, err);
    }
    Flow::Suspend
}

fn state_response_ready(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    if core.is_terminating {
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return disconnect_on_error(plc, core, err),
    };
    match io_was_spurious(&transport) {
        Ok(true) => {
            tracing::trace!(key = %plc.key(), "spurious wakeup, read still pending");
            return Flow::Suspend;
        }
        Ok(false) => {}
        Err(err) => return disconnect_on_error(plc, core, err),
    }

    drain_into_buffer(core, &transport);

    // one pass per sub-frame: the stack keeps returning Pending while the
    // received frame carries responses for more batched requests
    loop {
        let mut req_id = INVALID_REQUEST_ID;
        let flow = {
            let payload_end = core.payload_end;
            let PlcCore {
                buf, layers, queue, ..
            } = core;
            let mut win = FrameWindow::new(buf, 0, payload_end);

            match layers.process_response(&mut win, &mut req_id) {
                Err(err) => Err(err),
                Ok(RecvFlow::Partial) => Ok(RecvFlow::Partial),
                Ok(RecvFlow::Retry) => Err(DriverError::io("unexpected handshake retry")),
                Ok(flow) => {
                    // match against the head of the queue; anything else is a
                    // response for an abandoned request
                    let matched = queue
                        .front()
                        .is_some_and(|head| head.req_id == req_id);
                    if matched {
                        match queue.pop_front() {
                            Some(entry) => {
                                tracing::debug!(req_id, "delivering response");
                                entry
                                    .client
                                    .process_response(&mut win, req_id)
                                    .map(|()| flow)
                            }
                            None => Ok(flow),
                        }
                    } else {
                        tracing::info!(req_id, "dropping response for aborted request");
                        Ok(flow)
                    }
                }
            }
        };

        match flow {
            Err(err) => return disconnect_on_error(plc, core, err),
            Ok(RecvFlow::Partial) => {
                if core.payload_end == core.buf.len() {
                    return disconnect_on_error(plc, core, DriverError::io("frame exceeds buffer"));
                }
                tracing::debug!(key = %plc.key(), "partial response, reading more");
                if let Err(err) = transport.begin_read(WakeHandle::runner(plc)) {
                    return disconnect_on_error(plc, core, err);
                }
                return Flow::Suspend;
            }
            Ok(RecvFlow::Pending) => continue,
            Ok(_) => {
                let now = plc.clock().now_ms();
                core.arm_idle_timeout(now);
                core.note_successful_cycle();
                core.state = PlcState::DispatchRequests;
                return Flow::Continue;
            }
        }
    }
}

/* ---- disconnect track ---- */

fn state_start_disconnect(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    if !core.is_connected {
        tracing::debug!(key = %plc.key(), "already disconnected");
        core.state = PlcState::DispatchRequests;
        return Flow::Continue;
    }
    core.payload_start = 0;
    core.payload_end = 0;
    core.state = PlcState::BuildDisconnectRequest;
    Flow::Continue
}

fn state_build_disconnect_request(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    let mut req_id = INVALID_REQUEST_ID;
    let outcome: DriverResult<Option<(usize, usize)>> = {
        let PlcCore { buf, layers, .. } = core;
        let mut win = FrameWindow::new(buf, 0, 0);
        (|| match layers.disconnect(&mut win)? {
            LayerFlow::Complete => Ok(None),
            LayerFlow::Pending => {
                layers.build_layer(&mut win, &mut req_id)?;
                Ok(Some((win.start, win.end)))
            }
        })()
    };

    match outcome {
        Err(err) => reset_on_error(plc, core, err),
        Ok(None) => {
            tracing::info!(key = %plc.key(), "disconnect complete");
            core.is_connected = false;
            core.state = PlcState::DispatchRequests;
            Flow::Continue
        }
        Ok(Some((start, end))) => {
            core.payload_start = start;
            core.payload_end = end;
            let transport = match transport_of(core) {
                Ok(transport) => transport,
                Err(err) => return reset_on_error(plc, core, err),
            };
            core.state = PlcState::DisconnectRequestSent;
            if let Err(err) = transport.begin_write(&core.buf[..end], WakeHandle::runner(plc)) {
                return reset_on_error(plc, core, err);
            }
            Flow::Suspend
        }
    }
}

fn state_disconnect_request_sent(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return reset_on_error(plc, core, err),
    };
    match io_was_spurious(&transport) {
        Ok(true) => return Flow::Suspend,
        Ok(false) => {}
        Err(err) => return reset_on_error(plc, core, err),
    }

    core.payload_start = 0;
    core.payload_end = 0;
    core.state = PlcState::DisconnectResponseReady;
    if let Err(err) = transport.begin_read(WakeHandle::runner(plc)) {
        return reset_on_error(plc, core, err);
    }
    Flow::Suspend
}

fn state_disconnect_response_ready(plc: &Arc<Plc>, core: &mut PlcCore) -> Flow {
    let transport = match transport_of(core) {
        Ok(transport) => transport,
        Err(err) => return reset_on_error(plc, core, err),
    };
    match io_was_spurious(&transport) {
        Ok(true) => return Flow::Suspend,
        Ok(false) => {}
        Err(err) => return reset_on_error(plc, core, err),
    }

    drain_into_buffer(core, &transport);

    let mut req_id = INVALID_REQUEST_ID;
    let flow = {
        let payload_end = core.payload_end;
        let PlcCore { buf, layers, .. } = core;
        let mut win = FrameWindow::new(buf, 0, payload_end);
        layers.process_response(&mut win, &mut req_id)
    };

    match flow {
        Err(err) => reset_on_error(plc, core, err),
        Ok(RecvFlow::Partial) => {
            if core.payload_end == core.buf.len() {
                return reset_on_error(plc, core, DriverError::io("frame exceeds buffer"));
            }
            if let Err(err) = transport.begin_read(WakeHandle::runner(plc)) {
                return reset_on_error(plc, core, err);
            }
            Flow::Suspend
        }
        Ok(RecvFlow::Pending) => {
            tracing::info!(key = %plc.key(), "more layers require disconnect");
            core.state = PlcState::BuildDisconnectRequest;
            Flow::Continue
        }
        Ok(RecvFlow::Retry) => reset_on_error(
            plc,
            core,
            DriverError::io("unexpected retry in disconnect response"),
        ),
        Ok(RecvFlow::Complete) => {
            tracing::info!(key = %plc.key(), "disconnect complete");
            core.is_connected = false;
            core.state = PlcState::DispatchRequests;
            Flow::Continue
        }
    }
}

use crate::{DriverResult, RequestId};

/// Outcome of a connect, disconnect, or frame-build pass over a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFlow {
    /// The operation finished: the layer reports connected/disconnected, or
    /// the frame is sealed and must go out as-is.
    Complete,
    /// More to do: handshake bytes were produced and must be sent, or the
    /// frame still has room for another batched request.
    Pending,
}

/// Outcome of a receive pass over a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvFlow {
    /// The frame (or the last sub-frame) was fully consumed.
    Complete,
    /// The frame is incomplete on the wire; read more bytes and call again.
    Partial,
    /// Redo the current handshake step, e.g. a session registration that is
    /// followed by a forward-open exchange.
    Retry,
    /// A sub-frame was produced and more remain in the same received frame;
    /// call again.
    Pending,
}

/// Mutable view of the shared frame buffer handed through the layer chain.
///
/// `start..end` brackets the bytes the current operation owns. Both cursors
/// stay within `buf.len()`; the core asserts `start <= end <= capacity` at
/// every state entry.
#[derive(Debug)]
pub struct FrameWindow<'a> {
    pub buf: &'a mut [u8],
    pub start: usize,
    pub end: usize,
}

impl<'a> FrameWindow<'a> {
    pub fn new(buf: &'a mut [u8], start: usize, end: usize) -> Self {
        debug_assert!(start <= end && end <= buf.len());
        Self { buf, start, end }
    }

    /// Capacity of the backing buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently bracketed by the window.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One stratum of the on-wire protocol stack.
///
/// Layers form an ordered chain owned by the core; index 0 is the outermost
/// (link-level) wrapper and the last layer is the application protocol. The
/// core drives every operation top-down and a layer only ever sees its own
/// context, so implementations hold no reference back to the connection.
///
/// Window discipline: during the outbound path each layer consumes prefix
/// space for its headers and hands the inner window onward; during the
/// inbound path each layer strips its framing and narrows the window to the
/// inner payload. A layer that is already connected still reserves its
/// framing space inside [`Layer::connect`]/[`Layer::disconnect`] before
/// returning [`LayerFlow::Complete`], so inner layers build within the right
/// window and [`Layer::build_layer`] can later fill the skipped region.
pub trait Layer: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Reset per-connection state.
    fn initialize(&mut self) -> DriverResult<()>;

    /// Emit the next connect-handshake frame into the window, mutating the
    /// window to the bytes written. [`LayerFlow::Complete`] means this layer
    /// is connected and produced nothing to send.
    fn connect(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<LayerFlow>;

    /// Symmetric to [`Layer::connect`].
    fn disconnect(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<LayerFlow>;

    /// Shrink the window past this layer's headers and trailers; on return
    /// from the whole chain `start == end` sits at the first payload byte.
    /// The innermost layer mints and returns a fresh request id.
    fn reserve_space(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<Option<RequestId>>;

    /// Batching hook: the ids packed into the frame that is about to be
    /// sent.
    fn accept_requests(&mut self, _req_ids: &[RequestId]) -> DriverResult<()> {
        Ok(())
    }

    /// Forget a request this layer may have tracked.
    fn abort_request(&mut self, _req_id: RequestId) {}

    /// Fill in this layer's headers and trailers now that the inner content
    /// is known. [`LayerFlow::Pending`] invites another batched request;
    /// [`LayerFlow::Complete`] seals the frame. `req_id` carries the id of
    /// the request just built and must be updated to the id the next batched
    /// request will use.
    fn build_layer(
        &mut self,
        win: &mut FrameWindow<'_>,
        req_id: &mut RequestId,
    ) -> DriverResult<LayerFlow>;

    /// Strip this layer's framing from received bytes, narrow the window to
    /// the inner payload, and emit the matched request id. While this
    /// returns [`RecvFlow::Pending`] the core calls again with the full
    /// received frame to demux the next sub-frame.
    fn process_response(
        &mut self,
        win: &mut FrameWindow<'_>,
        req_id: &mut RequestId,
    ) -> DriverResult<RecvFlow>;
}

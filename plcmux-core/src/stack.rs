use plcmux_sdk::{DriverResult, FrameWindow, Layer, LayerFlow, RecvFlow, RequestId};

/// Ordered protocol layer chain; index 0 is the outermost (link-level)
/// wrapper, the last layer is the application protocol. The stack drives
/// every capability top-down so individual layers never hold a reference to
/// their neighbors.
pub(crate) struct LayerStack {
    layers: Vec<Box<dyn Layer>>,
    /// Minting fallback for stacks whose innermost layer does not issue ids.
    fallback_request_id: RequestId,
}

impl LayerStack {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            layers,
            fallback_request_id: 0,
        }
    }

    /// Reset per-connection state in every layer.
    pub fn initialize(&mut self) -> DriverResult<()> {
        for layer in &mut self.layers {
            layer.initialize()?;
        }
        Ok(())
    }

    /// One connect pass. `Complete` means every layer reports connected;
    /// `Pending` means some layer produced handshake bytes to send.
    pub fn connect(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<LayerFlow> {
        for layer in &mut self.layers {
            if layer.connect(win)? == LayerFlow::Pending {
                tracing::debug!(layer = layer.name(), "layer has connect bytes to send");
                return Ok(LayerFlow::Pending);
            }
        }
        Ok(LayerFlow::Complete)
    }

    /// One disconnect pass, symmetric to [`LayerStack::connect`].
    pub fn disconnect(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<LayerFlow> {
        for layer in &mut self.layers {
            if layer.disconnect(win)? == LayerFlow::Pending {
                tracing::debug!(layer = layer.name(), "layer has disconnect bytes to send");
                return Ok(LayerFlow::Pending);
            }
        }
        Ok(LayerFlow::Complete)
    }

    /// Shrink the window past every layer's framing and mint the request id.
    /// The innermost layer's id wins; the stack-local counter covers stacks
    /// that never mint.
    pub fn reserve_space(&mut self, win: &mut FrameWindow<'_>) -> DriverResult<RequestId> {
        let mut minted = None;
        for layer in &mut self.layers {
            if let Some(req_id) = layer.reserve_space(win)? {
                minted = Some(req_id);
            }
        }
        Ok(match minted {
            Some(req_id) => req_id,
            None => {
                self.fallback_request_id += 1;
                self.fallback_request_id
            }
        })
    }

    pub fn accept_requests(&mut self, req_ids: &[RequestId]) -> DriverResult<()> {
        for layer in &mut self.layers {
            layer.accept_requests(req_ids)?;
        }
        Ok(())
    }

    pub fn abort_request(&mut self, req_id: RequestId) {
        for layer in &mut self.layers {
            layer.abort_request(req_id);
        }
    }

    /// Fill in headers/trailers around the payload. Any layer sealing the
    /// frame outranks further batching.
    pub fn build_layer(
        &mut self,
        win: &mut FrameWindow<'_>,
        req_id: &mut RequestId,
    ) -> DriverResult<LayerFlow> {
        let mut flow = LayerFlow::Pending;
        for layer in &mut self.layers {
            if layer.build_layer(win, req_id)? == LayerFlow::Complete {
                flow = LayerFlow::Complete;
            }
        }
        Ok(flow)
    }

    /// Strip framing top-down. `Partial`/`Retry` from any layer stops the
    /// pass; `Pending` from any layer marks more sub-frames in the same
    /// received frame.
    pub fn process_response(
        &mut self,
        win: &mut FrameWindow<'_>,
        req_id: &mut RequestId,
    ) -> DriverResult<RecvFlow> {
        let mut more = false;
        for layer in &mut self.layers {
            match layer.process_response(win, req_id)? {
                RecvFlow::Complete => {}
                RecvFlow::Pending => more = true,
                RecvFlow::Partial => return Ok(RecvFlow::Partial),
                RecvFlow::Retry => return Ok(RecvFlow::Retry),
            }
        }
        Ok(if more {
            RecvFlow::Pending
        } else {
            RecvFlow::Complete
        })
    }
}

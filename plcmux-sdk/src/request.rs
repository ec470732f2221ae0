use crate::{DriverResult, FrameWindow};

/// Token minted by the innermost protocol layer when space is reserved for a
/// request, and echoed by the matching response. Opaque to the core, which
/// uses it only to pair responses with queued requests.
pub type RequestId = i64;

/// A request that has not been assigned an id yet.
pub const INVALID_REQUEST_ID: RequestId = -1;

/// One queued tag operation: the client context together with its two buffer
/// callbacks.
///
/// `build_request` writes the application payload into the reserved window,
/// advancing `win.end` past the bytes produced. Returning
/// [`DriverError::TooSmall`](crate::DriverError::TooSmall) tells the core the
/// remaining space cannot hold this request; when the frame already carries
/// other requests the core stops batching and sends what it has, otherwise
/// the connection is torn down.
///
/// `process_response` receives the matched response payload bracketed by
/// `win.start..win.end`. An error returned from it is treated as a protocol
/// failure and disconnects.
pub trait RequestClient: Send + Sync {
    fn build_request(&self, win: &mut FrameWindow<'_>, req_id: RequestId) -> DriverResult<()>;
    fn process_response(&self, win: &mut FrameWindow<'_>, req_id: RequestId) -> DriverResult<()>;
}

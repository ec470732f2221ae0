//! Shared contract between the plcmux connection core, the protocol-family
//! layer implementations, and the tag layer sitting above them.
//!
//! The core treats every protocol stratum as an opaque [`Layer`] and every
//! queued tag operation as an opaque [`RequestClient`]; this crate defines
//! those seams plus the closed error set and the little-endian wire cursor
//! that layer implementations size and encode their framing with.

mod error;
mod layer;
mod request;
mod wire;

/// Unified result type across the core and all layer implementations.
pub type DriverResult<T> = Result<T, DriverError>;

pub use error::DriverError;
pub use layer::{FrameWindow, Layer, LayerFlow, RecvFlow};
pub use request::{RequestClient, RequestId, INVALID_REQUEST_ID};
pub use wire::WireCursor;

//! Per-gateway PLC connection core.
//!
//! Many tag-level clients multiplex their read/write requests onto a single
//! stateful byte-stream connection per controller. The core interns one
//! [`PlcHandle`] per `family/gateway/path`, queues client requests, and
//! drives a cooperative state machine through connect, request packing
//! (batching several requests into one frame when the layer stack permits),
//! send, receive, demux, idle disconnect, and exponential retry.
//!
//! Protocol knowledge lives entirely in the pluggable
//! [`Layer`](plcmux_sdk::Layer) chain assembled by a family-specific
//! constructor; the core owns only the orchestration.

mod options;
mod plc;
mod registry;
pub mod runtime;
mod stack;
mod state;

pub use options::PlcOptions;
pub use registry::{get, module_init, module_teardown, PlcConfigurator, PlcHandle};

// the sdk seam types, re-exported so layer and tag crates need one import
pub use plcmux_sdk::{
    DriverError, DriverResult, FrameWindow, Layer, LayerFlow, RecvFlow, RequestClient, RequestId,
    WireCursor, INVALID_REQUEST_ID,
};

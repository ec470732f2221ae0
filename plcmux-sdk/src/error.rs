use std::io;
use thiserror::Error as ThisError;

/// Closed error set shared by the connection core and every layer
/// implementation.
///
/// Layer and client callbacks may signal only these codes. Flow outcomes
/// that are not failures (pending bytes, partial frames, handshake retries)
/// are expressed through `LayerFlow`/`RecvFlow` instead.
#[derive(Debug, ThisError)]
pub enum DriverError {
    /// Gateway string missing, unparseable, or carrying an illegal port.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// An offset or value ran past the allowed bound.
    #[error("out of bounds: offset {offset}, capacity {capacity}")]
    OutOfBounds { offset: usize, capacity: usize },

    /// Not enough space left in the frame for the payload being built.
    #[error("insufficient space in frame")]
    TooSmall,

    /// The request is already queued on this PLC.
    #[error("request is already queued")]
    Busy,

    /// The request is not on this PLC's queue.
    #[error("request not found")]
    NotFound,

    /// Transport-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Shorthand for transport failures that do not originate in a
    /// `std::io` call.
    pub fn io(context: &'static str) -> Self {
        DriverError::Io(io::Error::new(io::ErrorKind::Other, context))
    }
}

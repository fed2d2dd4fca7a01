//! Wire-level error type shared by framing and message conversion.

use thiserror::Error;

/// Failures while framing or decoding wire traffic.
///
/// These never carry application semantics; the tracker maps them to its
/// own `Corrupted`/`Transient` kinds at the transport boundary.
#[derive(Debug, Error)]
pub enum WireError {
    /// A frame announced a payload larger than the negotiated cap.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Payload bytes did not decode as the expected message.
    #[error("decode: {0}")]
    Decode(String),

    /// Underlying socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn decode(msg: impl Into<String>) -> Self {
        WireError::Decode(msg.into())
    }
}

impl From<prost::DecodeError> for WireError {
    fn from(e: prost::DecodeError) -> Self {
        WireError::Decode(e.to_string())
    }
}

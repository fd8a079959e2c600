//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Incomplete packet (need more data)
    #[error("incomplete packet")]
    Incomplete,

    /// Unknown property byte
    #[error("unknown property {0}")]
    Property(u8),

    /// Unknown delivery method byte
    #[error("unknown delivery method {0}")]
    Delivery(u8),

    /// Unknown message kind byte
    #[error("unknown message kind {0}")]
    MessageKind(u8),

    /// Payload exceeds the configured limit
    #[error("payload too large: {0}")]
    PayloadSize(usize),

    /// Declared length does not match the packet bytes
    #[error("malformed packet")]
    Malformed,

    /// Read past the end of a message
    #[error("message underrun at offset {0}")]
    Underrun(usize),

    /// Unknown address family in an encoded endpoint
    #[error("unknown address family {0}")]
    AddressFamily(u8),
}

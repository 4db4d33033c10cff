//! Error types for the tuner control protocol.

use thiserror::Error;

/// Protocol-level errors that can occur while framing control packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet type is unknown or unsupported.
    #[error("Unknown packet type: 0x{0:04X}")]
    UnknownPacketType(u16),

    /// Packet payload exceeds what the device accepts.
    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    /// Packet or TLV field is truncated.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Trailing CRC does not match the packet contents.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// A mandatory tag is absent.
    #[error("Missing tag: {0}")]
    MissingTag(&'static str),

    /// Failed to decode a field.
    #[error("Failed to decode message: {0}")]
    DecodeError(String),
}

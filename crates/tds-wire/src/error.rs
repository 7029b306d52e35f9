//! Wire-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding TDS wire structures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The byte stream violates the TDS framing rules and cannot be trusted.
    #[error("corrupted TDS stream: {0}")]
    CorruptedStream(&'static str),

    /// Unknown packet type byte.
    #[error("unknown packet type: 0x{0:02X}")]
    UnknownPacketType(u8),

    /// Status byte carries bits outside the defined mask.
    #[error("invalid packet status bits: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Not enough bytes to decode the structure.
    #[error("incomplete data: expected {expected} bytes, had {actual}")]
    Incomplete {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown token type byte.
    #[error("unknown token type: 0x{0:02X}")]
    UnknownTokenType(u8),

    /// A packet declares a length past the negotiated maximum.
    #[error("packet of {size} bytes exceeds negotiated size {max}")]
    PacketTooLarge {
        /// Declared total size.
        size: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// A UTF-16 string field contained an unpaired surrogate.
    #[error("string field is not valid UTF-16")]
    InvalidUtf16,
}

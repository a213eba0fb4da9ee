//! Codec errors.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding or decoding wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended before a field was complete
    #[error("message truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the next field requires
        needed: usize,
        /// Bytes left in the input
        available: usize,
    },

    /// Type byte is not assigned
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),

    /// Type byte is valid but belongs to the other message family
    #[error("unexpected message type {found:#04x}, expected {expected}")]
    UnexpectedType {
        /// Message family the decoder was asked for
        expected: &'static str,
        /// Type byte found
        found: u8,
    },

    /// Version byte does not match [`crate::PROTOCOL_VERSION`]
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Bytes remained after a complete message
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// A variable field or list exceeds its limit
    #[error("field too large: {size} exceeds {max}")]
    FieldTooLarge {
        /// Declared size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Fixed-size payload carried in a variable field has the wrong length
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Field name
        field: &'static str,
        /// Required length
        expected: usize,
        /// Received length
        actual: usize,
    },

    /// Goodbye reason is not UTF-8
    #[error("invalid UTF-8 in text field")]
    InvalidUtf8,

    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}

//! Error types for message parsing and construction.

use thiserror::Error;

/// Reasons a byte string is rejected as a CoAP message, or a message
/// cannot be assembled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// Datagram shorter than the fixed header.
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum number of bytes required at this point
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Version bits were not 01.
    #[error("unknown protocol version: {0}")]
    BadVersion(u8),

    /// Token length nibble in the reserved range 9..=15.
    #[error("reserved token length: {0}")]
    BadTokenLength(u8),

    /// Token bytes missing from the datagram.
    #[error("token truncated")]
    TruncatedToken,

    /// Option delta or length nibble 15 outside the payload marker.
    #[error("reserved option nibble 15")]
    ReservedOptionNibble,

    /// Option header, extension bytes or value ran past the datagram end.
    #[error("option truncated")]
    TruncatedOption,

    /// Accumulated option deltas exceeded the 16-bit number space.
    #[error("option number overflow")]
    OptionNumberOverflow,

    /// Payload marker present but no payload bytes follow.
    #[error("payload marker with empty payload")]
    MarkerWithoutPayload,

    /// An empty-code message (0.00) carried a token, options or payload.
    #[error("empty message with non-empty body")]
    NonEmptyEmptyMessage,

    /// A uint option value carried leading zero bytes.
    #[error("non-canonical uint option value")]
    NonCanonicalUint,

    /// Option value length outside the registry bounds for its number.
    #[error("option {number} value length {length} outside {min}..={max}")]
    OptionLength {
        /// Option number
        number: u16,
        /// Observed value length
        length: usize,
        /// Minimum allowed length
        min: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Block option value did not decode (szx 7 or overlong).
    #[error("invalid block option value")]
    BadBlock,
}

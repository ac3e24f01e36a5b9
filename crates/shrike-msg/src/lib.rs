//! # shrike-msg
//!
//! CoAP (RFC 7252) message codec and option registry.
//!
//! This crate provides:
//! - Message encoding and decoding (4-byte header, token, delta-encoded
//!   options, payload marker)
//! - The option registry with critical/unsafe/cache-key classification
//! - Block option (RFC 7959) packing
//! - Error types for malformed messages
//!
//! The types here are transport-agnostic: a [`Message`] is only the wire
//! content. Remote addressing and request/response correlation live in the
//! endpoint layer on top of this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod code;
pub mod error;
pub mod message;
pub mod option;

pub use code::Code;
pub use error::MessageError;
pub use message::{Message, MessageId, MessageType, Token};
pub use option::block::BlockValue;
pub use option::{CoapOption, OptionFormat, OptionList, OptionNumber};

/// CoAP protocol version carried in the header (the only valid value).
pub const VERSION: u8 = 1;

/// Fixed message header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Maximum token length in bytes.
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Payload marker separating options from payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Default port for unsecured CoAP over UDP.
pub const DEFAULT_PORT: u16 = 5683;

/// Default port for CoAP over DTLS.
pub const DEFAULT_SECURE_PORT: u16 = 5684;

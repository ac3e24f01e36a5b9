//! # shrike-oscore
//!
//! OSCORE (Object Security for Constrained RESTful Environments,
//! RFC 8613) for the shrike CoAP stack.
//!
//! This crate provides:
//! - The security context (HKDF-SHA256 key schedule over master
//!   secret/salt, sender/recipient keys, Common IV)
//! - AEAD protection and unprotection of CoAP messages with class E/I/U
//!   option handling and the compressed OSCORE option
//! - Anti-replay with a sliding window that only advances on verified
//!   messages
//! - Sender sequence number persistence with crash-safe skip-ahead
//!   (appendix B.1) and Echo-based window recovery
//!
//! ## Algorithms
//!
//! | Function | Default | Alternative |
//! |----------|---------|-------------|
//! | AEAD | AES-CCM-16-64-128 (COSE 10) | ChaCha20-Poly1305 (COSE 24) |
//! | HKDF | HKDF-SHA256 | |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod algorithms;
pub mod context;
pub mod error;
pub mod persist;
pub mod protect;
pub mod replay;

pub use algorithms::{AeadAlgorithm, HkdfAlgorithm};
pub use context::{ContextParameters, RequestAssociation, SecurityContext};
pub use error::SecurityError;
pub use persist::ContextStore;
pub use protect::peek_association;
pub use replay::ReplayWindow;

/// Maximum sender sequence number (2^40 - 1); the PIV encoding holds at
/// most five bytes.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 40) - 1;

/// OSCORE wire version, the only defined value.
pub const OSCORE_VERSION: u64 = 1;

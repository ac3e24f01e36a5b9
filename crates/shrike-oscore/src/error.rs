//! Error types for OSCORE processing.

use shrike_msg::{Message, MessageError};
use thiserror::Error;

/// Failures while protecting or unprotecting messages, or while managing
/// context state.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// AEAD verification failed; the message was tampered with or keyed
    /// differently.
    #[error("AEAD verification failed")]
    ProtectionInvalid,

    /// The partial IV was at or below the replay window's low-water mark,
    /// or its bit was already set.
    #[error("partial IV inside replay window")]
    ReplayDetected,

    /// A message that should have been OSCORE-protected was not. Carries
    /// the plain message for diagnostics.
    #[error("expected protected message, got plain {}", .0.code)]
    NotAProtectedMessage(Box<Message>),

    /// The OSCORE option referenced a key ID no context is known for.
    #[error("no security context for kid {}", hex::encode(.0))]
    UnknownKid(Vec<u8>),

    /// The compressed OSCORE option value did not parse.
    #[error("malformed OSCORE option")]
    MalformedOscoreOption,

    /// A request arrived during B.1 recovery without a valid Echo value.
    /// The caller should challenge with 4.01 carrying `challenge`.
    #[error("echo validation pending")]
    EchoRequired {
        /// The Echo value the peer has to mirror
        challenge: Vec<u8>,
    },

    /// The sender sequence number space is exhausted; the context must be
    /// re-established with fresh keys.
    #[error("sender sequence number space exhausted")]
    SequenceExhausted,

    /// Sender or recipient ID too long for the AEAD nonce.
    #[error("endpoint id longer than {max} bytes")]
    IdTooLong {
        /// nonce_len - 6 for the configured AEAD
        max: usize,
    },

    /// Inner plaintext or outer carrier failed CoAP parsing.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// CBOR encoding of the info or AAD structures failed.
    #[error("cbor error: {0}")]
    Cbor(#[from] serde_cbor::Error),

    /// Context directory I/O failed.
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A state file did not parse.
    #[error("persistence format error: {0}")]
    PersistFormat(#[from] serde_json::Error),

    /// A hex field in `secret.json` did not decode.
    #[error("persistence hex error: {0}")]
    PersistHex(#[from] hex::FromHexError),

    /// An algorithm name in `secret.json` is not supported.
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
}

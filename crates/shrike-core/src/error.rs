//! The endpoint error taxonomy.
//!
//! Every failure a caller can observe funnels into [`Error`]; the
//! [`kind`](Error::kind) discriminator is stable across releases for
//! machine consumption, the `Display` text is the diagnostic.

use shrike_msg::{Code, Message, MessageError};
use shrike_oscore::SecurityError;
use shrike_transport::TransportError;
use thiserror::Error;

/// Endpoint errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The codec rejected incoming bytes.
    #[error("malformed message: {0}")]
    Message(#[from] MessageError),

    /// CON retransmissions exhausted without an ACK or RST.
    #[error("request timed out after retransmissions")]
    RequestTimedOut,

    /// The request handle was cancelled before completion.
    #[error("request cancelled")]
    RequestCancelled,

    /// The peer answered the exchange with RST.
    #[error("exchange reset by peer")]
    ResetReceived,

    /// Transport send or receive failed unrecoverably.
    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// The context was shut down while the operation was pending.
    #[error("library shut down")]
    LibraryShutdown,

    /// A Block1 option arrived outside any upload in progress, or with a
    /// gap in the block numbers.
    #[error("unexpected Block1 state")]
    UnexpectedBlock1,

    /// A Block2 response did not continue the transfer being fetched.
    #[error("unexpected Block2 state")]
    UnexpectedBlock2,

    /// A response carried a critical option this client does not handle.
    #[error("critical option {0} not understood")]
    BadOption(u16),

    /// A response arrived whose code is not a response class.
    #[error("peer answered with non-response code {0}")]
    NotAResponse(Code),

    /// OSCORE processing failed.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// A resource handler failed with a response to relay.
    #[error("handler error: {}", .0.diagnostic)]
    Renderable(RenderableError),

    /// No configured transport claims the target.
    #[error("no transport claims {0}")]
    NoTransport(String),
}

impl Error {
    /// Stable machine-readable discriminator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Message(_) => "malformed-message",
            Error::RequestTimedOut => "request-timed-out",
            Error::RequestCancelled => "request-cancelled",
            Error::ResetReceived => "reset-received",
            Error::Network(_) => "network-error",
            Error::LibraryShutdown => "library-shutdown",
            Error::UnexpectedBlock1 => "unexpected-block1",
            Error::UnexpectedBlock2 => "unexpected-block2",
            Error::BadOption(_) => "bad-option",
            Error::NotAResponse(_) => "not-a-response",
            Error::Security(SecurityError::ProtectionInvalid) => "protection-invalid",
            Error::Security(SecurityError::ReplayDetected) => "replay-error",
            Error::Security(SecurityError::NotAProtectedMessage(_)) => {
                "not-a-protected-message"
            }
            Error::Security(SecurityError::UnknownKid(_)) => "no-security-context",
            Error::Security(_) => "security-error",
            Error::Renderable(_) => "renderable",
            Error::NoTransport(_) => "no-transport",
        }
    }
}

/// A handler-level failure carrying the CoAP response that describes it.
#[derive(Debug, Clone)]
pub struct RenderableError {
    /// Response code to send (4.xx or 5.xx)
    pub code: Code,
    /// Diagnostic payload text
    pub diagnostic: String,
}

impl RenderableError {
    /// An error response with code and diagnostic text.
    #[must_use]
    pub fn new(code: Code, diagnostic: impl Into<String>) -> Self {
        RenderableError {
            code,
            diagnostic: diagnostic.into(),
        }
    }

    /// 4.04 Not Found.
    #[must_use]
    pub fn not_found() -> Self {
        RenderableError::new(Code::NOT_FOUND, "resource not found")
    }

    /// 4.05 Method Not Allowed.
    #[must_use]
    pub fn method_not_allowed() -> Self {
        RenderableError::new(Code::METHOD_NOT_ALLOWED, "method not allowed")
    }

    /// 5.00 with a generic diagnostic, for handler panics and
    /// non-renderable internal failures.
    #[must_use]
    pub fn internal() -> Self {
        RenderableError::new(Code::INTERNAL_SERVER_ERROR, "internal error")
    }

    /// The wire payload for this error.
    #[must_use]
    pub fn to_message(&self, template: &Message) -> Message {
        let mut msg = Message::new(template.mtype, self.code, template.mid);
        msg.token = template.token;
        msg.payload = self.diagnostic.clone().into_bytes();
        msg
    }
}

impl From<RenderableError> for Error {
    fn from(e: RenderableError) -> Self {
        Error::Renderable(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_discriminators() {
        assert_eq!(Error::RequestTimedOut.kind(), "request-timed-out");
        assert_eq!(
            Error::Security(SecurityError::ReplayDetected).kind(),
            "replay-error"
        );
        assert_eq!(
            Error::Security(SecurityError::UnknownKid(vec![1])).kind(),
            "no-security-context"
        );
        assert_eq!(Error::BadOption(65001).kind(), "bad-option");
    }

    #[test]
    fn test_renderable_to_message() {
        use shrike_msg::{MessageId, MessageType, Token};
        let mut template = Message::new(MessageType::Con, Code::GET, MessageId(7));
        template.token = Token::new(&[0xAA]).unwrap();

        let rendered = RenderableError::not_found().to_message(&template);
        assert_eq!(rendered.code, Code::NOT_FOUND);
        assert_eq!(rendered.token, template.token);
        assert_eq!(rendered.payload, b"resource not found");
    }
}

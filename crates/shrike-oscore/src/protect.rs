//! Message protection and unprotection.
//!
//! Protecting a message moves its class E options and payload into an
//! inner plaintext (`code ‖ options ‖ 0xFF ‖ payload`), encrypts that
//! under the context's AEAD, and rewrites the outer message: code 0.02 /
//! 2.04, class U options kept, the compressed OSCORE option added, and
//! the ciphertext as payload. Unprotection reverses the transformation
//! and enforces replay and recovery rules.

use serde_bytes::Bytes;
use shrike_msg::{Code, Message, OptionList, OptionNumber};

use crate::context::{
    decode_piv, encode_piv, EchoState, RequestAssociation, SecurityContext,
};
use crate::error::SecurityError;
use crate::OSCORE_VERSION;

/// Options that stay visible on the outer message (class U per
/// RFC 8613 §4.1).
const CLASS_U: [OptionNumber; 4] = [
    OptionNumber::URI_HOST,
    OptionNumber::URI_PORT,
    OptionNumber::PROXY_URI,
    OptionNumber::PROXY_SCHEME,
];

/// Parsed compressed OSCORE option value.
#[derive(Debug, Default, PartialEq, Eq)]
struct OscoreOption {
    piv: Option<Vec<u8>>,
    kid: Option<Vec<u8>>,
    kid_context: Option<Vec<u8>>,
}

impl SecurityContext {
    /// Protect an outgoing request.
    ///
    /// Returns the outer message and the association needed to verify
    /// the matching response.
    ///
    /// # Errors
    ///
    /// Sequence exhaustion, persistence failures, or AEAD errors.
    pub fn protect_request(
        &mut self,
        message: &Message,
    ) -> Result<(Message, RequestAssociation), SecurityError> {
        let seq = self.allocate_sequence_number()?;
        let piv = encode_piv(seq);
        let kid = self.sender_id().to_vec();

        let nonce = self.nonce(&piv, &kid);
        let aad = build_aad(&kid, &piv, self.aead().cose_id())?;
        let option = encode_oscore_option(
            Some(&piv),
            Some(&kid),
            self.params.id_context.as_deref(),
        );

        let outer = self.seal_into_outer(message, Code::POST, &nonce, &aad, option)?;
        Ok((outer, RequestAssociation { kid, piv }))
    }

    /// Protect an outgoing response to a previously unprotected request.
    ///
    /// With `own_piv` false the request's nonce is reused and the OSCORE
    /// option is empty; with `own_piv` true (observe notifications, B.1
    /// responses) a fresh sequence number is spent and carried.
    ///
    /// # Errors
    ///
    /// Sequence exhaustion (own-piv path) or AEAD errors.
    pub fn protect_response(
        &mut self,
        message: &Message,
        request: &RequestAssociation,
        own_piv: bool,
    ) -> Result<Message, SecurityError> {
        let aad = build_aad(&request.kid, &request.piv, self.aead().cose_id())?;

        let (nonce, option) = if own_piv {
            let seq = self.allocate_sequence_number()?;
            let piv = encode_piv(seq);
            let nonce = self.nonce(&piv, self.sender_id());
            (nonce, encode_oscore_option(Some(&piv), None, None))
        } else {
            (
                self.nonce(&request.piv, &request.kid),
                encode_oscore_option(None, None, None),
            )
        };

        self.seal_into_outer(message, Code::CHANGED, &nonce, &aad, option)
    }

    /// Unprotect an incoming request.
    ///
    /// Returns the plaintext request and the association for protecting
    /// its response.
    ///
    /// # Errors
    ///
    /// `NotAProtectedMessage` without an OSCORE option; `UnknownKid`
    /// when the kid is not ours; `ReplayDetected`; `ProtectionInvalid`;
    /// `EchoRequired` while B.1 recovery awaits the challenge.
    pub fn unprotect_request(
        &mut self,
        message: &Message,
    ) -> Result<(Message, RequestAssociation), SecurityError> {
        let compressed = require_oscore_option(message)?;
        let (piv, kid) = match (compressed.piv, compressed.kid) {
            (Some(piv), Some(kid)) => (piv, kid),
            _ => return Err(SecurityError::MalformedOscoreOption),
        };
        if kid != self.recipient_id() {
            return Err(SecurityError::UnknownKid(kid));
        }
        if let Some(kid_context) = &compressed.kid_context {
            if Some(kid_context.as_slice()) != self.params.id_context.as_deref() {
                return Err(SecurityError::UnknownKid(kid));
            }
        }

        let seq = decode_piv(&piv);
        let recovering = matches!(self.echo, EchoState::Pending { .. });
        // An untrusted window cannot veto anything; the Echo exchange
        // below re-establishes it.
        if !recovering && !self.replay.check(seq) {
            return Err(SecurityError::ReplayDetected);
        }

        let nonce = self.nonce(&piv, &kid);
        let aad = build_aad(&kid, &piv, self.aead().cose_id())?;
        let plaintext = self
            .aead()
            .open(&self.recipient_key, &nonce, &aad, &message.payload)?;

        let (code, options, payload) = decode_inner(&plaintext)?;

        if let EchoState::Pending { challenge } = &self.echo {
            let echoed = options
                .get_first(OptionNumber::ECHO)
                .map(|o| o.value.as_slice());
            if echoed != Some(challenge.as_slice()) {
                return Err(SecurityError::EchoRequired {
                    challenge: challenge.clone(),
                });
            }
            tracing::info!(seq, "echo validated, replay window re-established");
            self.echo = EchoState::Validated;
            self.replay = crate::replay::ReplayWindow::new();
        }
        self.replay.commit(seq);

        let plain = reassemble(message, code, options, payload);
        Ok((plain, RequestAssociation { kid, piv }))
    }

    /// Unprotect an incoming response to a request we protected.
    ///
    /// # Errors
    ///
    /// `NotAProtectedMessage` without an OSCORE option;
    /// `ProtectionInvalid` on verification failure.
    pub fn unprotect_response(
        &mut self,
        message: &Message,
        request: &RequestAssociation,
    ) -> Result<Message, SecurityError> {
        let compressed = require_oscore_option(message)?;

        // Responses either reuse the request nonce or carry their own
        // partial IV (then originated by the peer's sender ID, which is
        // our recipient ID).
        let nonce = match &compressed.piv {
            Some(piv) => self.nonce(piv, self.recipient_id()),
            None => self.nonce(&request.piv, &request.kid),
        };
        let aad = build_aad(&request.kid, &request.piv, self.aead().cose_id())?;
        let plaintext = self
            .aead()
            .open(&self.recipient_key, &nonce, &aad, &message.payload)?;

        let (code, options, payload) = decode_inner(&plaintext)?;
        Ok(reassemble(message, code, options, payload))
    }

    /// Encrypt `message` and build the outer carrier around the
    /// ciphertext.
    fn seal_into_outer(
        &self,
        message: &Message,
        outer_code: Code,
        nonce: &[u8],
        aad: &[u8],
        option_value: Vec<u8>,
    ) -> Result<Message, SecurityError> {
        let mut inner_options = OptionList::new();
        let mut outer_options = OptionList::new();

        for opt in message.options.iter() {
            if opt.number == OptionNumber::OSCORE {
                continue;
            }
            if CLASS_U.contains(&opt.number) {
                outer_options.add(opt.number, opt.value.clone());
                continue;
            }
            // Observe stays visible for message-layer ordering while the
            // authoritative copy is protected.
            if opt.number == OptionNumber::OBSERVE {
                outer_options.add(opt.number, opt.value.clone());
            }
            inner_options.add(opt.number, opt.value.clone());
        }

        let plaintext = encode_inner(message.code, &inner_options, &message.payload);
        let ciphertext = self
            .aead()
            .seal(&self.sender_key, nonce, aad, &plaintext)?;

        outer_options.set(OptionNumber::OSCORE, option_value);

        let mut outer = Message::new(message.mtype, outer_code, message.mid);
        outer.token = message.token;
        outer.options = outer_options;
        outer.payload = ciphertext;
        Ok(outer)
    }
}

/// Serialize the inner plaintext: code, options, marker, payload.
fn encode_inner(code: Code, options: &OptionList, payload: &[u8]) -> Vec<u8> {
    // Reuse the message codec and strip the fixed header: byte 1 is the
    // code, bytes 4.. are options and payload (token length is zero).
    let mut carrier = Message::new(shrike_msg::MessageType::Con, code, shrike_msg::MessageId(0));
    carrier.options = options.clone();
    carrier.payload = payload.to_vec();
    let encoded = carrier.encode();

    let mut inner = Vec::with_capacity(encoded.len() - 3);
    inner.push(code.as_u8());
    inner.extend_from_slice(&encoded[4..]);
    inner
}

/// Parse an inner plaintext back into code, options and payload.
fn decode_inner(plaintext: &[u8]) -> Result<(Code, OptionList, Vec<u8>), SecurityError> {
    let (&code, rest) = plaintext
        .split_first()
        .ok_or(SecurityError::ProtectionInvalid)?;

    let mut carrier = Vec::with_capacity(4 + rest.len());
    carrier.extend_from_slice(&[0x40, code, 0x00, 0x00]);
    carrier.extend_from_slice(rest);
    let message = Message::decode(&carrier)?;
    Ok((message.code, message.options, message.payload))
}

/// Merge the unprotected outer carrier with the decrypted inner parts.
fn reassemble(
    outer: &Message,
    code: Code,
    inner_options: OptionList,
    payload: Vec<u8>,
) -> Message {
    let mut options = OptionList::new();
    for opt in outer.options.iter() {
        if CLASS_U.contains(&opt.number) {
            options.add(opt.number, opt.value.clone());
        }
    }
    for opt in inner_options.iter() {
        options.remove(opt.number);
    }
    for opt in inner_options.iter() {
        options.add(opt.number, opt.value.clone());
    }

    let mut plain = Message::new(outer.mtype, code, outer.mid);
    plain.token = outer.token;
    plain.options = options;
    plain.payload = payload;
    plain
}

/// Read the kid and partial IV out of a protected request without
/// verifying anything. Needed to address an error response (4.01 with
/// Echo, replay diagnostics) at a message that failed unprotection.
///
/// # Errors
///
/// `NotAProtectedMessage` / `MalformedOscoreOption` when there is no
/// parseable OSCORE option with both fields.
pub fn peek_association(message: &Message) -> Result<RequestAssociation, SecurityError> {
    let compressed = require_oscore_option(message)?;
    match (compressed.kid, compressed.piv) {
        (Some(kid), Some(piv)) => Ok(RequestAssociation { kid, piv }),
        _ => Err(SecurityError::MalformedOscoreOption),
    }
}

/// Extract and parse the OSCORE option, or classify the message as
/// unprotected.
fn require_oscore_option(message: &Message) -> Result<OscoreOption, SecurityError> {
    match message.options.get_first(OptionNumber::OSCORE) {
        Some(opt) => decode_oscore_option(&opt.value),
        None => Err(SecurityError::NotAProtectedMessage(Box::new(
            message.clone(),
        ))),
    }
}

/// Build the compressed option value: flag byte, partial IV, kid context
/// (length-prefixed), kid.
fn encode_oscore_option(
    piv: Option<&[u8]>,
    kid: Option<&[u8]>,
    kid_context: Option<&[u8]>,
) -> Vec<u8> {
    if piv.is_none() && kid.is_none() && kid_context.is_none() {
        return Vec::new();
    }

    let mut value = vec![0u8];
    if let Some(piv) = piv {
        value[0] |= piv.len() as u8 & 0x07;
        value.extend_from_slice(piv);
    }
    if let Some(kid_context) = kid_context {
        value[0] |= 0x10;
        value.push(kid_context.len() as u8);
        value.extend_from_slice(kid_context);
    }
    if let Some(kid) = kid {
        value[0] |= 0x08;
        value.extend_from_slice(kid);
    }
    value
}

/// Parse the compressed option value.
fn decode_oscore_option(value: &[u8]) -> Result<OscoreOption, SecurityError> {
    if value.is_empty() {
        return Ok(OscoreOption::default());
    }

    let flags = value[0];
    if flags & 0xE0 != 0 {
        return Err(SecurityError::MalformedOscoreOption);
    }
    let mut rest = &value[1..];

    let piv_len = (flags & 0x07) as usize;
    let piv = if piv_len > 0 {
        if rest.len() < piv_len {
            return Err(SecurityError::MalformedOscoreOption);
        }
        let (piv, tail) = rest.split_at(piv_len);
        rest = tail;
        Some(piv.to_vec())
    } else {
        None
    };

    let kid_context = if flags & 0x10 != 0 {
        let (&len, tail) = rest
            .split_first()
            .ok_or(SecurityError::MalformedOscoreOption)?;
        if tail.len() < len as usize {
            return Err(SecurityError::MalformedOscoreOption);
        }
        let (ctx, tail) = tail.split_at(len as usize);
        rest = tail;
        Some(ctx.to_vec())
    } else {
        None
    };

    let kid = if flags & 0x08 != 0 {
        Some(rest.to_vec())
    } else if rest.is_empty() {
        None
    } else {
        return Err(SecurityError::MalformedOscoreOption);
    };

    Ok(OscoreOption {
        piv,
        kid,
        kid_context,
    })
}

/// The AAD: a COSE Encrypt0 structure over
/// `[version, [alg], request_kid, request_piv, class-I options]`.
fn build_aad(
    request_kid: &[u8],
    request_piv: &[u8],
    alg_id: i64,
) -> Result<Vec<u8>, SecurityError> {
    let aad_array = (
        OSCORE_VERSION,
        [alg_id],
        Bytes::new(request_kid),
        Bytes::new(request_piv),
        Bytes::new(&[]),
    );
    let encoded_array = serde_cbor::to_vec(&aad_array)?;
    let enc_structure = ("Encrypt0", Bytes::new(&[]), Bytes::new(&encoded_array));
    Ok(serde_cbor::to_vec(&enc_structure)?)
}

//! The OSCORE security context: key schedule, nonce construction and
//! sender sequence number management.
//!
//! A context pairs one sender half (our ID, key and sequence number) with
//! one recipient half (peer ID, key and replay window), both derived from
//! the shared master secret. The sequence number is never handed out
//! without the persistence bound covering it; see [`crate::persist`].

use hkdf::Hkdf;
use serde_bytes::Bytes;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::algorithms::{AeadAlgorithm, HkdfAlgorithm};
use crate::error::SecurityError;
use crate::persist::ContextStore;
use crate::replay::ReplayWindow;
use crate::MAX_SEQUENCE_NUMBER;

/// Input parameters of a security context, as provisioned out of band.
#[derive(Clone, ZeroizeOnDrop)]
pub struct ContextParameters {
    /// Master Secret (sensitive)
    pub master_secret: Vec<u8>,
    /// Master Salt (may be empty)
    pub master_salt: Vec<u8>,
    /// ID Context distinguishing key generations, if any
    #[zeroize(skip)]
    pub id_context: Option<Vec<u8>>,
    /// Sender ID (our identity in this context)
    #[zeroize(skip)]
    pub sender_id: Vec<u8>,
    /// Recipient ID (the peer's identity)
    #[zeroize(skip)]
    pub recipient_id: Vec<u8>,
    /// AEAD algorithm
    #[zeroize(skip)]
    pub aead: AeadAlgorithm,
    /// HKDF algorithm
    #[zeroize(skip)]
    pub hkdf: HkdfAlgorithm,
}

impl ContextParameters {
    /// Parameters with default algorithms and no ID context.
    #[must_use]
    pub fn new(
        master_secret: Vec<u8>,
        master_salt: Vec<u8>,
        sender_id: Vec<u8>,
        recipient_id: Vec<u8>,
    ) -> Self {
        ContextParameters {
            master_secret,
            master_salt,
            id_context: None,
            sender_id,
            recipient_id,
            aead: AeadAlgorithm::default(),
            hkdf: HkdfAlgorithm::default(),
        }
    }
}

impl std::fmt::Debug for ContextParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs
        f.debug_struct("ContextParameters")
            .field("sender_id", &hex::encode(&self.sender_id))
            .field("recipient_id", &hex::encode(&self.recipient_id))
            .field("aead", &self.aead)
            .finish_non_exhaustive()
    }
}

/// Correlation data a response is protected or verified against: the kid
/// and partial IV of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAssociation {
    /// The request's key ID
    pub kid: Vec<u8>,
    /// The request's partial IV, minimally encoded
    pub piv: Vec<u8>,
}

/// Echo-gated recovery state after a reboot with an untrusted replay
/// window (appendix B.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EchoState {
    /// Normal operation; the replay window is authoritative.
    Validated,
    /// The window was lost. Requests must mirror `challenge` in an Echo
    /// option before anything reaches the application.
    Pending {
        /// The random value the peer has to echo
        challenge: Vec<u8>,
    },
}

/// A live security context.
#[derive(ZeroizeOnDrop)]
pub struct SecurityContext {
    #[zeroize(skip)]
    pub(crate) params: ContextParameters,
    pub(crate) sender_key: Vec<u8>,
    pub(crate) recipient_key: Vec<u8>,
    #[zeroize(skip)]
    pub(crate) common_iv: Vec<u8>,
    /// Next sequence number to hand out
    #[zeroize(skip)]
    pub(crate) sender_seq: u64,
    /// Persisted upper bound; numbers below it are safe to use
    #[zeroize(skip)]
    pub(crate) persisted_next: u64,
    #[zeroize(skip)]
    pub(crate) replay: ReplayWindow,
    #[zeroize(skip)]
    pub(crate) echo: EchoState,
    #[zeroize(skip)]
    pub(crate) store: Option<ContextStore>,
}

impl SecurityContext {
    /// Derive a volatile context (no persistence) from its parameters.
    ///
    /// # Errors
    ///
    /// `IdTooLong` when an endpoint ID does not fit the AEAD nonce;
    /// `Cbor` if the info structure cannot be built.
    pub fn new(params: ContextParameters) -> Result<Self, SecurityError> {
        let max_id = params.aead.max_id_len();
        if params.sender_id.len() > max_id || params.recipient_id.len() > max_id {
            return Err(SecurityError::IdTooLong { max: max_id });
        }

        let sender_key = derive(&params, &params.sender_id, "Key", params.aead.key_len())?;
        let recipient_key =
            derive(&params, &params.recipient_id, "Key", params.aead.key_len())?;
        let common_iv = derive(&params, &[], "IV", params.aead.nonce_len())?;

        Ok(SecurityContext {
            params,
            sender_key,
            recipient_key,
            common_iv,
            sender_seq: 0,
            persisted_next: 0,
            replay: ReplayWindow::new(),
            echo: EchoState::Validated,
            store: None,
        })
    }

    /// Our sender ID.
    #[must_use]
    pub fn sender_id(&self) -> &[u8] {
        &self.params.sender_id
    }

    /// The peer's ID.
    #[must_use]
    pub fn recipient_id(&self) -> &[u8] {
        &self.params.recipient_id
    }

    /// The configured AEAD algorithm.
    #[must_use]
    pub fn aead(&self) -> AeadAlgorithm {
        self.params.aead
    }

    /// The next sequence number that would be handed out.
    #[must_use]
    pub fn next_sequence_number(&self) -> u64 {
        self.sender_seq
    }

    /// True while B.1 recovery awaits an Echo-validated request.
    #[must_use]
    pub fn recovery_pending(&self) -> bool {
        matches!(self.echo, EchoState::Pending { .. })
    }

    /// Take a sequence number for an outgoing protected message.
    ///
    /// The persistence bound is pushed ahead of the handed-out number
    /// before this returns, so no number can be reused after a crash.
    ///
    /// # Errors
    ///
    /// `SequenceExhausted` past 2^40 - 1; persistence errors from the
    /// store.
    pub fn allocate_sequence_number(&mut self) -> Result<u64, SecurityError> {
        if self.sender_seq > MAX_SEQUENCE_NUMBER {
            return Err(SecurityError::SequenceExhausted);
        }
        if self.sender_seq >= self.persisted_next {
            let bound = match &self.store {
                Some(store) => {
                    let bound = self.sender_seq + store.batch();
                    store.write_sequence(bound, &self.replay)?;
                    bound
                }
                None => self.sender_seq + 1,
            };
            self.persisted_next = bound;
        }
        let seq = self.sender_seq;
        self.sender_seq += 1;
        Ok(seq)
    }

    /// Flush the sequence bound and replay window to disk, e.g. at
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Persistence errors from the store; a no-op without one.
    pub fn persist(&mut self) -> Result<(), SecurityError> {
        if let Some(store) = &self.store {
            store.write_sequence(self.persisted_next.max(self.sender_seq), &self.replay)?;
        }
        Ok(())
    }

    /// Compute the AEAD nonce for `piv` originated by `id_piv`
    /// (RFC 8613 §5.2): `S ‖ pad(id) ‖ pad(piv)` XOR Common IV.
    #[must_use]
    pub(crate) fn nonce(&self, piv: &[u8], id_piv: &[u8]) -> Vec<u8> {
        let nonce_len = self.params.aead.nonce_len();
        let mut nonce = vec![0u8; nonce_len];

        nonce[0] = id_piv.len() as u8;
        let id_end = nonce_len - 5;
        nonce[id_end - id_piv.len()..id_end].copy_from_slice(id_piv);
        nonce[nonce_len - piv.len()..].copy_from_slice(piv);

        for (byte, iv) in nonce.iter_mut().zip(self.common_iv.iter()) {
            *byte ^= iv;
        }
        nonce
    }

    /// Begin B.1 recovery: distrust the replay window, skip the sender
    /// sequence number ahead and require an Echo round trip before
    /// requests are accepted.
    ///
    /// The skip target is the next power of two above the current number,
    /// at least one window width.
    pub fn start_recovery(&mut self) -> Result<(), SecurityError> {
        // Strictly above the current number, so even an exact power of
        // two moves a full step ahead.
        let floor = (self.sender_seq.max(ReplayWindow::SIZE) + 1)
            .checked_next_power_of_two()
            .unwrap_or(MAX_SEQUENCE_NUMBER);
        self.sender_seq = floor;
        self.persisted_next = 0; // force a flush before the next use
        self.replay = ReplayWindow::new();

        let mut challenge = vec![0u8; 8];
        getrandom::getrandom(&mut challenge)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        tracing::debug!(
            kid = %hex::encode(&self.params.sender_id),
            next_seq = self.sender_seq,
            "starting sequence-number recovery"
        );
        self.echo = EchoState::Pending { challenge };
        Ok(())
    }

    /// The Echo value a challenge response has to carry, while recovery
    /// is pending.
    #[must_use]
    pub fn recovery_challenge(&self) -> Option<&[u8]> {
        match &self.echo {
            EchoState::Pending { challenge } => Some(challenge),
            EchoState::Validated => None,
        }
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("params", &self.params)
            .field("sender_seq", &self.sender_seq)
            .field("replay_high", &self.replay.high())
            .field("recovery_pending", &self.recovery_pending())
            .finish_non_exhaustive()
    }
}

/// Encode a sequence number as a partial IV: minimal big-endian, zero as
/// a single zero byte.
#[must_use]
pub(crate) fn encode_piv(seq: u64) -> Vec<u8> {
    let bytes = seq.to_be_bytes();
    match bytes.iter().position(|&b| b != 0) {
        Some(first) => bytes[first..].to_vec(),
        None => vec![0x00],
    }
}

/// Decode a partial IV back into a sequence number.
#[must_use]
pub(crate) fn decode_piv(piv: &[u8]) -> u64 {
    piv.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b))
}

/// HKDF expansion of one context key or IV.
fn derive(
    params: &ContextParameters,
    id: &[u8],
    kind: &str,
    len: usize,
) -> Result<Vec<u8>, SecurityError> {
    let info = build_info(id, params.id_context.as_deref(), params.aead, kind, len)?;

    let HkdfAlgorithm::Sha256 = params.hkdf;
    let hk = Hkdf::<Sha256>::new(Some(&params.master_salt), &params.master_secret);
    let mut okm = vec![0u8; len];
    hk.expand(&info, &mut okm)
        .map_err(|_| SecurityError::ProtectionInvalid)?;
    Ok(okm)
}

/// The CBOR `info` array `[id, id_context, alg_aead, type, L]`.
fn build_info(
    id: &[u8],
    id_context: Option<&[u8]>,
    aead: AeadAlgorithm,
    kind: &str,
    len: usize,
) -> Result<Vec<u8>, SecurityError> {
    let info = (
        Bytes::new(id),
        id_context.map(Bytes::new),
        aead.cose_id(),
        kind,
        len,
    );
    Ok(serde_cbor::to_vec(&info)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The RFC 8613 C.1.1 context: client sender ID empty, server ID 01.
    fn rfc_c1_params() -> ContextParameters {
        ContextParameters::new(
            hex::decode("0102030405060708090a0b0c0d0e0f10").unwrap(),
            hex::decode("9e7ca92223786340").unwrap(),
            vec![],
            vec![0x01],
        )
    }

    #[test]
    fn test_rfc8613_c1_derivation() {
        let ctx = SecurityContext::new(rfc_c1_params()).unwrap();
        assert_eq!(
            hex::encode(&ctx.sender_key),
            "f0910ed7295e6ad4b54fc793154302ff"
        );
        assert_eq!(
            hex::encode(&ctx.recipient_key),
            "ffb14e093c94c9cac9471648b4f98710"
        );
        assert_eq!(hex::encode(&ctx.common_iv), "4622d4dd6d944168eefb54987c");
    }

    #[test]
    fn test_piv_encoding() {
        assert_eq!(encode_piv(0), vec![0x00]);
        assert_eq!(encode_piv(1), vec![0x01]);
        assert_eq!(encode_piv(0x1234), vec![0x12, 0x34]);
        assert_eq!(encode_piv(0xFF_FFFF_FFFF), vec![0xFF; 5]);

        for seq in [0u64, 1, 255, 256, 0xFFFF, 0x10000, MAX_SEQUENCE_NUMBER] {
            assert_eq!(decode_piv(&encode_piv(seq)), seq);
        }
    }

    #[test]
    fn test_nonce_construction() {
        let ctx = SecurityContext::new(rfc_c1_params()).unwrap();
        // Nonce fields: S=1, recipient id 0x01 padded, piv 0x00
        let nonce = ctx.nonce(&[0x00], &[0x01]);
        assert_eq!(nonce.len(), 13);

        // XOR-ing the common IV back out exposes the plain structure
        let plain: Vec<u8> = nonce
            .iter()
            .zip(ctx.common_iv.iter())
            .map(|(n, iv)| n ^ iv)
            .collect();
        assert_eq!(plain[0], 1); // S
        assert_eq!(plain[7], 0x01); // id, right-aligned before the piv
        assert_eq!(plain[12], 0x00); // piv
    }

    #[test]
    fn test_id_too_long_rejected() {
        let mut params = rfc_c1_params();
        params.sender_id = vec![0u8; 8]; // max for a 13-byte nonce is 7
        assert!(matches!(
            SecurityContext::new(params),
            Err(SecurityError::IdTooLong { max: 7 })
        ));
    }

    #[test]
    fn test_sequence_allocation_monotone() {
        let mut ctx = SecurityContext::new(rfc_c1_params()).unwrap();
        let a = ctx.allocate_sequence_number().unwrap();
        let b = ctx.allocate_sequence_number().unwrap();
        let c = ctx.allocate_sequence_number().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn test_recovery_skips_ahead() {
        let mut ctx = SecurityContext::new(rfc_c1_params()).unwrap();
        for _ in 0..40 {
            ctx.allocate_sequence_number().unwrap();
        }
        ctx.start_recovery().unwrap();

        // next power of two above 40 is 64
        assert_eq!(ctx.next_sequence_number(), 64);
        assert!(ctx.recovery_pending());
        assert!(ctx.recovery_challenge().is_some());
    }

    #[test]
    fn test_recovery_minimum_gap() {
        let mut ctx = SecurityContext::new(rfc_c1_params()).unwrap();
        ctx.allocate_sequence_number().unwrap();
        ctx.start_recovery().unwrap();
        assert!(ctx.next_sequence_number() >= ReplayWindow::SIZE);
    }

    #[test]
    fn test_debug_hides_keys() {
        let ctx = SecurityContext::new(rfc_c1_params()).unwrap();
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("f0910ed7"));
        assert!(!debug.contains("0102030405"));
    }
}

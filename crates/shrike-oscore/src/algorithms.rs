//! COSE algorithm identifiers and AEAD dispatch.

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U8};
use ccm::Ccm;
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::SecurityError;

/// AES-CCM with a 16-byte key, 8-byte tag and 13-byte nonce.
type AesCcm16_64_128 = Ccm<Aes128, U8, U13>;

/// AEAD algorithms usable as the OSCORE AEAD Algorithm parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AeadAlgorithm {
    /// AES-CCM-16-64-128, COSE algorithm 10. The mandatory default.
    #[default]
    AesCcm16_64_128,
    /// ChaCha20-Poly1305, COSE algorithm 24.
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    /// COSE algorithm identifier, as it appears in the HKDF info and the
    /// AAD.
    #[must_use]
    pub const fn cose_id(self) -> i64 {
        match self {
            AeadAlgorithm::AesCcm16_64_128 => 10,
            AeadAlgorithm::ChaCha20Poly1305 => 24,
        }
    }

    /// Key length in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            AeadAlgorithm::AesCcm16_64_128 => 16,
            AeadAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Nonce length in bytes.
    #[must_use]
    pub const fn nonce_len(self) -> usize {
        match self {
            AeadAlgorithm::AesCcm16_64_128 => 13,
            AeadAlgorithm::ChaCha20Poly1305 => 12,
        }
    }

    /// Authentication tag length in bytes.
    #[must_use]
    pub const fn tag_len(self) -> usize {
        match self {
            AeadAlgorithm::AesCcm16_64_128 => 8,
            AeadAlgorithm::ChaCha20Poly1305 => 16,
        }
    }

    /// Longest sender/recipient ID the nonce construction can hold.
    #[must_use]
    pub const fn max_id_len(self) -> usize {
        self.nonce_len() - 6
    }

    /// The registered name, used in `secret.json`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            AeadAlgorithm::AesCcm16_64_128 => "AES-CCM-16-64-128",
            AeadAlgorithm::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }

    /// Look an algorithm up by its registered name.
    ///
    /// # Errors
    ///
    /// `UnknownAlgorithm` for anything else.
    pub fn from_name(name: &str) -> Result<Self, SecurityError> {
        match name {
            "AES-CCM-16-64-128" => Ok(AeadAlgorithm::AesCcm16_64_128),
            "ChaCha20-Poly1305" => Ok(AeadAlgorithm::ChaCha20Poly1305),
            other => Err(SecurityError::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Encrypt `plaintext` under `key`/`nonce`, binding `aad`. The tag is
    /// appended to the returned ciphertext.
    ///
    /// # Errors
    ///
    /// `ProtectionInvalid` when the primitive rejects the inputs.
    ///
    /// # Panics
    ///
    /// `key` and `nonce` must be exactly [`key_len`](Self::key_len) and
    /// [`nonce_len`](Self::nonce_len) bytes; the context derivation
    /// guarantees this.
    pub fn seal(
        self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            AeadAlgorithm::AesCcm16_64_128 => {
                AesCcm16_64_128::new(GenericArray::from_slice(key))
                    .encrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| SecurityError::ProtectionInvalid)
            }
            AeadAlgorithm::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(key))
                    .encrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| SecurityError::ProtectionInvalid)
            }
        }
    }

    /// Decrypt and verify `ciphertext` (tag included) under
    /// `key`/`nonce`/`aad`.
    ///
    /// # Errors
    ///
    /// `ProtectionInvalid` on authentication failure.
    ///
    /// # Panics
    ///
    /// Same size contract as [`seal`](Self::seal).
    pub fn open(
        self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self {
            AeadAlgorithm::AesCcm16_64_128 => {
                AesCcm16_64_128::new(GenericArray::from_slice(key))
                    .decrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| SecurityError::ProtectionInvalid)
            }
            AeadAlgorithm::ChaCha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(key))
                    .decrypt(GenericArray::from_slice(nonce), payload)
                    .map_err(|_| SecurityError::ProtectionInvalid)
            }
        }
    }
}

/// HKDF hash choices for the key schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HkdfAlgorithm {
    /// HKDF-SHA256, COSE algorithm -10. The mandatory default.
    #[default]
    Sha256,
}

impl HkdfAlgorithm {
    /// The registered name, used in `secret.json`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        "HKDF-SHA256"
    }

    /// Look an algorithm up by its registered name.
    ///
    /// # Errors
    ///
    /// `UnknownAlgorithm` for anything else.
    pub fn from_name(name: &str) -> Result<Self, SecurityError> {
        match name {
            "HKDF-SHA256" => Ok(HkdfAlgorithm::Sha256),
            other => Err(SecurityError::UnknownAlgorithm(other.to_string())),
        }
    }
}

//! Block1/Block2 option values (RFC 7959).
//!
//! A block value packs the block number, the more-blocks flag and the
//! size exponent into at most three bytes: `NUM << 4 | M << 3 | SZX`.

use crate::error::MessageError;
use crate::option::{decode_uint, encode_uint};

/// Largest representable block number (20 bits).
pub const MAX_BLOCK_NUMBER: u32 = (1 << 20) - 1;

/// A decoded Block1 or Block2 option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockValue {
    /// Block number within the transfer
    pub num: u32,
    /// More blocks follow
    pub more: bool,
    /// Size exponent; block size is `2^(szx + 4)`
    pub szx: u8,
}

impl BlockValue {
    /// Build a block value.
    ///
    /// # Errors
    ///
    /// `BadBlock` when `szx > 6` or the number exceeds 20 bits.
    pub fn new(num: u32, more: bool, szx: u8) -> Result<Self, MessageError> {
        if szx > 6 || num > MAX_BLOCK_NUMBER {
            return Err(MessageError::BadBlock);
        }
        Ok(BlockValue { num, more, szx })
    }

    /// The size exponent for a byte count, rounding down to the nearest
    /// power of two within 16..=1024.
    #[must_use]
    pub fn szx_for_size(size: usize) -> u8 {
        let clamped = size.clamp(16, 1024);
        // largest szx with 2^(szx+4) <= clamped
        (usize::BITS - 1 - clamped.leading_zeros()) as u8 - 4
    }

    /// Block size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    /// Byte offset of this block within the full representation.
    #[must_use]
    pub fn start(&self) -> usize {
        self.num as usize * self.size()
    }

    /// Encode to the canonical uint option value.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let raw = u64::from(self.num) << 4
            | u64::from(self.more) << 3
            | u64::from(self.szx);
        encode_uint(raw)
    }

    /// Decode from an option value.
    ///
    /// # Errors
    ///
    /// `BadBlock` on szx 7; `NonCanonicalUint` on overlong encodings.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > 3 {
            return Err(MessageError::BadBlock);
        }
        let raw = decode_uint(bytes)?;
        let szx = (raw & 0x07) as u8;
        if szx == 7 {
            return Err(MessageError::BadBlock);
        }
        Ok(BlockValue {
            num: (raw >> 4) as u32,
            more: raw & 0x08 != 0,
            szx,
        })
    }
}

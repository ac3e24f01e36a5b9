//! Message model and wire codec.
//!
//! The wire form is the RFC 7252 §3 layout: a fixed 4-byte header
//! (version, type, token length, code, message ID), the token, options in
//! ascending number order with delta/length nibbles and 13/14 extension
//! bytes, and an optional `0xFF`-prefixed payload. All multi-byte fields
//! are big-endian.

use core::fmt;

use crate::error::MessageError;
use crate::option::{CoapOption, OptionList, OptionNumber};
use crate::{Code, HEADER_SIZE, MAX_TOKEN_LENGTH, PAYLOAD_MARKER, VERSION};

/// The four CoAP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Confirmable; retransmitted until acknowledged
    Con,
    /// Non-confirmable; fire and forget
    Non,
    /// Acknowledgement of a Con
    Ack,
    /// Reset; rejects a message or cancels an observation
    Rst,
}

impl MessageType {
    /// The 2-bit wire value.
    #[must_use]
    pub const fn wire(self) -> u8 {
        match self {
            MessageType::Con => 0,
            MessageType::Non => 1,
            MessageType::Ack => 2,
            MessageType::Rst => 3,
        }
    }

    /// Decode the 2-bit wire value (only the low two bits are read).
    #[must_use]
    pub const fn from_wire(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Con,
            1 => MessageType::Non,
            2 => MessageType::Ack,
            _ => MessageType::Rst,
        }
    }

    /// True for Con.
    #[must_use]
    pub const fn is_confirmable(self) -> bool {
        matches!(self, MessageType::Con)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Con => "CON",
            MessageType::Non => "NON",
            MessageType::Ack => "ACK",
            MessageType::Rst => "RST",
        };
        f.write_str(name)
    }
}

/// 16-bit message identifier deduplicating retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(pub u16);

impl MessageId {
    /// The identifier following this one, wrapping at 2^16.
    #[must_use]
    pub const fn next(self) -> Self {
        MessageId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Request/response correlation token, 0 to 8 bytes.
///
/// Unused trailing bytes are kept zeroed so equality and hashing work on
/// the derived impls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    bytes: [u8; MAX_TOKEN_LENGTH],
    len: u8,
}

impl Token {
    /// The zero-length token.
    pub const EMPTY: Token = Token {
        bytes: [0; MAX_TOKEN_LENGTH],
        len: 0,
    };

    /// Build a token from raw bytes.
    ///
    /// # Errors
    ///
    /// `BadTokenLength` for slices longer than eight bytes.
    pub fn new(slice: &[u8]) -> Result<Self, MessageError> {
        if slice.len() > MAX_TOKEN_LENGTH {
            return Err(MessageError::BadTokenLength(slice.len() as u8));
        }
        let mut bytes = [0u8; MAX_TOKEN_LENGTH];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Token {
            bytes,
            len: slice.len() as u8,
        })
    }

    /// Shortest token holding `value` big-endian with leading zeros
    /// stripped; zero maps to a single zero byte.
    #[must_use]
    pub fn from_value(value: u64) -> Self {
        let be = value.to_be_bytes();
        let skip = (value.leading_zeros() / 8).min(7) as usize;
        Token::new(&be[skip..]).expect("at most 8 bytes")
    }

    /// The token bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Token length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the zero-length token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl TryFrom<&[u8]> for Token {
    type Error = MessageError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Token::new(slice)
    }
}

/// A decoded CoAP message: everything that is on the wire, nothing that
/// is not. Addressing and request/response direction are endpoint-layer
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Con, Non, Ack or Rst
    pub mtype: MessageType,
    /// Method or response code
    pub code: Code,
    /// Deduplication identifier
    pub mid: MessageId,
    /// Correlation token
    pub token: Token,
    /// Options, ascending by number
    pub options: OptionList,
    /// Payload bytes (no marker)
    pub payload: Vec<u8>,
}

impl Message {
    /// A message with no token, options or payload.
    #[must_use]
    pub fn new(mtype: MessageType, code: Code, mid: MessageId) -> Self {
        Message {
            mtype,
            code,
            mid,
            token: Token::EMPTY,
            options: OptionList::new(),
            payload: Vec::new(),
        }
    }

    /// The empty ACK for a received Con.
    #[must_use]
    pub fn ack_for(mid: MessageId) -> Self {
        Message::new(MessageType::Ack, Code::EMPTY, mid)
    }

    /// The RST rejecting a received message.
    #[must_use]
    pub fn rst_for(mid: MessageId) -> Self {
        Message::new(MessageType::Rst, Code::EMPTY, mid)
    }

    /// Serialize to the wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            HEADER_SIZE + self.token.len() + 16 + self.payload.len(),
        );
        buf.push(VERSION << 6 | self.mtype.wire() << 4 | self.token.len() as u8);
        buf.push(self.code.as_u8());
        buf.extend_from_slice(&self.mid.0.to_be_bytes());
        buf.extend_from_slice(self.token.as_slice());

        encode_options(&self.options, &mut buf);

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        buf
    }

    /// Parse a datagram.
    ///
    /// # Errors
    ///
    /// A [`MessageError`] naming the first violation: wrong version,
    /// reserved token length, truncated token or option, reserved nibble,
    /// a payload marker with nothing behind it, or a non-empty 0.00
    /// message.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < HEADER_SIZE {
            return Err(MessageError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let version = data[0] >> 6;
        if version != VERSION {
            return Err(MessageError::BadVersion(version));
        }
        let mtype = MessageType::from_wire(data[0] >> 4);
        let tkl = (data[0] & 0x0F) as usize;
        if tkl > MAX_TOKEN_LENGTH {
            return Err(MessageError::BadTokenLength(tkl as u8));
        }
        let code = Code::from_u8(data[1]);
        let mid = MessageId(u16::from_be_bytes([data[2], data[3]]));

        if code.is_empty() && data.len() > HEADER_SIZE {
            return Err(MessageError::NonEmptyEmptyMessage);
        }
        if code.is_empty() && tkl != 0 {
            return Err(MessageError::NonEmptyEmptyMessage);
        }

        if data.len() < HEADER_SIZE + tkl {
            return Err(MessageError::TruncatedToken);
        }
        let token = Token::new(&data[HEADER_SIZE..HEADER_SIZE + tkl])?;

        let (options, payload) = decode_options(&data[HEADER_SIZE + tkl..])?;

        Ok(Message {
            mtype,
            code,
            mid,
            token,
            options,
            payload,
        })
    }
}

/// Append the delta/length-encoded options to `buf`.
fn encode_options(options: &OptionList, buf: &mut Vec<u8>) {
    let mut previous = 0u16;
    for opt in options.iter() {
        let delta = opt.number.0 - previous;
        previous = opt.number.0;

        let (delta_nibble, delta_ext) = nibble_parts(delta);
        let (len_nibble, len_ext) = nibble_parts(opt.value.len() as u16);

        buf.push(delta_nibble << 4 | len_nibble);
        extend_ext(buf, delta_ext);
        extend_ext(buf, len_ext);
        buf.extend_from_slice(&opt.value);
    }
}

/// Split a delta or length into its header nibble and extension bytes.
fn nibble_parts(value: u16) -> (u8, Option<ExtBytes>) {
    match value {
        0..=12 => (value as u8, None),
        13..=268 => (13, Some(ExtBytes::One((value - 13) as u8))),
        _ => (14, Some(ExtBytes::Two((value - 269).to_be_bytes()))),
    }
}

enum ExtBytes {
    One(u8),
    Two([u8; 2]),
}

fn extend_ext(buf: &mut Vec<u8>, ext: Option<ExtBytes>) {
    match ext {
        Some(ExtBytes::One(b)) => buf.push(b),
        Some(ExtBytes::Two(bs)) => buf.extend_from_slice(&bs),
        None => {}
    }
}

/// Parse the option block and payload of a message body.
fn decode_options(mut data: &[u8]) -> Result<(OptionList, Vec<u8>), MessageError> {
    let mut opts: Vec<CoapOption> = Vec::new();
    let mut number = 0u32;

    while let Some((&head, rest)) = data.split_first() {
        if head == PAYLOAD_MARKER {
            if rest.is_empty() {
                return Err(MessageError::MarkerWithoutPayload);
            }
            return Ok((opts.into_iter().collect(), rest.to_vec()));
        }

        data = rest;
        let delta = decode_ext(head >> 4, &mut data)?;
        let length = decode_ext(head & 0x0F, &mut data)? as usize;

        number += u32::from(delta);
        if number > u32::from(u16::MAX) {
            return Err(MessageError::OptionNumberOverflow);
        }
        if data.len() < length {
            return Err(MessageError::TruncatedOption);
        }
        let (value, rest) = data.split_at(length);
        opts.push(CoapOption::new(
            OptionNumber(number as u16),
            value.to_vec(),
        ));
        data = rest;
    }

    Ok((opts.into_iter().collect(), Vec::new()))
}

/// Resolve a delta or length nibble, consuming extension bytes.
fn decode_ext(nibble: u8, data: &mut &[u8]) -> Result<u16, MessageError> {
    match nibble {
        0..=12 => Ok(u16::from(nibble)),
        13 => {
            let (&ext, rest) = data
                .split_first()
                .ok_or(MessageError::TruncatedOption)?;
            *data = rest;
            Ok(u16::from(ext) + 13)
        }
        14 => {
            if data.len() < 2 {
                return Err(MessageError::TruncatedOption);
            }
            let value = u16::from_be_bytes([data[0], data[1]]);
            *data = &data[2..];
            value
                .checked_add(269)
                .ok_or(MessageError::OptionNumberOverflow)
        }
        _ => Err(MessageError::ReservedOptionNibble),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::encode_uint;

    fn sample_get() -> Message {
        let mut msg = Message::new(MessageType::Con, Code::GET, MessageId(0x1234));
        msg.token = Token::new(&[0xAB, 0xCD]).unwrap();
        msg.options.set_uri_path("/hello/world");
        msg
    }

    #[test]
    fn test_encode_header() {
        let msg = sample_get();
        let bytes = msg.encode();
        // version 1, type CON, tkl 2
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
        assert_eq!(&bytes[4..6], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_roundtrip_basic() {
        let mut msg = sample_get();
        msg.payload = b"payload".to_vec();
        msg.options.set_uint(OptionNumber::CONTENT_FORMAT, 0);

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roundtrip_no_payload_no_marker() {
        let msg = sample_get();
        let bytes = msg.encode();
        assert!(!bytes.contains(&PAYLOAD_MARKER));
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_known_wire_form() {
        // GET coap://.../hello, token 0x20, mid 0x0001
        let mut msg = Message::new(MessageType::Con, Code::GET, MessageId(1));
        msg.token = Token::new(&[0x20]).unwrap();
        msg.options.set_uri_path("/hello");
        assert_eq!(
            msg.encode(),
            vec![0x41, 0x01, 0x00, 0x01, 0x20, 0xB5, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn test_option_extension_encodings() {
        let mut msg = Message::new(MessageType::Non, Code::POST, MessageId(7));
        // delta 13..268 takes a 1-byte extension: Echo is 252
        msg.options.add(OptionNumber::ECHO, vec![1, 2, 3, 4]);
        // delta > 268 takes a 2-byte extension
        msg.options.add(OptionNumber(64999), vec![9]);
        // long value takes a length extension
        msg.options
            .add(OptionNumber::URI_PATH, vec![b'a'; 200]);

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            Message::decode(&[0x40, 0x01]),
            Err(MessageError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_bad_version() {
        let err = Message::decode(&[0x80, 0x01, 0, 0]).unwrap_err();
        assert_eq!(err, MessageError::BadVersion(2));
    }

    #[test]
    fn test_decode_bad_token_length() {
        // tkl 9
        let err = Message::decode(&[0x49, 0x01, 0, 0]).unwrap_err();
        assert_eq!(err, MessageError::BadTokenLength(9));
    }

    #[test]
    fn test_decode_truncated_token() {
        let err = Message::decode(&[0x42, 0x01, 0, 0, 0xAB]).unwrap_err();
        assert_eq!(err, MessageError::TruncatedToken);
    }

    #[test]
    fn test_decode_reserved_nibble() {
        // option header 0xF0: delta nibble 15 without payload marker
        let err = Message::decode(&[0x40, 0x01, 0, 0, 0xF0]).unwrap_err();
        assert_eq!(err, MessageError::ReservedOptionNibble);
        // length nibble 15
        let err = Message::decode(&[0x40, 0x01, 0, 0, 0x1F]).unwrap_err();
        assert_eq!(err, MessageError::ReservedOptionNibble);
    }

    #[test]
    fn test_decode_marker_without_payload() {
        let err = Message::decode(&[0x40, 0x01, 0, 0, 0xFF]).unwrap_err();
        assert_eq!(err, MessageError::MarkerWithoutPayload);
    }

    #[test]
    fn test_decode_truncated_option_value() {
        // option with declared length 5, only 2 bytes present
        let err = Message::decode(&[0x40, 0x01, 0, 0, 0x15, 1, 2]).unwrap_err();
        assert_eq!(err, MessageError::TruncatedOption);
    }

    #[test]
    fn test_decode_truncated_extension() {
        // delta nibble 13 but no extension byte
        let err = Message::decode(&[0x40, 0x01, 0, 0, 0xD0]).unwrap_err();
        assert_eq!(err, MessageError::TruncatedOption);
    }

    #[test]
    fn test_decode_empty_message() {
        // plain ping: header only
        let ping = Message::decode(&[0x40, 0x00, 0x12, 0x34]).unwrap();
        assert!(ping.code.is_empty());
        assert_eq!(ping.mid, MessageId(0x1234));

        // empty code with a token is malformed
        let err = Message::decode(&[0x41, 0x00, 0, 0, 0xAA]).unwrap_err();
        assert_eq!(err, MessageError::NonEmptyEmptyMessage);
    }

    #[test]
    fn test_token_helpers() {
        assert_eq!(Token::EMPTY.len(), 0);
        assert!(Token::new(&[0; 9]).is_err());
        assert_eq!(Token::from_value(0).as_slice(), &[0]);
        assert_eq!(Token::from_value(0x0102).as_slice(), &[1, 2]);
        assert_eq!(Token::from_value(u64::MAX).len(), 8);
        assert_eq!(Token::new(&[1, 2]).unwrap().to_string(), "0102");
    }

    #[test]
    fn test_message_type_wire() {
        for mtype in [
            MessageType::Con,
            MessageType::Non,
            MessageType::Ack,
            MessageType::Rst,
        ] {
            assert_eq!(MessageType::from_wire(mtype.wire()), mtype);
        }
    }

    #[test]
    fn test_observe_option_roundtrip() {
        let mut msg = Message::new(MessageType::Con, Code::GET, MessageId(9));
        msg.token = Token::new(&[1]).unwrap();
        msg.options.set_uint(OptionNumber::OBSERVE, 0);
        msg.options.set_uri_path("/sensor");

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(
            decoded.options.get_uint(OptionNumber::OBSERVE).unwrap(),
            Some(0)
        );
        // Observe 0 is the canonical empty value
        assert_eq!(encode_uint(0), Vec::<u8>::new());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_message() -> impl Strategy<Value = Message> {
            (
                prop::sample::select(vec![
                    MessageType::Con,
                    MessageType::Non,
                    MessageType::Ack,
                    MessageType::Rst,
                ]),
                1u8..=255, // non-empty codes only; 0.00 carries nothing
                any::<u16>(),
                prop::collection::vec(any::<u8>(), 0..=8),
                prop::collection::vec(
                    (1u16..1000, prop::collection::vec(any::<u8>(), 0..32)),
                    0..8,
                ),
                prop::collection::vec(any::<u8>(), 0..256),
            )
                .prop_map(|(mtype, code, mid, token, options, payload)| {
                    let mut msg = Message::new(mtype, Code::from_u8(code), MessageId(mid));
                    msg.token = Token::new(&token).unwrap();
                    for (number, value) in options {
                        msg.options.add(OptionNumber(number), value);
                    }
                    msg.payload = payload;
                    msg
                })
        }

        proptest! {
            #[test]
            fn prop_roundtrip(msg in arb_message()) {
                let decoded = Message::decode(&msg.encode()).unwrap();
                prop_assert_eq!(decoded, msg);
            }

            #[test]
            fn prop_decode_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..1500)) {
                let _ = Message::decode(&data);
            }

            #[test]
            fn prop_reencode_identity(data in prop::collection::vec(any::<u8>(), 4..256)) {
                // decode(encode(decode(b))) must agree with decode(b)
                if let Ok(msg) = Message::decode(&data) {
                    let reencoded = msg.encode();
                    prop_assert_eq!(Message::decode(&reencoded).unwrap(), msg);
                }
            }

            #[test]
            fn prop_options_sorted(msg in arb_message()) {
                let bytes = msg.encode();
                let decoded = Message::decode(&bytes).unwrap();
                let numbers: Vec<u16> = decoded.options.iter().map(|o| o.number.0).collect();
                let mut sorted = numbers.clone();
                sorted.sort_unstable();
                prop_assert_eq!(numbers, sorted);
            }
        }
    }
}

//! CoAP options: numbers, classification bits, the known-option registry
//! and ordered option lists.
//!
//! Option numbers carry their processing rules in their bit pattern
//! (RFC 7252 §5.4.6): bit 0 marks an option critical, bit 1 unsafe to
//! forward, and the pattern `0b11100` in bits 1..=4 marks it as not part
//! of a proxy cache key. The registry table adds per-number value format
//! and length bounds.

use core::fmt;

use crate::error::MessageError;

pub mod block;

/// A CoAP option number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    /// If-Match
    pub const IF_MATCH: OptionNumber = OptionNumber(1);
    /// Uri-Host
    pub const URI_HOST: OptionNumber = OptionNumber(3);
    /// ETag
    pub const ETAG: OptionNumber = OptionNumber(4);
    /// If-None-Match
    pub const IF_NONE_MATCH: OptionNumber = OptionNumber(5);
    /// Observe (RFC 7641)
    pub const OBSERVE: OptionNumber = OptionNumber(6);
    /// Uri-Port
    pub const URI_PORT: OptionNumber = OptionNumber(7);
    /// Location-Path
    pub const LOCATION_PATH: OptionNumber = OptionNumber(8);
    /// OSCORE (RFC 8613)
    pub const OSCORE: OptionNumber = OptionNumber(9);
    /// Uri-Path
    pub const URI_PATH: OptionNumber = OptionNumber(11);
    /// Content-Format
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);
    /// Max-Age
    pub const MAX_AGE: OptionNumber = OptionNumber(14);
    /// Uri-Query
    pub const URI_QUERY: OptionNumber = OptionNumber(15);
    /// Hop-Limit (RFC 8768)
    pub const HOP_LIMIT: OptionNumber = OptionNumber(16);
    /// Accept
    pub const ACCEPT: OptionNumber = OptionNumber(17);
    /// Location-Query
    pub const LOCATION_QUERY: OptionNumber = OptionNumber(20);
    /// Block2 (RFC 7959)
    pub const BLOCK2: OptionNumber = OptionNumber(23);
    /// Block1 (RFC 7959)
    pub const BLOCK1: OptionNumber = OptionNumber(27);
    /// Size2 (RFC 7959)
    pub const SIZE2: OptionNumber = OptionNumber(28);
    /// Proxy-Uri
    pub const PROXY_URI: OptionNumber = OptionNumber(35);
    /// Proxy-Scheme
    pub const PROXY_SCHEME: OptionNumber = OptionNumber(39);
    /// Size1
    pub const SIZE1: OptionNumber = OptionNumber(60);
    /// Echo (RFC 9175)
    pub const ECHO: OptionNumber = OptionNumber(252);
    /// No-Response (RFC 7967)
    pub const NO_RESPONSE: OptionNumber = OptionNumber(258);

    /// Critical options must be understood by the receiver; elective
    /// options may be ignored.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Unsafe options must not be forwarded unrecognized by a proxy.
    #[must_use]
    pub const fn is_unsafe_to_forward(self) -> bool {
        self.0 & 0x02 != 0
    }

    /// Options excluded from a proxy's cache key.
    #[must_use]
    pub const fn is_no_cache_key(self) -> bool {
        self.0 & 0x1E == 0x1C
    }

    /// The value format for this number, [`OptionFormat::Opaque`] when
    /// unknown.
    #[must_use]
    pub fn format(self) -> OptionFormat {
        self.registry_entry()
            .map_or(OptionFormat::Opaque, |e| e.format)
    }

    /// Whether this number may appear more than once in a message.
    /// Unknown options are treated as repeatable.
    #[must_use]
    pub fn is_repeatable(self) -> bool {
        self.registry_entry().map_or(true, |e| e.repeatable)
    }

    /// Inclusive value length bounds, `(0, 1034)` for unknown numbers.
    #[must_use]
    pub fn length_bounds(self) -> (usize, usize) {
        self.registry_entry().map_or((0, 1034), |e| (e.min, e.max))
    }

    /// The registered name, if any.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        self.registry_entry().map(|e| e.name)
    }

    fn registry_entry(self) -> Option<&'static RegistryEntry> {
        REGISTRY.iter().find(|e| e.number == self.0)
    }
}

impl fmt::Display for OptionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "option {}", self.0),
        }
    }
}

impl From<u16> for OptionNumber {
    fn from(n: u16) -> Self {
        OptionNumber(n)
    }
}

/// Value formats an option can declare in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFormat {
    /// Zero-length value
    Empty,
    /// Raw bytes
    Opaque,
    /// Variable-length unsigned integer, no leading zero bytes
    Uint,
    /// UTF-8 text
    String,
}

struct RegistryEntry {
    number: u16,
    name: &'static str,
    format: OptionFormat,
    min: usize,
    max: usize,
    repeatable: bool,
}

macro_rules! entry {
    ($num:expr, $name:literal, $fmt:ident, $min:expr, $max:expr, $rep:expr) => {
        RegistryEntry {
            number: $num,
            name: $name,
            format: OptionFormat::$fmt,
            min: $min,
            max: $max,
            repeatable: $rep,
        }
    };
}

static REGISTRY: &[RegistryEntry] = &[
    entry!(1, "If-Match", Opaque, 0, 8, true),
    entry!(3, "Uri-Host", String, 1, 255, false),
    entry!(4, "ETag", Opaque, 1, 8, true),
    entry!(5, "If-None-Match", Empty, 0, 0, false),
    entry!(6, "Observe", Uint, 0, 3, false),
    entry!(7, "Uri-Port", Uint, 0, 2, false),
    entry!(8, "Location-Path", String, 0, 255, true),
    entry!(9, "OSCORE", Opaque, 0, 255, false),
    entry!(11, "Uri-Path", String, 0, 255, true),
    entry!(12, "Content-Format", Uint, 0, 2, false),
    entry!(14, "Max-Age", Uint, 0, 4, false),
    entry!(15, "Uri-Query", String, 0, 255, true),
    entry!(16, "Hop-Limit", Uint, 1, 1, false),
    entry!(17, "Accept", Uint, 0, 2, false),
    entry!(20, "Location-Query", String, 0, 255, true),
    entry!(23, "Block2", Uint, 0, 3, false),
    entry!(27, "Block1", Uint, 0, 3, false),
    entry!(28, "Size2", Uint, 0, 4, false),
    entry!(35, "Proxy-Uri", String, 1, 1034, false),
    entry!(39, "Proxy-Scheme", String, 1, 255, false),
    entry!(60, "Size1", Uint, 0, 4, false),
    entry!(252, "Echo", Opaque, 1, 40, false),
    entry!(258, "No-Response", Uint, 0, 1, false),
];

/// A single option instance: number plus raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// The option number
    pub number: OptionNumber,
    /// The raw value
    pub value: Vec<u8>,
}

impl CoapOption {
    /// Build an option from number and raw value.
    #[must_use]
    pub fn new(number: OptionNumber, value: Vec<u8>) -> Self {
        CoapOption { number, value }
    }

    /// Decode the value as a canonical variable-length uint.
    ///
    /// # Errors
    ///
    /// `NonCanonicalUint` on leading zero bytes or values longer than
    /// eight bytes.
    pub fn uint_value(&self) -> Result<u64, MessageError> {
        decode_uint(&self.value)
    }
}

/// Encode a uint option value in canonical form (minimal big-endian,
/// zero encodes as the empty string).
#[must_use]
pub fn encode_uint(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    let mut started = false;
    for shift in (0..8).rev() {
        let byte = (value >> (shift * 8)) as u8;
        if started || byte != 0 {
            out.push(byte);
            started = true;
        }
    }
    out
}

/// Decode a canonical uint option value.
///
/// # Errors
///
/// `NonCanonicalUint` on leading zeros or more than eight bytes.
pub fn decode_uint(bytes: &[u8]) -> Result<u64, MessageError> {
    if bytes.len() > 8 || (!bytes.is_empty() && bytes[0] == 0) {
        return Err(MessageError::NonCanonicalUint);
    }
    Ok(bytes.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b)))
}

/// An ordered collection of options.
///
/// Iteration order is ascending by option number, which is also the wire
/// order; options sharing a number keep their insertion order, preserving
/// the sequence of repeatable options like Uri-Path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionList {
    // Sorted by number; stable among equal numbers.
    opts: Vec<CoapOption>,
}

impl OptionList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of option instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.opts.len()
    }

    /// True when no options are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opts.is_empty()
    }

    /// Append an option, keeping the list number-sorted. An existing run
    /// of the same number keeps its order; the new instance goes last in
    /// the run.
    pub fn add(&mut self, number: OptionNumber, value: impl Into<Vec<u8>>) {
        let pos = self.opts.partition_point(|o| o.number <= number);
        self.opts.insert(pos, CoapOption::new(number, value.into()));
    }

    /// Replace all instances of `number` with a single value.
    pub fn set(&mut self, number: OptionNumber, value: impl Into<Vec<u8>>) {
        self.remove(number);
        self.add(number, value);
    }

    /// Set a uint option in canonical encoding.
    pub fn set_uint(&mut self, number: OptionNumber, value: u64) {
        self.set(number, encode_uint(value));
    }

    /// Remove every instance of `number`.
    pub fn remove(&mut self, number: OptionNumber) {
        self.opts.retain(|o| o.number != number);
    }

    /// First instance of `number`, if present.
    #[must_use]
    pub fn get_first(&self, number: OptionNumber) -> Option<&CoapOption> {
        self.opts.iter().find(|o| o.number == number)
    }

    /// Decoded uint value of the first instance of `number`.
    ///
    /// # Errors
    ///
    /// `NonCanonicalUint` if the value has leading zeros; `Ok(None)` when
    /// the option is absent.
    pub fn get_uint(&self, number: OptionNumber) -> Result<Option<u64>, MessageError> {
        self.get_first(number).map(CoapOption::uint_value).transpose()
    }

    /// All instances of `number`, in insertion order.
    pub fn get_all(&self, number: OptionNumber) -> impl Iterator<Item = &CoapOption> {
        self.opts.iter().filter(move |o| o.number == number)
    }

    /// All options, ascending by number.
    pub fn iter(&self) -> impl Iterator<Item = &CoapOption> {
        self.opts.iter()
    }

    /// Drain all options out of the list, ascending by number.
    pub fn drain(&mut self) -> impl Iterator<Item = CoapOption> + '_ {
        self.opts.drain(..)
    }

    /// Split the URI path into Uri-Path options. A leading `/` is
    /// ignored; `"/"` and `""` produce no options.
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove(OptionNumber::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// The Uri-Path segments as lossily decoded strings.
    #[must_use]
    pub fn uri_path(&self) -> Vec<String> {
        self.get_all(OptionNumber::URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect()
    }

    /// The Uri-Query entries as lossily decoded strings.
    #[must_use]
    pub fn uri_query(&self) -> Vec<String> {
        self.get_all(OptionNumber::URI_QUERY)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect()
    }

    /// Critical options in this list the caller does not recognize.
    ///
    /// `known` is the set of numbers the caller handles itself; registry
    /// membership is not enough, processing the message must actually
    /// honor the option.
    pub fn unknown_critical<'a>(
        &'a self,
        known: &'a [OptionNumber],
    ) -> impl Iterator<Item = OptionNumber> + 'a {
        self.opts
            .iter()
            .map(|o| o.number)
            .filter(move |n| n.is_critical() && !known.contains(n))
    }

    /// Validate the value lengths of all registered options.
    ///
    /// # Errors
    ///
    /// `OptionLength` naming the first offending option.
    pub fn validate_lengths(&self) -> Result<(), MessageError> {
        for opt in &self.opts {
            if opt.number.name().is_none() {
                continue;
            }
            let (min, max) = opt.number.length_bounds();
            if opt.value.len() < min || opt.value.len() > max {
                return Err(MessageError::OptionLength {
                    number: opt.number.0,
                    length: opt.value.len(),
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl FromIterator<CoapOption> for OptionList {
    fn from_iter<T: IntoIterator<Item = CoapOption>>(iter: T) -> Self {
        let mut list = OptionList::new();
        for opt in iter {
            list.add(opt.number, opt.value);
        }
        list
    }
}

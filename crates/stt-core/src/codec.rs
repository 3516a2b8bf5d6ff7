//! Varint and typed-value codec for headers and metadata blobs.
//!
//! Varints are unsigned little-endian base-128: seven value bits per byte,
//! least-significant group first, continuation bit in the MSB. The typed
//! value codec carries structured payloads (handshake messages, control
//! frames) as tagged values.
//!
//! Both codecs are canonical: every value has exactly one encoding, the
//! decoder rejects non-minimal forms, unsorted map keys, and trailing
//! garbage, so encoded byte equality corresponds to logical equality.

use thiserror::Error;

/// Maximum encoded varint length (10 bytes covers all of u64)
pub const MAX_VARINT_LEN: usize = 10;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended inside a value
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// Varint ran past its 10-byte maximum
    #[error("varint longer than {MAX_VARINT_LEN} bytes")]
    VarintTooLong,

    /// Varint encoded with unnecessary continuation bytes
    #[error("non-canonical varint encoding")]
    NonCanonicalVarint,

    /// Unknown value tag byte
    #[error("invalid value tag: 0x{0:02X}")]
    InvalidTag(u8),

    /// Integer encoded wider than its minimal width
    #[error("non-canonical integer width")]
    NonCanonicalInt,

    /// String payload is not valid UTF-8
    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    /// Map keys not in sorted encoded order
    #[error("map keys not sorted")]
    UnsortedMapKeys,

    /// Two map entries share an encoded key
    #[error("duplicate map key")]
    DuplicateMapKey,

    /// Bytes remain after a complete value
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// A declared length exceeds the remaining input
    #[error("declared length exceeds remaining input")]
    LengthOverrun,

    /// A required map field is absent
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A map field has the wrong type or shape
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Append the varint encoding of `value` to `out`
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `encode_varint` produces for `value`
#[must_use]
pub fn varint_len(value: u64) -> usize {
    let mut v = value;
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Decode a varint from the front of `input`.
///
/// Returns `(value, bytes_consumed)`.
///
/// # Errors
///
/// Returns `CodecError::UnexpectedEnd` if the input ends inside the varint,
/// `CodecError::VarintTooLong` past 10 bytes, and
/// `CodecError::NonCanonicalVarint` for a padded encoding.
pub fn decode_varint(input: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    for (i, &byte) in input.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(CodecError::VarintTooLong);
        }
        let group = u64::from(byte & 0x7F);
        // The 10th byte may only carry the single remaining bit of a u64.
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return Err(CodecError::VarintTooLong);
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(CodecError::NonCanonicalVarint);
            }
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::UnexpectedEnd)
}

mod tag {
    pub const NULL: u8 = 0x00;
    pub const FALSE: u8 = 0x01;
    pub const TRUE: u8 = 0x02;
    pub const I8: u8 = 0x03;
    pub const I16: u8 = 0x04;
    pub const I32: u8 = 0x05;
    pub const I64: u8 = 0x06;
    pub const F32: u8 = 0x07;
    pub const F64: u8 = 0x08;
    pub const BYTES: u8 = 0x09;
    pub const STR: u8 = 0x0A;
    pub const LIST: u8 = 0x0B;
    pub const MAP: u8 = 0x0C;
}

/// A typed wire value.
///
/// Maps compare as key-sorted sets: two maps holding the same entries are
/// equal regardless of construction order, matching the fact that they
/// serialize to the same bytes. Floats compare by bit pattern.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absence of a value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer, encoded at minimal width (1/2/4/8 bytes)
    Int(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Byte string, varint length prefix
    Bytes(Vec<u8>),
    /// UTF-8 string, varint length prefix
    Str(String),
    /// List, varint count prefix
    List(Vec<Value>),
    /// Map, varint count prefix; serialized with keys in sorted encoded order
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Shorthand for a string value
    #[must_use]
    pub fn str(s: &str) -> Self {
        Value::Str(s.to_string())
    }

    /// Shorthand for a byte-string value
    #[must_use]
    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }

    /// Integer payload, if this is an `Int`
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte payload, if this is a `Bytes`
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// String payload, if this is a `Str`
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a string-keyed entry, if this is a `Map`
    #[must_use]
    pub fn map_get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find_map(|(k, v)| match k {
                Value::Str(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Encode this value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::DuplicateMapKey` if a map contains two entries
    /// with the same key.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Value::Null => out.push(tag::NULL),
            Value::Bool(false) => out.push(tag::FALSE),
            Value::Bool(true) => out.push(tag::TRUE),
            Value::Int(v) => encode_int(*v, out),
            Value::F32(v) => {
                out.push(tag::F32);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::F64(v) => {
                out.push(tag::F64);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Bytes(b) => {
                out.push(tag::BYTES);
                encode_varint(b.len() as u64, out);
                out.extend_from_slice(b);
            }
            Value::Str(s) => {
                out.push(tag::STR);
                encode_varint(s.len() as u64, out);
                out.extend_from_slice(s.as_bytes());
            }
            Value::List(items) => {
                out.push(tag::LIST);
                encode_varint(items.len() as u64, out);
                for item in items {
                    item.encode_into(out)?;
                }
            }
            Value::Map(entries) => {
                let mut encoded: Vec<(Vec<u8>, &Value)> = entries
                    .iter()
                    .map(|(k, v)| Ok((k.encode()?, v)))
                    .collect::<Result<_, CodecError>>()?;
                encoded.sort_by(|a, b| a.0.cmp(&b.0));
                for pair in encoded.windows(2) {
                    if pair[0].0 == pair[1].0 {
                        return Err(CodecError::DuplicateMapKey);
                    }
                }

                out.push(tag::MAP);
                encode_varint(encoded.len() as u64, out);
                for (key_bytes, value) in encoded {
                    out.extend_from_slice(&key_bytes);
                    value.encode_into(out)?;
                }
            }
        }
        Ok(())
    }

    /// Decode a value, rejecting trailing garbage.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` for any malformed, non-canonical, or
    /// incompletely consumed input.
    pub fn decode(input: &[u8]) -> Result<Value, CodecError> {
        let (value, consumed) = Self::decode_from(input)?;
        if consumed != input.len() {
            return Err(CodecError::TrailingBytes(input.len() - consumed));
        }
        Ok(value)
    }

    /// Decode a value from the front of `input`, returning `(value, consumed)`.
    ///
    /// # Errors
    ///
    /// See [`Self::decode`]; trailing bytes are left for the caller here.
    pub fn decode_from(input: &[u8]) -> Result<(Value, usize), CodecError> {
        let (&tag_byte, rest) = input.split_first().ok_or(CodecError::UnexpectedEnd)?;
        let (value, used) = match tag_byte {
            tag::NULL => (Value::Null, 0),
            tag::FALSE => (Value::Bool(false), 0),
            tag::TRUE => (Value::Bool(true), 0),
            tag::I8 | tag::I16 | tag::I32 | tag::I64 => decode_int(tag_byte, rest)?,
            tag::F32 => {
                let bytes: [u8; 4] = rest
                    .get(..4)
                    .ok_or(CodecError::UnexpectedEnd)?
                    .try_into()
                    .expect("slice length checked");
                (Value::F32(f32::from_le_bytes(bytes)), 4)
            }
            tag::F64 => {
                let bytes: [u8; 8] = rest
                    .get(..8)
                    .ok_or(CodecError::UnexpectedEnd)?
                    .try_into()
                    .expect("slice length checked");
                (Value::F64(f64::from_le_bytes(bytes)), 8)
            }
            tag::BYTES => {
                let (len, prefix) = decode_varint(rest)?;
                let len = usize::try_from(len).map_err(|_| CodecError::LengthOverrun)?;
                let end = prefix.checked_add(len).ok_or(CodecError::LengthOverrun)?;
                let data = rest.get(prefix..end).ok_or(CodecError::LengthOverrun)?;
                (Value::Bytes(data.to_vec()), end)
            }
            tag::STR => {
                let (len, prefix) = decode_varint(rest)?;
                let len = usize::try_from(len).map_err(|_| CodecError::LengthOverrun)?;
                let end = prefix.checked_add(len).ok_or(CodecError::LengthOverrun)?;
                let data = rest.get(prefix..end).ok_or(CodecError::LengthOverrun)?;
                let s = std::str::from_utf8(data).map_err(|_| CodecError::InvalidUtf8)?;
                (Value::Str(s.to_string()), end)
            }
            tag::LIST => {
                let (count, prefix) = decode_varint(rest)?;
                let mut offset = prefix;
                let mut items = Vec::new();
                for _ in 0..count {
                    let (item, used) =
                        Self::decode_from(rest.get(offset..).ok_or(CodecError::UnexpectedEnd)?)?;
                    items.push(item);
                    offset += used;
                }
                (Value::List(items), offset)
            }
            tag::MAP => {
                let (count, prefix) = decode_varint(rest)?;
                let mut offset = prefix;
                let mut entries = Vec::new();
                let mut prev_key: Option<std::ops::Range<usize>> = None;
                for _ in 0..count {
                    let key_start = offset;
                    let (key, used) =
                        Self::decode_from(rest.get(offset..).ok_or(CodecError::UnexpectedEnd)?)?;
                    offset += used;
                    let key_range = key_start..offset;

                    if let Some(prev) = prev_key {
                        match rest[prev].cmp(&rest[key_range.clone()]) {
                            std::cmp::Ordering::Less => {}
                            std::cmp::Ordering::Equal => return Err(CodecError::DuplicateMapKey),
                            std::cmp::Ordering::Greater => {
                                return Err(CodecError::UnsortedMapKeys);
                            }
                        }
                    }
                    prev_key = Some(key_range);

                    let (value, used) =
                        Self::decode_from(rest.get(offset..).ok_or(CodecError::UnexpectedEnd)?)?;
                    offset += used;
                    entries.push((key, value));
                }
                (Value::Map(entries), offset)
            }
            other => return Err(CodecError::InvalidTag(other)),
        };
        Ok((value, 1 + used))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let normalize = |entries: &[(Value, Value)]| {
                    let mut sorted: Vec<(Vec<u8>, Vec<u8>)> = entries
                        .iter()
                        .map(|(k, v)| {
                            (
                                k.encode().unwrap_or_default(),
                                v.encode().unwrap_or_default(),
                            )
                        })
                        .collect();
                    sorted.sort();
                    sorted
                };
                normalize(a) == normalize(b)
            }
            _ => false,
        }
    }
}

fn encode_int(v: i64, out: &mut Vec<u8>) {
    if let Ok(v) = i8::try_from(v) {
        out.push(tag::I8);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i16::try_from(v) {
        out.push(tag::I16);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i32::try_from(v) {
        out.push(tag::I32);
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.push(tag::I64);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn decode_int(tag_byte: u8, rest: &[u8]) -> Result<(Value, usize), CodecError> {
    let (value, width) = match tag_byte {
        tag::I8 => {
            let bytes: [u8; 1] = rest
                .get(..1)
                .ok_or(CodecError::UnexpectedEnd)?
                .try_into()
                .expect("slice length checked");
            (i64::from(i8::from_le_bytes(bytes)), 1)
        }
        tag::I16 => {
            let bytes: [u8; 2] = rest
                .get(..2)
                .ok_or(CodecError::UnexpectedEnd)?
                .try_into()
                .expect("slice length checked");
            let v = i16::from_le_bytes(bytes);
            if i8::try_from(v).is_ok() {
                return Err(CodecError::NonCanonicalInt);
            }
            (i64::from(v), 2)
        }
        tag::I32 => {
            let bytes: [u8; 4] = rest
                .get(..4)
                .ok_or(CodecError::UnexpectedEnd)?
                .try_into()
                .expect("slice length checked");
            let v = i32::from_le_bytes(bytes);
            if i16::try_from(v).is_ok() {
                return Err(CodecError::NonCanonicalInt);
            }
            (i64::from(v), 4)
        }
        _ => {
            let bytes: [u8; 8] = rest
                .get(..8)
                .ok_or(CodecError::UnexpectedEnd)?
                .try_into()
                .expect("slice length checked");
            let v = i64::from_le_bytes(bytes);
            if i32::try_from(v).is_ok() {
                return Err(CodecError::NonCanonicalInt);
            }
            (v, 8)
        }
    };
    Ok((Value::Int(value), width))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_single_byte_boundary() {
        for value in [0u64, 1, 63, 64, 126, 127] {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(out.len(), 1, "value {value} should encode to 1 byte");
            assert_eq!(decode_varint(&out).unwrap(), (value, 1));
        }
    }

    #[test]
    fn test_varint_two_byte_boundary() {
        for value in [128u64, 129, 255, 256, 8192, 16383] {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(out.len(), 2, "value {value} should encode to 2 bytes");
            assert_eq!(decode_varint(&out).unwrap(), (value, 2));
        }
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        for value in [0u64, 127, 128, 16383, 16384, u64::from(u32::MAX), u64::MAX] {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(out.len(), varint_len(value));
        }
    }

    #[test]
    fn test_varint_max_value() {
        let mut out = Vec::new();
        encode_varint(u64::MAX, &mut out);
        assert_eq!(out.len(), 10);
        assert_eq!(decode_varint(&out).unwrap(), (u64::MAX, 10));
    }

    #[test]
    fn test_varint_truncated() {
        assert_eq!(decode_varint(&[0x80]), Err(CodecError::UnexpectedEnd));
        assert_eq!(decode_varint(&[]), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_varint_too_long() {
        // 11 continuation bytes
        let overlong = [0x80u8; 11];
        assert_eq!(decode_varint(&overlong), Err(CodecError::VarintTooLong));

        // 10 bytes but the last group exceeds the single remaining u64 bit
        let mut too_big = vec![0xFFu8; 9];
        too_big.push(0x02);
        assert_eq!(decode_varint(&too_big), Err(CodecError::VarintTooLong));
    }

    #[test]
    fn test_varint_non_canonical_rejected() {
        // 0 encoded as two bytes
        assert_eq!(
            decode_varint(&[0x80, 0x00]),
            Err(CodecError::NonCanonicalVarint)
        );
        // 1 padded with a zero continuation group
        assert_eq!(
            decode_varint(&[0x81, 0x00]),
            Err(CodecError::NonCanonicalVarint)
        );
    }

    #[test]
    fn test_varint_decode_leaves_remainder() {
        let (value, consumed) = decode_varint(&[0x05, 0xAA, 0xBB]).unwrap();
        assert_eq!(value, 5);
        assert_eq!(consumed, 1);
    }

    fn roundtrip(value: &Value) {
        let bytes = value.encode().unwrap();
        assert_eq!(&Value::decode(&bytes).unwrap(), value, "roundtrip {value:?}");
    }

    #[test]
    fn test_value_scalar_roundtrips() {
        roundtrip(&Value::Null);
        roundtrip(&Value::Bool(false));
        roundtrip(&Value::Bool(true));
        roundtrip(&Value::Int(0));
        roundtrip(&Value::Int(-1));
        roundtrip(&Value::Int(127));
        roundtrip(&Value::Int(128));
        roundtrip(&Value::Int(-32768));
        roundtrip(&Value::Int(i64::from(i32::MAX)));
        roundtrip(&Value::Int(i64::MIN));
        roundtrip(&Value::F32(1.5));
        roundtrip(&Value::F64(-0.25));
    }

    #[test]
    fn test_value_compound_roundtrips() {
        roundtrip(&Value::bytes(b""));
        roundtrip(&Value::bytes(&[0u8; 300]));
        roundtrip(&Value::str("hello"));
        roundtrip(&Value::List(vec![
            Value::Int(1),
            Value::str("two"),
            Value::Null,
        ]));
        roundtrip(&Value::Map(vec![
            (Value::str("a"), Value::Int(1)),
            (Value::str("b"), Value::bytes(b"data")),
        ]));
    }

    #[test]
    fn test_int_minimal_width() {
        assert_eq!(Value::Int(1).encode().unwrap().len(), 2);
        assert_eq!(Value::Int(200).encode().unwrap().len(), 3);
        assert_eq!(Value::Int(70000).encode().unwrap().len(), 5);
        assert_eq!(Value::Int(i64::MAX).encode().unwrap().len(), 9);
    }

    #[test]
    fn test_int_non_canonical_rejected() {
        // 1 encoded as i16
        let wide = [0x04, 0x01, 0x00];
        assert_eq!(Value::decode(&wide), Err(CodecError::NonCanonicalInt));
    }

    #[test]
    fn test_map_keys_sorted_regardless_of_insertion_order() {
        let forward = Value::Map(vec![
            (Value::str("alpha"), Value::Int(1)),
            (Value::str("beta"), Value::Int(2)),
        ]);
        let backward = Value::Map(vec![
            (Value::str("beta"), Value::Int(2)),
            (Value::str("alpha"), Value::Int(1)),
        ]);
        assert_eq!(forward.encode().unwrap(), backward.encode().unwrap());
    }

    #[test]
    fn test_map_duplicate_key_rejected_on_encode() {
        let dup = Value::Map(vec![
            (Value::str("k"), Value::Int(1)),
            (Value::str("k"), Value::Int(2)),
        ]);
        assert_eq!(dup.encode(), Err(CodecError::DuplicateMapKey));
    }

    #[test]
    fn test_map_unsorted_rejected_on_decode() {
        let sorted = Value::Map(vec![
            (Value::str("a"), Value::Int(1)),
            (Value::str("b"), Value::Int(2)),
        ])
        .encode()
        .unwrap();

        // Swap the two entries in the encoded form: entries are
        // (key "a", int 1) then (key "b", int 2), each 3 + 2 bytes.
        let header = &sorted[..2];
        let entry_a = &sorted[2..7];
        let entry_b = &sorted[7..];
        let swapped: Vec<u8> = [header, entry_b, entry_a].concat();
        assert_eq!(Value::decode(&swapped), Err(CodecError::UnsortedMapKeys));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut bytes = Value::Int(5).encode().unwrap();
        bytes.push(0xFF);
        assert_eq!(Value::decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_truncated_payloads_rejected() {
        let bytes = Value::bytes(&[1, 2, 3, 4]).encode().unwrap();
        assert_eq!(
            Value::decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::LengthOverrun)
        );

        let s = Value::str("hello").encode().unwrap();
        assert_eq!(Value::decode(&s[..3]), Err(CodecError::LengthOverrun));
    }

    #[test]
    fn test_invalid_tag() {
        assert_eq!(Value::decode(&[0x7F]), Err(CodecError::InvalidTag(0x7F)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = vec![0x0A];
        encode_varint(2, &mut bytes);
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(Value::decode(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_map_get() {
        let map = Value::Map(vec![
            (Value::str("nonce"), Value::bytes(&[1, 2, 3])),
            (Value::str("timestamp"), Value::Int(42)),
        ]);
        assert_eq!(map.map_get("timestamp").and_then(Value::as_int), Some(42));
        assert_eq!(
            map.map_get("nonce").and_then(Value::as_bytes),
            Some([1u8, 2, 3].as_slice())
        );
        assert!(map.map_get("absent").is_none());
    }

    #[test]
    fn test_deterministic_encoding() {
        let value = Value::Map(vec![
            (Value::str("z"), Value::List(vec![Value::Int(1)])),
            (Value::str("a"), Value::bytes(b"x")),
        ]);
        assert_eq!(value.encode().unwrap(), value.encode().unwrap());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::Int),
                prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
                "[a-z]{0,12}".prop_map(Value::Str),
            ];
            leaf.prop_recursive(3, 32, 8, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                    prop::collection::btree_map("[a-z]{1,6}", inner, 0..4).prop_map(|m| {
                        Value::Map(m.into_iter().map(|(k, v)| (Value::Str(k), v)).collect())
                    }),
                ]
            })
        }

        proptest! {
            #[test]
            fn prop_varint_roundtrip(value in any::<u64>()) {
                let mut out = Vec::new();
                encode_varint(value, &mut out);
                prop_assert_eq!(decode_varint(&out).unwrap(), (value, out.len()));
            }

            #[test]
            fn prop_varint_decode_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..16)) {
                let _ = decode_varint(&data);
            }

            #[test]
            fn prop_value_roundtrip(value in arb_value()) {
                let bytes = value.encode().unwrap();
                prop_assert_eq!(Value::decode(&bytes).unwrap(), value);
            }

            #[test]
            fn prop_encode_decode_encode_is_identity(value in arb_value()) {
                let bytes = value.encode().unwrap();
                let decoded = Value::decode(&bytes).unwrap();
                prop_assert_eq!(decoded.encode().unwrap(), bytes);
            }

            #[test]
            fn prop_value_decode_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = Value::decode(&data);
            }
        }
    }
}

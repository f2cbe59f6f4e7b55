//! Value kinds and their 16-byte slot encoding.
//!
//! A slot is two little-endian 8-byte words: the value word and the extra
//! word. Numeric kinds occupy the low bytes of the value word and leave the
//! rest zero. Text lives in the string pool; its slot carries the payload
//! length in the value word and the pool offset in the extra word.

use crate::core::error::{MmvError, Result};
use crate::core::types::{Semantics, MAX_STRING_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bytes in a value slot's inline area
pub const SLOT_BYTES: usize = 16;

/// Bytes in one string pool block (payload plus NUL)
pub const STRING_BLOCK_BYTES: usize = 256;

/// Wire type tags
pub mod type_tag {
    pub const I32: i32 = 0;
    pub const U32: i32 = 1;
    pub const I64: i32 = 2;
    pub const U64: i32 = 3;
    pub const FLOAT: i32 = 4;
    pub const DOUBLE: i32 = 5;
    pub const STRING: i32 = 6;
}

/// Closed set of value kinds a metric can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Written as an unsigned 32-bit 0 or 1
    Bool,
    Text,
}

impl ValueKind {
    /// Type tag written into the metric descriptor
    pub fn protocol_type(self) -> i32 {
        match self {
            ValueKind::I32 => type_tag::I32,
            ValueKind::U32 | ValueKind::Bool => type_tag::U32,
            ValueKind::I64 => type_tag::I64,
            ValueKind::U64 => type_tag::U64,
            ValueKind::F32 => type_tag::FLOAT,
            ValueKind::F64 => type_tag::DOUBLE,
            ValueKind::Text => type_tag::STRING,
        }
    }

    /// Kind a reader reconstructs from a type tag
    pub fn from_protocol_type(tag: i32) -> Option<Self> {
        match tag {
            type_tag::I32 => Some(ValueKind::I32),
            type_tag::U32 => Some(ValueKind::U32),
            type_tag::I64 => Some(ValueKind::I64),
            type_tag::U64 => Some(ValueKind::U64),
            type_tag::FLOAT => Some(ValueKind::F32),
            type_tag::DOUBLE => Some(ValueKind::F64),
            type_tag::STRING => Some(ValueKind::Text),
            _ => None,
        }
    }

    /// Slot bytes actually used
    pub fn byte_width(self) -> usize {
        match self {
            ValueKind::I32 | ValueKind::U32 | ValueKind::F32 | ValueKind::Bool => 4,
            ValueKind::I64 | ValueKind::U64 | ValueKind::F64 => 8,
            ValueKind::Text => SLOT_BYTES,
        }
    }

    /// True when values live in the string pool
    pub fn needs_overflow_storage(self) -> bool {
        matches!(self, ValueKind::Text)
    }

    /// Lower-case name used in configuration and errors
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::I32 => "i32",
            ValueKind::U32 => "u32",
            ValueKind::I64 => "i64",
            ValueKind::U64 => "u64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::Bool => "bool",
            ValueKind::Text => "text",
        }
    }

    /// Value a freshly laid out slot starts with
    pub fn zero(self) -> MetricValue {
        match self {
            ValueKind::I32 => MetricValue::I32(0),
            ValueKind::U32 => MetricValue::U32(0),
            ValueKind::I64 => MetricValue::I64(0),
            ValueKind::U64 => MetricValue::U64(0),
            ValueKind::F32 => MetricValue::F32(0.0),
            ValueKind::F64 => MetricValue::F64(0.0),
            ValueKind::Bool => MetricValue::Bool(false),
            ValueKind::Text => MetricValue::Text(String::new()),
        }
    }

    /// Rejects kind/semantics pairs the protocol cannot express
    pub fn check_semantics(self, semantics: Semantics) -> Result<()> {
        if self == ValueKind::Text && semantics == Semantics::Counter {
            return Err(MmvError::UnsupportedType("text values cannot be counters".to_string()));
        }
        Ok(())
    }

    /// Decodes a slot of this kind. `string_at` resolves pool offsets.
    pub fn decode<'a, F>(self, slot: &[u8; SLOT_BYTES], string_at: F) -> Result<MetricValue>
    where
        F: FnOnce(u64) -> Option<&'a [u8]>,
    {
        let word = u64::from_le_bytes(slot_word(slot, 0));
        let extra = u64::from_le_bytes(slot_word(slot, 8));
        let value = match self {
            ValueKind::I32 => MetricValue::I32(word as u32 as i32),
            ValueKind::U32 => MetricValue::U32(word as u32),
            ValueKind::I64 => MetricValue::I64(word as i64),
            ValueKind::U64 => MetricValue::U64(word),
            ValueKind::F32 => MetricValue::F32(f32::from_bits(word as u32)),
            ValueKind::F64 => MetricValue::F64(f64::from_bits(word)),
            ValueKind::Bool => MetricValue::Bool(word as u32 != 0),
            ValueKind::Text => {
                let block = string_at(extra)
                    .ok_or_else(|| MmvError::corrupt(format!("string offset {} out of range", extra)))?;
                MetricValue::Text(decode_string_block(block)?)
            },
        };
        Ok(value)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ValueKind {
    type Err = MmvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i32" | "int" | "int32" => Ok(ValueKind::I32),
            "u32" | "uint32" => Ok(ValueKind::U32),
            "i64" | "long" | "int64" => Ok(ValueKind::I64),
            "u64" | "uint64" => Ok(ValueKind::U64),
            "f32" | "float" => Ok(ValueKind::F32),
            "f64" | "double" => Ok(ValueKind::F64),
            "bool" | "boolean" => Ok(ValueKind::Bool),
            "text" | "string" | "str" => Ok(ValueKind::Text),
            other => Err(MmvError::UnsupportedType(other.to_string())),
        }
    }
}

/// Current value of a metric
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    /// Kind of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            MetricValue::I32(_) => ValueKind::I32,
            MetricValue::U32(_) => ValueKind::U32,
            MetricValue::I64(_) => ValueKind::I64,
            MetricValue::U64(_) => ValueKind::U64,
            MetricValue::F32(_) => ValueKind::F32,
            MetricValue::F64(_) => ValueKind::F64,
            MetricValue::Bool(_) => ValueKind::Bool,
            MetricValue::Text(_) => ValueKind::Text,
        }
    }

    /// Fails for payloads that do not fit their storage
    pub fn check_size(&self, name: &str) -> Result<()> {
        if let MetricValue::Text(text) = self {
            if text.len() > MAX_STRING_LEN || text.contains('\0') {
                return Err(MmvError::ValueTooLarge {
                    name: name.to_string(),
                    size: text.len(),
                    limit: MAX_STRING_LEN,
                });
            }
        }
        Ok(())
    }

    /// The two slot words; text is given the pool offset of its block
    pub fn slot_words(&self, text_offset: u64) -> (u64, u64) {
        match self {
            MetricValue::I32(v) => (u64::from(*v as u32), 0),
            MetricValue::U32(v) => (u64::from(*v), 0),
            MetricValue::I64(v) => (*v as u64, 0),
            MetricValue::U64(v) => (*v, 0),
            MetricValue::F32(v) => (u64::from(v.to_bits()), 0),
            MetricValue::F64(v) => (v.to_bits(), 0),
            MetricValue::Bool(v) => (u64::from(*v), 0),
            MetricValue::Text(text) => (text.len() as u64, text_offset),
        }
    }

    /// Encodes into a slot, returning the number of bytes used
    pub fn encode(&self, slot: &mut [u8; SLOT_BYTES], text_offset: u64) -> usize {
        let (word, extra) = self.slot_words(text_offset);
        slot[..8].copy_from_slice(&word.to_le_bytes());
        slot[8..].copy_from_slice(&extra.to_le_bytes());
        self.kind().byte_width()
    }

    /// Text payload, if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetricValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::I32(v) => write!(f, "{}", v),
            MetricValue::U32(v) => write!(f, "{}", v),
            MetricValue::I64(v) => write!(f, "{}", v),
            MetricValue::U64(v) => write!(f, "{}", v),
            MetricValue::F32(v) => write!(f, "{}", v),
            MetricValue::F64(v) => write!(f, "{}", v),
            MetricValue::Bool(v) => write!(f, "{}", v),
            MetricValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

/// Fills a string block with `text` followed by zeros
pub fn encode_string_block(text: &str, block: &mut [u8]) {
    let len = text.len().min(block.len().saturating_sub(1));
    block[..len].copy_from_slice(&text.as_bytes()[..len]);
    block[len..].fill(0);
}

/// Reads the NUL-terminated payload of a string block
pub fn decode_string_block(block: &[u8]) -> Result<String> {
    let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
    String::from_utf8(block[..end].to_vec())
        .map_err(|e| MmvError::corrupt(format!("string block is not UTF-8: {}", e)))
}

fn slot_word(slot: &[u8; SLOT_BYTES], at: usize) -> [u8; 8] {
    let mut word = [0u8; 8];
    word.copy_from_slice(&slot[at..at + 8]);
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: MetricValue) -> MetricValue {
        let mut slot = [0u8; SLOT_BYTES];
        value.encode(&mut slot, 0);
        value.kind().decode(&slot, |_| None).unwrap()
    }

    #[test]
    fn test_integer_boundaries() {
        for v in [0, -1, i32::MIN, i32::MAX] {
            assert_eq!(round_trip(MetricValue::I32(v)), MetricValue::I32(v));
        }
        for v in [0, 1, u32::MAX] {
            assert_eq!(round_trip(MetricValue::U32(v)), MetricValue::U32(v));
        }
        for v in [0, -1, i64::MIN, i64::MAX] {
            assert_eq!(round_trip(MetricValue::I64(v)), MetricValue::I64(v));
        }
        for v in [0, 1, u64::MAX] {
            assert_eq!(round_trip(MetricValue::U64(v)), MetricValue::U64(v));
        }
    }

    #[test]
    fn test_float_boundaries() {
        for v in [0.0f32, -1.0, f32::MIN, f32::MAX, f32::INFINITY, f32::NEG_INFINITY] {
            assert_eq!(round_trip(MetricValue::F32(v)), MetricValue::F32(v));
        }
        for v in [0.0f64, -1.0, f64::MIN, f64::MAX, f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(round_trip(MetricValue::F64(v)), MetricValue::F64(v));
        }

        match round_trip(MetricValue::F64(f64::NAN)) {
            MetricValue::F64(v) => assert!(v.is_nan()),
            other => panic!("Expected f64, got {:?}", other),
        }
        match round_trip(MetricValue::F32(f32::NAN)) {
            MetricValue::F32(v) => assert!(v.is_nan()),
            other => panic!("Expected f32, got {:?}", other),
        }
    }

    #[test]
    fn test_narrow_values_leave_upper_bytes_zero() {
        let mut slot = [0xAAu8; SLOT_BYTES];
        let used = MetricValue::I32(-1).encode(&mut slot, 0);
        assert_eq!(used, 4);
        assert_eq!(&slot[..4], &[0xFF; 4]);
        assert_eq!(&slot[4..], &[0u8; 12]);
    }

    #[test]
    fn test_bool_is_u32_on_the_wire() {
        assert_eq!(ValueKind::Bool.protocol_type(), type_tag::U32);
        let mut slot = [0u8; SLOT_BYTES];
        MetricValue::Bool(true).encode(&mut slot, 0);
        assert_eq!(ValueKind::U32.decode(&slot, |_| None).unwrap(), MetricValue::U32(1));
    }

    #[test]
    fn test_text_slot_points_into_pool() {
        let mut pool = vec![0u8; STRING_BLOCK_BYTES * 2];
        let offset = STRING_BLOCK_BYTES as u64;
        let value = MetricValue::Text("hello".to_string());

        let mut slot = [0u8; SLOT_BYTES];
        assert_eq!(value.encode(&mut slot, offset), SLOT_BYTES);
        encode_string_block("hello", &mut pool[STRING_BLOCK_BYTES..]);

        assert_eq!(u64::from_le_bytes(slot_word(&slot, 0)), 5);
        assert_eq!(u64::from_le_bytes(slot_word(&slot, 8)), offset);

        let decoded = ValueKind::Text
            .decode(&slot, |at| {
                let start = at as usize;
                pool.get(start..start + STRING_BLOCK_BYTES)
            })
            .unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_text_size_limit() {
        assert!(MetricValue::Text("x".repeat(255)).check_size("t").is_ok());
        let err = MetricValue::Text("x".repeat(256)).check_size("t").unwrap_err();
        assert!(matches!(err, MmvError::ValueTooLarge { size: 256, limit: 255, .. }));
    }

    #[test]
    fn test_kind_properties() {
        assert!(ValueKind::Text.needs_overflow_storage());
        assert!(!ValueKind::U64.needs_overflow_storage());
        for kind in [ValueKind::I32, ValueKind::U64, ValueKind::F64, ValueKind::Text] {
            assert!(kind.byte_width() <= SLOT_BYTES);
            assert_eq!(kind.zero().kind(), kind);
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("double".parse::<ValueKind>().unwrap(), ValueKind::F64);
        assert_eq!("String".parse::<ValueKind>().unwrap(), ValueKind::Text);
        assert!(matches!("bigdecimal".parse::<ValueKind>(), Err(MmvError::UnsupportedType(_))));
    }

    #[test]
    fn test_text_counter_rejected() {
        assert!(ValueKind::Text.check_semantics(Semantics::Counter).is_err());
        assert!(ValueKind::Text.check_semantics(Semantics::Discrete).is_ok());
        assert!(ValueKind::U64.check_semantics(Semantics::Counter).is_ok());
    }
}

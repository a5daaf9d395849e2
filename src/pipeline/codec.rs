//! Cache text codec
//!
//! Transactions are stored as JSON. JSON numbers cannot carry lamport or
//! token amounts without losing precision, so every big integer is written
//! as a string with the `BIGINT:` marker prefix (`"BIGINT:18446744073709551616"`).
//! Decoding turns any string matching `^BIGINT:[0-9]+$` back into a big
//! integer before the loosely typed value goes through schema validation.
//!
//! Free text (log messages, named instruction errors) may itself start with
//! the marker. Such text is written with one extra leading backslash, so
//! `BIGINT:5` is stored as `\BIGINT:5` and `\BIGINT:5` as `\\BIGINT:5`.
//! Decoding strips exactly one backslash from any `^\\+BIGINT:` string.
//! Base58 fields cannot contain `I` or `:` and never need escaping.

use std::borrow::Cow;
use std::collections::BTreeMap;

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serializer;
use serde_json::{Number, Value};
use thiserror::Error;

use super::errors::SchemaError;
use super::validator;
use crate::types::Transaction;

/// Marker prefix for encoded big integers
pub const BIGINT_MARKER: &str = "BIGINT:";

static BIGINT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^BIGINT:[0-9]+$").expect("valid bigint pattern"));

/// Text that needs one more backslash when written
static UNESCAPED_TEXT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\\*BIGINT:").expect("valid text pattern"));

/// Stored text carrying an escape backslash
static ESCAPED_TEXT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\\+BIGINT:").expect("valid escape pattern"));

/// Loosely typed value tree handed to the schema validator
///
/// This is JSON plus one extra leaf, [`RawValue::BigInt`], for integers that
/// must not go through a floating point or 64-bit representation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(Number),
    BigInt(BigUint),
    String(String),
    Array(Vec<RawValue>),
    Object(BTreeMap<String, RawValue>),
}

impl RawValue {
    /// Build an object from `(key, value)` pairs
    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, RawValue)>,
        K: Into<String>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert upstream JSON verbatim, strings stay strings
    pub fn from_json(value: Value) -> Self {
        Self::convert(value, false)
    }

    /// Convert cache JSON, decoding marker strings into big integers
    pub fn from_encoded_json(value: Value) -> Self {
        Self::convert(value, true)
    }

    fn convert(value: Value, decode_markers: bool) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) if decode_markers => decode_marker(s),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(|item| Self::convert(item, decode_markers))
                    .collect(),
            ),
            Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::convert(v, decode_markers)))
                    .collect(),
            ),
        }
    }

    /// Short type name used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(n) if n.is_f64() => "float",
            Self::Number(_) => "integer",
            Self::BigInt(_) => "bigint",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u8> for RawValue {
    fn from(value: u8) -> Self {
        Self::Number(value.into())
    }
}

impl From<u32> for RawValue {
    fn from(value: u32) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for RawValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<BigUint> for RawValue {
    fn from(value: BigUint) -> Self {
        Self::BigInt(value)
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl<T: Into<RawValue>> From<Vec<T>> for RawValue {
    fn from(values: Vec<T>) -> Self {
        Self::Array(values.into_iter().map(Into::into).collect())
    }
}

fn decode_marker(s: String) -> RawValue {
    if ESCAPED_TEXT_PATTERN.is_match(&s) {
        return RawValue::String(s[1..].to_string());
    }
    if !BIGINT_PATTERN.is_match(&s) {
        return RawValue::String(s);
    }
    match BigUint::parse_bytes(s[BIGINT_MARKER.len()..].as_bytes(), 10) {
        Some(n) => RawValue::BigInt(n),
        None => RawValue::String(s),
    }
}

/// Free text as written to the cache, see the module docs
pub fn escape_text(text: &str) -> Cow<'_, str> {
    if UNESCAPED_TEXT_PATTERN.is_match(text) {
        Cow::Owned(format!("\\{text}"))
    } else {
        Cow::Borrowed(text)
    }
}

/// `serialize_with` adapter for free text lists
pub fn serialize_texts<S: Serializer>(values: &[String], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|text| escape_text(text)))
}

/// Render a big integer with the marker prefix
pub fn encode_big(value: &BigUint) -> String {
    format!("{BIGINT_MARKER}{value}")
}

/// `serialize_with` adapter for big integer fields
pub fn serialize_big<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode_big(value))
}

/// Failure to turn stored text back into a value tree
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stored bytes are not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("stored text is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to recover a [`Transaction`] from stored text
#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Render a transaction as cache text
///
/// `pretty` uses two-space indentation so entries diff cleanly.
pub fn serialize(transaction: &Transaction, pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(transaction)
    } else {
        serde_json::to_string(transaction)
    }
}

/// Parse cache text into a loosely typed value tree
pub fn decode(text: &str) -> Result<RawValue, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    Ok(RawValue::from_encoded_json(value))
}

/// Parse raw stored bytes into a loosely typed value tree
pub fn decode_bytes(bytes: &[u8]) -> Result<RawValue, DecodeError> {
    decode(std::str::from_utf8(bytes)?)
}

/// Decode and validate cache text
pub fn deserialize(text: &str) -> Result<Transaction, DeserializeError> {
    let raw = decode(text)?;
    Ok(validator::validate(&raw)?)
}

/// Decode and validate raw stored bytes
pub fn deserialize_bytes(bytes: &[u8]) -> Result<Transaction, DeserializeError> {
    let raw = decode_bytes(bytes)?;
    Ok(validator::validate(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_marker_strings_become_big_integers() {
        let raw = RawValue::from_encoded_json(json!({
            "fee": "BIGINT:123456789012345678901234567890",
            "note": "BIGINT:12a",
            "plain": "hello",
        }));
        let RawValue::Object(map) = raw else {
            panic!("expected object");
        };
        assert_eq!(
            map["fee"],
            RawValue::BigInt("123456789012345678901234567890".parse().unwrap())
        );
        assert_eq!(map["note"], RawValue::String("BIGINT:12a".to_string()));
        assert_eq!(map["plain"], RawValue::String("hello".to_string()));
    }

    #[test]
    fn test_marker_like_text_is_escaped() {
        assert_eq!(escape_text("Program log: hi"), "Program log: hi");
        assert_eq!(escape_text("BIGINT:5"), "\\BIGINT:5");
        assert_eq!(escape_text("\\BIGINT:5"), "\\\\BIGINT:5");
        assert_eq!(escape_text("BIGINT:"), "\\BIGINT:");
        assert!(matches!(escape_text("xBIGINT:5"), Cow::Borrowed(_)));

        for text in ["BIGINT:5", "\\BIGINT:5", "\\\\BIGINT:x", "BIGINT:"] {
            let stored = Value::String(escape_text(text).into_owned());
            assert_eq!(
                RawValue::from_encoded_json(stored),
                RawValue::String(text.to_string())
            );
        }
    }

    #[test]
    fn test_upstream_json_keeps_marker_text() {
        let raw = RawValue::from_json(json!("BIGINT:5"));
        assert_eq!(raw, RawValue::String("BIGINT:5".to_string()));
    }

    #[test]
    fn test_encode_big() {
        let n: BigUint = "340282366920938463463374607431768211456".parse().unwrap();
        assert_eq!(encode_big(&n), "BIGINT:340282366920938463463374607431768211456");
        assert_eq!(encode_big(&BigUint::from(0u8)), "BIGINT:0");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode_bytes(&[0xff, 0xfe, 0x00]),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(RawValue::from(1u64).type_name(), "integer");
        assert_eq!(RawValue::from_json(json!(1.5)).type_name(), "float");
        assert_eq!(RawValue::from(BigUint::from(1u8)).type_name(), "bigint");
        assert_eq!(RawValue::Null.type_name(), "null");
    }
}

//! Generic value tree produced by the decoder.

use std::collections::BTreeMap;

/// A numeric literal kept exactly as it appeared on the wire.
///
/// The agent mixes integers, fixed-point and scientific spellings in the
/// same payload, so the text is preserved and converted on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Number(String);

impl Number {
    /// Wrap a literal that the decoder has already validated.
    pub(crate) fn from_literal(text: &str) -> Self {
        Self(text.to_string())
    }

    /// The literal text, e.g. `"-1.5e3"`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value as a double. Every valid literal converts.
    pub fn as_f64(&self) -> Option<f64> {
        self.0.parse().ok()
    }

    /// Value as an unsigned integer, if the literal is integral and non-negative.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.trim_start_matches('+').parse().ok()
    }
}

/// Decoded notation value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Sequence(Vec<Value>),
    /// Mapping with string keys. Unknown keys are kept; duplicate keys keep
    /// the last occurrence.
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }

    /// Look up a key if this value is a mapping.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Mapping(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value. Quoted numerals such as `"1.5"` are accepted too,
    /// since some agent versions stringify floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Non-negative integer value, also accepting quoted integers.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

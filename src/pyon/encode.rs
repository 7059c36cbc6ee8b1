//! Canonical PyON output.
//!
//! Strings are always double-quoted, mapping keys come out in sorted order
//! and numbers keep their original literal text, so `decode(encode(v)) == v`
//! for any decoded value.

use std::fmt::{self, Write};

use super::value::Value;

/// Encode a value as PyON text.
pub fn encode(value: &Value) -> String {
    value.to_string()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Number(n) => f.write_str(n.as_str()),
            Value::String(s) => write_quoted(f, s),
            Value::Sequence(items) => {
                f.write_char('[')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_char(']')
            }
            Value::Mapping(map) => {
                f.write_char('{')?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_quoted(f, key)?;
                    write!(f, ": {}", value)?;
                }
                f.write_char('}')
            }
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyon::decode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_canonical_form() {
        let value = decode(r#"{'b': [1, 2.5e0, None], 'a': {"t": True, "f": false}}"#).unwrap();
        assert_eq!(
            encode(&value),
            r#"{"a": {"f": False, "t": True}, "b": [1, 2.5e0, None]}"#
        );
    }

    #[test]
    fn test_encode_escapes_strings() {
        let value = Value::String("say \"hi\"\n\\ \u{1}".to_string());
        assert_eq!(encode(&value), r#""say \"hi\"\n\\ \u0001""#);
    }

    #[test]
    fn test_round_trip_law() {
        let samples = [
            "None",
            "-12",
            "+3.25E+02",
            r#"'quote \' inside'"#,
            r#"{"id": "00", "status": "RUNNING", "extra": {"nested": [[], {}]}}"#,
            r#"[["C", 0.0, 1.7, 12.01, 6], ["H", -1e-3, .5, 1.008, 1]]"#,
            "\"unicode \u{e9} \\ud83d\\ude00 \\t\"",
        ];

        for text in samples {
            let first = decode(text).unwrap();
            let second = decode(&encode(&first)).unwrap();
            assert_eq!(first, second, "round trip of {:?}", text);
            // A second pass is a fixed point
            assert_eq!(encode(&first), encode(&second));
        }
    }
}

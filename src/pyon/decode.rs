//! Recursive-descent decoder for PyON text.
//!
//! Positions reported in [`SyntaxError`] are byte offsets into the input.

use std::collections::BTreeMap;

use thiserror::Error;

use super::value::{Number, Value};

/// Maximum nesting depth of mappings and sequences.
pub const MAX_DEPTH: usize = 256;

/// Malformed notation text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Syntax error at byte {position}: expected {expected}")]
pub struct SyntaxError {
    /// Byte offset of the first unexpected character (or the input length
    /// when the text ends early).
    pub position: usize,
    /// What the decoder was looking for.
    pub expected: &'static str,
}

/// Decode a complete PyON document into a [`Value`].
///
/// Fails on the first unexpected character; no partial tree is returned.
///
/// # Example
///
/// ```
/// use atomata::pyon::decode;
///
/// let err = decode(r#"{"id": "0", "status": }"#).unwrap_err();
/// assert_eq!(err.position, 22);
/// ```
pub fn decode(text: &str) -> Result<Value, SyntaxError> {
    let mut parser = Parser::new(text);
    parser.skip_whitespace();
    let value = parser.parse_value(0)?;
    parser.skip_whitespace();
    if parser.pos < parser.bytes.len() {
        return Err(parser.error("end of input"));
    }
    Ok(value)
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, expected: &'static str) -> SyntaxError {
        SyntaxError {
            position: self.pos,
            expected,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value, SyntaxError> {
        match self.peek() {
            Some(b'{') => self.parse_mapping(depth + 1),
            Some(b'[') => self.parse_sequence(depth + 1),
            Some(b'"') | Some(b'\'') => self.parse_string().map(Value::String),
            Some(b'-' | b'+' | b'.' | b'0'..=b'9') => self.parse_number(),
            Some(b) if b.is_ascii_alphabetic() => self.parse_keyword(),
            _ => Err(self.error("value")),
        }
    }

    fn parse_mapping(&mut self, depth: usize) -> Result<Value, SyntaxError> {
        if depth > MAX_DEPTH {
            return Err(self.error("shallower nesting"));
        }
        self.pos += 1; // '{'
        let mut map = BTreeMap::new();

        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Mapping(map));
        }

        loop {
            self.skip_whitespace();
            if !matches!(self.peek(), Some(b'"') | Some(b'\'')) {
                return Err(self.error("string key"));
            }
            let key = self.parse_string()?;

            self.skip_whitespace();
            if self.peek() != Some(b':') {
                return Err(self.error("':'"));
            }
            self.pos += 1;

            self.skip_whitespace();
            let value = self.parse_value(depth)?;
            map.insert(key, value);

            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Value::Mapping(map));
                }
                _ => return Err(self.error("',' or '}'")),
            }
        }
    }

    fn parse_sequence(&mut self, depth: usize) -> Result<Value, SyntaxError> {
        if depth > MAX_DEPTH {
            return Err(self.error("shallower nesting"));
        }
        self.pos += 1; // '['
        let mut items = Vec::new();

        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Value::Sequence(items));
        }

        loop {
            self.skip_whitespace();
            items.push(self.parse_value(depth)?);

            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Value::Sequence(items));
                }
                _ => return Err(self.error("',' or ']'")),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, SyntaxError> {
        let quote = self.bytes[self.pos];
        self.pos += 1;
        let mut out = String::new();
        let mut run_start = self.pos;

        loop {
            let Some(b) = self.peek() else {
                return Err(self.error("closing quote"));
            };
            match b {
                _ if b == quote => {
                    out.push_str(&self.text[run_start..self.pos]);
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    out.push_str(&self.text[run_start..self.pos]);
                    self.pos += 1;
                    out.push(self.parse_escape()?);
                    run_start = self.pos;
                }
                b'\n' | b'\r' => return Err(self.error("closing quote")),
                _ => self.pos += 1,
            }
        }
    }

    /// Parse the character after a backslash. `pos` points past the backslash.
    fn parse_escape(&mut self) -> Result<char, SyntaxError> {
        let Some(b) = self.peek() else {
            return Err(self.error("escape sequence"));
        };
        self.pos += 1;
        let c = match b {
            b'"' => '"',
            b'\'' => '\'',
            b'\\' => '\\',
            b'/' => '/',
            b'n' => '\n',
            b'r' => '\r',
            b't' => '\t',
            b'b' => '\u{08}',
            b'f' => '\u{0c}',
            b'0' => '\0',
            b'x' => {
                let code = self.parse_hex(2)?;
                char::from_u32(code).ok_or_else(|| self.error("valid character code"))?
            }
            b'u' => {
                let start = self.pos;
                let high = self.parse_hex(4)?;
                if (0xD800..0xDC00).contains(&high) {
                    // Surrogate pair: expect a following \uDC00-\uDFFF
                    if self.bytes.get(self.pos..self.pos + 2) != Some(&b"\\u"[..]) {
                        return Err(self.error("low surrogate"));
                    }
                    self.pos += 2;
                    let low = self.parse_hex(4)?;
                    if !(0xDC00..0xE000).contains(&low) {
                        return Err(SyntaxError {
                            position: self.pos - 4,
                            expected: "low surrogate",
                        });
                    }
                    let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    char::from_u32(code).ok_or_else(|| self.error("valid character code"))?
                } else {
                    char::from_u32(high).ok_or(SyntaxError {
                        position: start,
                        expected: "valid character code",
                    })?
                }
            }
            _ => {
                self.pos -= 1;
                return Err(self.error("escape sequence"));
            }
        };
        Ok(c)
    }

    fn parse_hex(&mut self, digits: usize) -> Result<u32, SyntaxError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .peek()
                .and_then(|b| (b as char).to_digit(16))
                .ok_or_else(|| self.error("hex digit"))?;
            code = code * 16 + digit;
            self.pos += 1;
        }
        Ok(code)
    }

    fn parse_number(&mut self) -> Result<Value, SyntaxError> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }

        let int_digits = self.consume_digits();
        let mut frac_digits = 0;
        if self.peek() == Some(b'.') {
            self.pos += 1;
            frac_digits = self.consume_digits();
        }
        if int_digits == 0 && frac_digits == 0 {
            return Err(SyntaxError {
                position: start,
                expected: "number",
            });
        }

        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'-' | b'+')) {
                self.pos += 1;
            }
            if self.consume_digits() == 0 {
                return Err(self.error("exponent digits"));
            }
        }

        Ok(Value::Number(Number::from_literal(
            &self.text[start..self.pos],
        )))
    }

    fn consume_digits(&mut self) -> usize {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        self.pos - start
    }

    fn parse_keyword(&mut self) -> Result<Value, SyntaxError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        match &self.text[start..self.pos] {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            "None" | "none" | "null" => Ok(Value::Null),
            _ => Err(SyntaxError {
                position: start,
                expected: "value",
            }),
        }
    }
}

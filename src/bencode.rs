//! # Bencode Decoding
//!
//! This module implements a recursive descent decoder for bencoded data, the
//! encoding used by torrent metadata files and tracker responses.
//!
//! ## Grammar
//!
//! - Integer: `i<signed decimal>e`
//! - Byte string: `<length>:<bytes>`
//! - List: `l<values>e`
//! - Dictionary: `d<key-value pairs>e` (keys are byte strings)
//!
//! ## Raw `info` Capture
//!
//! The SHA-1 info hash that identifies a torrent is computed over the exact
//! bytes that encode the `info` dictionary in the original file. Re-encoding
//! the parsed value tree is not byte-stable, so the decoder records the span
//! of the `info` value while it parses the top-level dictionary. Callers hash
//! `input[span]` directly.
//!
//! ## Hostile Input
//!
//! Torrent files and tracker responses come from the network. The decoder
//! bounds string lengths and nesting depth, and rejects the usual integer
//! encoding tricks (leading zeros, negative zero).

use std::collections::BTreeMap;
use std::ops::Range;

use thiserror::Error;

/// Longest byte string the decoder will accept (10 MiB).
pub const MAX_STRING_LEN: usize = 10 * 1024 * 1024;

/// Deepest container nesting the decoder will follow.
pub const MAX_DEPTH: usize = 50;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bencode: empty input")]
    EmptyInput,
    #[error("bencode: unknown type identifier '{0}'")]
    UnknownTag(char),
    #[error("bencode: invalid integer format")]
    InvalidInteger,
    #[error("bencode: leading zeros not allowed")]
    LeadingZero,
    #[error("bencode: negative zero not allowed")]
    NegativeZero,
    #[error("bencode: invalid string length")]
    InvalidStringLength,
    #[error("bencode: string length exceeds limit")]
    StringTooLong,
    #[error("bencode: string shorter than specified length")]
    Truncated,
    #[error("bencode: unterminated list")]
    UnterminatedList,
    #[error("bencode: unterminated dictionary")]
    UnterminatedDict,
    #[error("bencode: dictionary key is not a string")]
    InvalidDictKey,
    #[error("bencode: exceeded max depth")]
    TooDeep,
    #[error("bencode: missing info dictionary")]
    MissingInfo,
}

/// A decoded bencode value.
///
/// Byte strings stay opaque at this layer; whether they hold UTF-8 text is a
/// decision for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a dictionary entry by key.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

/// Decode a complete bencode value from `data`.
///
/// Convenience entry point for callers that do not need the `info` span,
/// such as tracker response parsing.
pub fn decode(data: &[u8]) -> Result<Value, DecodeError> {
    Decoder::new(data).decode()
}

/// Recursive descent decoder over a byte buffer.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder {
            data,
            pos: 0,
            depth: 0,
            info_span: None,
        }
    }

    /// Decode the value at the start of the buffer.
    ///
    /// All errors are fatal; the decoder does not resynchronize.
    pub fn decode(&mut self) -> Result<Value, DecodeError> {
        self.parse_value()
    }

    /// Byte range of the top-level `info` dictionary value, if one was seen.
    ///
    /// Hashing `input[span]` yields the canonical info hash.
    pub fn info_span(&self) -> Option<Range<usize>> {
        self.info_span.clone()
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn parse_value(&mut self) -> Result<Value, DecodeError> {
        match self.peek() {
            None => Err(DecodeError::EmptyInput),
            Some(b'i') => self.parse_integer().map(Value::Int),
            Some(b'0'..=b'9') => self.parse_string().map(Value::Bytes),
            Some(b'l') => self.parse_list().map(Value::List),
            Some(b'd') => self.parse_dict().map(Value::Dict),
            Some(other) => Err(DecodeError::UnknownTag(other as char)),
        }
    }

    fn parse_integer(&mut self) -> Result<i64, DecodeError> {
        self.pos += 1; // consume 'i'

        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != b'e' {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(DecodeError::InvalidInteger);
        }
        let body = &self.data[start..self.pos];
        self.pos += 1; // consume 'e'

        if body.is_empty() {
            return Err(DecodeError::InvalidInteger);
        }

        // '0' must stand alone
        if body[0] == b'0' && body.len() > 1 {
            return Err(DecodeError::LeadingZero);
        }
        if body[0] == b'-' {
            if body.len() == 1 {
                return Err(DecodeError::InvalidInteger);
            }
            if body[1] == b'0' {
                if body.len() == 2 {
                    return Err(DecodeError::NegativeZero);
                }
                return Err(DecodeError::LeadingZero);
            }
        }

        std::str::from_utf8(body)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .ok_or(DecodeError::InvalidInteger)
    }

    fn parse_string(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos >= self.data.len() || self.data[self.pos] != b':' {
            return Err(DecodeError::InvalidStringLength);
        }

        let digits = &self.data[start..self.pos];
        if digits.is_empty() {
            return Err(DecodeError::InvalidStringLength);
        }
        // Leading zeros in the length prefix are not allowed unless the length is 0
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(DecodeError::LeadingZero);
        }

        let length: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(DecodeError::InvalidStringLength)?;
        if length > MAX_STRING_LEN {
            return Err(DecodeError::StringTooLong);
        }

        self.pos += 1; // consume ':'
        if self.data.len() - self.pos < length {
            return Err(DecodeError::Truncated);
        }

        let bytes = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;

        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Vec<Value>, DecodeError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        self.pos += 1; // consume 'l'

        let mut items = Vec::new();
        while self.pos < self.data.len() && self.data[self.pos] != b'e' {
            items.push(self.parse_value()?);
        }
        if self.pos >= self.data.len() {
            return Err(DecodeError::UnterminatedList);
        }
        self.pos += 1; // consume 'e'
        self.depth -= 1;

        Ok(items)
    }

    fn parse_dict(&mut self) -> Result<BTreeMap<Vec<u8>, Value>, DecodeError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        self.pos += 1; // consume 'd'

        let mut entries = BTreeMap::new();
        while self.pos < self.data.len() && self.data[self.pos] != b'e' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(DecodeError::InvalidDictKey);
            }
            let key = self.parse_string()?;

            if self.pos >= self.data.len() {
                return Err(DecodeError::UnterminatedDict);
            }

            let value_start = self.pos;
            let value = self.parse_value()?;

            // The top-level dict sits at depth 1, so this only fires for the
            // metainfo's own `info` key, never for nested dictionaries.
            if self.depth == 1 && key == b"info" {
                self.info_span = Some(value_start..self.pos);
            }

            entries.insert(key, value);
        }
        if self.pos >= self.data.len() {
            return Err(DecodeError::UnterminatedDict);
        }
        self.pos += 1; // consume 'e'
        self.depth -= 1;

        Ok(entries)
    }
}

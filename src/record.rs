//! Line validation and record fingerprinting.

use crate::reader::RawLine;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A validated JSON line ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Trimmed line text as it appeared in the file.
    pub raw: String,
    /// Hex SHA-256 of the canonical JSON form; the storage uniqueness key.
    pub fingerprint: String,
    /// Byte offset of the source line.
    pub offset: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("line is empty")]
    Empty,
    #[error("line is not valid utf-8")]
    InvalidUtf8,
    #[error("line is not valid json: {0}")]
    InvalidJson(String),
}

impl Rejection {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Rejection::Empty => "empty",
            Rejection::InvalidUtf8 => "invalid_utf8",
            Rejection::InvalidJson(_) => "invalid_json",
        }
    }
}

/// Turns raw lines into [`Record`]s. Stateless, so one parser can serve every line
/// of a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordParser;

impl RecordParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, line: &RawLine) -> Result<Record, Rejection> {
        let text = std::str::from_utf8(&line.bytes).map_err(|_| Rejection::InvalidUtf8)?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Rejection::Empty);
        }

        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|err| Rejection::InvalidJson(err.to_string()))?;

        Ok(Record {
            raw: trimmed.to_string(),
            fingerprint: fingerprint(&value),
            offset: line.offset,
        })
    }
}

/// Fingerprint of a JSON document that ignores whitespace and object key order.
pub fn fingerprint(value: &serde_json::Value) -> String {
    // serde_json's default map is ordered by key, so this serialization is canonical.
    let canonical = value.to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str) -> RawLine {
        RawLine {
            offset: 10,
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn accepts_json_and_trims_whitespace() {
        let record = RecordParser::new()
            .parse(&raw("  {\"status\":200,\"path\":\"/\"}\r"))
            .expect("valid");
        assert_eq!(record.raw, "{\"status\":200,\"path\":\"/\"}");
        assert_eq!(record.offset, 10);
        assert_eq!(record.fingerprint.len(), 64);
    }

    #[test]
    fn rejects_blank_lines() {
        assert_eq!(RecordParser::new().parse(&raw("   \t")), Err(Rejection::Empty));
        assert_eq!(RecordParser::new().parse(&raw("")), Err(Rejection::Empty));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = RecordParser::new()
            .parse(&raw("{\"status\": 200"))
            .expect_err("invalid");
        assert_eq!(err.metric_label(), "invalid_json");
    }

    #[test]
    fn rejects_invalid_utf8() {
        let line = RawLine {
            offset: 0,
            bytes: vec![b'{', 0xff, b'}'],
        };
        assert_eq!(RecordParser::new().parse(&line), Err(Rejection::InvalidUtf8));
    }

    #[test]
    fn fingerprint_ignores_formatting_and_key_order() {
        let parser = RecordParser::new();
        let a = parser.parse(&raw("{\"a\":1,\"b\":[1,2]}")).expect("valid");
        let b = parser
            .parse(&raw("{ \"b\": [1, 2],  \"a\": 1 }"))
            .expect("valid");
        let c = parser.parse(&raw("{\"a\":2,\"b\":[1,2]}")).expect("valid");

        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn fingerprint_is_stable() {
        let value = serde_json::json!({"k": "v"});
        assert_eq!(
            fingerprint(&value),
            "666c1aa02e8068c6d5cc1d3295009432c16790bec28ec8ce119d0d1a18d61319"
        );
    }
}

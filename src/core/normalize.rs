//! Purpose: Canonicalize connection-listing output into one JSON array text.
//! Exports: `normalize`, `normalize_text`, `canonical_or_default`,
//! `MalformedPayload`, `EMPTY_ARRAY`, `WELL_KNOWN_KEYS`.
//! Role: Wire-format boundary for `ListConnections`, independent of engine shape.
//! Invariants: Output is freshly serialized by serde_json, never passed through.
//! Invariants: Output is either a well-formed array or the caller's default.
use std::error::Error as StdError;
use std::fmt;

use serde_json::Value;

use super::probe::RawPayload;

pub const EMPTY_ARRAY: &str = "[]";

/// Object keys that may hold the connection array, checked in order.
pub const WELL_KNOWN_KEYS: [&str; 4] = ["connections", "Connections", "nekoray_connections", "data"];

#[derive(Debug)]
pub enum MalformedPayload {
    Encode(serde_json::Error),
    Parse(serde_json::Error),
    NoArray(&'static str),
}

impl fmt::Display for MalformedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "failed to encode structured payload: {err}"),
            Self::Parse(err) => write!(f, "payload is not JSON: {err}"),
            Self::NoArray(shape) => write!(f, "no connection array in {shape} payload"),
        }
    }
}

impl StdError for MalformedPayload {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Encode(err) | Self::Parse(err) => Some(err),
            Self::NoArray(_) => None,
        }
    }
}

pub fn normalize(raw: RawPayload) -> Result<String, MalformedPayload> {
    match raw {
        RawPayload::Text(text) => normalize_text(&text),
        RawPayload::Bytes(bytes) => normalize_text(&String::from_utf8_lossy(&bytes)),
        RawPayload::Structured(value) => {
            let text = value.encode_json().map_err(MalformedPayload::Encode)?;
            normalize_text(&text)
        }
    }
}

pub fn normalize_text(payload: &str) -> Result<String, MalformedPayload> {
    if payload.is_empty() {
        return Ok(EMPTY_ARRAY.to_string());
    }

    let parsed: Value = serde_json::from_str(payload).map_err(MalformedPayload::Parse)?;
    let array = match parsed {
        Value::Array(items) => items,
        Value::Object(mut map) => WELL_KNOWN_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or(MalformedPayload::NoArray("object"))?,
        other => return Err(MalformedPayload::NoArray(shape_name(&other))),
    };
    serde_json::to_string(&array).map_err(MalformedPayload::Encode)
}

pub fn canonical_or_default(result: Result<String, MalformedPayload>) -> String {
    result.unwrap_or_else(|_| EMPTY_ARRAY.to_string())
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

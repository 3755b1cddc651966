use serde_json::{Map, Value};
use thiserror::Error;

/// A decoded row: field name to JSON value.
pub type Record = Map<String, Value>;

/// Payload could not be turned into a record. Redelivery reproduces the
/// same failure, so these are always permanent.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Decode a message body into a record.
pub fn decode(body: &[u8]) -> Result<Record, DecodeError> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(map),
        other => Err(DecodeError::NotAnObject(kind(&other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lossy, truncated rendering of a payload for log lines.
pub fn preview(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= limit {
        return text.into_owned();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}

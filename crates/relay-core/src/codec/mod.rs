//! Protocol codec between [`CanonicalMessage`] and the two wire dialects.
//!
//! - [`Dialect::FlatText`]: `post_type` envelopes whose message body is a
//!   single string with inline `[CQ:type,key=value]` tags ([`flat_text`]).
//! - [`Dialect::Structured`]: `type`/`detail_type` envelopes whose message
//!   body is an ordered list of `{type, data}` objects.
//!
//! Every function here is pure. Encoding writes the extension bag first and
//! then the typed fields, so typed values win over same-named extension keys.

pub mod escape;
pub mod flat_text;

mod dialect_a;
mod dialect_b;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::action::ActionRequest;
use crate::message::{CanonicalMessage, Extensions, Segment, SegmentKind, Sender};

/// Decode failure for a single wire frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Required field absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// Field present with the wrong shape.
    #[error("invalid field `{field}`: expected {expected}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Expected shape.
        expected: &'static str,
    },
    /// Event type the codec does not model.
    #[error("unknown event type `{0}`")]
    UnknownEvent(String),
    /// Neither dialect's markers are present.
    #[error("unrecognised wire dialect")]
    UnknownDialect,
}

/// Wire dialect spoken by a connector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Flat bracket-tag text (`post_type` envelopes).
    #[default]
    FlatText,
    /// Structured segment lists (`type`/`detail_type` envelopes).
    Structured,
}

impl Dialect {
    /// Stable snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlatText => "flat_text",
            Self::Structured => "structured",
        }
    }

    /// Parse a configuration or header value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat_text" | "flat" | "a" | "v11" => Some(Self::FlatText),
            "structured" | "b" | "v12" => Some(Self::Structured),
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode an event as a JSON value in `dialect`.
pub fn encode(msg: &CanonicalMessage, dialect: Dialect) -> Value {
    match dialect {
        Dialect::FlatText => dialect_a::encode(msg),
        Dialect::Structured => dialect_b::encode(msg),
    }
}

/// Encode an event as a JSON string in `dialect`.
pub fn encode_string(msg: &CanonicalMessage, dialect: Dialect) -> String {
    encode(msg, dialect).to_string()
}

/// Decode a JSON value known to be in `dialect`.
pub fn decode(value: &Value, dialect: Dialect) -> Result<CanonicalMessage, CodecError> {
    match dialect {
        Dialect::FlatText => dialect_a::decode(value),
        Dialect::Structured => dialect_b::decode(value),
    }
}

/// Guess the dialect of an event frame from its marker fields.
pub fn detect(value: &Value) -> Option<Dialect> {
    let obj = value.as_object()?;
    if obj.contains_key("post_type") {
        return Some(Dialect::FlatText);
    }
    if obj.contains_key("type") && (obj.contains_key("detail_type") || obj.contains_key("self")) {
        return Some(Dialect::Structured);
    }
    if obj.contains_key("retcode") {
        let structured = obj.contains_key("message")
            && !obj.contains_key("msg")
            && !obj.contains_key("wording");
        return Some(if structured {
            Dialect::Structured
        } else {
            Dialect::FlatText
        });
    }
    None
}

/// Detect the dialect of `value` and decode it.
pub fn decode_any(value: &Value) -> Result<(CanonicalMessage, Dialect), CodecError> {
    let dialect = detect(value).ok_or(CodecError::UnknownDialect)?;
    Ok((decode(value, dialect)?, dialect))
}

/// Parse, detect and decode a text frame.
pub fn decode_str(text: &str) -> Result<(CanonicalMessage, Dialect), CodecError> {
    let value: Value = serde_json::from_str(text)?;
    decode_any(&value)
}

/// Whether a frame is an action envelope rather than an event.
pub fn is_action(value: &Value) -> bool {
    value.get("action").is_some_and(Value::is_string)
}

/// Encode a segment list the way `dialect` carries message bodies.
pub fn encode_segments(segments: &[Segment], dialect: Dialect) -> Value {
    match dialect {
        Dialect::FlatText => Value::String(flat_text::render(segments)),
        Dialect::Structured => Value::Array(
            segments
                .iter()
                .map(|seg| {
                    let data: Map<String, Value> = seg
                        .data
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect();
                    let mut obj = Map::new();
                    let _ = obj.insert("type".into(), Value::String(seg.kind.as_str().into()));
                    let _ = obj.insert("data".into(), Value::Object(data));
                    Value::Object(obj)
                })
                .collect(),
        ),
    }
}

/// Decode a message body in either shape: a flat-text string or a
/// `{type, data}` list (flat `at`/`qq` names are accepted in lists too).
pub fn decode_segments(value: &Value) -> Result<Vec<Segment>, CodecError> {
    match value {
        Value::String(s) => Ok(flat_text::parse(s)),
        Value::Array(items) => items.iter().map(decode_segment_object).collect(),
        _ => Err(CodecError::InvalidField {
            field: "message",
            expected: "string or array",
        }),
    }
}

fn decode_segment_object(item: &Value) -> Result<Segment, CodecError> {
    let kind = item
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::InvalidField {
            field: "message",
            expected: "segment object with `type`",
        })?;
    let mut segment = Segment::new(SegmentKind::parse(kind));
    if let Some(data) = item.get("data").and_then(Value::as_object) {
        for (key, value) in data {
            let Some(value) = scalar_string(value) else {
                continue;
            };
            let key = flat_text::canonical_key(&segment.kind, key);
            let _ = segment.data.insert(key, value);
        }
    }
    Ok(segment)
}

/// Re-encode an action for a connector speaking `dialect`. A message body
/// in `params.message` is converted to that dialect's shape.
pub fn encode_action(request: &ActionRequest, dialect: Dialect) -> Value {
    let mut params = request.params.clone();
    if let Some(message) = params.get_mut("message") {
        match decode_segments(message) {
            Ok(segments) => *message = encode_segments(&segments, dialect),
            Err(e) => warn!(action = %request.action, error = %e, "leaving message param untouched"),
        }
    }
    let mut obj = Map::new();
    let _ = obj.insert("action".into(), Value::String(request.action.clone()));
    let _ = obj.insert("params".into(), params);
    if let Some(echo) = &request.echo {
        let _ = obj.insert("echo".into(), Value::String(echo.clone()));
    }
    Value::Object(obj)
}

// ── Field helpers shared by both dialects ───────────────────────────────────

/// Wire representation of an id: a JSON number when the string is a
/// canonical integer, otherwise a string.
pub(crate) fn id_to_value(id: &str) -> Value {
    match id.parse::<i64>() {
        Ok(n) if n.to_string() == id => Value::from(n),
        _ => Value::String(id.to_string()),
    }
}

/// Scalar JSON value as a string. `null` yields `None`; nested values are
/// kept as their JSON text.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    obj.remove(key).as_ref().and_then(scalar_string)
}

pub(crate) fn require_string(
    obj: &mut Map<String, Value>,
    key: &'static str,
) -> Result<String, CodecError> {
    take_string(obj, key).ok_or(CodecError::MissingField(key))
}

pub(crate) fn take_optional(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    take_string(obj, key).filter(|s| !s.is_empty())
}

pub(crate) fn take_i64(obj: &mut Map<String, Value>, key: &'static str) -> Result<Option<i64>, CodecError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or(CodecError::InvalidField {
                field: key,
                expected: "integer",
            }),
        Some(Value::String(s)) => s.parse().map(Some).map_err(|_| CodecError::InvalidField {
            field: key,
            expected: "integer",
        }),
        Some(_) => Err(CodecError::InvalidField {
            field: key,
            expected: "integer",
        }),
    }
}

/// Move whatever is left of a decoded object into a bounded bag.
/// Typed sender fields from a wire `sender` object. Keys without a typed
/// field go back into `rest` under `sender` and end up in the extension bag.
pub(crate) fn decode_sender(
    value: Option<Value>,
    fallback_user: &str,
    rest: &mut Map<String, Value>,
) -> Sender {
    let Some(Value::Object(mut obj)) = value else {
        return Sender {
            user_id: fallback_user.to_string(),
            ..Sender::default()
        };
    };
    let sender = Sender {
        user_id: take_string(&mut obj, "user_id").unwrap_or_else(|| fallback_user.to_string()),
        nickname: take_string(&mut obj, "nickname"),
        card: take_string(&mut obj, "card"),
        avatar: take_string(&mut obj, "avatar"),
    };
    if !obj.is_empty() {
        put(rest, "sender", Value::Object(obj));
    }
    sender
}

pub(crate) fn collect_extensions(obj: Map<String, Value>) -> Extensions {
    let mut ext = Extensions::new();
    let mut dropped = 0usize;
    for (key, value) in obj {
        if !ext.insert(key, value) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(dropped, "extension bag full, dropping unrecognised keys");
    }
    ext
}

pub(crate) fn extensions_to_map(ext: &Extensions) -> Map<String, Value> {
    ext.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

pub(crate) fn put(obj: &mut Map<String, Value>, key: &str, value: Value) {
    let _ = obj.insert(key.to_string(), value);
}

pub(crate) fn put_opt(obj: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        put(obj, key, Value::String(v.to_string()));
    }
}

//! Session lifecycle events
//!
//! A frame received from the forwarder is parsed into a [`SessionEvent`] by
//! [`parse_frame`]. Two wire shapes are accepted:
//! - the canonical camelCase record (`eventKind`, `sessionId`, ...)
//! - the flat agent record keyed by `SessionGUID` (see [`legacy`])
//!
//! Parsing is pure: it never blocks and a failure only affects the frame.

pub mod legacy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Attribute keys whose millisecond value determines a span's duration,
/// checked in order.
pub const DURATION_KEYS: [&str; 2] = ["durationMs", "ProcLifetimeMs"];

/// Errors produced while parsing and validating a frame
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record is not a JSON object")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unrecognized event kind: {0}")]
    UnknownEventKind(String),

    #[error("Session id is not a GUID: {0}")]
    InvalidSessionId(String),

    #[error("Invalid process id: {0}")]
    InvalidProcessId(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl ParseError {
    /// Short label used in logs and rejection counters
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::Json(_) | ParseError::NotAnObject => "malformed",
            ParseError::MissingField(_) => "missing_field",
            ParseError::UnknownEventKind(_) => "event_kind",
            ParseError::InvalidSessionId(_) => "session_id",
            ParseError::InvalidProcessId(_) => "process_id",
            ParseError::InvalidTimestamp(_) => "timestamp",
        }
    }
}

/// Result type for parsing
pub type ParseResult<T> = Result<T, ParseError>;

/// Logon or logoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Logon,
    Logoff,
}

impl EventKind {
    /// Span name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Logon => "Logon",
            EventKind::Logoff => "Logoff",
        }
    }

    /// Value of the `event_type` span attribute
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::Logon => "logon",
            EventKind::Logoff => "logoff",
        }
    }

    /// Nibble written into the top of the trace id
    pub fn discriminator(&self) -> u8 {
        match self {
            EventKind::Logon => 0x1,
            EventKind::Logoff => 0x2,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("logon") {
            Ok(EventKind::Logon)
        } else if s.eq_ignore_ascii_case("logoff") {
            Ok(EventKind::Logoff)
        } else {
            Err(ParseError::UnknownEventKind(s.to_string()))
        }
    }
}

/// A session identifier
///
/// Keeps the string exactly as received (that is what gets written to the
/// correlation store) next to the parsed GUID used for trace id derivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    raw: String,
    guid: Uuid,
}

impl SessionId {
    pub fn parse(raw: &str) -> ParseResult<Self> {
        let trimmed = raw.trim();
        let guid = Uuid::parse_str(trimmed)
            .map_err(|_| ParseError::InvalidSessionId(raw.to_string()))?;
        Ok(Self {
            raw: trimmed.to_string(),
            guid,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn guid(&self) -> &Uuid {
        &self.guid
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    /// Interpret the value as a non-negative millisecond duration,
    /// returned in nanoseconds
    pub fn duration_nanos(&self) -> Option<u64> {
        match self {
            AttributeValue::Int(ms) if *ms >= 0 => (*ms as u64).checked_mul(1_000_000),
            AttributeValue::Double(ms) if ms.is_finite() && *ms >= 0.0 => {
                let nanos = ms * 1_000_000.0;
                (nanos <= u64::MAX as f64).then_some(nanos as u64)
            }
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// One validated session lifecycle record
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub session_id: SessionId,
    pub process_id: u64,
    pub parent_process_id: Option<u64>,
    pub user_name: String,
    pub host_name: String,
    pub occurred_at: DateTime<Utc>,
    pub process_name: Option<String>,
    pub process_type: Option<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl SessionEvent {
    /// Duration carried by the first recognised duration attribute
    pub fn duration_nanos(&self) -> Option<u64> {
        DURATION_KEYS
            .iter()
            .find_map(|key| self.attributes.get(*key).and_then(|v| v.duration_nanos()))
    }
}

/// Canonical record as it appears on the wire
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalRecord {
    event_kind: Option<String>,
    session_id: Option<String>,
    process_id: Option<i64>,
    parent_process_id: Option<i64>,
    user_name: Option<String>,
    host_name: Option<String>,
    occurred_at: Option<String>,
    process_name: Option<String>,
    process_type: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
}

/// Parse one frame into a validated event
///
/// `received_at` anchors records that carry a relative start time.
pub fn parse_frame(frame: &[u8], received_at: DateTime<Utc>) -> ParseResult<SessionEvent> {
    let value: serde_json::Value = serde_json::from_slice(frame)?;
    let serde_json::Value::Object(map) = value else {
        return Err(ParseError::NotAnObject);
    };

    if map.contains_key(legacy::SESSION_GUID) {
        return legacy::from_agent_record(map, received_at);
    }

    let record: CanonicalRecord = serde_json::from_value(serde_json::Value::Object(map))?;
    from_canonical(record)
}

fn from_canonical(record: CanonicalRecord) -> ParseResult<SessionEvent> {
    let kind: EventKind = record
        .event_kind
        .ok_or(ParseError::MissingField("eventKind"))?
        .parse()?;
    let session_id = SessionId::parse(
        record
            .session_id
            .as_deref()
            .ok_or(ParseError::MissingField("sessionId"))?,
    )?;
    let process_id = process_id(record.process_id.ok_or(ParseError::MissingField("processId"))?)?;
    let parent_process_id = record.parent_process_id.map(parent_id).transpose()?.flatten();
    let occurred_at = parse_timestamp(
        record
            .occurred_at
            .as_deref()
            .ok_or(ParseError::MissingField("occurredAt"))?,
    )?;

    Ok(SessionEvent {
        kind,
        session_id,
        process_id,
        parent_process_id,
        user_name: record.user_name.unwrap_or_default(),
        host_name: record.host_name.unwrap_or_default(),
        occurred_at,
        process_name: record.process_name.filter(|s| !s.is_empty()),
        process_type: record.process_type.filter(|s| !s.is_empty()),
        attributes: record.attributes,
    })
}

/// A process id must be positive
pub(crate) fn process_id(value: i64) -> ParseResult<u64> {
    if value <= 0 {
        return Err(ParseError::InvalidProcessId(value.to_string()));
    }
    Ok(value as u64)
}

/// Zero means "no parent"
pub(crate) fn parent_id(value: i64) -> ParseResult<Option<u64>> {
    match value {
        0 => Ok(None),
        v if v < 0 => Err(ParseError::InvalidProcessId(v.to_string())),
        v => Ok(Some(v as u64)),
    }
}

/// RFC 3339 timestamp representable as non-negative epoch nanoseconds
pub(crate) fn parse_timestamp(raw: &str) -> ParseResult<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|e| ParseError::InvalidTimestamp(format!("{}: {}", raw, e)))?
        .with_timezone(&Utc);
    ensure_epoch_range(parsed)
}

pub(crate) fn ensure_epoch_range(ts: DateTime<Utc>) -> ParseResult<DateTime<Utc>> {
    match ts.timestamp_nanos_opt() {
        Some(nanos) if nanos >= 0 => Ok(ts),
        _ => Err(ParseError::InvalidTimestamp(format!(
            "{} is outside the nanosecond epoch range",
            ts.to_rfc3339()
        ))),
    }
}

//! Flat agent records
//!
//! The endpoint agent emits one flat object per process start, keyed by
//! `SessionGUID`. The kind is implied by which process-type field is set and
//! the start time is relative to when the record reaches us.

use super::{
    ensure_epoch_range, parent_id, process_id, AttributeValue, EventKind, ParseError, ParseResult,
    SessionEvent, SessionId,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SESSION_GUID: &str = "SessionGUID";
const LOGON_PROC_TYPE: &str = "LogonProcType";
const LOGOFF_PROC_TYPE: &str = "LogoffProcType";
const PROC_ID: &str = "ProcID";
const PROC_PARENT_ID: &str = "ProcParentID";
const PROC_USER: &str = "ProcUser";
const HOST_NAME: &str = "HostName";
const PROC_NAME: &str = "ProcName";
const START_RELATIVE_MS: &str = "ProcStartTimeRelativeMs";

/// Fields mapped onto the event itself rather than copied into attributes
const MAPPED_FIELDS: [&str; 9] = [
    SESSION_GUID,
    LOGON_PROC_TYPE,
    LOGOFF_PROC_TYPE,
    PROC_ID,
    PROC_PARENT_ID,
    PROC_USER,
    HOST_NAME,
    PROC_NAME,
    START_RELATIVE_MS,
];

/// Build an event from a flat agent record
pub fn from_agent_record(
    mut record: Map<String, Value>,
    received_at: DateTime<Utc>,
) -> ParseResult<SessionEvent> {
    let session_id = match record.get(SESSION_GUID) {
        Some(Value::String(s)) => SessionId::parse(s)?,
        Some(other) => return Err(ParseError::InvalidSessionId(other.to_string())),
        None => return Err(ParseError::MissingField(SESSION_GUID)),
    };

    let (kind, process_type) = if let Some(v) = record.get(LOGOFF_PROC_TYPE) {
        (EventKind::Logoff, scalar_string(v))
    } else if let Some(v) = record.get(LOGON_PROC_TYPE) {
        (EventKind::Logon, scalar_string(v))
    } else {
        return Err(ParseError::MissingField(LOGON_PROC_TYPE));
    };

    let pid = record
        .get(PROC_ID)
        .ok_or(ParseError::MissingField(PROC_ID))?;
    let process_id = process_id(
        as_integer(pid).ok_or_else(|| ParseError::InvalidProcessId(pid.to_string()))?,
    )?;

    let parent_process_id = match record.get(PROC_PARENT_ID) {
        None | Some(Value::Null) => None,
        Some(v) => parent_id(as_integer(v).ok_or_else(|| ParseError::InvalidProcessId(v.to_string()))?)?,
    };

    let offset_ms = record
        .get(START_RELATIVE_MS)
        .and_then(as_integer)
        .unwrap_or(0);
    let occurred_at = Duration::try_milliseconds(offset_ms)
        .and_then(|offset| received_at.checked_add_signed(offset))
        .ok_or_else(|| {
            ParseError::InvalidTimestamp(format!("{} offset of {}ms", START_RELATIVE_MS, offset_ms))
        })?;
    let occurred_at = ensure_epoch_range(occurred_at)?;

    let user_name = record.get(PROC_USER).and_then(scalar_string).unwrap_or_default();
    let host_name = record.get(HOST_NAME).and_then(scalar_string).unwrap_or_default();
    let process_name = record.get(PROC_NAME).and_then(scalar_string);

    for key in MAPPED_FIELDS {
        record.remove(key);
    }
    let attributes: BTreeMap<String, AttributeValue> = record
        .into_iter()
        .filter_map(|(key, value)| scalar_attribute(value).map(|v| (key, v)))
        .collect();

    Ok(SessionEvent {
        kind,
        session_id,
        process_id,
        parent_process_id,
        user_name,
        host_name,
        occurred_at,
        process_name,
        process_type: process_type.filter(|s| !s.is_empty()),
        attributes,
    })
}

/// Agents send numeric fields either as JSON numbers or as numeric strings
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Agent records carry extra columns of mixed types; anything that is not a
/// scalar is skipped rather than failing the whole record.
fn scalar_attribute(value: Value) -> Option<AttributeValue> {
    match value {
        Value::Bool(b) => Some(AttributeValue::Bool(b)),
        Value::Number(n) => n
            .as_i64()
            .map(AttributeValue::Int)
            .or_else(|| n.as_f64().map(AttributeValue::Double)),
        Value::String(s) => Some(AttributeValue::String(s)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

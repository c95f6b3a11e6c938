//! Span model and the event-to-span transformer
//!
//! The transformer is pure and deterministic: the same event always yields
//! the same identifiers, so a session can be correlated with its traces
//! without any shared state.

use crate::events::{AttributeValue, EventKind, SessionEvent};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Span attribute keys added by the transformer
pub mod attr {
    pub const SESSION_ID: &str = "session.id";
    pub const EVENT_TYPE: &str = "event_type";
    pub const USER_NAME: &str = "user.name";
    pub const HOST_NAME: &str = "host.name";
    pub const PROCESS_PID: &str = "process.pid";
    pub const PROCESS_PARENT_PID: &str = "process.parent_pid";
    pub const PROCESS_EXECUTABLE_NAME: &str = "process.executable.name";
}

/// 128-bit trace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Derive the trace id for one side of a session
    ///
    /// Uses the GUID bytes in RFC 4122 order with the most significant
    /// nibble replaced by the event kind discriminator.
    pub fn derive(session: &uuid::Uuid, kind: EventKind) -> Self {
        let mut bytes = *session.as_bytes();
        bytes[0] = (bytes[0] & 0x0F) | (kind.discriminator() << 4);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 64-bit span identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    /// Process id as a big-endian 64-bit value
    pub fn from_process_id(pid: u64) -> Self {
        Self(pid.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A finished span, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub kind: EventKind,
    pub session_id: String,
    /// Resource `service.name`; `None` falls back to the configured default
    pub service_name: Option<String>,
    pub start_nanos: u64,
    pub end_nanos: u64,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Span {
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn duration_nanos(&self) -> u64 {
        self.end_nanos - self.start_nanos
    }
}

/// Convert a validated event into its span
pub fn transform(event: &SessionEvent) -> Span {
    let trace_id = TraceId::derive(event.session_id.guid(), event.kind);
    let start_nanos = event
        .occurred_at
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or_default();
    let end_nanos = event
        .duration_nanos()
        .map(|d| start_nanos.saturating_add(d))
        .unwrap_or(start_nanos);

    let mut attributes = event.attributes.clone();
    attributes.insert(attr::SESSION_ID.into(), event.session_id.as_str().into());
    attributes.insert(attr::EVENT_TYPE.into(), event.kind.event_type().into());
    attributes.insert(attr::USER_NAME.into(), event.user_name.as_str().into());
    attributes.insert(attr::HOST_NAME.into(), event.host_name.as_str().into());
    attributes.insert(attr::PROCESS_PID.into(), pid_value(event.process_id));
    if let Some(ppid) = event.parent_process_id {
        attributes.insert(attr::PROCESS_PARENT_PID.into(), pid_value(ppid));
    }
    if let Some(name) = &event.process_name {
        attributes.insert(attr::PROCESS_EXECUTABLE_NAME.into(), name.as_str().into());
    }

    Span {
        trace_id,
        span_id: SpanId::from_process_id(event.process_id),
        parent_span_id: event.parent_process_id.map(SpanId::from_process_id),
        kind: event.kind,
        session_id: event.session_id.as_str().to_string(),
        service_name: event.process_type.clone(),
        start_nanos,
        end_nanos,
        attributes,
    }
}

fn pid_value(pid: u64) -> AttributeValue {
    i64::try_from(pid)
        .map(AttributeValue::Int)
        .unwrap_or_else(|_| AttributeValue::String(pid.to_string()))
}

/// Cross-reference from a session to the trace generated for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub session_id: String,
    pub kind: EventKind,
    pub trace_id: TraceId,
    pub recorded_at: DateTime<Utc>,
}

impl CorrelationRecord {
    pub fn for_span(span: &Span, recorded_at: DateTime<Utc>) -> Self {
        Self {
            session_id: span.session_id.clone(),
            kind: span.kind,
            trace_id: span.trace_id,
            recorded_at,
        }
    }
}

//! InfluxDB line protocol encoding

use sessiontrace_core::config::CorrelationStoreSettings;
use sessiontrace_core::events::EventKind;
use sessiontrace_core::span::CorrelationRecord;

/// Measurement names per event kind
#[derive(Debug, Clone)]
pub struct Measurements {
    pub logon: String,
    pub logoff: String,
}

impl Default for Measurements {
    fn default() -> Self {
        Self {
            logon: "uberAgent:logonTraceMap".to_string(),
            logoff: "uberAgent:logoffTraceMap".to_string(),
        }
    }
}

impl From<&CorrelationStoreSettings> for Measurements {
    fn from(settings: &CorrelationStoreSettings) -> Self {
        Self {
            logon: settings.logon_measurement.clone(),
            logoff: settings.logoff_measurement.clone(),
        }
    }
}

impl Measurements {
    pub fn for_kind(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Logon => &self.logon,
            EventKind::Logoff => &self.logoff,
        }
    }
}

/// Encode one record as a line
///
/// `<measurement>,guid=<session>,trace_id=<hex> value=0i <ns>`. The timestamp
/// is left off when `recorded_at` is outside the nanosecond range, so the
/// store assigns one.
pub fn line_protocol(record: &CorrelationRecord, measurements: &Measurements) -> String {
    let mut line = String::with_capacity(96);
    escape_into(&mut line, measurements.for_kind(record.kind), false);
    line.push_str(",guid=");
    escape_into(&mut line, &record.session_id, true);
    line.push_str(",trace_id=");
    line.push_str(&record.trace_id.to_hex());
    line.push_str(" value=0i");
    if let Some(nanos) = record.recorded_at.timestamp_nanos_opt() {
        line.push(' ');
        line.push_str(&nanos.to_string());
    }
    line
}

fn escape_into(out: &mut String, value: &str, is_tag: bool) {
    for c in value.chars() {
        match c {
            ',' | ' ' => out.push('\\'),
            '=' if is_tag => out.push('\\'),
            '\n' => {
                out.push_str("\\n");
                continue;
            }
            _ => {}
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sessiontrace_core::span::TraceId;

    fn record(kind: EventKind, session: &str) -> CorrelationRecord {
        CorrelationRecord {
            session_id: session.to_string(),
            kind,
            trace_id: TraceId::from_bytes([0xab; 16]),
            recorded_at: Utc.timestamp_opt(1_704_067_200, 5).unwrap(),
        }
    }

    #[test]
    fn test_logon_line() {
        let line = line_protocol(
            &record(EventKind::Logon, "3f2504e0-4f89-41d3-9a0c-0305e82c3301"),
            &Measurements::default(),
        );
        assert_eq!(
            line,
            "uberAgent:logonTraceMap,guid=3f2504e0-4f89-41d3-9a0c-0305e82c3301,\
             trace_id=abababababababababababababababab value=0i 1704067200000000005"
        );
    }

    #[test]
    fn test_logoff_uses_own_measurement() {
        let measurements = Measurements {
            logon: "on".into(),
            logoff: "off map".into(),
        };
        let line = line_protocol(&record(EventKind::Logoff, "g"), &measurements);
        assert!(line.starts_with("off\\ map,guid=g,"));
    }

    #[test]
    fn test_tag_escaping() {
        let line = line_protocol(&record(EventKind::Logon, "a b,c=d"), &Measurements::default());
        assert!(line.contains(",guid=a\\ b\\,c\\=d,"));
    }
}

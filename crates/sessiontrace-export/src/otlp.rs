//! OTLP/HTTP protobuf encoding and transport
//!
//! A batch becomes one `ExportTraceServiceRequest` with a `ResourceSpans`
//! per `service.name`, a single instrumentation scope and INTERNAL spans.

use crate::error::{ExportError, ExportResult};
use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{
    any_value::Value, AnyValue, InstrumentationScope, KeyValue,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span::SpanKind, ResourceSpans, ScopeSpans, Span};
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use sessiontrace_core::batch::Batch;
use sessiontrace_core::config::PipelineSettings;
use sessiontrace_core::events::AttributeValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Instrumentation scope name on every exported span
pub const SCOPE_NAME: &str = "sessiontrace";

/// Longest collector error body kept in an error
const MAX_ERROR_BODY: usize = 512;

/// Build the export request for a batch
///
/// Spans without a service name use `default_service`. Resource groups
/// appear in order of first use; spans keep their batch order.
pub fn encode_batch(batch: &Batch, default_service: &str) -> ExportTraceServiceRequest {
    let mut groups: Vec<(String, Vec<Span>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for span in batch.spans() {
        let service = span
            .service_name
            .as_deref()
            .unwrap_or(default_service)
            .to_string();
        let slot = *index.entry(service.clone()).or_insert_with(|| {
            groups.push((service, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(encode_span(span));
    }

    ExportTraceServiceRequest {
        resource_spans: groups
            .into_iter()
            .map(|(service, spans)| ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![string_attribute("service.name", service)],
                    ..Default::default()
                }),
                scope_spans: vec![ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: SCOPE_NAME.to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        ..Default::default()
                    }),
                    spans,
                    ..Default::default()
                }],
                ..Default::default()
            })
            .collect(),
    }
}

fn encode_span(span: &sessiontrace_core::span::Span) -> Span {
    Span {
        trace_id: span.trace_id.as_bytes().to_vec(),
        span_id: span.span_id.as_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|id| id.as_bytes().to_vec())
            .unwrap_or_default(),
        name: span.name().to_string(),
        kind: SpanKind::Internal as i32,
        start_time_unix_nano: span.start_nanos,
        end_time_unix_nano: span.end_nanos,
        attributes: span
            .attributes
            .iter()
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: Some(any_value(value)),
            })
            .collect(),
        ..Default::default()
    }
}

fn any_value(value: &AttributeValue) -> AnyValue {
    let value = match value {
        AttributeValue::Bool(b) => Value::BoolValue(*b),
        AttributeValue::Int(i) => Value::IntValue(*i),
        AttributeValue::Double(d) => Value::DoubleValue(*d),
        AttributeValue::String(s) => Value::StringValue(s.clone()),
    };
    AnyValue { value: Some(value) }
}

fn string_attribute(key: &str, value: String) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(Value::StringValue(value)),
        }),
    }
}

/// Sends one encoded batch; no retries at this level
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &Batch) -> ExportResult<()>;

    /// Where requests go, for logs
    fn endpoint(&self) -> &str;
}

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// OTLP/HTTP traces endpoint
    pub endpoint: Url,

    /// Per-request timeout
    pub timeout: Duration,

    /// Extra headers on every request
    pub headers: Vec<(String, String)>,

    /// `service.name` for spans without a process type
    pub default_service: String,
}

impl From<&PipelineSettings> for TransportConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            endpoint: settings.export_endpoint.clone(),
            timeout: settings.export_timeout,
            headers: settings.export_headers.clone(),
            default_service: settings.service_name.clone(),
        }
    }
}

/// OTLP/HTTP protobuf transport
pub struct OtlpHttpTransport {
    client: Client,
    endpoint: Url,
    headers: HeaderMap,
    default_service: String,
}

impl OtlpHttpTransport {
    pub fn new(config: TransportConfig) -> ExportResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ExportError::Config(format!("header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ExportError::Config(format!("header '{}' value: {}", name, e)))?;
            headers.insert(name, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("sessiontrace/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExportError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            headers,
            default_service: config.default_service,
        })
    }
}

#[async_trait]
impl Transport for OtlpHttpTransport {
    async fn send(&self, batch: &Batch) -> ExportResult<()> {
        let body = encode_batch(batch, &self.default_service).encode_to_vec();
        debug!(
            "Posting {} spans ({} bytes) to {}",
            batch.len(),
            body.len(),
            self.endpoint
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExportError::Timeout
                } else {
                    ExportError::Network(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(ExportError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sessiontrace_core::events::parse_frame;
    use sessiontrace_core::span::transform;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn span(pid: u32, extra: &str) -> sessiontrace_core::span::Span {
        let frame = format!(
            r#"{{"eventKind":"Logon","sessionId":"3f2504e0-4f89-41d3-9a0c-0305e82c3301","processId":{},"occurredAt":"2024-01-01T00:00:00Z"{}}}"#,
            pid, extra
        );
        transform(&parse_frame(frame.as_bytes(), Utc::now()).unwrap())
    }

    fn transport(server: &MockServer, headers: Vec<(String, String)>) -> OtlpHttpTransport {
        OtlpHttpTransport::new(TransportConfig {
            endpoint: Url::parse(&format!("{}/v1/traces", server.uri())).unwrap(),
            timeout: Duration::from_millis(500),
            headers,
            default_service: "unknown-service".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_encode_groups_by_service() {
        let batch = Batch::from_spans(vec![
            span(1, r#","processType":"winlogon""#),
            span(2, ""),
            span(3, r#","processType":"winlogon","parentProcessId":1"#),
        ]);
        let request = encode_batch(&batch, "fallback");

        assert_eq!(request.resource_spans.len(), 2);
        let first = &request.resource_spans[0];
        let service = &first.resource.as_ref().unwrap().attributes[0];
        assert_eq!(service.key, "service.name");
        assert_eq!(
            service.value.as_ref().unwrap().value,
            Some(Value::StringValue("winlogon".to_string()))
        );

        let scope = &first.scope_spans[0];
        assert_eq!(scope.scope.as_ref().unwrap().name, SCOPE_NAME);
        assert_eq!(scope.spans.len(), 2);

        let proto = &scope.spans[1];
        assert_eq!(proto.name, "Logon");
        assert_eq!(proto.kind, SpanKind::Internal as i32);
        assert_eq!(proto.trace_id.len(), 16);
        assert_eq!(proto.span_id, 3u64.to_be_bytes().to_vec());
        assert_eq!(proto.parent_span_id, 1u64.to_be_bytes().to_vec());
        assert!(scope.spans[0].parent_span_id.is_empty());

        let fallback = &request.resource_spans[1];
        assert_eq!(
            fallback.resource.as_ref().unwrap().attributes[0].value.as_ref().unwrap().value,
            Some(Value::StringValue("fallback".to_string()))
        );
    }

    #[tokio::test]
    async fn test_posts_protobuf() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .and(header("content-type", "application/x-protobuf"))
            .and(header("x-tenant", "blue"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server, vec![("x-tenant".into(), "blue".into())]);
        let batch = Batch::from_spans(vec![span(1, "")]);
        transport.send(&batch).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let decoded = ExportTraceServiceRequest::decode(received[0].body.as_slice()).unwrap();
        assert_eq!(decoded.resource_spans[0].scope_spans[0].spans.len(), 1);
    }

    #[tokio::test]
    async fn test_status_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = transport(&server, vec![])
            .send(&Batch::from_spans(vec![span(1, "")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Status { status: 503, ref body } if body == "overloaded"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = transport(&server, vec![])
            .send(&Batch::from_spans(vec![span(1, "")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Timeout));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = OtlpHttpTransport::new(TransportConfig {
            endpoint: Url::parse("http://localhost:4318/v1/traces").unwrap(),
            timeout: Duration::from_secs(1),
            headers: vec![("bad header".into(), "x".into())],
            default_service: "svc".into(),
        });
        assert!(matches!(result, Err(ExportError::Config(_))));
    }
}

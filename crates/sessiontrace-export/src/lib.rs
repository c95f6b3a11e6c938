//! SessionTrace Export - span delivery to an OpenTelemetry collector
//!
//! - [`otlp`]: OTLP/HTTP protobuf encoding and the HTTP transport
//! - [`breaker`]: process-wide circuit breaker
//! - [`exporter`]: the [`SpanExporter`](sessiontrace_core::SpanExporter)
//!   combining both with local retries

pub mod breaker;
pub mod error;
pub mod exporter;
pub mod otlp;

pub use breaker::{Admission, BreakerConfig, CircuitBreaker, CircuitState, Permit};
pub use error::{ExportError, ExportResult};
pub use exporter::{OtlpExporter, RetryPolicy};
pub use otlp::{encode_batch, OtlpHttpTransport, Transport, TransportConfig};

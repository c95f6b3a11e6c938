//! SessionTrace Core - Event types, plugin traits, and pipeline orchestration
//!
//! This crate provides the foundational types and abstractions for SessionTrace:
//!
//! - **Events**: session lifecycle records and the frame parser
//! - **Span**: deterministic event-to-span transformation
//! - **Queue / Worker / Batch**: the bounded processing path
//! - **Pipeline**: stage wiring and graceful shutdown
//! - **Plugins**: trait definitions for the export and correlation seams
//! - **Config / Metrics**: configuration loading and self-observability

pub mod batch;
pub mod config;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod plugins;
pub mod queue;
pub mod span;
pub mod worker;

// Re-export commonly used types
pub use batch::{Batch, Batcher};
pub use config::{ConfigLoader, PipelineSettings, ServiceConfig};
pub use events::{parse_frame, AttributeValue, EventKind, ParseError, SessionEvent, SessionId};
pub use metrics::{create_metrics, MetricsCollector, SharedMetrics};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, ShutdownReport};
pub use plugins::{CorrelationSink, ExportOutcome, NoopCorrelation, PluginInfo, SpanExporter};
pub use queue::{EnqueueError, EventConsumer, EventProducer};
pub use span::{transform, CorrelationRecord, Span, SpanId, TraceId};

/// Service version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

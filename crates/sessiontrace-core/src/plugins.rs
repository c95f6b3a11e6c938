//! Plugin traits at the pipeline's I/O seams
//!
//! The pipeline itself never talks to the network. Span export and the
//! correlation side channel are provided by implementations of these traits
//! living in their own crates.

use crate::batch::Batch;
use crate::span::CorrelationRecord;
use async_trait::async_trait;

/// Basic plugin information
pub trait PluginInfo {
    /// Plugin name
    fn name(&self) -> &str;
}

/// What happened to a batch handed to an exporter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    /// The collector accepted the batch
    Delivered,
    /// The batch was attempted and failed
    Failed,
    /// The batch was dropped without a network call
    ShortCircuited,
}

/// Sends sealed batches to a trace collector
///
/// Implementations own their retry policy and failure accounting. A batch is
/// consumed whatever the outcome; nothing is handed back for requeueing.
#[async_trait]
pub trait SpanExporter: PluginInfo + Send + Sync {
    async fn export(&self, batch: Batch) -> ExportOutcome;
}

/// Receives one correlation record per transformed span
///
/// `record` must never block or fail from the caller's point of view.
pub trait CorrelationSink: Send + Sync {
    fn record(&self, record: CorrelationRecord);
}

/// Correlation sink used when no store is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCorrelation;

impl CorrelationSink for NoopCorrelation {
    fn record(&self, _record: CorrelationRecord) {}
}

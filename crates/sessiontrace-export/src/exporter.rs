//! Breaker-gated, retrying span exporter

use crate::breaker::{Admission, CircuitBreaker};
use crate::error::ExportResult;
use crate::otlp::Transport;
use async_trait::async_trait;
use sessiontrace_core::batch::Batch;
use sessiontrace_core::config::PipelineSettings;
use sessiontrace_core::metrics::SharedMetrics;
use sessiontrace_core::plugins::{ExportOutcome, PluginInfo, SpanExporter};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Local retry policy for one export
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// First retry delay (doubles with each retry)
    pub initial_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl From<&PipelineSettings> for RetryPolicy {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            max_retries: settings.export_max_retries,
            initial_delay: settings.export_retry_backoff,
            ..Default::default()
        }
    }
}

/// Exports batches through a [`Transport`], guarded by a [`CircuitBreaker`]
///
/// Every batch is consumed: delivered, failed after retries, or dropped while
/// the breaker is open. Each failed export counts once toward the breaker,
/// however many attempts it took.
pub struct OtlpExporter<T> {
    transport: T,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: SharedMetrics,
}

impl<T: Transport> OtlpExporter<T> {
    pub fn new(
        transport: T,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            transport,
            breaker,
            retry,
            metrics,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Send with retry logic
    async fn send_with_retry(&self, batch: &Batch) -> ExportResult<()> {
        let mut delay = self.retry.initial_delay;
        let mut attempts = 0;

        loop {
            match self.transport.send(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() || attempts >= self.retry.max_retries => {
                    return Err(e);
                }
                Err(e) => {
                    attempts += 1;
                    self.metrics
                        .export
                        .export_retries
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Export to {} failed (attempt {}), retrying in {:?}: {}",
                        self.transport.endpoint(),
                        attempts,
                        delay,
                        e
                    );

                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.retry.max_delay);
                }
            }
        }
    }
}

impl<T: Transport> PluginInfo for OtlpExporter<T> {
    fn name(&self) -> &str {
        "otlp-http"
    }
}

#[async_trait]
impl<T: Transport> SpanExporter for OtlpExporter<T> {
    async fn export(&self, batch: Batch) -> ExportOutcome {
        let spans = batch.len() as u64;
        let export = &self.metrics.export;

        let Some(permit) = self.breaker.try_acquire() else {
            export.export_failures.fetch_add(1, Ordering::Relaxed);
            export
                .batches_short_circuited
                .fetch_add(1, Ordering::Relaxed);
            debug!("Circuit open, dropped batch of {} spans", spans);
            return ExportOutcome::ShortCircuited;
        };

        let started = Instant::now();
        let result = match permit.admission() {
            Admission::Trial => self.transport.send(&batch).await,
            Admission::Normal => self.send_with_retry(&batch).await,
        };
        self.metrics.batch_latency.observe(started.elapsed());

        match result {
            Ok(()) => {
                permit.success();
                export.batches_sent.fetch_add(1, Ordering::Relaxed);
                export.spans_exported.fetch_add(spans, Ordering::Relaxed);
                debug!("Exported batch of {} spans", spans);
                ExportOutcome::Delivered
            }
            Err(e) => {
                permit.failure();
                export.export_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropped batch of {} spans after failed export to {}: {}",
                    spans,
                    self.transport.endpoint(),
                    e
                );
                ExportOutcome::Failed
            }
        }
    }
}

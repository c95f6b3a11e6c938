//! Self-observability metrics for SessionTrace
//!
//! All counters and gauges are lock-free atomics shared through
//! [`SharedMetrics`]. The collector renders itself as Prometheus text or JSON.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bounds (seconds) of the `batch_latency_seconds` buckets
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    /// When the collector was started
    start_time: Instant,
    /// Listener and parser metrics
    pub ingest: IngestMetrics,
    /// Queue, worker and batcher metrics
    pub pipeline: PipelineMetrics,
    /// Exporter and circuit breaker metrics
    pub export: ExportMetrics,
    /// Correlation side channel metrics
    pub correlation: CorrelationMetrics,
    /// Export round-trip latency per batch
    pub batch_latency: LatencyHistogram,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ingest: IngestMetrics::default(),
            pipeline: PipelineMetrics::default(),
            export: ExportMetrics::default(),
            correlation: CorrelationMetrics::default(),
            batch_latency: LatencyHistogram::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        write_metric(
            &mut output,
            "uptime_seconds",
            "Time since the service started",
            "gauge",
            self.uptime_seconds(),
        );

        // Ingest
        write_metric(
            &mut output,
            "records_received_total",
            "Frames read from forwarder connections",
            "counter",
            load(&self.ingest.records_received),
        );
        write_metric(
            &mut output,
            "records_parsed_total",
            "Frames parsed into valid session events",
            "counter",
            load(&self.ingest.records_parsed),
        );
        write_metric(
            &mut output,
            "records_rejected_total",
            "Frames rejected as malformed or oversized",
            "counter",
            load(&self.ingest.records_rejected),
        );
        write_metric(
            &mut output,
            "records_dropped_total",
            "Valid events dropped because the queue stayed full",
            "counter",
            load(&self.ingest.records_dropped),
        );
        write_metric(
            &mut output,
            "connections_accepted_total",
            "Forwarder connections accepted",
            "counter",
            load(&self.ingest.connections_accepted),
        );
        write_metric(
            &mut output,
            "active_connections",
            "Forwarder connections currently open",
            "gauge",
            load(&self.ingest.active_connections),
        );

        // Pipeline
        write_metric(
            &mut output,
            "span_queue_size",
            "Events waiting in the bounded queue",
            "gauge",
            load(&self.pipeline.span_queue_size),
        );
        write_metric(
            &mut output,
            "records_discarded_total",
            "Queued events discarded when the shutdown grace period ran out",
            "counter",
            load(&self.pipeline.records_discarded),
        );
        write_metric(
            &mut output,
            "spans_created_total",
            "Spans produced by the transformer",
            "counter",
            load(&self.pipeline.spans_created),
        );
        output.push_str("# HELP batches_sealed_total Batches sealed by trigger\n");
        output.push_str("# TYPE batches_sealed_total counter\n");
        output.push_str(&format!(
            "batches_sealed_total{{trigger=\"size\"}} {}\n",
            load(&self.pipeline.batches_sealed_size)
        ));
        output.push_str(&format!(
            "batches_sealed_total{{trigger=\"timeout\"}} {}\n",
            load(&self.pipeline.batches_sealed_timeout)
        ));
        output.push_str(&format!(
            "batches_sealed_total{{trigger=\"shutdown\"}} {}\n\n",
            load(&self.pipeline.batches_sealed_shutdown)
        ));

        // Export
        write_metric(
            &mut output,
            "batches_sent_total",
            "Batches accepted by the collector",
            "counter",
            load(&self.export.batches_sent),
        );
        write_metric(
            &mut output,
            "spans_exported_total",
            "Spans accepted by the collector",
            "counter",
            load(&self.export.spans_exported),
        );
        write_metric(
            &mut output,
            "export_failures_total",
            "Batches that were not delivered, including short-circuited ones",
            "counter",
            load(&self.export.export_failures),
        );
        write_metric(
            &mut output,
            "export_retries_total",
            "Local export retries after transient failures",
            "counter",
            load(&self.export.export_retries),
        );
        write_metric(
            &mut output,
            "batches_short_circuited_total",
            "Batches dropped without a network call while the breaker was open",
            "counter",
            load(&self.export.batches_short_circuited),
        );
        write_metric(
            &mut output,
            "circuit_breaker_state",
            "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            "gauge",
            load(&self.export.circuit_breaker_state),
        );
        write_metric(
            &mut output,
            "circuit_breaker_transitions_total",
            "Circuit breaker state changes",
            "counter",
            load(&self.export.circuit_breaker_transitions),
        );

        // Correlation
        write_metric(
            &mut output,
            "correlation_records_written_total",
            "Correlation records written to the store",
            "counter",
            load(&self.correlation.records_written),
        );
        write_metric(
            &mut output,
            "correlation_write_failures_total",
            "Correlation records lost to failed store writes",
            "counter",
            load(&self.correlation.write_failures),
        );
        write_metric(
            &mut output,
            "correlation_records_dropped_total",
            "Correlation records dropped because the writer buffer was full",
            "counter",
            load(&self.correlation.records_dropped),
        );

        self.batch_latency.write_prometheus(
            &mut output,
            "batch_latency_seconds",
            "Time spent exporting one batch, retries included",
        );

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "ingest": {
                "records_received": load(&self.ingest.records_received),
                "records_parsed": load(&self.ingest.records_parsed),
                "records_rejected": load(&self.ingest.records_rejected),
                "records_dropped": load(&self.ingest.records_dropped),
                "connections_accepted": load(&self.ingest.connections_accepted),
                "active_connections": load(&self.ingest.active_connections),
            },
            "pipeline": {
                "span_queue_size": load(&self.pipeline.span_queue_size),
                "records_discarded": load(&self.pipeline.records_discarded),
                "spans_created": load(&self.pipeline.spans_created),
                "batches_sealed": {
                    "size": load(&self.pipeline.batches_sealed_size),
                    "timeout": load(&self.pipeline.batches_sealed_timeout),
                    "shutdown": load(&self.pipeline.batches_sealed_shutdown),
                },
            },
            "export": {
                "batches_sent": load(&self.export.batches_sent),
                "spans_exported": load(&self.export.spans_exported),
                "export_failures": load(&self.export.export_failures),
                "export_retries": load(&self.export.export_retries),
                "batches_short_circuited": load(&self.export.batches_short_circuited),
                "circuit_breaker_state": load(&self.export.circuit_breaker_state),
                "circuit_breaker_transitions": load(&self.export.circuit_breaker_transitions),
            },
            "correlation": {
                "records_written": load(&self.correlation.records_written),
                "write_failures": load(&self.correlation.write_failures),
                "records_dropped": load(&self.correlation.records_dropped),
            },
            "batch_latency_seconds": {
                "count": self.batch_latency.count(),
                "sum": self.batch_latency.sum_seconds(),
            },
        })
    }
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn write_metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} {}\n", name, kind));
    output.push_str(&format!("{} {}\n\n", name, value));
}

/// Listener and parser metrics
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub records_received: AtomicU64,
    pub records_parsed: AtomicU64,
    pub records_rejected: AtomicU64,
    pub records_dropped: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub active_connections: AtomicU64,
}

/// Queue, worker and batcher metrics
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub span_queue_size: AtomicU64,
    pub records_discarded: AtomicU64,
    pub spans_created: AtomicU64,
    pub batches_sealed_size: AtomicU64,
    pub batches_sealed_timeout: AtomicU64,
    pub batches_sealed_shutdown: AtomicU64,
}

/// Exporter and circuit breaker metrics
#[derive(Debug, Default)]
pub struct ExportMetrics {
    pub batches_sent: AtomicU64,
    pub spans_exported: AtomicU64,
    pub export_failures: AtomicU64,
    pub export_retries: AtomicU64,
    pub batches_short_circuited: AtomicU64,
    pub circuit_breaker_state: AtomicU64,
    pub circuit_breaker_transitions: AtomicU64,
}

/// Correlation side channel metrics
#[derive(Debug, Default)]
pub struct CorrelationMetrics {
    pub records_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub records_dropped: AtomicU64,
}

/// Fixed-bucket latency histogram
///
/// Buckets hold per-bucket counts; they are accumulated when rendered.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if let Some(idx) = LATENCY_BUCKETS.iter().position(|bound| secs <= *bound) {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Cumulative count of observations at or below each bucket bound
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        LATENCY_BUCKETS
            .iter()
            .zip(self.buckets.iter())
            .map(|(bound, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }

    fn write_prometheus(&self, output: &mut String, name: &str, help: &str) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} histogram\n", name));
        for (bound, count) in self.cumulative() {
            output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, bound, count));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, self.count()));
        output.push_str(&format!("{}_sum {}\n", name, self.sum_seconds()));
        output.push_str(&format!("{}_count {}\n\n", name, self.count()));
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(MetricsCollector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_names() {
        let metrics = create_metrics();
        metrics.ingest.records_received.fetch_add(3, Ordering::Relaxed);
        metrics.pipeline.span_queue_size.store(7, Ordering::Relaxed);

        let text = metrics.to_prometheus();
        assert!(text.contains("records_received_total 3\n"));
        assert!(text.contains("# TYPE span_queue_size gauge\n"));
        assert!(text.contains("span_queue_size 7\n"));
        assert!(text.contains("# TYPE batch_latency_seconds histogram\n"));
        assert!(text.contains("batch_latency_seconds_bucket{le=\"+Inf\"} 0\n"));
        for name in [
            "records_parsed_total",
            "batches_sent_total",
            "export_failures_total",
            "records_discarded_total",
            "circuit_breaker_state",
            "correlation_records_written_total",
            "active_connections",
        ] {
            assert!(text.contains(&format!("# TYPE {} ", name)), "missing {}", name);
        }
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = LatencyHistogram::default();
        histogram.observe(Duration::from_millis(3));
        histogram.observe(Duration::from_millis(30));
        histogram.observe(Duration::from_millis(30));
        histogram.observe(Duration::from_secs(20));

        let buckets = histogram.cumulative();
        assert_eq!(buckets[0], (0.005, 1));
        assert_eq!(buckets[3], (0.05, 3));
        assert_eq!(buckets[10], (10.0, 3));
        assert_eq!(histogram.count(), 4);
        assert!((histogram.sum_seconds() - 20.063).abs() < 1e-9);

        let mut text = String::new();
        histogram.write_prometheus(&mut text, "x", "y");
        assert!(text.contains("x_bucket{le=\"0.005\"} 1\n"));
        assert!(text.contains("x_bucket{le=\"+Inf\"} 4\n"));
    }

    #[test]
    fn test_json_shape() {
        let metrics = create_metrics();
        metrics.export.batches_sent.fetch_add(2, Ordering::Relaxed);
        let json = metrics.to_json();
        assert_eq!(json["export"]["batches_sent"], 2);
        assert_eq!(json["batch_latency_seconds"]["count"], 0);
    }
}

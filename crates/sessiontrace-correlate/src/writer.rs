//! Buffered background writer
//!
//! Workers hand records over with a non-blocking `try_send`. One task drains
//! the buffer and writes a batch when it reaches `batch_size` or when the
//! flush interval elapses, whichever comes first.

use crate::backend::CorrelationBackend;
use crate::line::{line_protocol, Measurements};
use sessiontrace_core::config::CorrelationStoreSettings;
use sessiontrace_core::metrics::SharedMetrics;
use sessiontrace_core::plugins::CorrelationSink;
use sessiontrace_core::span::{CorrelationRecord, TraceId};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Records buffered between workers and the writer
    pub buffer: usize,

    /// Records per write
    pub batch_size: usize,

    /// Longest a record waits before being written
    pub flush_interval: Duration,

    pub measurements: Measurements,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            buffer: 10_000,
            batch_size: 1_000,
            flush_interval: Duration::from_secs(1),
            measurements: Measurements::default(),
        }
    }
}

impl From<&CorrelationStoreSettings> for WriterConfig {
    fn from(settings: &CorrelationStoreSettings) -> Self {
        Self {
            buffer: settings.buffer,
            batch_size: settings.batch_size,
            flush_interval: settings.flush_interval,
            measurements: Measurements::from(settings),
        }
    }
}

/// Producer side of the side channel
#[derive(Clone)]
pub struct CorrelationWriter {
    tx: mpsc::Sender<CorrelationRecord>,
    metrics: SharedMetrics,
}

impl CorrelationSink for CorrelationWriter {
    fn record(&self, record: CorrelationRecord) {
        if let Err(e) = self.tx.try_send(record) {
            self.metrics
                .correlation
                .records_dropped
                .fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(r) => {
                    debug!("Correlation buffer full, dropped record for {}", r.session_id)
                }
                mpsc::error::TrySendError::Closed(r) => {
                    debug!("Correlation writer stopped, dropped record for {}", r.session_id)
                }
            }
        }
    }
}

/// Owner of the background writer task
pub struct WriterHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Write what is buffered and stop, giving up after `grace`
    pub async fn finish(self, grace: Duration) {
        let _ = self.stop.send(());
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Correlation writer task failed: {}", e),
            Err(_) => {
                warn!("Correlation writer did not finish within {:?}, abandoning", grace);
                task.abort();
            }
        }
    }
}

/// Start the writer task
pub fn spawn_writer(
    config: WriterConfig,
    backend: Arc<dyn CorrelationBackend>,
    metrics: SharedMetrics,
) -> (CorrelationWriter, WriterHandle) {
    let (tx, rx) = mpsc::channel(config.buffer.max(1));
    let (stop_tx, stop_rx) = oneshot::channel();

    let state = WriterState {
        config,
        backend,
        metrics: metrics.clone(),
        pending: Vec::new(),
    };
    let task = tokio::spawn(state.run(rx, stop_rx));

    (
        CorrelationWriter { tx, metrics },
        WriterHandle {
            stop: stop_tx,
            task,
        },
    )
}

struct WriterState {
    config: WriterConfig,
    backend: Arc<dyn CorrelationBackend>,
    metrics: SharedMetrics,
    pending: Vec<CorrelationRecord>,
}

impl WriterState {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<CorrelationRecord>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let batch_size = self.config.batch_size.max(1);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!("Correlation writer started");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    rx.close();
                    while let Ok(record) = rx.try_recv() {
                        self.pending.push(record);
                    }
                    break;
                }
                received = rx.recv() => match received {
                    Some(record) => {
                        self.pending.push(record);
                        if self.pending.len() >= batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        // Final write may exceed batch_size; split it
        while !self.pending.is_empty() {
            let rest = self.pending.split_off(self.pending.len().min(batch_size));
            self.flush().await;
            self.pending = rest;
        }
        info!("Correlation writer stopped");
    }

    /// Write pending records, one `(session, trace)` pair once
    async fn flush(&mut self) {
        let mut seen: HashSet<(String, TraceId)> = HashSet::with_capacity(self.pending.len());
        let lines: Vec<String> = self
            .pending
            .drain(..)
            .filter(|r| seen.insert((r.session_id.clone(), r.trace_id)))
            .map(|r| line_protocol(&r, &self.config.measurements))
            .collect();

        match self.backend.write_lines(&lines).await {
            Ok(()) => {
                self.metrics
                    .correlation
                    .records_written
                    .fetch_add(lines.len() as u64, Ordering::Relaxed);
                debug!("Wrote {} correlation records", lines.len());
            }
            Err(e) => {
                self.metrics
                    .correlation
                    .write_failures
                    .fetch_add(lines.len() as u64, Ordering::Relaxed);
                warn!("Failed to write {} correlation records: {}", lines.len(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CorrelationError, CorrelationResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use sessiontrace_core::events::EventKind;
    use sessiontrace_core::metrics::create_metrics;

    #[derive(Default)]
    struct RecordingBackend {
        writes: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl CorrelationBackend for RecordingBackend {
        async fn write_lines(&self, lines: &[String]) -> CorrelationResult<()> {
            if self.fail {
                return Err(CorrelationError::Rejected {
                    status: 503,
                    body: String::new(),
                });
            }
            self.writes.lock().push(lines.to_vec());
            Ok(())
        }
    }

    fn record(session: &str, trace: u8) -> CorrelationRecord {
        CorrelationRecord {
            session_id: session.to_string(),
            kind: EventKind::Logon,
            trace_id: TraceId::from_bytes([trace; 16]),
            recorded_at: Utc::now(),
        }
    }

    fn config(buffer: usize, batch_size: usize) -> WriterConfig {
        WriterConfig {
            buffer,
            batch_size,
            flush_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_at_batch_size() {
        let backend = Arc::new(RecordingBackend::default());
        let metrics = create_metrics();
        let (writer, handle) = spawn_writer(config(100, 3), backend.clone(), metrics.clone());

        for i in 0..3 {
            writer.record(record("s", i));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.writes.lock().len(), 1);
        assert_eq!(backend.writes.lock()[0].len(), 3);

        handle.finish(Duration::from_secs(1)).await;
        assert_eq!(
            metrics.correlation.records_written.load(Ordering::Relaxed),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_interval() {
        let backend = Arc::new(RecordingBackend::default());
        let (writer, _handle) = spawn_writer(config(100, 1000), backend.clone(), create_metrics());

        writer.record(record("s", 1));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(backend.writes.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(backend.writes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_written_once() {
        let backend = Arc::new(RecordingBackend::default());
        let (writer, handle) = spawn_writer(config(100, 1000), backend.clone(), create_metrics());

        writer.record(record("a", 1));
        writer.record(record("a", 1));
        writer.record(record("a", 2));
        writer.record(record("b", 1));
        handle.finish(Duration::from_secs(1)).await;

        let writes = backend.writes.lock();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 3);
    }

    #[tokio::test]
    async fn test_full_buffer_drops() {
        let backend = Arc::new(RecordingBackend::default());
        let metrics = create_metrics();
        let (writer, handle) = spawn_writer(config(2, 1000), backend.clone(), metrics.clone());

        // Writer task has not run yet on this single-threaded runtime
        for i in 0..5 {
            writer.record(record("s", i));
        }
        assert_eq!(
            metrics.correlation.records_dropped.load(Ordering::Relaxed),
            3
        );

        handle.finish(Duration::from_secs(1)).await;
        assert_eq!(backend.writes.lock()[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_counted_not_retried() {
        let backend = Arc::new(RecordingBackend {
            fail: true,
            ..Default::default()
        });
        let metrics = create_metrics();
        let (writer, handle) = spawn_writer(config(100, 2), backend, metrics.clone());

        for i in 0..4 {
            writer.record(record("s", i));
        }
        handle.finish(Duration::from_secs(1)).await;

        // Two failed writes of two records each
        let correlation = &metrics.correlation;
        assert_eq!(correlation.write_failures.load(Ordering::Relaxed), 4);
        assert_eq!(correlation.records_written.load(Ordering::Relaxed), 0);

        // Records after stop are dropped, not queued
        writer.record(record("s", 9));
        assert_eq!(correlation.records_dropped.load(Ordering::Relaxed), 1);
    }
}

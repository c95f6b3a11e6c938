//! Event pipeline - orchestrates the flow from queue to exporter
//!
//! ```text
//! producers -> queue -> workers -> batcher -> hand-off -> exporter tasks
//!                          \-> correlation sink
//! ```

use crate::batch::{Batch, Batcher};
use crate::config::PipelineSettings;
use crate::metrics::SharedMetrics;
use crate::plugins::{CorrelationSink, SpanExporter};
use crate::queue::{bounded, EventConsumer, EventProducer};
use crate::worker::{spawn_workers, WorkerContext};
use futures_util::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline is shutting down")]
    Stopped,
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of workers
    pub worker_count: usize,

    /// Events the queue holds before producers start waiting
    pub queue_capacity: usize,

    /// Spans per batch
    pub batch_size: usize,

    /// Maximum age of an open batch
    pub batch_timeout: Duration,

    /// Sealed batches waiting for an exporter task
    pub export_queue_capacity: usize,

    /// Number of exporter tasks
    pub export_concurrency: usize,

    /// Time allowed for draining on shutdown
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 10_000,
            batch_size: 200,
            batch_timeout: Duration::from_millis(200),
            export_queue_capacity: 16,
            export_concurrency: 2,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            worker_count: settings.worker_count,
            queue_capacity: settings.queue_capacity,
            batch_size: settings.batch_size,
            batch_timeout: settings.batch_timeout,
            export_queue_capacity: settings.export_queue_capacity,
            export_concurrency: settings.export_concurrency,
            shutdown_grace: settings.shutdown_grace,
        }
    }
}

/// What happened during shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued events thrown away when the grace period ran out
    pub discarded: usize,
    /// Every stage finished inside the grace period
    pub completed: bool,
}

/// The running pipeline
pub struct Pipeline {
    config: PipelineConfig,
    metrics: SharedMetrics,
    producer: Option<EventProducer>,
    consumer: EventConsumer,
    batcher: Arc<Batcher>,
    workers: Vec<JoinHandle<()>>,
    exporters: Vec<JoinHandle<()>>,
    timer: JoinHandle<()>,
    timer_stop: broadcast::Sender<()>,
}

impl Pipeline {
    /// Start workers, the batch timer and exporter tasks on the current runtime
    pub fn start(
        config: PipelineConfig,
        exporter: Arc<dyn SpanExporter>,
        correlation: Arc<dyn CorrelationSink>,
        metrics: SharedMetrics,
    ) -> Self {
        let (producer, consumer) = bounded(config.queue_capacity, metrics.clone());
        let (sealed_tx, sealed_rx) = mpsc::channel::<Batch>(config.export_queue_capacity.max(1));

        let batcher = Arc::new(Batcher::new(
            config.batch_size,
            config.batch_timeout,
            sealed_tx,
            metrics.clone(),
        ));

        let workers = spawn_workers(
            config.worker_count,
            WorkerContext {
                consumer: consumer.clone(),
                batcher: batcher.clone(),
                correlation,
                metrics: metrics.clone(),
            },
        );

        let (timer_stop, timer_rx) = broadcast::channel(1);
        let timer = tokio::spawn(batcher.clone().run_timer(timer_rx));

        let sealed_rx = Arc::new(Mutex::new(sealed_rx));
        let exporters = (0..config.export_concurrency.max(1))
            .map(|id| tokio::spawn(run_exporter(id, sealed_rx.clone(), exporter.clone())))
            .collect();

        info!(
            "Pipeline started: {} workers, {} exporter tasks, queue {}, batch {} / {:?}, exporter {}",
            workers.len(),
            config.export_concurrency.max(1),
            config.queue_capacity,
            config.batch_size,
            config.batch_timeout,
            exporter.name()
        );

        Self {
            config,
            metrics,
            producer: Some(producer),
            consumer,
            batcher,
            workers,
            exporters,
            timer,
            timer_stop,
        }
    }

    /// Handle for submitting events
    pub fn producer(&self) -> Result<EventProducer, PipelineError> {
        self.producer.clone().ok_or(PipelineError::Stopped)
    }

    /// Drain and stop every stage within the shutdown grace period
    ///
    /// Callers must drop every producer they hold (stop the listener) first,
    /// otherwise workers only stop when the grace period runs out.
    pub async fn shutdown(self) -> ShutdownReport {
        let deadline = Instant::now() + self.config.shutdown_grace;
        self.shutdown_until(deadline).await
    }

    /// Like [`Pipeline::shutdown`], with a deadline shared with other stages
    pub async fn shutdown_until(mut self, deadline: Instant) -> ShutdownReport {
        let mut report = ShutdownReport {
            completed: true,
            ..Default::default()
        };

        self.producer.take();
        info!(
            "Draining pipeline ({} queued events, {:?} left)",
            self.consumer_len(),
            deadline.saturating_duration_since(Instant::now())
        );

        // Workers
        let aborts: Vec<_> = self.workers.iter().map(|h| h.abort_handle()).collect();
        let workers = std::mem::take(&mut self.workers);
        if timeout_at(deadline, join_all(workers)).await.is_err() {
            for handle in &aborts {
                handle.abort();
            }
            report.completed = false;
        }
        let discarded = self.consumer.discard_remaining().await;
        if discarded > 0 {
            self.metrics
                .pipeline
                .records_discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            warn!(
                "Shutdown grace period elapsed, discarded {} queued events",
                discarded
            );
        }
        report.discarded = discarded;

        // Batch timer, then whatever is still open
        let _ = self.timer_stop.send(());
        if timeout_at(deadline, &mut self.timer).await.is_err() {
            self.timer.abort();
            report.completed = false;
        }
        match timeout_at(deadline, self.batcher.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not flush open batch: {}", e),
            Err(_) => {
                warn!(
                    "Shutdown grace period elapsed, dropping open batch of {} spans",
                    self.batcher.pending()
                );
                report.completed = false;
            }
        }

        // Exporters finish once the last sender (held by the batcher) is gone
        let Pipeline {
            batcher, exporters, ..
        } = self;
        drop(batcher);
        let aborts: Vec<_> = exporters.iter().map(|h| h.abort_handle()).collect();
        if timeout_at(deadline, join_all(exporters)).await.is_err() {
            warn!("Shutdown grace period elapsed with exports still in flight");
            for handle in &aborts {
                handle.abort();
            }
            report.completed = false;
        }

        info!("Pipeline stopped");
        report
    }

    fn consumer_len(&self) -> u64 {
        self.metrics.pipeline.span_queue_size.load(Ordering::Relaxed)
    }
}

async fn run_exporter(
    id: usize,
    sealed_rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    exporter: Arc<dyn SpanExporter>,
) {
    debug!("Exporter task {} started", id);
    loop {
        let next = sealed_rx.lock().await.recv().await;
        let Some(batch) = next else {
            break;
        };
        let spans = batch.len();
        let outcome = exporter.export(batch).await;
        debug!("Exporter task {}: batch of {} spans {:?}", id, spans, outcome);
    }
    debug!("Exporter task {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_frame;
    use crate::metrics::create_metrics;
    use crate::plugins::{ExportOutcome, NoopCorrelation, PluginInfo};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingExporter {
        batches: AtomicUsize,
        spans: AtomicUsize,
        delay: Duration,
    }

    impl PluginInfo for CountingExporter {
        fn name(&self) -> &str {
            "counting"
        }
    }

    #[async_trait]
    impl SpanExporter for CountingExporter {
        async fn export(&self, batch: Batch) -> ExportOutcome {
            tokio::time::sleep(self.delay).await;
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.spans.fetch_add(batch.len(), Ordering::SeqCst);
            ExportOutcome::Delivered
        }
    }

    fn frame(pid: usize) -> Vec<u8> {
        format!(
            r#"{{"eventKind":"Logon","sessionId":"3f2504e0-4f89-41d3-9a0c-0305e82c3301","processId":{},"occurredAt":"2024-01-01T00:00:00Z"}}"#,
            pid
        )
        .into_bytes()
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_everything() {
        let metrics = create_metrics();
        let exporter = Arc::new(CountingExporter::default());
        let pipeline = Pipeline::start(
            PipelineConfig {
                worker_count: 4,
                batch_size: 200,
                batch_timeout: Duration::from_secs(30),
                ..Default::default()
            },
            exporter.clone(),
            Arc::new(NoopCorrelation),
            metrics.clone(),
        );

        let producer = pipeline.producer().unwrap();
        for pid in 1..=250 {
            let event = parse_frame(&frame(pid), Utc::now()).unwrap();
            producer.push(event, Duration::from_millis(50)).await.unwrap();
        }
        drop(producer);

        let report = pipeline.shutdown().await;
        assert!(report.completed);
        assert_eq!(report.discarded, 0);
        assert_eq!(exporter.batches.load(Ordering::SeqCst), 2);
        assert_eq!(exporter.spans.load(Ordering::SeqCst), 250);
        assert_eq!(
            metrics.pipeline.batches_sealed_shutdown.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_discards_backlog() {
        let metrics = create_metrics();
        // Slow exporter, tiny hand-off: workers stall on the batcher
        let exporter = Arc::new(CountingExporter {
            delay: Duration::from_secs(60),
            ..Default::default()
        });
        let pipeline = Pipeline::start(
            PipelineConfig {
                worker_count: 1,
                queue_capacity: 100,
                batch_size: 1,
                export_queue_capacity: 1,
                export_concurrency: 1,
                shutdown_grace: Duration::from_secs(1),
                ..Default::default()
            },
            exporter,
            Arc::new(NoopCorrelation),
            metrics.clone(),
        );

        let producer = pipeline.producer().unwrap();
        for pid in 1..=50 {
            let event = parse_frame(&frame(pid), Utc::now()).unwrap();
            producer.push(event, Duration::from_millis(50)).await.unwrap();
        }
        drop(producer);

        let started = Instant::now();
        let report = pipeline.shutdown().await;
        assert!(!report.completed);
        assert!(report.discarded > 0);
        assert_eq!(
            metrics.pipeline.records_discarded.load(Ordering::Relaxed),
            report.discarded as u64
        );
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_honours_shared_deadline() {
        let metrics = create_metrics();
        let exporter = Arc::new(CountingExporter {
            delay: Duration::from_secs(60),
            ..Default::default()
        });
        let pipeline = Pipeline::start(
            PipelineConfig {
                worker_count: 1,
                batch_size: 1,
                export_queue_capacity: 1,
                export_concurrency: 1,
                shutdown_grace: Duration::from_secs(30),
                ..Default::default()
            },
            exporter,
            Arc::new(NoopCorrelation),
            metrics,
        );

        let producer = pipeline.producer().unwrap();
        for pid in 1..=10 {
            let event = parse_frame(&frame(pid), Utc::now()).unwrap();
            producer.push(event, Duration::from_millis(50)).await.unwrap();
        }
        drop(producer);

        // Part of the grace period was already spent by earlier stages
        let started = Instant::now();
        let report = pipeline
            .shutdown_until(started + Duration::from_secs(2))
            .await;
        assert!(!report.completed);
        assert!(started.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_idle_pipeline_shuts_down() {
        let pipeline = Pipeline::start(
            PipelineConfig::default(),
            Arc::new(CountingExporter::default()),
            Arc::new(NoopCorrelation),
            create_metrics(),
        );
        assert!(pipeline.producer().is_ok());
        let report = pipeline.shutdown().await;
        assert!(report.completed);
    }
}

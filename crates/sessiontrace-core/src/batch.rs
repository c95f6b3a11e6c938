//! Size- and age-bounded span batching
//!
//! Workers append spans to one shared open batch. The batch is sealed when it
//! reaches the size bound (by the worker that filled it) or when its age
//! reaches the timeout (by the timer task), whichever comes first. Sealed
//! batches go to a bounded hand-off channel drained by the exporter tasks.

use crate::metrics::SharedMetrics;
use crate::span::Span;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// The sealed-batch channel has no receivers left
#[derive(Debug, Error)]
#[error("export hand-off channel is closed")]
pub struct HandOffClosed;

/// Ordered spans bounded by count and age
#[derive(Debug)]
pub struct Batch {
    spans: Vec<Span>,
    created_at: Instant,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            spans: Vec::with_capacity(capacity),
            created_at: Instant::now(),
        }
    }

    pub fn from_spans(spans: Vec<Span>) -> Self {
        Self {
            spans,
            created_at: Instant::now(),
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    fn push(&mut self, span: Span) {
        self.spans.push(span);
    }
}

/// Why a batch was sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealTrigger {
    Size,
    Timeout,
    Shutdown,
}

/// Shared accumulator for the open batch
pub struct Batcher {
    max_size: usize,
    timeout: Duration,
    open: Mutex<Option<Batch>>,
    started: Notify,
    sealed_tx: mpsc::Sender<Batch>,
    metrics: SharedMetrics,
}

impl Batcher {
    pub fn new(
        max_size: usize,
        timeout: Duration,
        sealed_tx: mpsc::Sender<Batch>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            max_size: max_size.max(1),
            timeout,
            open: Mutex::new(None),
            started: Notify::new(),
            sealed_tx,
            metrics,
        }
    }

    /// Append a span, sealing the batch if this span fills it
    ///
    /// Waits only when the hand-off channel is full.
    pub async fn add(&self, span: Span) -> Result<(), HandOffClosed> {
        let mut started = false;
        let sealed = {
            let mut open = self.open.lock();
            let batch = open.get_or_insert_with(|| {
                started = true;
                Batch::with_capacity(self.max_size)
            });
            batch.push(span);
            if batch.len() >= self.max_size {
                open.take()
            } else {
                None
            }
        };

        if started {
            self.started.notify_one();
        }
        match sealed {
            Some(batch) => self.dispatch(batch, SealTrigger::Size).await,
            None => Ok(()),
        }
    }

    /// Seal the open batch if it is at least `timeout` old at `now`
    pub fn seal_expired(&self, now: Instant) -> Option<Batch> {
        let mut open = self.open.lock();
        match open.as_ref() {
            Some(batch) if now.duration_since(batch.created_at) >= self.timeout => open.take(),
            _ => None,
        }
    }

    /// Seal and hand off whatever is open
    pub async fn flush(&self) -> Result<(), HandOffClosed> {
        let sealed = self.open.lock().take();
        match sealed {
            Some(batch) if !batch.is_empty() => self.dispatch(batch, SealTrigger::Shutdown).await,
            _ => Ok(()),
        }
    }

    /// Spans in the open batch
    pub fn pending(&self) -> usize {
        self.open.lock().as_ref().map_or(0, Batch::len)
    }

    fn deadline(&self) -> Option<Instant> {
        self.open
            .lock()
            .as_ref()
            .map(|batch| batch.created_at + self.timeout)
    }

    async fn dispatch(&self, batch: Batch, trigger: SealTrigger) -> Result<(), HandOffClosed> {
        let counter = match trigger {
            SealTrigger::Size => &self.metrics.pipeline.batches_sealed_size,
            SealTrigger::Timeout => &self.metrics.pipeline.batches_sealed_timeout,
            SealTrigger::Shutdown => &self.metrics.pipeline.batches_sealed_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!("Sealed batch of {} spans ({:?})", batch.len(), trigger);

        self.sealed_tx.send(batch).await.map_err(|_| HandOffClosed)
    }

    /// Timer loop sealing batches that reach the age bound
    ///
    /// Runs until `stop` fires or the hand-off channel closes.
    pub async fn run_timer(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        loop {
            match self.deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            // The batch may have been sealed by size meanwhile
                            if let Some(batch) = self.seal_expired(Instant::now()) {
                                if self.dispatch(batch, SealTrigger::Timeout).await.is_err() {
                                    break;
                                }
                            }
                        }
                        _ = stop.recv() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.started.notified() => trace!("Batch timer armed"),
                        _ = stop.recv() => break,
                    }
                }
            }
        }
        debug!("Batch timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_frame;
    use crate::metrics::create_metrics;
    use crate::span::transform;

    fn span(pid: u32) -> Span {
        let frame = format!(
            r#"{{"eventKind":"Logon","sessionId":"3f2504e0-4f89-41d3-9a0c-0305e82c3301","processId":{},"occurredAt":"2024-01-01T00:00:00Z"}}"#,
            pid
        );
        transform(&parse_frame(frame.as_bytes(), chrono::Utc::now()).unwrap())
    }

    #[tokio::test]
    async fn test_seals_on_size() {
        let (tx, mut rx) = mpsc::channel(4);
        let batcher = Batcher::new(3, Duration::from_secs(60), tx, create_metrics());

        for pid in 1..=7 {
            batcher.add(span(pid)).await.unwrap();
        }

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert_eq!(batcher.pending(), 1);

        let pids: Vec<u64> = first
            .spans()
            .iter()
            .map(|s| u64::from_be_bytes(*s.span_id.as_bytes()))
            .collect();
        assert_eq!(pids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_sealed_after_timeout() {
        let metrics = create_metrics();
        let (tx, mut rx) = mpsc::channel(4);
        let batcher = Arc::new(Batcher::new(200, Duration::from_millis(200), tx, metrics.clone()));
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let timer = tokio::spawn(batcher.clone().run_timer(stop_rx));

        let started = Instant::now();
        for pid in 1..=250 {
            batcher.add(span(pid)).await.unwrap();
        }

        let full = rx.recv().await.unwrap();
        assert_eq!(full.len(), 200);

        let rest = rx.recv().await.unwrap();
        assert_eq!(rest.len(), 50);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(metrics.pipeline.batches_sealed_size.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.pipeline.batches_sealed_timeout.load(Ordering::Relaxed), 1);

        stop_tx.send(()).unwrap();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_measures_from_first_insertion() {
        let (tx, mut rx) = mpsc::channel(4);
        let batcher = Arc::new(Batcher::new(10, Duration::from_secs(1), tx, create_metrics()));
        let (_stop_tx, stop_rx) = broadcast::channel(1);
        tokio::spawn(batcher.clone().run_timer(stop_rx));

        // Idle time before the first span does not count
        tokio::time::sleep(Duration::from_secs(5)).await;
        batcher.add(span(1)).await.unwrap();
        let added = Instant::now();
        tokio::time::sleep(Duration::from_millis(500)).await;
        batcher.add(span(2)).await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(added.elapsed() >= Duration::from_secs(1));
        assert!(added.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_flush_seals_open_batch() {
        let (tx, mut rx) = mpsc::channel(4);
        let batcher = Batcher::new(10, Duration::from_secs(60), tx, create_metrics());
        batcher.flush().await.unwrap();
        assert!(rx.try_recv().is_err());

        batcher.add(span(1)).await.unwrap();
        batcher.flush().await.unwrap();
        assert_eq!(rx.try_recv().unwrap().len(), 1);
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_hand_off() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let batcher = Batcher::new(1, Duration::from_secs(1), tx, create_metrics());
        assert!(batcher.add(span(1)).await.is_err());
    }
}

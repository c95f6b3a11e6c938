//! Bounded event queue between connections and workers
//!
//! Producers wait a bounded amount of time for space and then drop the
//! event. Consumers share one receiver, so any idle worker takes the next
//! event.

use crate::events::SessionEvent;
use crate::metrics::SharedMetrics;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::Mutex;

/// Reasons an event could not be queued
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("queue stayed full for the enqueue timeout")]
    Full,

    #[error("queue is closed")]
    Closed,
}

/// Create a queue holding at most `capacity` events
pub fn bounded(capacity: usize, metrics: SharedMetrics) -> (EventProducer, EventConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventProducer {
            tx,
            metrics: metrics.clone(),
        },
        EventConsumer {
            rx: Arc::new(Mutex::new(rx)),
            metrics,
        },
    )
}

/// Sending half, cloned into every connection task
#[derive(Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<SessionEvent>,
    metrics: SharedMetrics,
}

impl EventProducer {
    /// Queue an event, waiting at most `wait` for space
    ///
    /// A timeout drops the event and counts it in `records_dropped_total`.
    pub async fn push(&self, event: SessionEvent, wait: Duration) -> Result<(), EnqueueError> {
        match self.tx.send_timeout(event, wait).await {
            Ok(()) => {
                self.metrics
                    .pipeline
                    .span_queue_size
                    .store(self.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.metrics
                    .ingest
                    .records_dropped
                    .fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Full)
            }
            Err(SendTimeoutError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Events currently waiting
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving half, shared by all workers
#[derive(Clone)]
pub struct EventConsumer {
    rx: Arc<Mutex<mpsc::Receiver<SessionEvent>>>,
    metrics: SharedMetrics,
}

impl EventConsumer {
    /// Take the next event, or `None` once every producer is gone and the
    /// queue is empty
    pub async fn pop(&self) -> Option<SessionEvent> {
        let mut rx = self.rx.lock().await;
        let event = rx.recv().await;
        self.metrics
            .pipeline
            .span_queue_size
            .store(rx.len() as u64, Ordering::Relaxed);
        event
    }

    /// Close the queue and throw away whatever is still in it
    ///
    /// Returns the number of events discarded.
    pub async fn discard_remaining(&self) -> usize {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.metrics
            .pipeline
            .span_queue_size
            .store(0, Ordering::Relaxed);
        discarded
    }
}

//! Worker pool
//!
//! Workers are symmetric and stateless: each one pulls the next event from
//! the shared queue, transforms it, records the correlation and hands the
//! span to the batcher.

use crate::batch::Batcher;
use crate::metrics::SharedMetrics;
use crate::plugins::CorrelationSink;
use crate::queue::EventConsumer;
use crate::span::{transform, CorrelationRecord};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Everything a worker needs, shared by the whole pool
#[derive(Clone)]
pub struct WorkerContext {
    pub consumer: EventConsumer,
    pub batcher: Arc<Batcher>,
    pub correlation: Arc<dyn CorrelationSink>,
    pub metrics: SharedMetrics,
}

/// Spawn `count` workers on the current runtime
pub fn spawn_workers(count: usize, ctx: WorkerContext) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| tokio::spawn(run_worker(id, ctx.clone())))
        .collect()
}

async fn run_worker(id: usize, ctx: WorkerContext) {
    debug!("Worker {} started", id);

    while let Some(event) = ctx.consumer.pop().await {
        let span = transform(&event);
        ctx.metrics
            .pipeline
            .spans_created
            .fetch_add(1, Ordering::Relaxed);
        trace!(
            "Worker {} transformed {} event for session {} into trace {}",
            id,
            event.kind,
            event.session_id,
            span.trace_id
        );

        ctx.correlation
            .record(CorrelationRecord::for_span(&span, Utc::now()));

        if let Err(e) = ctx.batcher.add(span).await {
            warn!("Worker {} stopping: {}", id, e);
            break;
        }
    }

    debug!("Worker {} stopped", id);
}

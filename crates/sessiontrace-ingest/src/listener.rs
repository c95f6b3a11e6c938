//! TCP listener for the event forwarder
//!
//! One task per connection. A read error or a closed connection only ends
//! that connection; bad frames are counted and skipped.

use crate::frame::{Frame, FrameReader};
use chrono::Utc;
use sessiontrace_core::config::PipelineSettings;
use sessiontrace_core::events::parse_frame;
use sessiontrace_core::metrics::SharedMetrics;
use sessiontrace_core::queue::{EnqueueError, EventProducer};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address
    pub addr: SocketAddr,

    /// Longest accepted frame
    pub max_frame_bytes: usize,

    /// How long to wait for queue space before dropping an event
    pub enqueue_timeout: Duration,

    /// How long open connections get to finish after shutdown
    pub drain_timeout: Duration,
}

impl From<&PipelineSettings> for ListenerConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            addr: settings.listen_addr,
            max_frame_bytes: settings.max_frame_bytes,
            enqueue_timeout: settings.enqueue_timeout,
            drain_timeout: settings.shutdown_grace,
        }
    }
}

/// A bound ingestion listener
pub struct SessionListener {
    config: ListenerConfig,
    listener: TcpListener,
    metrics: SharedMetrics,
}

impl SessionListener {
    /// Bind the listening socket
    ///
    /// Binding happens up front so the caller can treat failure as fatal.
    pub async fn bind(config: ListenerConfig, metrics: SharedMetrics) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.addr).await?;
        info!("Ingestion listener bound to {}", listener.local_addr()?);
        Ok(Self {
            config,
            listener,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `stop` becomes `true`
    ///
    /// Returns once every connection task has finished or been aborted after
    /// `drain_timeout`, which releases all clones of `producer`.
    pub async fn serve(self, producer: EventProducer, stop: watch::Receiver<bool>) {
        let mut stopped = stop.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.metrics.ingest.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        let conn = Connection {
                            peer,
                            producer: producer.clone(),
                            metrics: self.metrics.clone(),
                            max_frame_bytes: self.config.max_frame_bytes,
                            enqueue_timeout: self.config.enqueue_timeout,
                        };
                        connections.spawn(conn.run(stream, stop.clone()));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = async { stopped.wait_for(|stop| *stop).await.map(|_| ()) } => {
                    info!("Listener shutdown signal received");
                    break;
                }
            }
        }

        drop(self.listener);
        drop(producer);
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.drain_timeout, drain).await.is_err() {
            warn!(
                "Aborting {} connections still open after {:?}",
                connections.len(),
                self.config.drain_timeout
            );
            connections.shutdown().await;
        }
        info!("Ingestion listener stopped");
    }
}

/// Per-connection state
struct Connection {
    peer: SocketAddr,
    producer: EventProducer,
    metrics: SharedMetrics,
    max_frame_bytes: usize,
    enqueue_timeout: Duration,
}

impl Connection {
    async fn run<S: AsyncRead + Unpin>(self, stream: S, mut stop: watch::Receiver<bool>) {
        self.metrics
            .ingest
            .active_connections
            .fetch_add(1, Ordering::Relaxed);
        info!("New forwarder connection from {}", self.peer);

        let mut reader = FrameReader::new(stream, self.max_frame_bytes);
        loop {
            let frame = tokio::select! {
                frame = reader.next_frame() => frame,
                _ = stop.wait_for(|stop| *stop) => {
                    debug!("Closing connection from {} for shutdown", self.peer);
                    break;
                }
            };

            match frame {
                Ok(Some(Frame::Record(bytes))) => self.submit(&bytes).await,
                Ok(Some(Frame::Oversized(len))) => {
                    self.metrics
                        .ingest
                        .records_received
                        .fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .ingest
                        .records_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Discarded {} byte frame from {} (limit {})",
                        len, self.peer, self.max_frame_bytes
                    );
                }
                Ok(None) => {
                    info!("Connection closed by {}", self.peer);
                    break;
                }
                Err(e) => {
                    error!("Read error from {}: {}", self.peer, e);
                    break;
                }
            }
        }

        self.metrics
            .ingest
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Parse one frame and queue the event
    async fn submit(&self, bytes: &[u8]) {
        self.metrics
            .ingest
            .records_received
            .fetch_add(1, Ordering::Relaxed);

        let event = match parse_frame(bytes, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                self.metrics
                    .ingest
                    .records_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Rejected record from {} ({}): {} - frame: {}",
                    self.peer,
                    e.reason(),
                    e,
                    String::from_utf8_lossy(&bytes[..bytes.len().min(100)])
                );
                return;
            }
        };
        self.metrics
            .ingest
            .records_parsed
            .fetch_add(1, Ordering::Relaxed);

        let session = event.session_id.clone();
        match self.producer.push(event, self.enqueue_timeout).await {
            Ok(()) => {}
            Err(EnqueueError::Full) => {
                warn!("Queue full, dropped event for session {}", session);
            }
            Err(EnqueueError::Closed) => {
                debug!("Queue closed, dropped event for session {}", session);
            }
        }
    }
}

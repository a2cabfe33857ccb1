//! Graceful Shutdown Module
//!
//! Listens for SIGINT/SIGTERM, broadcasts the shutdown signal to the accept
//! loop, then gives pending cache writes a bounded window to finish. Uploads
//! still running when the window closes are dropped with the process.

use crate::cache_writer::CacheWriter;
use crate::metrics::ProxyMetrics;
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    cache_writer: Option<CacheWriter>,
    metrics: Option<Arc<ProxyMetrics>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            cache_writer: None,
            metrics: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Set cache writer whose pending uploads are drained on shutdown
    pub fn set_cache_writer(&mut self, cache_writer: CacheWriter) {
        self.cache_writer = Some(cache_writer);
    }

    /// Set metrics summarized on shutdown
    pub fn set_metrics(&mut self, metrics: Arc<ProxyMetrics>) {
        self.metrics = Some(metrics);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Block until SIGINT or SIGTERM, then broadcast the shutdown signal
    ///
    /// Pending cache writes are not touched here; call
    /// [`complete_shutdown`](Self::complete_shutdown) once the listeners have
    /// stopped and their in-flight requests have finished.
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown();
        Ok(())
    }

    /// Tell every subscriber to stop accepting work
    pub fn initiate_shutdown(&self) {
        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }
    }

    /// Drain pending cache writes and log the final counters
    ///
    /// Must run after the accept loops have returned, so that no request can
    /// enqueue a write once the drain has started.
    pub async fn complete_shutdown(&self) {
        if let Some(cache_writer) = &self.cache_writer {
            cache_writer.drain(self.shutdown_timeout).await;
        }

        if let Some(metrics) = &self.metrics {
            let snapshot = metrics.snapshot();
            info!(
                "Served {} requests (avg {}ms, {} upstream failures, {} non-success); cache writes: {} ok, {} failed, {} skipped, {} bytes",
                snapshot.requests_total,
                snapshot.average_response_time_ms(),
                snapshot.upstream_failures,
                snapshot.upstream_non_success,
                snapshot.cache_writes_succeeded,
                snapshot.cache_writes_failed,
                snapshot.cache_writes_skipped,
                snapshot.cache_bytes_written
            );
        }

        info!("Graceful shutdown completed");
    }
}

/// Per-component handle on the shutdown broadcast
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for the shutdown broadcast
    ///
    /// A closed or lagged channel also counts as shutdown.
    pub async fn wait_for_shutdown(&mut self) {
        match self.receiver.recv().await {
            Ok(()) => {
                debug!("Shutdown signal received");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Shutdown channel closed, treating as shutdown");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Shutdown receiver lagged by {} messages", skipped);
            }
        }
        self.shutdown_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_storage::ObjectStoreStorage;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_shutdown_signal_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut first = ShutdownSignal::new(coordinator.subscribe());
        let mut second = ShutdownSignal::new(coordinator.subscribe());
        assert!(!first.is_shutdown_requested());

        coordinator.initiate_shutdown();

        first.wait_for_shutdown().await;
        second.wait_for_shutdown().await;
        assert!(first.is_shutdown_requested());
        assert!(second.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_dropped_coordinator_counts_as_shutdown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = ShutdownSignal::new(coordinator.subscribe());
        drop(coordinator);

        signal.wait_for_shutdown().await;
        assert!(signal.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_lagged_receiver_counts_as_shutdown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = ShutdownSignal::new(coordinator.subscribe());
        for _ in 0..20 {
            coordinator.initiate_shutdown();
        }

        signal.wait_for_shutdown().await;
        assert!(signal.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_complete_shutdown_waits_for_pending_writes() {
        let memory = Arc::new(InMemory::new());
        let metrics = Arc::new(ProxyMetrics::new());
        let writer = CacheWriter::new(
            Arc::new(ObjectStoreStorage::new("processed", memory)),
            metrics.clone(),
            0,
        );

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.set_cache_writer(writer.clone());
        coordinator.set_metrics(metrics.clone());

        writer.enqueue(bytes::Bytes::from_static(b"late"), "late-key".to_string());
        coordinator.initiate_shutdown();
        coordinator.complete_shutdown().await;

        assert_eq!(metrics.pending_cache_writes(), 0);
        assert_eq!(metrics.snapshot().cache_writes_succeeded, 1);
    }
}

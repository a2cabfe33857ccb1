//! Cache Writer Module
//!
//! Persists successful upstream responses to object storage off the client's
//! critical path. Every qualifying response gets its own detached task; the
//! caller never waits on it and never learns its outcome.
//!
//! Writes are unconditional: there is no existence check, no deduplication of
//! concurrent writes to the same key and no retry. A failed write is logged
//! and forgotten.

use crate::metrics::ProxyMetrics;
use crate::object_storage::ObjectStorage;
use crate::upstream::UpstreamResponse;
use bytes::Bytes;
use hyper::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Marks an upload finished when dropped, including when the task panics
/// or is dropped by the runtime before it runs
struct PendingWrite {
    metrics: Arc<ProxyMetrics>,
}

impl PendingWrite {
    fn start(metrics: Arc<ProxyMetrics>) -> Self {
        metrics.record_cache_write_started();
        Self { metrics }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.metrics.record_cache_write_finished();
    }
}

/// Spawns detached uploads of transformation results
#[derive(Clone)]
pub struct CacheWriter {
    storage: Arc<dyn ObjectStorage>,
    metrics: Arc<ProxyMetrics>,
    /// `None` when concurrent uploads are unbounded
    upload_permits: Option<Arc<Semaphore>>,
}

impl CacheWriter {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        metrics: Arc<ProxyMetrics>,
        max_concurrent_uploads: usize,
    ) -> Self {
        let upload_permits = if max_concurrent_uploads > 0 {
            info!(
                "Cache writes limited to {} concurrent uploads",
                max_concurrent_uploads
            );
            Some(Arc::new(Semaphore::new(max_concurrent_uploads)))
        } else {
            None
        };

        Self {
            storage,
            metrics,
            upload_permits,
        }
    }

    /// Whether a response to `method` may be written to storage
    ///
    /// Only a `200 OK` to a `GET` carries a complete transformation result.
    pub fn is_cacheable(method: &Method, response: &UpstreamResponse) -> bool {
        *method == Method::GET && response.is_success()
    }

    /// Cache `response` under `key` if it qualifies
    ///
    /// Returns the handle of the detached upload, or `None` when the response
    /// was skipped. Dropping the handle does not cancel the upload.
    pub fn maybe_enqueue(
        &self,
        method: &Method,
        response: &UpstreamResponse,
        key: String,
    ) -> Option<JoinHandle<()>> {
        if !Self::is_cacheable(method, response) {
            debug!(
                "Skipping cache write for {} response to {}: key={}",
                response.status, method, key
            );
            self.metrics.record_cache_write_skipped();
            return None;
        }
        Some(self.enqueue(response.body.clone(), key))
    }

    /// Start a detached upload of `body` under `key` and return immediately
    pub fn enqueue(&self, body: Bytes, key: String) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let metrics = Arc::clone(&self.metrics);
        let upload_permits = self.upload_permits.clone();

        let pending = PendingWrite::start(Arc::clone(&metrics));

        tokio::spawn(async move {
            let _pending = pending;
            let _permit = match upload_permits {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };

            let start = Instant::now();
            let size = body.len() as u64;

            match storage.put_object(&key, body).await {
                Ok(()) => {
                    metrics.record_cache_write_succeeded(size);
                    debug!(
                        "Cached response: bucket={}, key={}, bytes={}, duration={:?}",
                        storage.bucket(),
                        key,
                        size,
                        start.elapsed()
                    );
                }
                Err(e) => {
                    metrics.record_cache_write_failed();
                    error!(
                        "Failed to cache response: bucket={}, key={}, error={}",
                        storage.bucket(),
                        key,
                        e
                    );
                }
            }
        })
    }

    /// Wait for in-flight uploads to finish, up to `timeout`
    ///
    /// Returns the number of uploads still pending when the wait ended.
    pub async fn drain(&self, timeout: Duration) -> u64 {
        let start = Instant::now();
        let mut pending = self.metrics.pending_cache_writes();
        if pending == 0 {
            return 0;
        }

        info!(
            "Waiting for {} pending cache write(s) (timeout: {:?})",
            pending, timeout
        );
        while pending > 0 && start.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pending = self.metrics.pending_cache_writes();
        }

        if pending > 0 {
            warn!("{} cache write(s) still pending at shutdown", pending);
        } else {
            info!("All pending cache writes completed");
        }
        pending
    }
}

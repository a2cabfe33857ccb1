//! Metrics Module
//!
//! Lock-free counters for forwarded requests and cache writes. Shared across
//! connection tasks and detached upload tasks; summarized in the log on
//! shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Request and cache-write counters
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    requests_total: AtomicU64,
    upstream_failures: AtomicU64,
    upstream_non_success: AtomicU64,
    response_time_ms_total: AtomicU64,
    cache_writes_started: AtomicU64,
    cache_writes_succeeded: AtomicU64,
    cache_writes_failed: AtomicU64,
    cache_writes_skipped: AtomicU64,
    cache_bytes_written: AtomicU64,
    cache_writes_pending: AtomicU64,
}

/// Point-in-time copy of [`ProxyMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub upstream_failures: u64,
    pub upstream_non_success: u64,
    pub response_time_ms_total: u64,
    pub cache_writes_started: u64,
    pub cache_writes_succeeded: u64,
    pub cache_writes_failed: u64,
    pub cache_writes_skipped: u64,
    pub cache_bytes_written: u64,
    pub cache_writes_pending: u64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatched client response
    pub fn record_request(&self, upstream_success: bool, response_time: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.response_time_ms_total
            .fetch_add(response_time.as_millis() as u64, Ordering::Relaxed);
        if !upstream_success {
            self.upstream_non_success.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_write_skipped(&self) {
        self.cache_writes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_write_started(&self) {
        self.cache_writes_started.fetch_add(1, Ordering::Relaxed);
        self.cache_writes_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_write_succeeded(&self, bytes: u64) {
        self.cache_writes_succeeded.fetch_add(1, Ordering::Relaxed);
        self.cache_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_cache_write_failed(&self) {
        self.cache_writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Upload task ended, whatever the outcome
    pub fn record_cache_write_finished(&self) {
        self.cache_writes_pending.fetch_sub(1, Ordering::Relaxed);
    }

    /// Uploads spawned but not yet finished
    pub fn pending_cache_writes(&self) -> u64 {
        self.cache_writes_pending.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            upstream_non_success: self.upstream_non_success.load(Ordering::Relaxed),
            response_time_ms_total: self.response_time_ms_total.load(Ordering::Relaxed),
            cache_writes_started: self.cache_writes_started.load(Ordering::Relaxed),
            cache_writes_succeeded: self.cache_writes_succeeded.load(Ordering::Relaxed),
            cache_writes_failed: self.cache_writes_failed.load(Ordering::Relaxed),
            cache_writes_skipped: self.cache_writes_skipped.load(Ordering::Relaxed),
            cache_bytes_written: self.cache_bytes_written.load(Ordering::Relaxed),
            cache_writes_pending: self.cache_writes_pending.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Mean client response time in milliseconds
    pub fn average_response_time_ms(&self) -> u64 {
        if self.requests_total == 0 {
            0
        } else {
            self.response_time_ms_total / self.requests_total
        }
    }
}

//! Readiness Gate
//!
//! Blocks startup until the upstream engine answers its health endpoint with a
//! success status, or gives up once the configured window has elapsed. Polling
//! runs at a fixed interval; there is no backoff.

use crate::upstream::UpstreamClient;
use crate::{ProxyError, Result};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of waiting for the upstream engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Health endpoint answered 2xx after `attempts` probes
    Ready { attempts: u32, elapsed: Duration },
    /// Window elapsed without a healthy answer
    TimedOut { attempts: u32, elapsed: Duration },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    /// Convert a timeout into the fatal startup error
    pub fn into_result(self) -> Result<()> {
        match self {
            Readiness::Ready { .. } => Ok(()),
            Readiness::TimedOut { attempts, elapsed } => Err(ProxyError::StartupError(format!(
                "Upstream not healthy after {} attempts in {:?}",
                attempts, elapsed
            ))),
        }
    }
}

/// Poller for the upstream health endpoint
pub struct ReadinessGate<'a> {
    upstream: &'a UpstreamClient,
    health_path: String,
    interval: Duration,
}

impl<'a> ReadinessGate<'a> {
    pub fn new(upstream: &'a UpstreamClient, health_path: &str, interval: Duration) -> Self {
        Self {
            upstream,
            health_path: health_path.to_string(),
            interval,
        }
    }

    /// Poll until the first success or until `timeout` has elapsed
    ///
    /// Each probe is bounded by the remaining window, so the call never returns
    /// later than `timeout` plus scheduling slack.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Readiness {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0u32;

        info!(
            "Waiting for upstream {}{} to become healthy (timeout: {:?})",
            self.upstream.base_url(),
            self.health_path,
            timeout
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            match self.upstream.probe(&self.health_path, remaining).await {
                Ok(status) if status.is_success() => {
                    let elapsed = start.elapsed();
                    info!(
                        "Upstream is ready after {} attempt(s) in {:?}",
                        attempts, elapsed
                    );
                    return Readiness::Ready { attempts, elapsed };
                }
                Ok(status) => {
                    debug!("Upstream health attempt {} returned {}", attempts, status);
                }
                Err(e) => {
                    debug!("Upstream health attempt {} failed: {}", attempts, e);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.interval.min(remaining)).await;
        }

        Readiness::TimedOut {
            attempts,
            elapsed: start.elapsed(),
        }
    }
}

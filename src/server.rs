//! Server Lifecycle Module
//!
//! Wires the components together in startup order: readiness gate, object
//! storage, cache writer, listener. The listener is bound only after the
//! upstream engine has reported healthy. Shutdown runs in the reverse order:
//! stop accepting, let in-flight requests finish, then drain cache writes.

use crate::cache_writer::CacheWriter;
use crate::config::Config;
use crate::http_proxy::{HttpProxy, ProxyContext};
use crate::metrics::ProxyMetrics;
use crate::object_storage::{ObjectStorage, ObjectStoreStorage};
use crate::readiness::{Readiness, ReadinessGate};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::upstream::UpstreamClient;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound on waiting for the accept loop after the shutdown broadcast;
/// covers its own request drain window
const PROXY_STOP_TIMEOUT: Duration = Duration::from_secs(6);

/// Start the proxy against S3 and serve until SIGINT/SIGTERM
///
/// Returns `ProxyError::StartupError` without binding when the upstream never
/// becomes healthy.
pub async fn run(config: Arc<Config>) -> Result<()> {
    let server = ProxyServer::start(config).await?;
    server.run_until_signal().await
}

/// A started proxy: listener bound, accept loop running
pub struct ProxyServer {
    local_addr: SocketAddr,
    metrics: Arc<ProxyMetrics>,
    cache_writer: CacheWriter,
    coordinator: ShutdownCoordinator,
    proxy_task: JoinHandle<Result<()>>,
}

impl ProxyServer {
    /// Gate on upstream health, then start with the configured S3 bucket
    pub async fn start(config: Arc<Config>) -> Result<Self> {
        let upstream = Arc::new(UpstreamClient::from_config(&config));
        Self::wait_for_upstream(&config, &upstream).await?;

        let storage = Arc::new(ObjectStoreStorage::s3(&config.storage)?);
        Self::launch(config, upstream, storage).await
    }

    /// Gate on upstream health, then start with the given storage backend
    pub async fn start_with_storage(
        config: Arc<Config>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Result<Self> {
        let upstream = Arc::new(UpstreamClient::from_config(&config));
        Self::wait_for_upstream(&config, &upstream).await?;
        Self::launch(config, upstream, storage).await
    }

    async fn wait_for_upstream(config: &Config, upstream: &UpstreamClient) -> Result<()> {
        let gate = ReadinessGate::new(
            upstream,
            &config.upstream.health_path,
            config.upstream.health_check_interval,
        );
        let readiness = gate
            .wait_until_ready(config.upstream.health_check_timeout)
            .await;

        if let Readiness::TimedOut { attempts, elapsed } = readiness {
            error!(
                "Upstream {} did not become healthy after {} attempts in {:?}",
                upstream.base_url(),
                attempts,
                elapsed
            );
        }
        readiness.into_result()
    }

    async fn launch(
        config: Arc<Config>,
        upstream: Arc<UpstreamClient>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Result<Self> {
        let metrics = Arc::new(ProxyMetrics::new());
        let cache_writer = CacheWriter::new(
            storage,
            metrics.clone(),
            config.storage.max_concurrent_uploads,
        );

        let mut coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
        coordinator.set_cache_writer(cache_writer.clone());
        coordinator.set_metrics(metrics.clone());

        let proxy = HttpProxy::bind(ProxyContext {
            config,
            upstream,
            cache_writer: cache_writer.clone(),
            metrics: metrics.clone(),
        })
        .await?;
        let local_addr = proxy.local_addr();

        let shutdown_signal = ShutdownSignal::new(coordinator.subscribe());
        let proxy_task = tokio::spawn(proxy.start(shutdown_signal));

        Ok(Self {
            local_addr,
            metrics,
            cache_writer,
            coordinator,
            proxy_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cache_writer(&self) -> &CacheWriter {
        &self.cache_writer
    }

    /// Serve until SIGINT/SIGTERM, then shut down gracefully
    pub async fn run_until_signal(self) -> Result<()> {
        self.coordinator.listen_for_shutdown().await?;
        self.finish().await
    }

    /// Shut down gracefully without waiting for a signal
    pub async fn shutdown(self) -> Result<()> {
        self.coordinator.initiate_shutdown();
        self.finish().await
    }

    async fn finish(self) -> Result<()> {
        let stopped = match tokio::time::timeout(PROXY_STOP_TIMEOUT, self.proxy_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("HTTP proxy task failed: {}", e);
                Ok(())
            }
            Err(_) => {
                warn!("HTTP proxy still draining after {:?}", PROXY_STOP_TIMEOUT);
                Ok(())
            }
        };

        // only now can no request enqueue another write
        self.coordinator.complete_shutdown().await;
        info!("Image Cache Proxy shutdown complete");
        stopped
    }
}

use imgcache_proxy::{config::Config, logging::LoggerManager, server, ProxyError, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = LoggerManager::from_config(&config.logging);
    logger.initialize()?;

    info!("Starting Image Cache Proxy v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Listening address: {}, upstream: {}, bucket: {}, folder: '{}', endpoint: {}",
        config.server.bind_address,
        config.upstream_base(),
        config.storage.bucket,
        config.storage.folder,
        config.storage.endpoint
    );
    debug!("Configuration: {:?}", config);

    match server::run(config).await {
        Ok(()) => Ok(()),
        Err(ProxyError::StartupError(message)) => {
            error!("Startup failed, exiting: {}", message);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Image Cache Proxy failed: {}", e);
            std::process::exit(1);
        }
    }
}

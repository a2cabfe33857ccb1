//! Logging Module
//!
//! Installs the global tracing subscriber: a compact console layer and, when an
//! application log directory is configured, a daily-rotated file layer.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "imgcache-proxy.log";

/// Logger manager owning the subscriber setup
pub struct LoggerManager {
    config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Logger for the local host
    pub fn from_config(config: &LoggingConfig) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Self::new(config.clone(), hostname)
    }

    /// Directory receiving the rotated application log, if file logging is enabled
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Install the global subscriber
    ///
    /// `RUST_LOG` takes precedence over the configured level. A subscriber that
    /// is already installed (as in tests) is left in place.
    pub fn initialize(&self) -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let file_layer = match self.host_log_dir() {
            Some(dir) => {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    ProxyError::IoError(format!(
                        "Failed to create app log directory {:?}: {}",
                        dir, e
                    ))
                })?;
                let appender = RollingFileAppender::new(Rotation::DAILY, &dir, LOG_FILE_NAME);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init();

        match result {
            Ok(()) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = self.host_log_dir() {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }
}

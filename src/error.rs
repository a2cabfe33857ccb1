//! Error Module
//!
//! Defines error types and result types used throughout the image cache proxy.

use thiserror::Error;

/// Main error type for the image cache proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Startup error: {0}")]
    StartupError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// True for failures where the upstream call never produced a response
    pub fn is_gateway_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::HttpError(_) | ProxyError::ConnectionError(_) | ProxyError::TimeoutError(_)
        )
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            ProxyError::ConnectionError(err.to_string())
        } else {
            ProxyError::HttpError(err.to_string())
        }
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl From<object_store::Error> for ProxyError {
    fn from(err: object_store::Error) -> Self {
        ProxyError::StorageError(err.to_string())
    }
}

/// Result type alias for the image cache proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

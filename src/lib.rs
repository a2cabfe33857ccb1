//! Image Cache Proxy - cache-on-write reverse proxy for an image transformation engine
//!
//! This library provides the core functionality for the proxy server: upstream
//! readiness gating, verbatim request forwarding, response dispatch and
//! asynchronous persistence of transformation results to object storage.

pub mod cache_key;
pub mod cache_writer;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod logging;
pub mod metrics;
pub mod object_storage;
pub mod readiness;
pub mod server;
pub mod shutdown;
pub mod upstream;

pub use error::{ProxyError, Result};

//! Upstream Client Module
//!
//! Forwards requests to the image transformation engine and materializes its
//! responses. The inbound path and query are reused verbatim; the transform
//! syntax inside them is never interpreted.

use crate::config::Config;
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderName, CONTENT_LENGTH, HOST};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tracing::debug;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Inbound request as handed to the forwarder, body already collected
#[derive(Debug, Clone)]
pub struct UpstreamRequestContext {
    pub method: Method,
    /// Path and query exactly as received, e.g. `/_/rs:fill:50:50/plain/...`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Fully buffered response from the upstream engine
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_duration: Duration,
}

impl UpstreamResponse {
    /// Byte length of the materialized body
    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    /// Whether the upstream answered with its success status
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK
    }
}

/// HTTP client for the upstream engine
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    base_url: String,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(request_timeout));

        let client = Client::builder(TokioExecutor::new()).build(connector.clone());
        let probe_client = Client::builder(TokioExecutor::new()).build(connector);

        debug!(
            "Created upstream client: base_url={}, request_timeout={:?}",
            base_url, request_timeout
        );

        Self {
            client,
            probe_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.upstream_base(), config.server.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upstream URI for an inbound path-and-query, concatenated without rewriting
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri> {
        let target = if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        };
        target.parse().map_err(|e| {
            ProxyError::InvalidRequest(format!("Invalid upstream URI '{}': {}", target, e))
        })
    }

    /// Forward a request and buffer the complete response
    ///
    /// A response with any status is `Ok`; only transport failures and the
    /// request timeout are errors. Nothing is retried.
    pub async fn forward(&self, context: UpstreamRequestContext) -> Result<UpstreamResponse> {
        let start_time = Instant::now();
        let uri = self.target_uri(&context.path_and_query)?;

        let mut request_builder = Request::builder().method(&context.method).uri(&uri);
        for (name, value) in context.headers.iter() {
            if Self::is_forwardable(name) {
                request_builder = request_builder.header(name.clone(), value.clone());
            }
        }

        let request = request_builder
            .body(Full::new(context.body))
            .map_err(|e| ProxyError::HttpError(format!("Failed to build request: {}", e)))?;

        debug!("Forwarding {} request to {}", context.method, uri);

        let exchange = async {
            let response = self.client.request(request).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, ProxyError>((parts, body))
        };

        let (parts, body) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                ProxyError::TimeoutError(format!(
                    "Upstream did not respond within {:?}",
                    self.request_timeout
                ))
            })??;

        let request_duration = start_time.elapsed();
        debug!(
            "Upstream responded: status={}, bytes={}, duration={:?}",
            parts.status,
            body.len(),
            request_duration
        );

        Ok(UpstreamResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            request_duration,
        })
    }

    /// Single health probe: `GET {base}{path}` bounded by `timeout`
    pub async fn probe(&self, path: &str, timeout: Duration) -> Result<StatusCode> {
        let uri = self.target_uri(path)?;
        let request = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProxyError::HttpError(format!("Failed to build probe: {}", e)))?;

        let exchange = async {
            let response = self.probe_client.request(request).await?;
            let status = response.status();
            // drain so the connection can be reused by the next probe
            response.into_body().collect().await?;
            Ok::<_, ProxyError>(status)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ProxyError::TimeoutError(format!("Probe exceeded {:?}", timeout)))?
    }

    fn is_forwardable(name: &HeaderName) -> bool {
        // hyper recomputes content-length from the buffered body
        if name == HOST || name == CONTENT_LENGTH {
            return false;
        }
        !HOP_BY_HOP_HEADERS.contains(&name.as_str())
    }
}

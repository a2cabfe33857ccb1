//! HTTP Proxy Module
//!
//! Accepts client connections, forwards every request verbatim to the upstream
//! engine, dispatches the buffered upstream response back to the client and
//! hands successful results to the cache writer. The client response never
//! waits on the storage write.

use crate::cache_key::object_key;
use crate::cache_writer::CacheWriter;
use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::shutdown::ShutdownSignal;
use crate::upstream::{UpstreamClient, UpstreamRequestContext, UpstreamResponse};
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared, read-only handles used by every request
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    pub cache_writer: CacheWriter,
    pub metrics: Arc<ProxyMetrics>,
}

/// HTTP proxy server in front of the transformation engine
pub struct HttpProxy {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: ProxyContext,
    active_connections: Arc<AtomicUsize>,
    in_flight_requests: Arc<AtomicUsize>,
}

/// Counts a request from arrival until its cache write (if any) is enqueued
struct InFlightRequest {
    counter: Arc<AtomicUsize>,
}

impl InFlightRequest {
    fn start(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpProxy {
    /// Bind the listener on the configured address
    ///
    /// Call only after the readiness gate has passed: once bound, the socket
    /// accepts connections.
    pub async fn bind(context: ProxyContext) -> Result<Self> {
        let addr = context.config.bind_socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ProxyError::IoError(format!("Failed to bind HTTP proxy on {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            context,
            active_connections: Arc::new(AtomicUsize::new(0)),
            in_flight_requests: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until the shutdown signal fires
    ///
    /// Returns once every in-flight request has been answered and handed its
    /// result to the cache writer, or after the drain timeout. Idle keep-alive
    /// connections are not waited for.
    pub async fn start(self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        info!(
            "HTTP proxy listening on {}, forwarding to {}",
            self.local_addr,
            self.context.upstream.base_url()
        );

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let context = self.context.clone();
                            let active_connections = Arc::clone(&self.active_connections);
                            let in_flight_requests = Arc::clone(&self.in_flight_requests);
                            tokio::spawn(async move {
                                Self::serve_connection(
                                    stream,
                                    addr,
                                    context,
                                    active_connections,
                                    in_flight_requests,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        // Drain period: wait for in-flight requests to complete
        let drain_timeout = Duration::from_secs(5);
        let drain_start = Instant::now();
        let in_flight = self.in_flight_requests.load(Ordering::SeqCst);
        if in_flight > 0 {
            info!(
                "HTTP proxy draining {} in-flight requests on {} connections (timeout: {:?})",
                in_flight,
                self.active_connections.load(Ordering::Relaxed),
                drain_timeout
            );
            while self.in_flight_requests.load(Ordering::SeqCst) > 0
                && drain_start.elapsed() < drain_timeout
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let remaining = self.in_flight_requests.load(Ordering::SeqCst);
            if remaining > 0 {
                warn!("HTTP proxy shutdown with {} requests still in flight", remaining);
            }
        }

        info!("HTTP proxy stopped");
        Ok(())
    }

    /// Serve a single HTTP connection
    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        context: ProxyContext,
        active_connections: Arc<AtomicUsize>,
        in_flight_requests: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let context = context.clone();
            let in_flight = InFlightRequest::start(Arc::clone(&in_flight_requests));
            async move { Self::handle_request(req, addr, context, in_flight).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Handle a single HTTP request
    ///
    /// The work runs in its own task so that a client hanging up does not
    /// cancel the upstream call or the cache write that follows it. The
    /// in-flight marker travels with that task.
    async fn handle_request(
        req: Request<Incoming>,
        client_addr: SocketAddr,
        context: ProxyContext,
        in_flight: InFlightRequest,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let request_id = Uuid::new_v4();
        let work = tokio::spawn(async move {
            let _in_flight = in_flight;
            Self::process_request(req, client_addr, context, request_id).await
        });

        match work.await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request {} task failed: {}", request_id, e);
                Ok(Self::build_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal proxy error",
                ))
            }
        }
    }

    async fn process_request(
        req: Request<Incoming>,
        client_addr: SocketAddr,
        context: ProxyContext,
        request_id: Uuid,
    ) -> Response<Full<Bytes>> {
        let start_time = Instant::now();
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        debug!(
            "Request {}: {} {} from {}",
            request_id, parts.method, path_and_query, client_addr
        );

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("Request {}: failed to read request body: {}", request_id, e);
                return Self::build_error_response(
                    StatusCode::BAD_REQUEST,
                    "Failed to read request body",
                );
            }
        };

        let method = parts.method.clone();
        let upstream_request = UpstreamRequestContext {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
        };
        let key_source = upstream_request.path_and_query.clone();

        match context.upstream.forward(upstream_request).await {
            Ok(upstream_response) => {
                let key = object_key(&context.config.storage.folder, &key_source);
                context
                    .cache_writer
                    .maybe_enqueue(&method, &upstream_response, key);

                let success = upstream_response.is_success();
                if !success {
                    debug!(
                        "Request {}: upstream answered {}, passing through",
                        request_id, upstream_response.status
                    );
                }

                let response = Self::deliver(upstream_response);
                context
                    .metrics
                    .record_request(success, start_time.elapsed());
                response
            }
            Err(e) => {
                context.metrics.record_upstream_failure();
                warn!(
                    "Request {}: upstream call for {} {} failed: {}",
                    request_id, method, key_source, e
                );
                let status = match e {
                    ProxyError::TimeoutError(_) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                Self::build_error_response(status, "Upstream image engine unavailable")
            }
        }
    }

    /// Build the client response from a buffered upstream response
    ///
    /// Copies the status and the `content-type`/`content-length` headers; the
    /// length falls back to the buffered body size when the upstream sent none.
    pub fn deliver(upstream_response: UpstreamResponse) -> Response<Full<Bytes>> {
        let content_length = upstream_response
            .headers
            .get(CONTENT_LENGTH)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from(upstream_response.content_length()));

        let mut response = Response::new(Full::new(upstream_response.body));
        *response.status_mut() = upstream_response.status;

        let headers = response.headers_mut();
        if let Some(content_type) = upstream_response.headers.get(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, content_type.clone());
        }
        headers.insert(CONTENT_LENGTH, content_length);

        response
    }

    /// Plain-text response for failures the proxy itself reports
    fn build_error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
        let body = Bytes::from(format!("{}\n", message));
        let mut response = Response::new(Full::new(body.clone()));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        response
    }
}

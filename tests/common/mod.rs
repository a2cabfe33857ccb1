//! Shared fixtures for integration tests: a scripted upstream engine, a
//! proxy wired to in-memory object storage and a small HTTP client.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use imgcache_proxy::cache_writer::CacheWriter;
use imgcache_proxy::config::Config;
use imgcache_proxy::metrics::ProxyMetrics;
use imgcache_proxy::object_storage::{ObjectStorage, ObjectStoreStorage};
use imgcache_proxy::server::ProxyServer;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// How the scripted upstream behaves
#[derive(Clone, Default)]
pub struct UpstreamBehavior {
    /// Number of health probes answered 503 before the first 200
    pub health_failures: u32,
    /// Answer every health probe with 503
    pub never_healthy: bool,
    /// Delay before answering transformation requests
    pub response_delay: Duration,
}

/// A request the upstream received
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct UpstreamState {
    behavior: UpstreamBehavior,
    health_checks: AtomicU32,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Scripted stand-in for the image transformation engine
///
/// - `/health` answers 503 or 200 according to [`UpstreamBehavior`]
/// - paths under `/missing` answer 404, under `/broken` answer 500
/// - anything else answers 200 `image/png` with [`transformed_body`]
pub struct FakeUpstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
    task: JoinHandle<()>,
}

/// Body the fake engine returns for a successful transformation of `path`
pub fn transformed_body(path_and_query: &str) -> Bytes {
    Bytes::from(format!("PNG:{}", path_and_query))
}

impl FakeUpstream {
    pub async fn start(behavior: UpstreamBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(UpstreamState {
            behavior,
            health_checks: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Self::handle(req, state).await }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state, task }
    }

    /// Stop accepting connections; later requests are refused
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn health_checks(&self) -> u32 {
        self.state.health_checks.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    async fn handle(
        req: Request<Incoming>,
        state: Arc<UpstreamState>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        let method = req.method().clone();
        let headers = req.headers().clone();
        let body = req
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();

        if path_and_query == "/health" {
            let seen = state.health_checks.fetch_add(1, Ordering::SeqCst);
            let healthy = !state.behavior.never_healthy && seen >= state.behavior.health_failures;
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            return Ok(respond(status, "text/plain", Bytes::from_static(b"health")));
        }

        state.requests.lock().unwrap().push(RecordedRequest {
            method,
            path_and_query: path_and_query.clone(),
            headers,
            body,
        });

        if !state.behavior.response_delay.is_zero() {
            tokio::time::sleep(state.behavior.response_delay).await;
        }

        let response = if path_and_query.starts_with("/missing") {
            respond(
                StatusCode::NOT_FOUND,
                "text/plain",
                Bytes::from_static(b"source image not found"),
            )
        } else if path_and_query.starts_with("/broken") {
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Bytes::from_static(b"processing failed"),
            )
        } else {
            respond(StatusCode::OK, "image/png", transformed_body(&path_and_query))
        };
        Ok(response)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .header("x-engine-internal", "1")
        .body(Full::new(body))
        .unwrap()
}

/// Storage wrapper that holds every write for a fixed delay
pub struct SlowStorage {
    inner: ObjectStoreStorage,
    delay: Duration,
}

impl SlowStorage {
    pub fn new(store: Arc<InMemory>, delay: Duration) -> Self {
        Self {
            inner: ObjectStoreStorage::new("processed", store),
            delay,
        }
    }
}

#[async_trait]
impl ObjectStorage for SlowStorage {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn put_object(&self, key: &str, body: Bytes) -> imgcache_proxy::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_object(key, body).await
    }
}

/// Proxy under test, listening on an ephemeral port
pub struct TestProxy {
    pub addr: SocketAddr,
    pub memory: Arc<InMemory>,
    pub metrics: Arc<ProxyMetrics>,
    pub cache_writer: CacheWriter,
    // dropping the server closes the shutdown channel and stops the proxy
    server: Option<ProxyServer>,
}

/// Configuration pointing at `upstream_url` with an ephemeral listen port
pub fn test_config(upstream_url: &str, folder: &str) -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.server.request_timeout = Duration::from_secs(5);
    config.server.shutdown_timeout = Duration::from_secs(5);
    config.upstream.url = upstream_url.to_string();
    config.upstream.health_check_timeout = Duration::from_secs(5);
    config.upstream.health_check_interval = Duration::from_millis(20);
    config.storage.bucket = "processed".to_string();
    config.storage.folder = folder.to_string();
    config
}

/// In-memory storage as the proxy sees it
pub fn memory_storage(memory: Arc<InMemory>) -> Arc<dyn ObjectStorage> {
    Arc::new(ObjectStoreStorage::new("processed", memory))
}

impl TestProxy {
    pub async fn start(config: Config) -> Self {
        let memory = Arc::new(InMemory::new());
        let storage = memory_storage(memory.clone());
        Self::start_with_storage(config, memory, storage).await
    }

    pub async fn start_with_storage(
        config: Config,
        memory: Arc<InMemory>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        let server = ProxyServer::start_with_storage(Arc::new(config), storage)
            .await
            .unwrap();

        Self {
            addr: server.local_addr(),
            memory,
            metrics: server.metrics(),
            cache_writer: server.cache_writer().clone(),
            server: Some(server),
        }
    }

    /// Wait for all enqueued cache writes to settle
    pub async fn settle(&self) {
        assert_eq!(self.cache_writer.drain(Duration::from_secs(10)).await, 0);
    }

    pub async fn stored(&self, key: &str) -> Option<Bytes> {
        match self.memory.get(&Path::from(key)).await {
            Ok(result) => Some(result.bytes().await.unwrap()),
            Err(object_store::Error::NotFound { .. }) => None,
            Err(e) => panic!("unexpected storage error: {}", e),
        }
    }

    pub async fn stored_count(&self) -> usize {
        let listed = self.memory.list_with_delimiter(None).await.unwrap();
        listed.objects.len() + listed.common_prefixes.len()
    }

    /// Run the graceful shutdown sequence
    pub async fn shutdown(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await.unwrap();
        }
    }
}

/// Response as seen by a client of the proxy
pub struct ClientResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

pub async fn send(
    client: &Client<HttpConnector, Full<Bytes>>,
    addr: SocketAddr,
    method: Method,
    path_and_query: &str,
    body: Bytes,
) -> ClientResponse {
    let request = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", addr, path_and_query))
        .header("user-agent", "imgcache-proxy-tests")
        .body(Full::new(body))
        .unwrap();
    let response = client.request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    ClientResponse {
        status: parts.status,
        headers: parts.headers,
        body: body.collect().await.unwrap().to_bytes(),
    }
}

pub async fn get(addr: SocketAddr, path_and_query: &str) -> ClientResponse {
    send(&client(), addr, Method::GET, path_and_query, Bytes::new()).await
}

/// An address nothing is listening on
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

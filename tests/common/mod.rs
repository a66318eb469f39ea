//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway backend servers that record what the gateway sends
//! them, configuration and gateway builders, and request helpers used
//! across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use device_gateway::wrp::{MessageType, ENVELOPE_CONTENT_TYPE};
use device_gateway::{build_client, Config, Envelope, Gateway, RuntimeConfig};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Collects a response body into [`Bytes`].
pub async fn collect_body(body: Full<Bytes>) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Builds a `RuntimeConfig` targeting the given local backend address.
pub fn test_config(addr: SocketAddr) -> Arc<RuntimeConfig> {
    test_config_with_timeout(addr, 2_000)
}

/// Builds a `RuntimeConfig` with a short response timeout.
pub fn test_config_with_timeout(addr: SocketAddr, timeout_ms: u64) -> Arc<RuntimeConfig> {
    Arc::new(
        Config {
            target_url: format!("http://{addr}"),
            response_timeout_ms: Some(timeout_ms),
            ..Default::default()
        }
        .into_runtime()
        .expect("test config must be valid"),
    )
}

/// Builds a `RuntimeConfig` with a specific body size limit.
pub fn test_config_with_body_limit(addr: SocketAddr, limit: u64) -> Arc<RuntimeConfig> {
    Arc::new(
        Config {
            target_url: format!("http://{addr}"),
            max_body_size: Some(limit),
            ..Default::default()
        }
        .into_runtime()
        .expect("test config must be valid"),
    )
}

/// Builds a gateway over `config` with a fresh pooled client.
pub fn test_gateway(config: Arc<RuntimeConfig>) -> Arc<Gateway> {
    let client = build_client(&config);
    Arc::new(Gateway::new(config, client).expect("test gateway must build"))
}

/// Builds an inbound request with the given method, path, and body.
pub fn request(method: Method, path: &str, body: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

/// Encodes a backend envelope answer carrying `payload`.
pub fn envelope_body(payload: &str) -> Bytes {
    Envelope {
        message_type: MessageType::SimpleRequestResponse,
        source: "mac:112233445566/config".into(),
        destination: "config/device-gateway".into(),
        transaction_id: "backend-tid".into(),
        content_type: ENVELOPE_CONTENT_TYPE.into(),
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
    .encode()
    .expect("test envelope must encode")
}

/// What a test backend answers with.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: Bytes,
    pub delay: Duration,
}

impl Reply {
    /// A 200 answer carrying an envelope with `payload`.
    pub fn envelope(payload: &str) -> Self {
        Self {
            status: StatusCode::OK,
            headers: vec![("content-type", ENVELOPE_CONTENT_TYPE)],
            body: envelope_body(payload),
            delay: Duration::ZERO,
        }
    }

    /// An answer with the given status and raw body.
    pub fn raw(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::from_static(body.as_bytes()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A request as received by a test backend.
#[derive(Debug)]
pub struct Captured {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Captured {
    /// Decodes the captured body as an envelope.
    pub fn envelope(&self) -> Envelope {
        Envelope::decode(&self.body).expect("backend must receive an envelope")
    }

    /// Decodes the envelope payload as JSON.
    pub fn command(&self) -> serde_json::Value {
        serde_json::from_slice(&self.envelope().payload).expect("payload must be JSON")
    }
}

/// A running test backend. Dropping it shuts the server down.
pub struct Backend {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<Captured>,
    _shutdown: oneshot::Sender<()>,
}

impl Backend {
    /// Returns the next captured request, waiting briefly for it.
    pub async fn next_request(&mut self) -> Captured {
        tokio::time::timeout(Duration::from_secs(2), self.requests.recv())
            .await
            .expect("backend was not called")
            .expect("backend channel closed")
    }

    /// Asserts that the backend was never called.
    pub fn assert_untouched(&mut self) {
        assert!(
            self.requests.try_recv().is_err(),
            "backend should not have been called"
        );
    }
}

/// Starts a local HTTP server that records every request and answers each
/// one with `reply`, after `reply.delay`.
pub async fn start_backend(reply: Reply) -> Backend {
    let (tx, rx) = oneshot::channel::<()>();
    let (captured_tx, captured_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let reply = reply.clone();
                    let captured_tx = captured_tx.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let reply = reply.clone();
                        let captured_tx = captured_tx.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await.unwrap().to_bytes();
                            let _ = captured_tx.send(Captured {
                                method: parts.method,
                                path: parts.uri.path().to_owned(),
                                headers: parts.headers,
                                body,
                            });

                            tokio::time::sleep(reply.delay).await;

                            let mut builder = Response::builder().status(reply.status);
                            for (name, value) in &reply.headers {
                                builder = builder.header(*name, *value);
                            }
                            Ok::<_, std::convert::Infallible>(
                                builder
                                    .body(Full::new(reply.body))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    Backend {
        addr,
        requests: captured_rx,
        _shutdown: tx,
    }
}

//! Backend calls bounded by the caller's deadline and cancellation signal.
//!
//! Every call runs on its own spawned task and hands its result back over a
//! oneshot channel. The caller races that channel against the request
//! context. When the deadline or cancellation wins, the task is aborted,
//! which drops the in-flight request and closes its backend connection.
//! A oneshot send never blocks, so a task finishing just as it is abandoned
//! exits on its own.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::RequestContext;
use crate::wrp::{Envelope, ENVELOPE_CONTENT_TYPE};
use crate::{GatewayError, Result, RuntimeConfig};

/// The pooled HTTP client used for all backend calls.
pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Constructs the pooled backend client from the runtime configuration.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(HttpConnector::new())
}

/// A fully read backend response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Performs single-attempt backend calls. Cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    client: HttpClient,
}

impl RequestExecutor {
    /// Creates an executor owning the given client.
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    /// Sends `request` and waits for the full response, the context's
    /// deadline, or its cancellation, whichever comes first.
    ///
    /// A context that is already cancelled fails without contacting the
    /// backend. On deadline or cancellation the in-flight call is aborted.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        request: Request<Full<Bytes>>,
    ) -> Result<RawResponse> {
        if ctx.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();

        let _call = AbortOnDrop(tokio::spawn(async move {
            let result = perform(client, request).await;
            if tx.send(result).is_err() {
                debug!("caller stopped waiting, discarding backend result");
            }
        }));

        let deadline = tokio::time::Instant::from_std(ctx.deadline());
        tokio::select! {
            result = rx => result.unwrap_or_else(|_| {
                Err(GatewayError::Internal("backend task ended without a result".into()))
            }),
            () = tokio::time::sleep_until(deadline) => {
                debug!("deadline reached, aborting backend call");
                Err(GatewayError::DeadlineExceeded(ctx.timeout()))
            }
            () = ctx.cancelled() => {
                debug!("request cancelled, aborting backend call");
                Err(GatewayError::Cancelled)
            }
        }
    }
}

/// Aborts the backend call when the caller stops waiting for it, including
/// when the caller's own future is dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn perform(client: HttpClient, request: Request<Full<Bytes>>) -> Result<RawResponse> {
    let response = client.request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();

    Ok(RawResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

/// Builds the POST carrying `envelope` to the backend device endpoint,
/// forwarding the caller's `Authorization` value verbatim.
pub fn envelope_request(
    endpoint: &str,
    envelope: &Envelope,
    authorization: Option<&HeaderValue>,
) -> Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(endpoint)
        .header(CONTENT_TYPE, ENVELOPE_CONTENT_TYPE);
    if let Some(auth) = authorization {
        builder = builder.header(AUTHORIZATION, auth.clone());
    }
    Ok(builder.body(Full::new(envelope.encode()?))?)
}

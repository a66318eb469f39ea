//! The per-request translation pipeline.
//!
//! Every inbound request is wrapped in a [`tracing::Span`] carrying its
//! transaction id, then routed, decoded into a device command, wrapped in an
//! envelope, sent to the backend, and translated back. Failures are logged
//! here and handed to the error classifier, which never logs itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::AUTHORIZATION;
use hyper::{Method, Request, Response, StatusCode, Uri};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::context::RequestContext;
use crate::executor::{self, HttpClient, RequestExecutor};
use crate::routes::{Route, Router};
use crate::{headers, stat, translate, wdmp, wrp, GatewayError, Result, RuntimeConfig};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Long-lived state shared by all requests.
#[derive(Debug)]
pub struct Gateway {
    config: Arc<RuntimeConfig>,
    router: Router,
    executor: RequestExecutor,
}

impl Gateway {
    /// Assembles the gateway around a validated configuration and the pooled
    /// backend client, which the executor takes ownership of.
    pub fn new(config: Arc<RuntimeConfig>, client: HttpClient) -> Result<Self> {
        let router = Router::new(&config.api_base())?;
        Ok(Self {
            config,
            router,
            executor: RequestExecutor::new(client),
        })
    }

    /// The configuration this gateway was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// Handles a single inbound request and always produces a response.
///
/// `cancel` is the shared cancellation signal; flipping it to `true` makes
/// any in-flight backend wait return early.
pub async fn handle_request<B>(
    req: Request<B>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
    cancel: watch::Receiver<bool>,
) -> Response<Full<Bytes>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let ctx = RequestContext::capture(req.headers(), gateway.config.response_timeout, cancel);
    let method = req.method().clone();
    let uri = req.uri().clone();

    let span = tracing::info_span!(
        "request",
        tid = ctx.transaction_id_opt().unwrap_or("-"),
        method = %method,
        uri = %uri,
        client = %client_addr,
    );

    async move {
        let response = match process(req, &gateway, &ctx).await {
            Ok(response) => response,
            Err(err) => {
                if err.status_code().is_some() {
                    warn!(error = %err, "request rejected");
                } else {
                    error!(error = %err, "request failed");
                }
                err.into_response(ctx.transaction_id_opt())
            }
        };

        bookkeeping(&ctx, &method, &uri, client_addr, response.status());
        response
    }
    .instrument(span)
    .await
}

async fn process<B>(
    req: Request<B>,
    gateway: &Gateway,
    ctx: &RequestContext,
) -> Result<Response<Full<Bytes>>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let config = &gateway.config;

    if headers::is_smuggling_attempt(req.headers()) {
        return Err(GatewayError::RequestSmuggling);
    }
    if headers::content_length_exceeds(req.headers(), config.max_body_size) {
        return Err(GatewayError::BodyTooLarge {
            limit: config.max_body_size,
        });
    }

    let route = gateway.router.route(req.method(), req.uri().path())?;
    let transaction_id = ctx.transaction_id()?;

    let (parts, body) = req.into_parts();
    let authorization = parts.headers.get(AUTHORIZATION);

    let (backend_req, want_whole_body) = match route {
        Route::Stat { device_id } => (stat::stat_request(config, &device_id, authorization)?, true),
        Route::Device(vars) => {
            if !config.is_valid_service(&vars.service) {
                return Err(GatewayError::InvalidService(vars.service));
            }

            wdmp::precheck(&parts.method, &vars, &config.passthrough_service)?;
            let body = read_body(body, config.max_body_size).await?;
            let payload = wdmp::decode(
                &parts.method,
                &vars,
                parts.uri.query(),
                &parts.headers,
                body,
                &config.passthrough_service,
            )?;
            let envelope = wrp::build(
                payload.into_bytes()?,
                &vars,
                ctx,
                &config.application_name,
            )?;

            debug!(destination = %envelope.destination, "forwarding envelope");
            (
                executor::envelope_request(&config.device_endpoint(), &envelope, authorization)?,
                false,
            )
        }
    };

    let start = Instant::now();
    let raw = gateway.executor.execute(ctx, backend_req).await?;
    let latency_ms = start.elapsed().as_millis() as u64;

    if raw.status == StatusCode::OK {
        info!(status = raw.status.as_u16(), latency_ms, "backend responded");
    } else {
        warn!(
            status = raw.status.as_u16(),
            latency_ms,
            "non-200 response from backend"
        );
    }

    let response = translate::translate(raw, want_whole_body, &config.forward_header_prefix)?;
    Ok(translate::encode_response(response, transaction_id))
}

/// Reads the whole request body, enforcing `limit` for bodies that did not
/// declare their length up front.
async fn read_body<B>(body: B, limit: u64) -> Result<Bytes>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<StdError>,
{
    let limited = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX));
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(GatewayError::BodyTooLarge { limit })
        }
        Err(err) => Err(GatewayError::Internal(format!(
            "failed to read request body: {err}"
        ))),
    }
}

/// Logs the outcome of a request once its response is ready.
fn bookkeeping(
    ctx: &RequestContext,
    method: &Method,
    uri: &Uri,
    client_addr: SocketAddr,
    status: StatusCode,
) {
    let latency = match ctx.latency() {
        Some(latency) => format!("{latency:?}"),
        None => {
            error!("latency value could not be derived");
            "-".to_owned()
        }
    };

    info!(
        request_address = %client_addr,
        request_path = uri.path(),
        request_query = uri.query().unwrap_or_default(),
        request_method = %method,
        response_code = status.as_u16(),
        latency = %latency,
        "bookkeeping response"
    );
}

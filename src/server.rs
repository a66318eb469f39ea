//! Server accept loop and graceful shutdown.
//!
//! Contains the runtime infrastructure that sits between the TCP listener
//! and the per-request translation pipeline. Kept apart from `main()` so the
//! server can be driven from tests without signal handling or
//! `std::process::exit`.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::headers::{self, TRANSACTION_ID_HEADER};
use crate::{handle_request, Gateway, GatewayError};

/// How long shutdown waits for in-flight requests after cancelling them.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime state shared across the accept loop.
pub struct ServerState {
    /// The translation pipeline shared by all handlers.
    pub gateway: Arc<Gateway>,
    /// Bounds the number of concurrent in-flight requests.
    pub semaphore: Arc<Semaphore>,
    /// Cached value of the semaphore capacity, used in error messages.
    pub concurrency_limit: usize,
    /// Flipped to `true` on shutdown to cancel outstanding backend waits.
    pub cancel: watch::Sender<bool>,
}

impl ServerState {
    /// Builds the state for `gateway`, sizing the concurrency limit from its
    /// configuration.
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let concurrency_limit = gateway.config().max_concurrent_requests;
        let (cancel, _) = crate::context::cancellation();
        Self {
            gateway,
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
            cancel,
        }
    }
}

/// Accepts connections on `listener` and dispatches them through the
/// gateway pipeline.
///
/// Runs until `shutdown` resolves, then stops accepting connections,
/// cancels every outstanding backend wait, and gives in-flight requests up
/// to [`DRAIN_TIMEOUT`] to write their responses.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: impl Future<Output = ()>) {
    let ServerState {
        gateway,
        semaphore,
        concurrency_limit,
        cancel,
    } = state;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let gateway = Arc::clone(&gateway);
                let semaphore = Arc::clone(&semaphore);
                let cancel_rx = cancel.subscribe();

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let gateway = Arc::clone(&gateway);
                        let semaphore = Arc::clone(&semaphore);
                        let cancel_rx = cancel_rx.clone();
                        async move {
                            let _permit = match semaphore.try_acquire() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        limit = concurrency_limit,
                                        "concurrency limit reached, rejecting request"
                                    );
                                    let tid = headers::non_empty(req.headers(), TRANSACTION_ID_HEADER);
                                    let err = GatewayError::ServiceUnavailable {
                                        limit: concurrency_limit,
                                    };
                                    return Ok::<Response<Full<Bytes>>, Infallible>(
                                        err.into_response(tid.as_deref()),
                                    );
                                }
                            };

                            let resp = handle_request(req, gateway, client_addr, cancel_rx).await;
                            Ok::<Response<Full<Bytes>>, Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }

    cancel.send_replace(true);

    let permits = u32::try_from(concurrency_limit).unwrap_or(u32::MAX);
    match tokio::time::timeout(DRAIN_TIMEOUT, semaphore.acquire_many(permits)).await {
        Ok(_) => info!("in-flight requests drained"),
        Err(_) => warn!(
            in_flight = concurrency_limit - semaphore.available_permits(),
            "drain timed out with requests still in flight"
        ),
    };
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}

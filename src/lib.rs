//!
//! An HTTP gateway that turns REST-style device management requests into
//! protocol envelopes for a backend device cluster, built on [Hyper].
//!
//! A request such as `GET /api/v2/device/{id}/config?names=a,b` is decoded
//! into a device command ([`wdmp`]), wrapped in an envelope addressed to the
//! device ([`wrp`]), posted to the backend under the caller's deadline
//! ([`executor`]), and the backend's answer is translated back into a
//! status, headers, and body ([`translate`]).
//!
//! [Hyper]: https://hyper.rs/

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod headers;
pub mod routes;
pub mod server;
pub mod stat;
pub mod translate;
pub mod wdmp;
pub mod wrp;

pub use config::{Config, RuntimeConfig};
pub use context::RequestContext;
pub use error::GatewayError;
pub use executor::{build_client, HttpClient, RawResponse, RequestExecutor};
pub use gateway::{handle_request, Gateway};
pub use server::{serve, shutdown_signal, ServerState};
pub use translate::XmidtResponse;
pub use wdmp::{DeviceCommand, RequestPayload};
pub use wrp::Envelope;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

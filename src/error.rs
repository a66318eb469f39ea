//! Error types and the boundary classifier mapping them onto HTTP responses.
//!
//! Errors the caller can act on carry an explicit status code and keep their
//! message. Everything else is reported as a 500 with a fixed message so that
//! internal details never leave the gateway. Callers log the original error
//! before classifying it; nothing in this module logs.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

use crate::headers::TRANSACTION_ID_HEADER;

/// Message sent in place of any error that is not a coded error.
pub const INTERNAL_ERROR_MESSAGE: &str = "an unexpected error occurred while handling the request";

/// Content type of every JSON body the gateway writes itself.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Every failure the gateway can produce.
#[derive(Debug)]
pub enum GatewayError {
    /// A GET request without a `names` query parameter.
    EmptyNames,
    /// An add or replace request without a table path parameter.
    MissingTable,
    /// An add request without a row body, or a delete without a row id.
    MissingRow,
    /// A replace request without a non-empty list of rows.
    MissingRows,
    /// A PATCH body that fails shape or concurrency validation.
    InvalidSetPayload(String),
    /// A service outside the configured set, or a misused passthrough path.
    InvalidService(String),
    /// The HTTP method is not supported for the addressed resource.
    UnsupportedMethod(String),
    /// No route matches the requested path.
    NotFound(String),
    /// The request carried both `Content-Length` and `Transfer-Encoding`.
    RequestSmuggling,
    /// The declared request body exceeds the configured limit.
    BodyTooLarge { limit: u64 },
    /// The concurrency limit has been reached.
    ServiceUnavailable { limit: usize },
    /// The request context carries no transaction id.
    MissingTransactionId,
    /// The backend call did not finish before the request deadline.
    DeadlineExceeded(Duration),
    /// The request context was cancelled while the backend call was in flight.
    Cancelled,
    /// The backend could not be reached or its response could not be read.
    Transport(String),
    /// A JSON document could not be decoded or encoded.
    Json(serde_json::Error),
    /// The configuration file could not be loaded or is invalid.
    Config(String),
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyNames => write!(f, "names parameter is required"),
            Self::MissingTable => write!(f, "table property is required"),
            Self::MissingRow => write!(f, "row property is required"),
            Self::MissingRows => write!(f, "rows property is required"),
            Self::InvalidSetPayload(reason) => write!(f, "invalid SET message: {reason}"),
            Self::InvalidService(service) => write!(f, "invalid service: {service}"),
            Self::UnsupportedMethod(method) => {
                write!(f, "unsupported method {method}, could not decode request payload")
            }
            Self::NotFound(path) => write!(f, "no resource found at {path}"),
            Self::RequestSmuggling => write!(
                f,
                "request contains both Content-Length and Transfer-Encoding headers"
            ),
            Self::BodyTooLarge { limit } => {
                write!(f, "request body exceeds maximum size of {limit} bytes")
            }
            Self::ServiceUnavailable { limit } => {
                write!(f, "concurrency limit of {limit} reached")
            }
            Self::MissingTransactionId => write!(f, "request context has no transaction id"),
            Self::DeadlineExceeded(timeout) => {
                write!(f, "backend call exceeded the deadline of {}ms", timeout.as_millis())
            }
            Self::Cancelled => write!(f, "request context was cancelled"),
            Self::Transport(msg) => write!(f, "backend transport error: {msg}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl GatewayError {
    /// Returns the explicit status code of a coded error, or `None` for
    /// errors whose details must be masked.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::EmptyNames
            | Self::MissingTable
            | Self::MissingRow
            | Self::MissingRows
            | Self::InvalidSetPayload(_)
            | Self::InvalidService(_)
            | Self::RequestSmuggling => Some(StatusCode::BAD_REQUEST),
            Self::UnsupportedMethod(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            Self::NotFound(_) => Some(StatusCode::NOT_FOUND),
            Self::BodyTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Self::ServiceUnavailable { .. } => Some(StatusCode::SERVICE_UNAVAILABLE),
            Self::MissingTransactionId
            | Self::DeadlineExceeded(_)
            | Self::Cancelled
            | Self::Transport(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Internal(_) => None,
        }
    }

    /// Classifies this error into the status and JSON body sent to the caller.
    ///
    /// Coded errors keep their status and message; any other error becomes a
    /// 500 carrying [`INTERNAL_ERROR_MESSAGE`].
    pub fn classify(&self) -> (StatusCode, Bytes) {
        let (status, message) = match self.status_code() {
            Some(status) => (status, self.to_string()),
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_ERROR_MESSAGE.to_owned(),
            ),
        };
        let body = serde_json::json!({ "message": message });
        (status, Bytes::from(body.to_string()))
    }

    /// Converts this error into the caller-facing response, echoing the
    /// transaction id when one is known.
    pub fn into_response(self, transaction_id: Option<&str>) -> Response<Full<Bytes>> {
        let (status, body) = self.classify();
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        if let Some(value) = transaction_id.and_then(|tid| HeaderValue::from_str(tid).ok()) {
            headers.insert(TRANSACTION_ID_HEADER, value);
        }
        response
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for GatewayError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

//! Configuration loading, validation, and pre-computed runtime state.
//!
//! The gateway reads its YAML configuration exactly once at startup and
//! turns it into a [`RuntimeConfig`] holding the parsed backend URL, the
//! service allow-list, and all timeouts as [`Duration`]s.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{GatewayError, Result};

/// Default maximum request body size: 10 MiB.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Default time the gateway waits for the backend before giving up.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(40);

/// Default idle timeout for pooled connections before they are closed.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per backend host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Default maximum number of concurrent in-flight requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Upper bound for `max_concurrent_requests`: what a semaphore can hold and
/// what shutdown can reclaim in a single acquisition.
pub const MAX_CONCURRENT_REQUESTS_LIMIT: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6100";

/// Default API version segment, used both inbound and towards the backend.
pub const DEFAULT_API_VERSION: &str = "v2";

/// Default service whose POST bodies are forwarded without interpretation.
pub const DEFAULT_PASSTHROUGH_SERVICE: &str = "iot";

/// Default prefix selecting which backend response headers are forwarded.
pub const DEFAULT_FORWARD_HEADER_PREFIX: &str = "X";

/// Default name used as the source of outbound envelopes.
pub const DEFAULT_APPLICATION_NAME: &str = "device-gateway";

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:6100"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Base URL of the backend cluster (e.g. `"http://petasos:6000"`).
    #[serde(default)]
    pub target_url: String,
    /// API version segment (default `"v2"`).
    #[serde(default)]
    pub api_version: Option<String>,
    /// Time in milliseconds to wait for a backend response (default: 40000).
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
    /// Services accepted in the `{service}` path segment.
    #[serde(default)]
    pub valid_services: Vec<String>,
    /// Service whose POST body is forwarded verbatim (default `"iot"`).
    #[serde(default)]
    pub passthrough_service: Option<String>,
    /// Prefix of backend response headers copied to the caller (default `"X"`).
    #[serde(default)]
    pub forward_header_prefix: Option<String>,
    /// Name stamped into the source of outbound envelopes.
    #[serde(default)]
    pub application_name: Option<String>,
    /// Maximum allowed request body size in bytes (default: 10 MiB).
    #[serde(default)]
    pub max_body_size: Option<u64>,
    /// Idle timeout in milliseconds for pooled connections (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Maximum idle connections kept per backend host (default: 32).
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    /// Maximum concurrent in-flight requests before returning 503
    /// Service Unavailable (default: 1000).
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    /// Socket address the gateway binds to.
    pub listen: SocketAddr,
    /// Backend base URL without a trailing slash.
    pub target_url: String,
    /// API version segment.
    pub api_version: String,
    /// Per-call response timeout.
    pub response_timeout: Duration,
    /// Services accepted in the `{service}` path segment.
    pub valid_services: HashSet<String>,
    /// Service whose POST body is forwarded verbatim.
    pub passthrough_service: String,
    /// Prefix of backend response headers copied to the caller.
    pub forward_header_prefix: String,
    /// Source name for outbound envelopes.
    pub application_name: String,
    /// Maximum request body size in bytes.
    pub max_body_size: u64,
    /// Idle timeout for pooled backend connections.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per backend host.
    pub pool_max_idle_per_host: usize,
    /// Maximum concurrent in-flight requests. Overflow yields 503.
    pub max_concurrent_requests: usize,
}

/// Validates the backend base URL, returning it without a trailing slash.
fn validate_target(target_url: &str) -> Result<String> {
    let trimmed = target_url.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(GatewayError::Config("target_url must not be empty".into()));
    }

    let uri = trimmed
        .parse::<hyper::Uri>()
        .map_err(|e| GatewayError::Config(format!("invalid target_url \"{trimmed}\": {e}")))?;

    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(GatewayError::Config(format!(
            "target_url must be absolute: {trimmed}"
        )));
    }

    Ok(trimmed.to_owned())
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields and applies defaults, producing a
    /// [`RuntimeConfig`].
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let target_url = validate_target(&self.target_url)?;

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            GatewayError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let response_timeout = self
            .response_timeout_ms
            .map_or(DEFAULT_RESPONSE_TIMEOUT, Duration::from_millis);
        if response_timeout.is_zero() {
            return Err(GatewayError::Config(
                "response_timeout_ms must be positive".into(),
            ));
        }

        let passthrough_service = self
            .passthrough_service
            .unwrap_or_else(|| DEFAULT_PASSTHROUGH_SERVICE.into());

        let valid_services: HashSet<String> = if self.valid_services.is_empty() {
            ["config".to_owned(), passthrough_service.clone()].into()
        } else {
            self.valid_services
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect()
        };
        if valid_services.is_empty() {
            return Err(GatewayError::Config(
                "valid_services must name at least one service".into(),
            ));
        }

        let max_concurrent_requests = self
            .max_concurrent_requests
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
        if max_concurrent_requests == 0 || max_concurrent_requests > MAX_CONCURRENT_REQUESTS_LIMIT
        {
            return Err(GatewayError::Config(format!(
                "max_concurrent_requests must be between 1 and {MAX_CONCURRENT_REQUESTS_LIMIT}"
            )));
        }

        Ok(RuntimeConfig {
            listen,
            target_url,
            api_version: self
                .api_version
                .unwrap_or_else(|| DEFAULT_API_VERSION.into()),
            response_timeout,
            valid_services,
            passthrough_service,
            forward_header_prefix: self
                .forward_header_prefix
                .unwrap_or_else(|| DEFAULT_FORWARD_HEADER_PREFIX.into()),
            application_name: self
                .application_name
                .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.into()),
            max_body_size: self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            pool_idle_timeout: self
                .pool_idle_timeout_ms
                .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis),
            pool_max_idle_per_host: self
                .pool_max_idle_per_host
                .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST),
            max_concurrent_requests,
        })
    }
}

impl RuntimeConfig {
    /// Path prefix every inbound route lives under, e.g. `/api/v2`.
    pub fn api_base(&self) -> String {
        format!("/api/{}", self.api_version)
    }

    /// Backend endpoint receiving envelopes.
    pub fn device_endpoint(&self) -> String {
        format!("{}/api/{}/device", self.target_url, self.api_version)
    }

    /// Backend endpoint reporting statistics for one device.
    pub fn stat_endpoint(&self, device_id: &str) -> String {
        format!("{}/{device_id}/stat", self.device_endpoint())
    }

    /// Returns `true` if `service` may be addressed through the device API.
    pub fn is_valid_service(&self, service: &str) -> bool {
        self.valid_services.contains(service)
    }
}

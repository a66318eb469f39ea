//! Path matching for the device API.
//!
//! Routes live under the configured API base (e.g. `/api/v2`):
//!
//! | Path | Methods |
//! |---|---|
//! | `/device/{deviceid}/stat` | GET |
//! | `/device/{deviceid}/{service}` | GET, PATCH, POST |
//! | `/device/{deviceid}/{service}/{parameter}` | DELETE, PUT, POST |

use hyper::Method;
use regex::Regex;

use crate::{GatewayError, Result};

/// Service segment reserved for device statistics.
pub const STAT_SERVICE: &str = "stat";

/// Variables extracted from a matched device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathVars {
    /// The addressed device, copied verbatim from the path.
    pub device_id: String,
    /// The addressed service on the device.
    pub service: String,
    /// Table name or row id, for paths that carry one.
    pub parameter: Option<String>,
}

/// The outcome of matching an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Device statistics for the given device id.
    Stat { device_id: String },
    /// A device command against a service.
    Device(PathVars),
}

/// Compiled route table, built once at startup.
#[derive(Debug, Clone)]
pub struct Router {
    pattern: Regex,
}

impl Router {
    /// Compiles the route table for paths under `api_base`.
    pub fn new(api_base: &str) -> Result<Self> {
        let escaped = regex::escape(api_base.trim_end_matches('/'));
        let pattern = Regex::new(&format!(
            r"^{escaped}/device/(?P<deviceid>[^/]+)/(?P<service>[^/]+)(?:/(?P<parameter>[^/]+))?/?$"
        ))
        .map_err(|e| GatewayError::Config(format!("invalid route pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Matches `path` and checks `method` against the methods the matched
    /// route accepts.
    ///
    /// Unknown paths yield [`GatewayError::NotFound`], a known path with an
    /// unsupported method [`GatewayError::UnsupportedMethod`].
    pub fn route(&self, method: &Method, path: &str) -> Result<Route> {
        let captures = self
            .pattern
            .captures(path)
            .ok_or_else(|| GatewayError::NotFound(path.to_owned()))?;

        let device_id = captures["deviceid"].to_owned();
        let service = captures["service"].to_owned();
        let parameter = captures.name("parameter").map(|m| m.as_str().to_owned());

        let allowed: &[Method] = match (service.as_str(), &parameter) {
            (STAT_SERVICE, None) => &[Method::GET],
            (_, None) => &[Method::GET, Method::PATCH, Method::POST],
            (_, Some(_)) => &[Method::DELETE, Method::PUT, Method::POST],
        };
        if !allowed.contains(method) {
            return Err(GatewayError::UnsupportedMethod(method.to_string()));
        }

        if service == STAT_SERVICE && parameter.is_none() {
            return Ok(Route::Stat { device_id });
        }

        Ok(Route::Device(PathVars {
            device_id,
            service,
            parameter,
        }))
    }
}

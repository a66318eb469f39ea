//! Device statistics, fetched from the backend without envelope translation.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{Method, Request};

use crate::{Result, RuntimeConfig};

/// Builds the GET asking the backend for a device's statistics, forwarding
/// the caller's `Authorization` value verbatim.
///
/// The backend answers with a plain body, so the response is translated
/// with `want_whole_body` set.
pub fn stat_request(
    config: &RuntimeConfig,
    device_id: &str,
    authorization: Option<&HeaderValue>,
) -> Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(config.stat_endpoint(device_id));
    if let Some(auth) = authorization {
        builder = builder.header(AUTHORIZATION, auth.clone());
    }
    Ok(builder.body(Full::new(Bytes::new()))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, GatewayError};

    fn config() -> RuntimeConfig {
        Config {
            target_url: "http://backend:6000".into(),
            ..Default::default()
        }
        .into_runtime()
        .unwrap()
    }

    #[test]
    fn targets_device_stat_endpoint() {
        let auth = HeaderValue::from_static("Basic dXNlcjpwYXNz");
        let req = stat_request(&config(), "mac:112233445566", Some(&auth)).unwrap();

        assert_eq!(req.method(), Method::GET);
        assert_eq!(
            req.uri(),
            "http://backend:6000/api/v2/device/mac:112233445566/stat"
        );
        assert_eq!(req.headers().get(AUTHORIZATION).unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn unencodable_device_id_is_an_internal_error() {
        let err = stat_request(&config(), "bad id", None).unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }
}

//! Translation of backend responses into caller-facing responses.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Deserialize;

use crate::error::JSON_CONTENT_TYPE;
use crate::executor::RawResponse;
use crate::headers;
use crate::wrp::Envelope;
use crate::Result;

/// The uniform shape written back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct XmidtResponse {
    pub body: Bytes,
    pub forwarded_headers: HeaderMap,
    pub code: StatusCode,
}

#[derive(Debug, Deserialize)]
struct DeviceResponse {
    #[serde(rename = "statusCode", default)]
    status_code: i64,
}

/// Re-derives the caller-facing response from a backend response.
///
/// Headers whose name starts with `forward_prefix` are always copied. A
/// non-200 backend response is mirrored byte for byte. With
/// `want_whole_body` the body is forwarded untouched; otherwise it is decoded
/// as an envelope and the envelope payload becomes the body, with its
/// embedded `statusCode` as the status when it is set and not 500.
pub fn translate(
    raw: RawResponse,
    want_whole_body: bool,
    forward_prefix: &str,
) -> Result<XmidtResponse> {
    let RawResponse {
        status,
        headers: backend_headers,
        body,
    } = raw;

    let mut forwarded_headers = HeaderMap::new();
    headers::forward_by_prefix(forward_prefix, &backend_headers, &mut forwarded_headers);

    if status != StatusCode::OK || want_whole_body {
        return Ok(XmidtResponse {
            body,
            forwarded_headers,
            code: status,
        });
    }

    let envelope = Envelope::decode(&body)?;
    let code = embedded_status(&envelope.payload).unwrap_or(StatusCode::OK);
    forwarded_headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

    Ok(XmidtResponse {
        body: envelope.payload,
        forwarded_headers,
        code,
    })
}

/// Extracts the device-reported status, ignoring zero, 500, and anything
/// that is not a valid HTTP status.
fn embedded_status(payload: &[u8]) -> Option<StatusCode> {
    let response: DeviceResponse = serde_json::from_slice(payload).ok()?;
    match response.status_code {
        0 | 500 => None,
        code => u16::try_from(code)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok()),
    }
}

/// Writes `response` as an HTTP response carrying the transaction id.
pub fn encode_response(response: XmidtResponse, transaction_id: &str) -> Response<Full<Bytes>> {
    let XmidtResponse {
        body,
        forwarded_headers,
        code,
    } = response;

    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = code;
    *resp.headers_mut() = forwarded_headers;
    headers::set_transaction_id(resp.headers_mut(), transaction_id);
    resp
}

#[cfg(test)]
mod tests {
    use hyper::header::HeaderName;

    use super::*;
    use crate::wrp::{MessageType, ENVELOPE_CONTENT_TYPE};
    use crate::GatewayError;

    fn envelope_body(payload: &'static [u8]) -> Bytes {
        Envelope {
            message_type: MessageType::SimpleRequestResponse,
            source: "abc/config".into(),
            destination: "config/device-gateway".into(),
            transaction_id: "tid-1".into(),
            content_type: ENVELOPE_CONTENT_TYPE.into(),
            payload: Bytes::from_static(payload),
        }
        .encode()
        .unwrap()
    }

    fn raw(status: StatusCode, headers: &[(&str, &str)], body: Bytes) -> RawResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RawResponse {
            status,
            headers: map,
            body,
        }
    }

    #[test]
    fn embedded_status_replaces_success() {
        let payload = br#"{"statusCode":404,"message":"Invalid parameter name"}"#;
        let resp = translate(raw(StatusCode::OK, &[], envelope_body(payload)), false, "X").unwrap();

        assert_eq!(resp.code, StatusCode::NOT_FOUND);
        assert_eq!(resp.body, Bytes::from_static(payload));
        assert_eq!(
            resp.forwarded_headers.get(CONTENT_TYPE).unwrap(),
            JSON_CONTENT_TYPE
        );
    }

    #[test]
    fn server_error_or_missing_status_means_success() {
        for payload in [
            &br#"{"statusCode":500}"#[..],
            br#"{"parameters":[]}"#,
            br#"{"statusCode":0}"#,
            b"not json at all",
        ] {
            let body = Envelope {
                message_type: MessageType::SimpleRequestResponse,
                source: String::new(),
                destination: String::new(),
                transaction_id: String::new(),
                content_type: String::new(),
                payload: Bytes::copy_from_slice(payload),
            }
            .encode()
            .unwrap();

            let resp = translate(raw(StatusCode::OK, &[], body), false, "X").unwrap();
            assert_eq!(resp.code, StatusCode::OK);
            assert_eq!(resp.body, Bytes::copy_from_slice(payload));
        }
    }

    #[test]
    fn non_success_backend_response_is_mirrored() {
        let body = Bytes::from_static(br#"{"error":"unavailable"}"#);
        let resp = translate(
            raw(
                StatusCode::SERVICE_UNAVAILABLE,
                &[
                    ("content-type", "application/json"),
                    ("connection", "close"),
                    ("x-xmidt-region", "east"),
                ],
                body.clone(),
            ),
            false,
            "X",
        )
        .unwrap();

        assert_eq!(resp.code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.body, body);
        assert_eq!(resp.forwarded_headers.len(), 1);
        assert_eq!(resp.forwarded_headers.get("x-xmidt-region").unwrap(), "east");
    }

    #[test]
    fn whole_body_skips_unwrapping() {
        let body = Bytes::from_static(br#"{"id":"mac:112233445566","uptime":"1h"}"#);
        let resp = translate(raw(StatusCode::OK, &[], body.clone()), true, "X").unwrap();

        assert_eq!(resp.code, StatusCode::OK);
        assert_eq!(resp.body, body);
        assert!(resp.forwarded_headers.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn undecodable_envelope_is_an_error() {
        let err = translate(
            raw(StatusCode::OK, &[], Bytes::from_static(b"\x82\xa4oops")),
            false,
            "X",
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Json(_)));
    }

    #[test]
    fn translating_twice_is_identical() {
        let make = || {
            raw(
                StatusCode::OK,
                &[("x-xmidt-message-id", "m-1")],
                envelope_body(br#"{"statusCode":200}"#),
            )
        };
        let first = translate(make(), false, "X").unwrap();
        let second = translate(make(), false, "X").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn encode_response_sets_transaction_id() {
        let resp = encode_response(
            XmidtResponse {
                body: Bytes::from_static(b"{}"),
                forwarded_headers: HeaderMap::new(),
                code: StatusCode::ACCEPTED,
            },
            "tid-9",
        );
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(
            resp.headers().get(headers::TRANSACTION_ID_HEADER).unwrap(),
            "tid-9"
        );
    }
}

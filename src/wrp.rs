//! Protocol envelopes exchanged with the backend cluster.
//!
//! Envelopes travel as JSON objects. The `payload` field carries raw bytes
//! and is therefore base64 encoded on the wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::routes::PathVars;
use crate::{GatewayError, Result};

/// Content type of encoded envelopes and of the command payloads they carry.
pub const ENVELOPE_CONTENT_TYPE: &str = "application/json";

/// Envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    Authorization,
    SimpleRequestResponse,
    SimpleEvent,
    Create,
    Retrieve,
    Update,
    Delete,
    ServiceRegistration,
    ServiceAlive,
    Unknown,
}

impl From<MessageType> for u8 {
    fn from(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Authorization => 2,
            MessageType::SimpleRequestResponse => 3,
            MessageType::SimpleEvent => 4,
            MessageType::Create => 5,
            MessageType::Retrieve => 6,
            MessageType::Update => 7,
            MessageType::Delete => 8,
            MessageType::ServiceRegistration => 9,
            MessageType::ServiceAlive => 10,
            MessageType::Unknown => 11,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match code {
            2 => Self::Authorization,
            3 => Self::SimpleRequestResponse,
            4 => Self::SimpleEvent,
            5 => Self::Create,
            6 => Self::Retrieve,
            7 => Self::Update,
            8 => Self::Delete,
            9 => Self::ServiceRegistration,
            10 => Self::ServiceAlive,
            11 => Self::Unknown,
            other => return Err(format!("unknown message type {other}")),
        })
    }
}

/// A protocol envelope addressed to or received from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "msg_type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(rename = "dest", default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(
        rename = "transaction_uuid",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, with = "base64_payload", skip_serializing_if = "Bytes::is_empty")]
    pub payload: Bytes,
}

mod base64_payload {
    use super::*;

    pub fn serialize<S: serde::Serializer>(
        payload: &Bytes,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(payload))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Wraps an encoded command payload into an envelope addressed to the
/// device and service named by `vars`.
///
/// Performs no validation of the payload. Fails only when the context has
/// no transaction id.
pub fn build(
    payload: Bytes,
    vars: &PathVars,
    ctx: &RequestContext,
    application_name: &str,
) -> Result<Envelope> {
    let transaction_id = ctx.transaction_id()?.to_owned();

    Ok(Envelope {
        message_type: MessageType::SimpleRequestResponse,
        source: format!("{}/{application_name}", vars.service),
        destination: format!("{}/{}", vars.device_id, vars.service),
        transaction_id,
        content_type: ENVELOPE_CONTENT_TYPE.to_owned(),
        payload,
    })
}

impl Envelope {
    /// Encodes the envelope for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes an envelope from a backend response body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(GatewayError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::context;

    fn vars() -> PathVars {
        PathVars {
            device_id: "abc".into(),
            service: "config".into(),
            parameter: None,
        }
    }

    fn ctx_with_tid() -> RequestContext {
        let (_tx, rx) = context::cancellation();
        RequestContext::new(Duration::from_secs(1), rx).with_transaction_id("tid-42")
    }

    #[test]
    fn build_addresses_device_and_service() {
        let envelope = build(
            Bytes::from_static(br#"{"command":"GET"}"#),
            &vars(),
            &ctx_with_tid(),
            "device-gateway",
        )
        .unwrap();

        assert_eq!(envelope.message_type, MessageType::SimpleRequestResponse);
        assert_eq!(envelope.destination, "abc/config");
        assert_eq!(envelope.source, "config/device-gateway");
        assert_eq!(envelope.transaction_id, "tid-42");
        assert_eq!(envelope.content_type, ENVELOPE_CONTENT_TYPE);
    }

    #[test]
    fn build_without_transaction_id_fails() {
        let (_tx, rx) = context::cancellation();
        let ctx = RequestContext::new(Duration::from_secs(1), rx);

        let err = build(Bytes::new(), &vars(), &ctx, "device-gateway").unwrap_err();
        assert!(matches!(err, GatewayError::MissingTransactionId));
    }

    #[test]
    fn encode_uses_wire_field_names() {
        let envelope = build(
            Bytes::from_static(b"hi"),
            &vars(),
            &ctx_with_tid(),
            "device-gateway",
        )
        .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "msg_type": 3,
                "source": "config/device-gateway",
                "dest": "abc/config",
                "transaction_uuid": "tid-42",
                "content_type": "application/json",
                "payload": "aGk=",
            })
        );
    }

    #[test]
    fn decode_reads_backend_envelope() {
        let body = br#"{"msg_type":3,"source":"mac:112233445566/config","payload":"eyJzdGF0dXNDb2RlIjoyMDB9"}"#;
        let envelope = Envelope::decode(body).unwrap();
        assert_eq!(envelope.payload, Bytes::from_static(br#"{"statusCode":200}"#));
        assert!(envelope.destination.is_empty());
    }

    #[test]
    fn decode_rejects_bad_payload_encoding() {
        let body = br#"{"msg_type":3,"payload":"***"}"#;
        assert!(matches!(Envelope::decode(body), Err(GatewayError::Json(_))));
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let body = br#"{"msg_type":99}"#;
        assert!(Envelope::decode(body).is_err());
    }
}

//! Wire model for the relay channel.
//!
//! Every payload that crosses the relay is wrapped twice:
//!
//! 1. An [`AgentMessage`] envelope: `{messageType, schemaVersion,
//!    messagePayload}` where `messagePayload` is the inner object serialized
//!    to bytes (base64 on the wire, since JSON has no byte string).
//! 2. A [`SignalRMessage`] record: `{target, type, arguments:[AgentMessage]}`
//!    terminated by the `0x1E` record separator. Only `type == 1`
//!    (invocation) records carry envelopes.
//!
//! An envelope is either *request-bearing* (`Keysplitting`: carries an action
//! name and a request id) or a *stream* message (chunked, sequence-numbered
//! content for one request). Control-plane envelopes (`HealthCheck`,
//! `NewDatachannel`) and `Error` round out the set.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Record separator between SignalR records inside one websocket frame.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// SignalR invocation record type. Everything else is ignored.
pub const INVOCATION_TYPE: i32 = 1;

/// Envelope schema version stamped on every outbound message.
pub const SCHEMA_VERSION: &str = "v1";

/// Special record target: the relay is ready for us to start sending.
pub const TARGET_READY: &str = "ReadyBastionToClient";

/// Special record target: the peer closed the logical hub (normal EOF).
pub const TARGET_CLOSE: &str = "CloseConnection";

/// Serialize `Vec<u8>` as a base64 string, the way JSON byte fields travel.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// The envelope kind. Serialized names are wire-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Keysplitting,
    Stream,
    Error,
    HealthCheck,
    NewDatachannel,
}

/// The outer envelope carried in SignalR record arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub message_type: MessageType,
    pub schema_version: String,
    #[serde(with = "b64")]
    pub message_payload: Vec<u8>,
}

impl AgentMessage {
    /// Wrap an inner payload of the given kind.
    pub fn new<T: Serialize>(message_type: MessageType, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            message_type,
            schema_version: SCHEMA_VERSION.to_string(),
            message_payload: serde_json::to_vec(payload)?,
        })
    }

    /// Parse the inner payload as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.message_payload)
    }
}

/// SignalR wrapper: one record on the relay channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRMessage {
    /// Hub method name ("target") this record is addressed to.
    #[serde(default)]
    pub target: String,
    /// Record kind; absent on the handshake ack, which parses as 0 and is
    /// ignored.
    #[serde(rename = "type", default)]
    pub message_type: i32,
    #[serde(default)]
    pub arguments: Vec<AgentMessage>,
}

/// Response body of the `/negotiate` call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: String,
}

/// Inner message of a request-bearing (`Keysplitting`) envelope: the action
/// name plus its serialized payload. Every action payload carries the
/// request id, so routing peeks it with [`JustRequestId`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMessage {
    pub action: String,
    #[serde(with = "b64")]
    pub action_payload: Vec<u8>,
}

impl ActionMessage {
    pub fn new<T: Serialize>(action: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            action: action.to_string(),
            action_payload: serde_json::to_vec(payload)?,
        })
    }

    /// Request id carried by the action payload, used for registry routing.
    pub fn request_id(&self) -> serde_json::Result<String> {
        let just: JustRequestId = serde_json::from_slice(&self.action_payload)?;
        Ok(just.request_id)
    }

    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.action_payload)
    }

    pub fn into_envelope(self) -> Result<AgentMessage, TransportError> {
        AgentMessage::new(MessageType::Keysplitting, &self)
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))
    }
}

/// Minimal view of any action payload: just the request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JustRequestId {
    pub request_id: String,
}

/// A chunk of one logical stream. The producer numbers chunks per
/// (request id, stream type) starting at 0; `more == false` marks the final
/// chunk. `content` is base64 so a raw `0x1E` can never appear inside a
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub request_id: String,
    pub sequence_number: u64,
    #[serde(rename = "type")]
    pub stream_type: String,
    /// Base64-encoded chunk content.
    pub content: String,
    pub more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    /// Set on port-forward streams: the sub-connection this chunk belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forward_request_id: Option<String>,
}

impl StreamMessage {
    pub fn new(request_id: &str, stream_type: &str, sequence_number: u64, content: &[u8]) -> Self {
        use base64::Engine;
        Self {
            request_id: request_id.to_string(),
            sequence_number,
            stream_type: stream_type.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(content),
            more: true,
            log_id: None,
            port_forward_request_id: None,
        }
    }

    #[must_use]
    pub fn last(mut self) -> Self {
        self.more = false;
        self
    }

    #[must_use]
    pub fn for_sub_request(mut self, port_forward_request_id: &str) -> Self {
        self.port_forward_request_id = Some(port_forward_request_id.to_string());
        self
    }

    /// Decoded chunk bytes.
    pub fn content_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.decode(&self.content)
    }

    pub fn into_envelope(self) -> Result<AgentMessage, TransportError> {
        AgentMessage::new(MessageType::Stream, &self)
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))
    }
}

/// Payload of an `Error` envelope, addressed to one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub request_id: String,
    pub message: String,
}

impl ErrorMessage {
    pub fn into_envelope(self) -> Result<AgentMessage, TransportError> {
        AgentMessage::new(MessageType::Error, &self)
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))
    }
}

/// Control plane: health check probe from the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckMessage {
    pub cluster_name: String,
}

/// Control plane: health check reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliveCheckMessage {
    pub alive: bool,
    pub cluster_users: Vec<String>,
}

/// Control plane: the relay asks the agent to open a data-plane session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDatachannelMessage {
    pub connection_id: String,
    pub token: String,
    pub target_user: String,
    #[serde(default)]
    pub target_groups: Vec<String>,
    #[serde(default)]
    pub role: String,
}

/// Challenge request sent before opening an authenticated transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChallengeMessage {
    pub org_id: String,
    pub cluster_name: String,
}

/// Challenge nonce to sign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChallengeResponse {
    pub challenge: String,
}

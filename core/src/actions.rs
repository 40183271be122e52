//! Action names and payloads.
//!
//! Every logical operation is an *action* identified by a
//! `kube/<family>/<verb>` string; the verb is authoritative for routing
//! inside an action. Payload shapes are identical on both sides of the
//! relay.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ActionError;
use crate::message::b64;

// Request-bearing action names.
pub const REST_REQUEST: &str = "kube/restapi/request";
pub const REST_RESPONSE: &str = "kube/restapi/response";
pub const EXEC_START: &str = "kube/exec/start";
pub const EXEC_INPUT: &str = "kube/exec/input";
pub const EXEC_RESIZE: &str = "kube/exec/resize";
pub const EXEC_STOP: &str = "kube/exec/stop";
pub const STREAM_START: &str = "kube/stream/start";
pub const STREAM_STOP: &str = "kube/stream/stop";
pub const PORTFORWARD_START: &str = "kube/portforward/start";
pub const PORTFORWARD_DATA_IN: &str = "kube/portforward/datain";
pub const PORTFORWARD_ERROR_IN: &str = "kube/portforward/errorin";
pub const PORTFORWARD_REQUEST_STOP: &str = "kube/portforward/request/stop";
pub const PORTFORWARD_STOP: &str = "kube/portforward/stop";

// Stream message types.
pub const STREAM_TYPE_EXEC_STDOUT: &str = "kube/exec/stdout";
pub const STREAM_TYPE_EXEC_STDERR: &str = "kube/exec/stderr";
pub const STREAM_TYPE_STREAM_STDOUT: &str = "kube/stream/stdout";
pub const STREAM_TYPE_PF_DATA: &str = "kube/portforward/data";
pub const STREAM_TYPE_PF_ERROR: &str = "kube/portforward/error";
pub const STREAM_TYPE_PF_READY: &str = "kube/portforward/ready";

/// Sent by the agent as the entire content of a terminal stdout chunk when
/// the remote end of an exec finished on its own (e.g. the user typed
/// `exit`). UUID-shaped so it cannot collide with real terminal output.
pub const EXEC_END_SENTINEL: &[u8] = b"bbf22c9f-d584-4f80-91b1-aa3cfa0f182a";

/// Action family, the `<family>` segment of an action name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionFamily {
    RestApi,
    Exec,
    Stream,
    PortForward,
}

impl ActionFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestApi => "restapi",
            Self::Exec => "exec",
            Self::Stream => "stream",
            Self::PortForward => "portforward",
        }
    }
}

/// Split `kube/<family>/<verb>` into its family and verb. The verb may
/// itself contain a slash (`request/stop`).
pub fn parse_action(action: &str) -> Result<(ActionFamily, &str), ActionError> {
    let rest = action
        .strip_prefix("kube/")
        .ok_or_else(|| ActionError::Protocol(format!("unknown action prefix: {action}")))?;
    let (family, verb) = rest
        .split_once('/')
        .ok_or_else(|| ActionError::Protocol(format!("malformed action: {action}")))?;
    let family = match family {
        "restapi" => ActionFamily::RestApi,
        "exec" => ActionFamily::Exec,
        "stream" => ActionFamily::Stream,
        "portforward" => ActionFamily::PortForward,
        other => {
            return Err(ActionError::Protocol(format!(
                "unknown action family: {other}"
            )))
        }
    };
    Ok((family, verb))
}

/// `kube/restapi/request` — one unary HTTP round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestRequestPayload {
    pub request_id: String,
    pub log_id: String,
    pub kube_command: String,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub method: String,
    #[serde(with = "b64")]
    pub body: Vec<u8>,
}

/// `kube/restapi/response` — the single reply to a REST request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestResponsePayload {
    pub request_id: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    #[serde(with = "b64")]
    pub content: Vec<u8>,
}

/// `kube/exec/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecStartPayload {
    pub request_id: String,
    pub log_id: String,
    pub is_tty: bool,
    pub command: Vec<String>,
    pub endpoint: String,
}

/// `kube/exec/input` — one chunk of stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecInputPayload {
    pub request_id: String,
    pub log_id: String,
    #[serde(with = "b64")]
    pub stdin: Vec<u8>,
}

/// `kube/exec/resize` — terminal geometry change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResizePayload {
    pub request_id: String,
    pub log_id: String,
    pub width: u16,
    pub height: u16,
}

/// `kube/exec/stop` and `kube/stream/stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    pub request_id: String,
    pub log_id: String,
}

/// `kube/stream/start` — long-poll / follow request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartPayload {
    pub request_id: String,
    pub log_id: String,
    pub kube_command: String,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub method: String,
}

/// `kube/portforward/start` — opens a port-forward session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStartPayload {
    pub request_id: String,
    pub log_id: String,
    pub kube_command: String,
    pub endpoint: String,
}

/// `kube/portforward/datain` / `kube/portforward/errorin` — daemon-to-agent
/// bytes for one sub-connection. Sequenced per (sub-request, direction) with
/// the same reorder discipline as stream messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardDataInPayload {
    pub request_id: String,
    pub port_forward_request_id: String,
    pub sequence_number: u64,
    pub port: u16,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// `kube/portforward/request/stop` — closes one sub-connection, leaving the
/// port-forward session alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRequestStopPayload {
    pub request_id: String,
    pub port_forward_request_id: String,
}

/// `kube/portforward/stop` — tears the whole session down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStopPayload {
    pub request_id: String,
    pub log_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_segment_actions() {
        assert_eq!(
            parse_action("kube/restapi/request").unwrap(),
            (ActionFamily::RestApi, "request")
        );
        assert_eq!(
            parse_action("kube/exec/resize").unwrap(),
            (ActionFamily::Exec, "resize")
        );
        // the verb keeps its own slashes
        assert_eq!(
            parse_action("kube/portforward/request/stop").unwrap(),
            (ActionFamily::PortForward, "request/stop")
        );
    }

    #[test]
    fn rejects_malformed_actions() {
        assert!(parse_action("kube/restapi").is_err());
        assert!(parse_action("ssh/exec/start").is_err());
        assert!(parse_action("kube/telnet/start").is_err());
    }

    #[test]
    fn rest_request_body_travels_as_base64() {
        let payload = RestRequestPayload {
            request_id: "r".into(),
            log_id: "l".into(),
            kube_command: "kubectl get pods".into(),
            endpoint: "/api/v1/namespaces/default/pods".into(),
            headers: HashMap::new(),
            method: "GET".into(),
            body: vec![0x1E, 0x00, 0xFF],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["body"].is_string());
        let back: RestRequestPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, vec![0x1E, 0x00, 0xFF]);
    }
}

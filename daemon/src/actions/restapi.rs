//! REST action, daemon side: one local HTTP request becomes one
//! `kube/restapi/request` envelope and waits for exactly one
//! `kube/restapi/response`.
//!
//! A response whose request id does not match the waiting action is handed
//! back to the router (never dropped) so it can reach its rightful owner.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use tracing::{debug, warn};
use uuid::Uuid;

use kubelink_core::actions::{
    ActionFamily, RestRequestPayload, RestResponsePayload, REST_REQUEST, REST_RESPONSE,
};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::error::ActionError;
use kubelink_core::message::ActionMessage;
use kubelink_core::registry::InboundMessage;

use super::CommandContext;

/// Cap on a proxied request body.
const MAX_BODY: usize = 10 * 1024 * 1024;

pub async fn handle(channel: ChannelHandle, meta: CommandContext, req: Request) -> Response {
    match run(channel, meta, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!("rest action failed: {e}");
            let status = match e {
                ActionError::Upstream(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Response::builder()
                .status(status)
                .body(Body::from(e.to_string()))
                .unwrap_or_default()
        }
    }
}

async fn run(
    channel: ChannelHandle,
    meta: CommandContext,
    req: Request,
) -> Result<Response, ActionError> {
    let request_id = Uuid::new_v4().to_string();
    let mut rx = channel
        .register(&request_id, ActionFamily::RestApi)
        .await
        .map_err(|e| ActionError::Local(e.to_string()))?;

    let (parts, body) = req.into_parts();
    let endpoint = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let method = parts.method.to_string();
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
    let body = axum::body::to_bytes(body, MAX_BODY)
        .await
        .map_err(|e| ActionError::Local(e.to_string()))?;

    debug!(%request_id, %method, %endpoint, "proxying rest call");
    channel
        .send_action(REST_REQUEST, &RestRequestPayload {
            request_id: request_id.clone(),
            log_id: meta.log_id,
            kube_command: meta.kube_command,
            endpoint,
            headers,
            method,
            body: body.to_vec(),
        })
        .await
        .map_err(|e| ActionError::Local(e.to_string()))?;

    let result = await_response(&channel, &request_id, &mut rx).await;
    channel.remove(&request_id).await;
    let payload = result?;

    let mut builder = Response::builder().status(
        StatusCode::from_u16(payload.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &payload.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(payload.content))
        .map_err(|e| ActionError::Local(e.to_string()))
}

async fn await_response(
    channel: &ChannelHandle,
    request_id: &str,
    rx: &mut tokio::sync::mpsc::Receiver<InboundMessage>,
) -> Result<RestResponsePayload, ActionError> {
    let mut cancel = channel.cancelled();
    loop {
        let msg = tokio::select! {
            _ = cancel.changed() => return Err(ActionError::Closed),
            msg = rx.recv() => msg.ok_or(ActionError::Closed)?,
        };
        match msg {
            InboundMessage::Request { action, payload } if action == REST_RESPONSE => {
                let response: RestResponsePayload = serde_json::from_slice(&payload)
                    .map_err(|e| ActionError::Protocol(e.to_string()))?;
                if response.request_id == request_id {
                    return Ok(response);
                }
                // Mis-delivered response: send it back to the router so the
                // rightful action can claim it.
                warn!(
                    got = %response.request_id,
                    want = %request_id,
                    "re-enqueueing response for another request"
                );
                let envelope = ActionMessage {
                    action,
                    action_payload: payload,
                }
                .into_envelope()
                .map_err(|e| ActionError::Protocol(e.to_string()))?;
                channel
                    .requeue(envelope)
                    .await
                    .map_err(|e| ActionError::Local(e.to_string()))?;
            }
            InboundMessage::Error(error) => {
                return Err(ActionError::Upstream(error.message));
            }
            other => warn!("rest action ignoring unexpected message: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use kubelink_core::channel::{self, SessionChannels};
    use kubelink_core::message::{AgentMessage, MessageType};
    use kubelink_core::registry::ActionRegistry;
    use tokio::sync::watch;

    struct Harness {
        registry: ActionRegistry,
        channel: ChannelHandle,
        outbound_rx: tokio::sync::mpsc::Receiver<AgentMessage>,
        requeue_rx: tokio::sync::mpsc::Receiver<AgentMessage>,
        _cancel_tx: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let registry = ActionRegistry::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle,
            outbound_rx,
            requeue_rx,
        } = channel::session(registry.clone(), cancel_rx);
        Harness {
            registry,
            channel: handle,
            outbound_rx,
            requeue_rx,
            _cancel_tx: cancel_tx,
        }
    }

    fn local_request(method: Method, path: &str, body: &[u8]) -> Request {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    async fn sent_request(outbound_rx: &mut tokio::sync::mpsc::Receiver<AgentMessage>) -> RestRequestPayload {
        let envelope = outbound_rx.recv().await.expect("start envelope");
        assert_eq!(envelope.message_type, MessageType::Keysplitting);
        let action: ActionMessage = envelope.payload().unwrap();
        assert_eq!(action.action, REST_REQUEST);
        action.payload().unwrap()
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let mut h = harness();
        let channel = h.channel.clone();
        let registry = h.registry.clone();

        let action = tokio::spawn(handle(
            channel,
            CommandContext::default(),
            local_request(Method::GET, "/api/v1/namespaces/default/pods", b""),
        ));

        let sent = sent_request(&mut h.outbound_rx).await;
        assert_eq!(sent.method, "GET");
        assert_eq!(sent.endpoint, "/api/v1/namespaces/default/pods");

        // mocked agent: answer 200 with a fixed body
        registry
            .deliver(
                &sent.request_id,
                InboundMessage::Request {
                    action: REST_RESPONSE.to_string(),
                    payload: serde_json::to_vec(&RestResponsePayload {
                        request_id: sent.request_id.clone(),
                        status_code: 200,
                        headers: HashMap::from([
                            ("Content-Type".to_string(), "application/json".to_string()),
                            ("Content-Length".to_string(), "999".to_string()),
                        ]),
                        content: br#"{"items":[]}"#.to_vec(),
                    })
                    .unwrap(),
                },
            )
            .await
            .unwrap();

        let response = action.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        // Content-Length is never copied from the proxied response
        assert!(response.headers().get("content-length").is_none());
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"items":[]}"#);

        // registry entry is gone once the action finished
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn mismatched_response_is_requeued_not_dropped() {
        let mut h = harness();
        let channel = h.channel.clone();
        let registry = h.registry.clone();

        let action = tokio::spawn(handle(
            channel,
            CommandContext::default(),
            local_request(Method::GET, "/api/v1/nodes", b""),
        ));

        let sent = sent_request(&mut h.outbound_rx).await;

        // a response for some other request lands in this action's queue
        registry
            .deliver(
                &sent.request_id,
                InboundMessage::Request {
                    action: REST_RESPONSE.to_string(),
                    payload: serde_json::to_vec(&RestResponsePayload {
                        request_id: "someone-else".to_string(),
                        status_code: 200,
                        headers: HashMap::new(),
                        content: b"not mine".to_vec(),
                    })
                    .unwrap(),
                },
            )
            .await
            .unwrap();

        // it must come back out on the requeue lane, intact
        let requeued = h.requeue_rx.recv().await.expect("requeued envelope");
        let requeued_action: ActionMessage = requeued.payload().unwrap();
        assert_eq!(requeued_action.action, REST_RESPONSE);
        assert_eq!(requeued_action.request_id().unwrap(), "someone-else");

        // and the action keeps waiting for its own response
        registry
            .deliver(
                &sent.request_id,
                InboundMessage::Request {
                    action: REST_RESPONSE.to_string(),
                    payload: serde_json::to_vec(&RestResponsePayload {
                        request_id: sent.request_id.clone(),
                        status_code: 201,
                        headers: HashMap::new(),
                        content: b"mine".to_vec(),
                    })
                    .unwrap(),
                },
            )
            .await
            .unwrap();

        let response = action.await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn upstream_error_maps_to_502() {
        let mut h = harness();
        let channel = h.channel.clone();
        let registry = h.registry.clone();

        let action = tokio::spawn(handle(
            channel,
            CommandContext::default(),
            local_request(Method::DELETE, "/api/v1/namespaces/default/pods/p", b""),
        ));

        let sent = sent_request(&mut h.outbound_rx).await;
        registry
            .deliver(
                &sent.request_id,
                InboundMessage::Error(kubelink_core::message::ErrorMessage {
                    request_id: sent.request_id.clone(),
                    message: "kube-apiserver unreachable".to_string(),
                }),
            )
            .await
            .unwrap();

        let response = action.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}

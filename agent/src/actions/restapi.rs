//! REST action, agent side: perform the HTTP call against kube-apiserver
//! (impersonating the session's target user) and respond exactly once.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use kubelink_core::actions::{RestRequestPayload, RestResponsePayload, REST_REQUEST, REST_RESPONSE};
use kubelink_core::channel::ChannelHandle;
use kubelink_core::message::ErrorMessage;
use kubelink_core::registry::InboundMessage;

use crate::kube::{KubeApi, RestRequest};

pub async fn run<K: KubeApi>(
    kube: K,
    channel: ChannelHandle,
    request_id: String,
    mut rx: mpsc::Receiver<InboundMessage>,
) {
    let result = serve_one(&kube, &channel, &request_id, &mut rx).await;
    if let Err(message) = result {
        warn!(%request_id, "rest action failed: {message}");
        let _ = channel
            .send_error(ErrorMessage {
                request_id: request_id.clone(),
                message,
            })
            .await;
    }
    channel.remove(&request_id).await;
}

async fn serve_one<K: KubeApi>(
    kube: &K,
    channel: &ChannelHandle,
    request_id: &str,
    rx: &mut mpsc::Receiver<InboundMessage>,
) -> Result<(), String> {
    let mut cancel = channel.cancelled();
    let payload: RestRequestPayload = loop {
        let msg = tokio::select! {
            _ = cancel.changed() => return Ok(()),
            msg = rx.recv() => msg.ok_or("action queue closed")?,
        };
        match msg {
            InboundMessage::Request { action, payload } if action == REST_REQUEST => {
                break serde_json::from_slice(&payload).map_err(|e| e.to_string())?;
            }
            other => warn!(%request_id, "rest action ignoring: {other:?}"),
        }
    };

    debug!(%request_id, method = %payload.method, endpoint = %payload.endpoint,
           command = %payload.kube_command, "rest call");
    let response = kube
        .do_rest(RestRequest {
            method: payload.method,
            endpoint: payload.endpoint,
            headers: payload.headers,
            body: payload.body,
        })
        .await
        .map_err(|e| e.to_string())?;

    channel
        .send_action(REST_RESPONSE, &RestResponsePayload {
            request_id: request_id.to_string(),
            status_code: response.status,
            headers: response.headers,
            content: response.body,
        })
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::test_support::FakeKube;
    use kubelink_core::actions::ActionFamily;
    use kubelink_core::channel::{self, SessionChannels};
    use kubelink_core::message::{ActionMessage, MessageType};
    use kubelink_core::registry::ActionRegistry;
    use std::collections::HashMap;
    use tokio::sync::watch;

    #[tokio::test]
    async fn echoes_through_the_adapter_and_responds_once() {
        let registry = ActionRegistry::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle,
            mut outbound_rx,
            ..
        } = channel::session(registry.clone(), cancel_rx);

        let kube = FakeKube::echo();
        let rx = registry.register("r-1", ActionFamily::RestApi).await.unwrap();
        tokio::spawn(run(kube, handle, "r-1".to_string(), rx));

        registry
            .deliver(
                "r-1",
                InboundMessage::Request {
                    action: REST_REQUEST.to_string(),
                    payload: serde_json::to_vec(&RestRequestPayload {
                        request_id: "r-1".to_string(),
                        log_id: "l".to_string(),
                        kube_command: "kubectl get pods".to_string(),
                        endpoint: "/api/v1/namespaces/default/pods".to_string(),
                        headers: HashMap::new(),
                        method: "GET".to_string(),
                        body: b"ping".to_vec(),
                    })
                    .unwrap(),
                },
            )
            .await
            .unwrap();

        let envelope = outbound_rx.recv().await.unwrap();
        assert_eq!(envelope.message_type, MessageType::Keysplitting);
        let action: ActionMessage = envelope.payload().unwrap();
        assert_eq!(action.action, REST_RESPONSE);
        let response: RestResponsePayload = action.payload().unwrap();
        assert_eq!(response.request_id, "r-1");
        assert_eq!(response.status_code, 200);
        // the echo adapter reflects the request body
        assert_eq!(response.content, b"ping");

        // action record is gone once the response went out
        tokio::task::yield_now().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn upstream_failure_becomes_an_error_envelope() {
        let registry = ActionRegistry::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let SessionChannels {
            handle,
            mut outbound_rx,
            ..
        } = channel::session(registry.clone(), cancel_rx);

        let kube = FakeKube::failing("kube-apiserver unreachable");
        let rx = registry.register("r-2", ActionFamily::RestApi).await.unwrap();
        tokio::spawn(run(kube, handle, "r-2".to_string(), rx));

        registry
            .deliver(
                "r-2",
                InboundMessage::Request {
                    action: REST_REQUEST.to_string(),
                    payload: serde_json::to_vec(&RestRequestPayload {
                        request_id: "r-2".to_string(),
                        log_id: "l".to_string(),
                        kube_command: "N/A".to_string(),
                        endpoint: "/api/v1/nodes".to_string(),
                        headers: HashMap::new(),
                        method: "GET".to_string(),
                        body: Vec::new(),
                    })
                    .unwrap(),
                },
            )
            .await
            .unwrap();

        let envelope = outbound_rx.recv().await.unwrap();
        assert_eq!(envelope.message_type, MessageType::Error);
        let error: kubelink_core::message::ErrorMessage = envelope.payload().unwrap();
        assert_eq!(error.request_id, "r-2");
        assert!(error.message.contains("unreachable"));
    }
}

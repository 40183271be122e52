//! Agent side of a data-plane session.
//!
//! Opened for each `NewDatachannel` from the control plane. The router
//! creates an action when the first message for a request id arrives (a
//! `*/start` verb, or the single-shot REST request); everything else for a
//! known id goes to the owning action's queue, and anything for an unknown
//! id is dropped with a warning.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use kubelink_core::actions::{self, ActionFamily};
use kubelink_core::channel::{self, ChannelHandle, SessionChannels, Unrouted};
use kubelink_core::message::{
    ActionMessage, AgentMessage, MessageType, NewDatachannelMessage, StreamMessage,
};
use kubelink_core::registry::{ActionRegistry, InboundMessage};
use kubelink_core::transport::{Transport, TransportConfig};

use crate::actions::{exec, portforward, restapi, stream};
use crate::kube::KubeApi;

/// Hub the agent's data plane lives on.
pub const DATA_HUB: &str = "/api/v1/hub/kube-server";

/// Hub target every agent-plane envelope is addressed to.
pub const TARGET_DATA: &str = "ResponseClusterToBastionV1";

/// Request-bearing actions the agent plane may emit or relay.
const ALLOWED_ACTIONS: [&str; 13] = [
    actions::REST_RESPONSE,
    actions::REST_REQUEST,
    actions::EXEC_START,
    actions::EXEC_STOP,
    actions::EXEC_INPUT,
    actions::EXEC_RESIZE,
    actions::STREAM_START,
    actions::STREAM_STOP,
    actions::PORTFORWARD_START,
    actions::PORTFORWARD_STOP,
    actions::PORTFORWARD_REQUEST_STOP,
    actions::PORTFORWARD_DATA_IN,
    actions::PORTFORWARD_ERROR_IN,
];

/// Stream types the agent plane may emit.
const ALLOWED_STREAMS: [&str; 6] = [
    actions::STREAM_TYPE_STREAM_STDOUT,
    actions::STREAM_TYPE_EXEC_STDOUT,
    actions::STREAM_TYPE_EXEC_STDERR,
    actions::STREAM_TYPE_PF_DATA,
    actions::STREAM_TYPE_PF_ERROR,
    actions::STREAM_TYPE_PF_READY,
];

/// Outbound hub mapping for the agent plane.
pub fn target_select(msg: &AgentMessage) -> Option<&'static str> {
    match msg.message_type {
        MessageType::Keysplitting => {
            let action: ActionMessage = msg.payload().ok()?;
            ALLOWED_ACTIONS
                .contains(&action.action.as_str())
                .then_some(TARGET_DATA)
        }
        MessageType::Stream => {
            let stream: StreamMessage = msg.payload().ok()?;
            ALLOWED_STREAMS
                .contains(&stream.stream_type.as_str())
                .then_some(TARGET_DATA)
        }
        MessageType::Error => Some(TARGET_DATA),
        _ => None,
    }
}

/// Run one data-plane session to completion: until the transport ends or
/// the session context is cancelled.
pub async fn run_session<K: KubeApi + Clone>(
    kube: K,
    service_url: Url,
    provision: NewDatachannelMessage,
    shutdown: watch::Receiver<bool>,
) {
    info!(
        connection_id = %provision.connection_id,
        target_user = %provision.target_user,
        "opening data channel"
    );

    let mut config = TransportConfig::new(service_url, DATA_HUB);
    config.auto_reconnect = false;
    config.params = HashMap::from([
        (
            "daemon_connection_id".to_string(),
            provision.connection_id.clone(),
        ),
        ("token".to_string(), provision.token.clone()),
    ]);

    let mut transport = Transport::start(config, std::sync::Arc::new(target_select), shutdown.clone());

    let registry = ActionRegistry::new();
    let SessionChannels {
        handle,
        outbound_rx,
        requeue_rx: _requeue_rx,
    } = channel::session(registry.clone(), shutdown.clone());

    tokio::spawn(channel::run_forwarder(
        outbound_rx,
        transport.handle.clone(),
        shutdown.clone(),
    ));

    let mut done = transport.handle.done();
    let mut cancel = shutdown;
    loop {
        let envelope = tokio::select! {
            _ = cancel.changed() => break,
            _ = done.changed() => break,
            env = transport.inbound.recv() => match env {
                Some(env) => env,
                None => break,
            },
        };
        if let Err(unrouted) = channel::route_to_action(&registry, envelope).await {
            start_action(&kube, &handle, &registry, unrouted).await;
        }
    }

    info!(connection_id = %provision.connection_id, "data channel closed");
}

/// First message for an unknown request id: create the action if the verb
/// can open one, then hand it its message.
async fn start_action<K: KubeApi + Clone>(
    kube: &K,
    handle: &ChannelHandle,
    registry: &ActionRegistry,
    unrouted: Unrouted,
) {
    let Some(action) = unrouted.action else {
        warn!(request_id = %unrouted.request_id, "dropping message with no owning action");
        return;
    };
    let (family, verb) = match actions::parse_action(&action.action) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("dropping message with unparseable action: {e}");
            return;
        }
    };
    let opens = verb == "start" || action.action == actions::REST_REQUEST;
    if !opens {
        warn!(
            request_id = %unrouted.request_id,
            action = %action.action,
            "dropping non-start message for unknown request"
        );
        return;
    }

    let request_id = unrouted.request_id;
    let rx = match registry.register(&request_id, family).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(%request_id, "action register failed: {e}");
            return;
        }
    };

    match family {
        ActionFamily::RestApi => {
            tokio::spawn(restapi::run(
                kube.clone(),
                handle.clone(),
                request_id.clone(),
                rx,
            ));
        }
        ActionFamily::Exec => {
            tokio::spawn(exec::run(
                kube.clone(),
                handle.clone(),
                request_id.clone(),
                rx,
            ));
        }
        ActionFamily::Stream => {
            tokio::spawn(stream::run(
                kube.clone(),
                handle.clone(),
                request_id.clone(),
                rx,
            ));
        }
        ActionFamily::PortForward => {
            tokio::spawn(portforward::run(
                kube.clone(),
                handle.clone(),
                request_id.clone(),
                rx,
            ));
        }
    }

    // Hand the freshly created action its first message.
    let msg = InboundMessage::Request {
        action: action.action,
        payload: action.action_payload,
    };
    if let Err(e) = registry.deliver(&request_id, msg).await {
        warn!(%request_id, "failed to deliver opening message: {e}");
        registry.remove(&request_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelink_core::message::ErrorMessage;

    fn keysplitting(action: &str, request_id: &str) -> AgentMessage {
        ActionMessage::new(action, &kubelink_core::message::JustRequestId {
            request_id: request_id.to_string(),
        })
        .unwrap()
        .into_envelope()
        .unwrap()
    }

    #[test]
    fn allowed_kinds_route_to_the_cluster_target() {
        assert_eq!(
            target_select(&keysplitting(actions::REST_RESPONSE, "r")),
            Some(TARGET_DATA)
        );
        assert_eq!(
            target_select(
                &StreamMessage::new("r", actions::STREAM_TYPE_EXEC_STDOUT, 0, b"x")
                    .into_envelope()
                    .unwrap()
            ),
            Some(TARGET_DATA)
        );
        assert_eq!(
            target_select(
                &ErrorMessage {
                    request_id: "r".into(),
                    message: "m".into()
                }
                .into_envelope()
                .unwrap()
            ),
            Some(TARGET_DATA)
        );
    }

    #[test]
    fn unknown_kinds_have_no_route() {
        assert_eq!(target_select(&keysplitting("kube/telnet/start", "r")), None);
        assert_eq!(
            target_select(
                &StreamMessage::new("r", "kube/telnet/stdout", 0, b"x")
                    .into_envelope()
                    .unwrap()
            ),
            None
        );
        let health = AgentMessage::new(
            MessageType::HealthCheck,
            &kubelink_core::message::HealthCheckMessage {
                cluster_name: "c".into(),
            },
        )
        .unwrap();
        assert_eq!(target_select(&health), None);
    }

    #[tokio::test]
    async fn creates_actions_only_for_opening_verbs() {
        use crate::kube::test_support::FakeKube;
        let registry = ActionRegistry::new();
        let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let SessionChannels { handle, .. } = channel::session(registry.clone(), cancel_rx);
        let kube = FakeKube::echo();

        // a non-start verb for an unknown id must not create an action
        let orphan = channel::route_to_action(&registry, keysplitting(actions::EXEC_INPUT, "x"))
            .await
            .unwrap_err();
        start_action(&kube, &handle, &registry, orphan).await;
        assert!(registry.is_empty().await);

        // a start verb does
        let opening =
            channel::route_to_action(&registry, keysplitting(actions::PORTFORWARD_START, "y"))
                .await
                .unwrap_err();
        start_action(&kube, &handle, &registry, opening).await;
        assert!(registry.contains("y").await);
    }
}

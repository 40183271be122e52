//! Daemon side of a data-plane session.
//!
//! The daemon owns one transport to the relay for the session it serves.
//! Every local kubectl operation becomes an action that registers itself in
//! the session registry *before* sending its start envelope; the router then
//! only ever forwards inbound traffic to already-registered actions. An
//! inbound request-bearing envelope with no owner is re-enqueued once (the
//! safety net for out-of-order responses) and dropped with a warning if it
//! still finds no owner.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use url::Url;

use kubelink_core::actions;
use kubelink_core::channel::{self, ChannelHandle, SessionChannels};
use kubelink_core::message::{ActionMessage, AgentMessage, MessageType};
use kubelink_core::registry::ActionRegistry;
use kubelink_core::transport::{Transport, TransportConfig, TransportHandle};

use crate::config::Config;

/// Hub the daemon's data plane lives on.
pub const DATA_HUB: &str = "/api/v1/hub/kube";

/// Hub target every daemon-plane envelope is addressed to.
pub const TARGET_DATA: &str = "RequestClientToBastionV1";

/// Actions the daemon plane is allowed to emit.
const ALLOWED_ACTIONS: [&str; 12] = [
    actions::REST_REQUEST,
    actions::EXEC_START,
    actions::EXEC_INPUT,
    actions::EXEC_RESIZE,
    actions::EXEC_STOP,
    actions::STREAM_START,
    actions::STREAM_STOP,
    actions::PORTFORWARD_START,
    actions::PORTFORWARD_DATA_IN,
    actions::PORTFORWARD_ERROR_IN,
    actions::PORTFORWARD_REQUEST_STOP,
    actions::PORTFORWARD_STOP,
];

/// Outbound hub mapping for the daemon plane. Anything without a mapping is
/// refused with `NoRoute` before it reaches the socket.
pub fn target_select(msg: &AgentMessage) -> Option<&'static str> {
    match msg.message_type {
        MessageType::Keysplitting => {
            let action: ActionMessage = msg.payload().ok()?;
            ALLOWED_ACTIONS
                .contains(&action.action.as_str())
                .then_some(TARGET_DATA)
        }
        MessageType::Error => Some(TARGET_DATA),
        _ => None,
    }
}

/// A running daemon session: what the HTTP front-end hands to actions.
#[derive(Clone)]
pub struct Session {
    pub handle: ChannelHandle,
}

/// Open the session transport and start its router and forwarder.
pub fn open(config: &Config, shutdown: watch::Receiver<bool>) -> Result<Session, String> {
    let service_url =
        Url::parse(&config.relay.service_url).map_err(|e| format!("bad service url: {e}"))?;

    let mut transport_config = TransportConfig::new(service_url, DATA_HUB);
    transport_config.auto_reconnect = true;
    transport_config.params = HashMap::from([
        ("connection_id".to_string(), config.relay.connection_id.clone()),
        ("token".to_string(), config.relay.token.clone()),
    ]);

    let transport = Transport::start(
        transport_config,
        std::sync::Arc::new(target_select),
        shutdown.clone(),
    );

    let registry = ActionRegistry::new();
    let SessionChannels {
        handle,
        outbound_rx,
        requeue_rx,
    } = channel::session(registry.clone(), shutdown.clone());

    tokio::spawn(channel::run_forwarder(
        outbound_rx,
        transport.handle.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(run_router(
        transport.inbound,
        requeue_rx,
        registry,
        transport.handle.clone(),
        shutdown,
    ));

    Ok(Session { handle })
}

/// Drain transport inbound plus the requeue lane into the registry.
async fn run_router(
    mut inbound: mpsc::Receiver<AgentMessage>,
    mut requeue_rx: mpsc::Receiver<AgentMessage>,
    registry: ActionRegistry,
    transport: TransportHandle,
    mut cancel: watch::Receiver<bool>,
) {
    let mut done = transport.done();

    loop {
        let (envelope, from_requeue) = tokio::select! {
            _ = cancel.changed() => break,
            _ = done.changed() => {
                info!("session transport ended");
                break;
            }
            env = inbound.recv() => match env {
                Some(env) => (env, false),
                None => break,
            },
            env = requeue_rx.recv() => match env {
                Some(env) => (env, true),
                None => break,
            },
        };

        match channel::route_to_action(&registry, envelope).await {
            Ok(()) => {}
            Err(unrouted) => {
                // The daemon never creates actions from inbound traffic. A
                // response for an unknown request gets one more chance in
                // case its action is registering right now; a miss on the
                // requeue lane is final.
                if from_requeue {
                    warn!(
                        request_id = %unrouted.request_id,
                        "dropping envelope with no matching action"
                    );
                } else if let Err(e) = retry_route(&registry, unrouted.envelope).await {
                    warn!("requeue failed: {e}");
                }
            }
        }
    }
}

async fn retry_route(registry: &ActionRegistry, envelope: AgentMessage) -> Result<(), String> {
    // Actions register before sending their start envelope, so a single
    // re-route after yielding is enough to cover the registration race.
    tokio::task::yield_now().await;
    match channel::route_to_action(registry, envelope).await {
        Ok(()) => Ok(()),
        Err(unrouted) => Err(format!("request {} still unowned", unrouted.request_id)),
    }
}

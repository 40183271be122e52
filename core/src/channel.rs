//! Data-plane session plumbing shared by both processes.
//!
//! A session owns one transport, one [`ActionRegistry`], and a session-local
//! outbound queue. Actions talk to the world exclusively through a
//! [`ChannelHandle`]: registering themselves, sending envelopes, and
//! re-enqueuing a mismatched response back to the router. Cancelling the
//! session context stops the forwarder, which drains and discards whatever
//! the session still had queued.

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::actions::ActionFamily;
use crate::error::TransportError;
use crate::message::{ActionMessage, AgentMessage, ErrorMessage, StreamMessage};
use crate::registry::{ActionRegistry, InboundMessage, RegistryError};
use crate::transport::TransportHandle;

/// Depth of the session-local outbound and requeue queues.
pub const SESSION_QUEUE_DEPTH: usize = 64;

/// The pieces a session's router and forwarder tasks consume.
pub struct SessionChannels {
    pub handle: ChannelHandle,
    pub outbound_rx: mpsc::Receiver<AgentMessage>,
    pub requeue_rx: mpsc::Receiver<AgentMessage>,
}

/// Create the channel set for one session.
pub fn session(registry: ActionRegistry, cancel: watch::Receiver<bool>) -> SessionChannels {
    let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
    let (requeue_tx, requeue_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
    SessionChannels {
        handle: ChannelHandle {
            registry,
            outbound: outbound_tx,
            requeue: requeue_tx,
            cancel,
        },
        outbound_rx,
        requeue_rx,
    }
}

/// An action's view of its session.
#[derive(Clone)]
pub struct ChannelHandle {
    registry: ActionRegistry,
    outbound: mpsc::Sender<AgentMessage>,
    requeue: mpsc::Sender<AgentMessage>,
    cancel: watch::Receiver<bool>,
}

impl ChannelHandle {
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Watch that flips to `true` when the session is being torn down.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    pub async fn register(
        &self,
        request_id: &str,
        family: ActionFamily,
    ) -> Result<mpsc::Receiver<InboundMessage>, RegistryError> {
        self.registry.register(request_id, family).await
    }

    pub async fn remove(&self, request_id: &str) {
        self.registry.remove(request_id).await;
    }

    /// Wrap and enqueue a request-bearing envelope.
    pub async fn send_action<T: serde::Serialize>(
        &self,
        action: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        let envelope = ActionMessage::new(action, payload)
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?
            .into_envelope()?;
        self.send(envelope).await
    }

    pub async fn send_stream(&self, msg: StreamMessage) -> Result<(), TransportError> {
        self.send(msg.into_envelope()?).await
    }

    pub async fn send_error(&self, msg: ErrorMessage) -> Result<(), TransportError> {
        self.send(msg.into_envelope()?).await
    }

    async fn send(&self, envelope: AgentMessage) -> Result<(), TransportError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Hand an envelope that reached the wrong action back to the router so
    /// it can find its rightful owner.
    pub async fn requeue(&self, envelope: AgentMessage) -> Result<(), TransportError> {
        self.requeue
            .send(envelope)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Forward the session's outbound queue into the transport until the session
/// is cancelled or the transport ends; then drain and discard.
pub async fn run_forwarder(
    mut outbound_rx: mpsc::Receiver<AgentMessage>,
    transport: TransportHandle,
    mut cancel: watch::Receiver<bool>,
) {
    let mut done = transport.done();
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = done.changed() => break,
            item = outbound_rx.recv() => {
                let Some(envelope) = item else { break };
                if let Err(e) = transport.send(envelope).await {
                    warn!("dropping outbound envelope: {e}");
                    if matches!(e, TransportError::Closed) {
                        break;
                    }
                }
            }
        }
    }
    // Discard whatever is still queued so no stale envelope survives the
    // session.
    let mut discarded = 0_usize;
    while outbound_rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(discarded, "discarded queued outbound on session end");
    }
}

/// Route one inbound envelope into the registry. Returns the envelope back
/// when no action owns it, so side-specific routers can decide whether to
/// create one.
pub async fn route_to_action(
    registry: &ActionRegistry,
    envelope: AgentMessage,
) -> Result<(), Unrouted> {
    match envelope.message_type {
        crate::message::MessageType::Keysplitting => {
            let action: ActionMessage = match envelope.payload() {
                Ok(a) => a,
                Err(e) => {
                    warn!("dropping malformed action envelope: {e}");
                    return Ok(());
                }
            };
            let request_id = match action.request_id() {
                Ok(id) => id,
                Err(e) => {
                    warn!(action = %action.action, "dropping action without request id: {e}");
                    return Ok(());
                }
            };
            let msg = InboundMessage::Request {
                action: action.action.clone(),
                payload: action.action_payload.clone(),
            };
            match registry.deliver(&request_id, msg).await {
                Ok(()) => Ok(()),
                Err(RegistryError::NotFound(_)) => Err(Unrouted {
                    request_id,
                    action: Some(action),
                    envelope,
                }),
                Err(e) => {
                    warn!("dropping undeliverable action envelope: {e}");
                    Ok(())
                }
            }
        }
        crate::message::MessageType::Stream => {
            let stream: StreamMessage = match envelope.payload() {
                Ok(s) => s,
                Err(e) => {
                    warn!("dropping malformed stream envelope: {e}");
                    return Ok(());
                }
            };
            let request_id = stream.request_id.clone();
            if let Err(e) = registry
                .deliver(&request_id, InboundMessage::Stream(stream))
                .await
            {
                warn!(%request_id, "dropping stream chunk: {e}");
            }
            Ok(())
        }
        crate::message::MessageType::Error => {
            let error: ErrorMessage = match envelope.payload() {
                Ok(e) => e,
                Err(e) => {
                    warn!("dropping malformed error envelope: {e}");
                    return Ok(());
                }
            };
            let request_id = error.request_id.clone();
            if let Err(e) = registry
                .deliver(&request_id, InboundMessage::Error(error))
                .await
            {
                warn!(%request_id, "dropping error envelope: {e}");
            }
            Ok(())
        }
        other => {
            warn!(?other, "dropping control envelope on data plane");
            Ok(())
        }
    }
}

/// A request-bearing envelope nobody owns yet.
#[derive(Debug)]
pub struct Unrouted {
    pub request_id: String,
    pub action: Option<ActionMessage>,
    pub envelope: AgentMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::REST_REQUEST;
    use crate::message::JustRequestId;

    fn request_envelope(request_id: &str) -> AgentMessage {
        ActionMessage::new(REST_REQUEST, &JustRequestId {
            request_id: request_id.to_string(),
        })
        .unwrap()
        .into_envelope()
        .unwrap()
    }

    #[tokio::test]
    async fn routes_request_envelopes_by_request_id() {
        let registry = ActionRegistry::new();
        let mut rx = registry
            .register("r-1", ActionFamily::RestApi)
            .await
            .unwrap();

        route_to_action(&registry, request_envelope("r-1"))
            .await
            .expect("routed");
        match rx.recv().await.unwrap() {
            InboundMessage::Request { action, .. } => assert_eq!(action, REST_REQUEST),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_request_id_comes_back_unrouted() {
        let registry = ActionRegistry::new();
        let unrouted = route_to_action(&registry, request_envelope("ghost"))
            .await
            .expect_err("should be unrouted");
        assert_eq!(unrouted.request_id, "ghost");
    }

    #[tokio::test]
    async fn cancelling_the_session_discards_queued_outbound() {
        let registry = ActionRegistry::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let channels = session(registry, cancel_rx.clone());

        // a transport whose queue is never drained
        let (transport, _out_rx) = crate::transport::TransportHandle::detached(
            std::sync::Arc::new(|_| Some("TestHub")),
        );

        channels
            .handle
            .send_error(ErrorMessage {
                request_id: "r".into(),
                message: "m".into(),
            })
            .await
            .unwrap();

        cancel_tx.send(true).unwrap();
        run_forwarder(channels.outbound_rx, transport, cancel_rx).await;
        // forwarder returned, nothing panicked; queue is gone with it
    }
}

//! Per-session action registry.
//!
//! One registry per data-plane session maps request ids to live actions. The
//! envelope router owns the map; action tasks receive their traffic through
//! the bounded queue registered here. At most one action exists per request
//! id; entries are removed when the action reports closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};

use crate::actions::ActionFamily;
use crate::message::{ErrorMessage, StreamMessage};

/// Queue depth for each action's inbound traffic.
pub const ACTION_QUEUE_DEPTH: usize = 64;

/// One message routed to an action.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// A request-bearing envelope: action name + its serialized payload.
    Request { action: String, payload: Vec<u8> },
    /// A chunk of stream content.
    Stream(StreamMessage),
    /// An `Error` envelope addressed to this request.
    Error(ErrorMessage),
}

struct Entry {
    family: ActionFamily,
    created_at: Instant,
    tx: mpsc::Sender<InboundMessage>,
}

/// Shared, mutex-guarded map of in-flight actions. All access goes through
/// these helpers; the mutex is never exposed.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action and hand back the receiving side of its queue.
    /// Fails if the request id is already live.
    pub async fn register(
        &self,
        request_id: &str,
        family: ActionFamily,
    ) -> Result<mpsc::Receiver<InboundMessage>, RegistryError> {
        let mut map = self.inner.lock().await;
        if map.contains_key(request_id) {
            return Err(RegistryError::Duplicate(request_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(ACTION_QUEUE_DEPTH);
        map.insert(
            request_id.to_string(),
            Entry {
                family,
                created_at: Instant::now(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Forward a message to the action owning `request_id`.
    pub async fn deliver(
        &self,
        request_id: &str,
        msg: InboundMessage,
    ) -> Result<(), RegistryError> {
        // Clone the sender out so the map lock is not held across the send.
        let tx = {
            let map = self.inner.lock().await;
            map.get(request_id)
                .map(|e| e.tx.clone())
                .ok_or_else(|| RegistryError::NotFound(request_id.to_string()))?
        };
        tx.send(msg)
            .await
            .map_err(|_| RegistryError::Gone(request_id.to_string()))
    }

    /// Remove a closed action. Idempotent.
    pub async fn remove(&self, request_id: &str) {
        self.inner.lock().await.remove(request_id);
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().await.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// (request id, family, age) snapshot, for logging.
    pub async fn snapshot(&self) -> Vec<(String, ActionFamily, std::time::Duration)> {
        let map = self.inner.lock().await;
        map.iter()
            .map(|(id, e)| (id.clone(), e.family, e.created_at.elapsed()))
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("an action already exists for request {0}")]
    Duplicate(String),

    #[error("no action for request {0}")]
    NotFound(String),

    #[error("action for request {0} is gone")]
    Gone(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_action_per_request_id() {
        let reg = ActionRegistry::new();
        let _rx = reg.register("r-1", ActionFamily::RestApi).await.unwrap();
        let err = reg.register("r-1", ActionFamily::Exec).await.unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[tokio::test]
    async fn delivers_to_the_registered_queue() {
        let reg = ActionRegistry::new();
        let mut rx = reg.register("r-1", ActionFamily::Exec).await.unwrap();
        reg.deliver(
            "r-1",
            InboundMessage::Stream(StreamMessage::new("r-1", "kube/exec/stdout", 0, b"x")),
        )
        .await
        .unwrap();
        match rx.recv().await.unwrap() {
            InboundMessage::Stream(s) => assert_eq!(s.sequence_number, 0),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_request_id_is_reported() {
        let reg = ActionRegistry::new();
        let err = reg
            .deliver(
                "nope",
                InboundMessage::Error(ErrorMessage {
                    request_id: "nope".into(),
                    message: "x".into(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_after_remove() {
        let reg = ActionRegistry::new();
        let _rx = reg.register("r-1", ActionFamily::Stream).await.unwrap();
        assert_eq!(reg.len().await, 1);
        reg.remove("r-1").await;
        reg.remove("r-1").await; // idempotent
        assert!(reg.is_empty().await);
    }
}

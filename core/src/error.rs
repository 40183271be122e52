//! Error taxonomy shared by both processes.

use thiserror::Error;

/// Failures of the relay transport. `AuthFailed` is permanent for the
/// affected transport; `NegotiateFailed` and `HandshakeFailed` are retried
/// internally by the connect loop; the rest surface through the `done`
/// signal or at send time.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay rejected authentication")]
    AuthFailed,

    #[error("negotiation failed: {0}")]
    NegotiateFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("no hub target for outbound {0:?} message")]
    NoRoute(crate::message::MessageType),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("transport is shut down")]
    Closed,
}

/// Failures inside an action state machine. These never reach the transport
/// directly; they are written into the action's own response path (a REST
/// response or an `Error` envelope carrying the action's request id).
#[derive(Debug, Error)]
pub enum ActionError {
    /// Malformed payload, unknown verb, or a sequence gap past capacity.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Failure talking to kube-apiserver.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Failure of the local HTTP / stream stack.
    #[error("local error: {0}")]
    Local(String),

    /// The action (or its session) was closed underneath us.
    #[error("action closed")]
    Closed,
}

/// Failures of the on-disk vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault io: {0}")]
    Io(#[from] std::io::Error),

    #[error("vault parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("vault has no identity key")]
    MissingKey,

    #[error("stored key is invalid: {0}")]
    BadKey(String),
}

//! Daemon-side action state machines, one module per family.
//!
//! Each action allocates its request id, registers in the session registry
//! before emitting its start envelope, and owns its inbound queue until it
//! closes.

pub mod exec;
pub mod portforward;
pub mod restapi;
pub mod stream;

/// Command metadata parsed from the local bearer token tail, attached to
/// every start payload.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub kube_command: String,
    pub log_id: String,
}

impl Default for CommandContext {
    fn default() -> Self {
        Self {
            kube_command: "N/A".to_string(),
            log_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

//! Agent-side action state machines, one module per family.
//!
//! Agent actions are created by the data channel's router when the first
//! message for a request id arrives, run as their own task consuming the
//! registered inbound queue, and remove themselves from the registry when
//! they close.

pub mod exec;
pub mod portforward;
pub mod restapi;
pub mod stream;

//! Handoff: per-conversation gate between automated replies and a human
//! operator.
//!
//! Activation comes from outside (a pipeline escalation or an operator).
//! Reactivation happens on inbound traffic when the agent has gone quiet or
//! the message lands in the off-hours window.

pub mod manager;
pub mod policy;
pub mod state;

pub use manager::HandoffManager;
pub use state::{HandoffState, ReactivationReason};

//! Burstline: per-participant message burst coordination.
//!
//! Inbound messages are buffered per participant behind a sliding window,
//! then handed to a processing pipeline one batch at a time, with a handoff
//! gate that suppresses automated replies while a human operator is engaged.

pub mod api;
pub mod config;
pub mod error;
pub mod handoff;
pub mod ingest;
pub mod pipeline;
pub mod store;
pub mod worker;

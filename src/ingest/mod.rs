//! Ingestion: validation, dedup, and buffer-window upkeep for inbound
//! events.

pub mod gateway;
pub mod types;

pub use gateway::IngestionGateway;
pub use types::{InboundEvent, IngestOutcome};

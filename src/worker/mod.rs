//! Background workers over the buffer and conversation tables.
//!
//! - `sweeper`: claims expired buffers and runs batches through the pipeline
//! - `reclaimer`: force-resets locks held past the staleness threshold
//! - `timeouts`: closes out long-running handoffs on its own timer

pub mod reclaimer;
pub mod sweeper;
pub mod timeouts;

pub use reclaimer::StuckLockReclaimer;
pub use sweeper::{ParticipantOutcome, SweepReport, Sweeper, spawn_sweeper};
pub use timeouts::{TimeoutReport, TimeoutSweeper, spawn_timeout_sweeper};

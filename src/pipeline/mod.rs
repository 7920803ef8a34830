//! Downstream processing pipeline.
//!
//! The sweeper hands each claimed batch to a `ProcessingPipeline`:
//! 1. Messages for one participant, oldest first
//! 2. The conversation context (status, handoff, retry count)
//! 3. An explicit `PipelineOutcome` back, or an error treated as failure
//!
//! `WebhookPipeline` is the HTTP implementation used by the binary.

pub mod types;
pub mod webhook;

pub use types::{
    CompletedBatch, ConversationContext, PipelineOutcome, PostProcessHook, ProcessingPipeline,
};
pub use webhook::WebhookPipeline;

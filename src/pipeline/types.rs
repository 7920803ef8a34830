//! Shared types for the downstream processing pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::store::model::{ConversationStatus, StoredMessage};

// ── Context ─────────────────────────────────────────────────────────

/// Conversation state handed to the pipeline alongside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: Uuid,
    pub participant_id: String,
    pub status: ConversationStatus,
    pub handoff_active: bool,
    /// How many times this buffer was released after a failed attempt.
    pub retry_count: u32,
    /// Fencing generation of the lock this batch runs under.
    pub generation: i64,
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Result of one pipeline invocation. `success` is always explicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub success: bool,
    #[serde(default)]
    pub detail: Option<String>,
    /// The pipeline decided a human should take over this conversation.
    #[serde(default)]
    pub escalate: bool,
}

impl PipelineOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            detail: None,
            escalate: false,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
            escalate: false,
        }
    }

    pub fn escalated() -> Self {
        Self {
            escalate: true,
            ..Self::succeeded()
        }
    }
}

// ── Pipeline trait ──────────────────────────────────────────────────

/// Downstream consumer of coalesced message batches.
///
/// Called at most once at a time per participant, with messages oldest
/// first. An `Err` is treated the same as `success: false`.
#[async_trait]
pub trait ProcessingPipeline: Send + Sync {
    async fn process(
        &self,
        participant_id: &str,
        messages: &[StoredMessage],
        context: &ConversationContext,
    ) -> Result<PipelineOutcome, PipelineError>;
}

// ── Post-processing hooks ───────────────────────────────────────────

/// A batch that was completed, passed to post-processing hooks.
#[derive(Debug, Clone)]
pub struct CompletedBatch {
    pub participant_id: String,
    pub conversation_id: Uuid,
    pub messages: Vec<StoredMessage>,
    /// `None` when the batch was suppressed by an active handoff.
    pub outcome: Option<PipelineOutcome>,
}

/// Fire-and-forget side effect run after a batch completes.
///
/// Hooks run as detached tasks; failures are logged and never undo the
/// completion.
#[async_trait]
pub trait PostProcessHook: Send + Sync {
    /// Hook name for logs.
    fn name(&self) -> &str;

    async fn after_complete(&self, batch: &CompletedBatch) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_requires_success_field() {
        let missing: Result<PipelineOutcome, _> = serde_json::from_str(r#"{"detail":"x"}"#);
        assert!(missing.is_err());

        let minimal: PipelineOutcome = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(minimal, PipelineOutcome::succeeded());
    }

    #[test]
    fn escalated_is_a_success() {
        let outcome = PipelineOutcome::escalated();
        assert!(outcome.success);
        assert!(outcome.escalate);
        assert!(!PipelineOutcome::failed("nope").success);
    }
}

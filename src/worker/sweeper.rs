//! Sweeper: claims expired buffers and drives each batch through the
//! processing pipeline.
//!
//! Each pass:
//! 1. Refresh configuration from settings/env
//! 2. Reclaim stuck locks
//! 3. `acquire` every expired, unclaimed buffer (lost races are skipped)
//! 4. Load the participant's unprocessed messages, oldest first
//! 5. Suppress (handoff active) or call the pipeline
//! 6. `complete` on success, `release` + alert on failure
//!
//! Any number of sweepers may run at once; the buffer lock keeps each
//! participant to a single holder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::reclaimer::StuckLockReclaimer;
use crate::config::{CoordinatorConfig, SharedConfig};
use crate::error::{Error, PipelineError};
use crate::handoff::HandoffManager;
use crate::pipeline::{
    CompletedBatch, ConversationContext, PipelineOutcome, PostProcessHook, ProcessingPipeline,
};
use crate::store::Database;
use crate::store::model::{AlertKind, LockGrant, StoredMessage};

/// What happened to one participant during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantOutcome {
    /// Another sweeper holds the lock, or the window has not expired.
    Skipped,
    /// Pipeline succeeded (or the buffer was empty) and the batch completed.
    Completed,
    /// Handoff active: batch marked processed without a pipeline call.
    Suppressed,
    /// Pipeline failed; the buffer was released for the next pass.
    Failed,
}

/// Summary of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub suppressed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub reclaimed: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: ParticipantOutcome) {
        match outcome {
            ParticipantOutcome::Skipped => self.skipped += 1,
            ParticipantOutcome::Completed => self.completed += 1,
            ParticipantOutcome::Suppressed => self.suppressed += 1,
            ParticipantOutcome::Failed => self.failed += 1,
        }
        if outcome != ParticipantOutcome::Skipped {
            self.claimed += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Claims and processes expired buffers.
pub struct Sweeper {
    db: Arc<dyn Database>,
    pipeline: Arc<dyn ProcessingPipeline>,
    handoff: Arc<HandoffManager>,
    config: SharedConfig,
    reclaimer: StuckLockReclaimer,
    hooks: Vec<Arc<dyn PostProcessHook>>,
}

impl Sweeper {
    pub fn new(
        db: Arc<dyn Database>,
        pipeline: Arc<dyn ProcessingPipeline>,
        handoff: Arc<HandoffManager>,
        config: SharedConfig,
    ) -> Self {
        Self {
            reclaimer: StuckLockReclaimer::new(Arc::clone(&db)),
            db,
            pipeline,
            handoff,
            config,
            hooks: Vec::new(),
        }
    }

    /// Register a hook run after every completed batch.
    pub fn with_hook(mut self, hook: Arc<dyn PostProcessHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Re-read configuration and publish it to the shared snapshot.
    async fn refresh_config(&self) -> CoordinatorConfig {
        let config = CoordinatorConfig::load(self.db.as_ref()).await;
        *self.config.write().await = config.clone();
        config
    }

    pub async fn sweep(&self) -> Result<SweepReport, Error> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one periodic pass as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, Error> {
        let config = self.refresh_config().await;
        let mut report = SweepReport::default();

        match self.reclaimer.reclaim_at(config.lock_stale_threshold, now).await {
            Ok(n) => report.reclaimed = n,
            Err(e) => warn!(error = %e, "Stuck-lock reclaim failed; continuing sweep"),
        }

        let candidates = self.db.list_expired_buffers(now).await?;
        if candidates.is_empty() {
            return Ok(report);
        }
        debug!(count = candidates.len(), "Expired buffers found");

        let config = &config;
        let outcomes: Vec<ParticipantOutcome> = stream::iter(candidates)
            .map(|participant_id| async move {
                match self.process_participant(&participant_id, config, now).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(participant = %participant_id, error = %e, "Sweep failed for participant");
                        ParticipantOutcome::Failed
                    }
                }
            })
            .buffer_unordered(config.max_concurrent_participants.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }
        Ok(report)
    }

    pub async fn sweep_participant(&self, participant_id: &str) -> Result<ParticipantOutcome, Error> {
        self.sweep_participant_at(participant_id, Utc::now()).await
    }

    /// Forced sweep for one participant: pull its window forward and run the
    /// normal acquire path. A claimed buffer is left to its holder.
    pub async fn sweep_participant_at(
        &self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ParticipantOutcome, Error> {
        let config = self.refresh_config().await;
        self.db.expire_window(participant_id, now).await?;
        self.process_participant(participant_id, &config, now).await
    }

    async fn process_participant(
        &self,
        participant_id: &str,
        config: &CoordinatorConfig,
        now: DateTime<Utc>,
    ) -> Result<ParticipantOutcome, Error> {
        let token = Uuid::new_v4().to_string();
        let Some(grant) = self.db.acquire(participant_id, &token, now).await? else {
            debug!(participant = participant_id, "Buffer not claimable, skipping");
            return Ok(ParticipantOutcome::Skipped);
        };

        match self.run_claimed(&grant, config, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Storage failed mid-batch; hand the buffer back rather than
                // waiting for the reclaimer.
                if let Err(release_err) = self.db.release(&grant, now).await {
                    warn!(participant = participant_id, error = %release_err, "Failed to release after error");
                }
                Err(e)
            }
        }
    }

    async fn run_claimed(
        &self,
        grant: &LockGrant,
        config: &CoordinatorConfig,
        now: DateTime<Utc>,
    ) -> Result<ParticipantOutcome, Error> {
        let participant_id = grant.participant_id.as_str();
        let messages = self.db.list_unprocessed_messages(participant_id).await?;
        if messages.is_empty() {
            if !self.db.complete(grant, &[], now).await? {
                warn!(participant = participant_id, generation = grant.generation, "Lock lost before empty buffer was cleared");
                return Ok(ParticipantOutcome::Failed);
            }
            debug!(participant = participant_id, "Empty buffer cleared");
            return Ok(ParticipantOutcome::Completed);
        }
        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();

        let open = self
            .db
            .ensure_active_conversation(participant_id, now)
            .await?;
        let (conversation, state) = self.handoff.current_state(open.id).await?;

        if state.suppresses_replies() {
            if !self.db.complete(grant, &ids, now).await? {
                warn!(participant = participant_id, generation = grant.generation, "Lock lost before suppression completed");
                return Ok(ParticipantOutcome::Failed);
            }
            info!(
                participant = participant_id,
                conversation_id = %conversation.id,
                count = ids.len(),
                "Handoff active, batch suppressed"
            );
            self.spawn_hooks(conversation.id, messages, None);
            return Ok(ParticipantOutcome::Suppressed);
        }

        let context = ConversationContext {
            conversation_id: conversation.id,
            participant_id: participant_id.to_string(),
            status: conversation.status,
            handoff_active: conversation.handoff_active,
            retry_count: grant.retry_count,
            generation: grant.generation,
        };

        let result = match tokio::time::timeout(
            config.pipeline_timeout,
            self.pipeline.process(participant_id, &messages, &context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(config.pipeline_timeout)),
        };

        let outcome = match result {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => {
                let detail = outcome
                    .detail
                    .unwrap_or_else(|| "pipeline reported failure".to_string());
                return self.fail(grant, &detail, now).await;
            }
            Err(e) => return self.fail(grant, &e.to_string(), now).await,
        };

        if !self.db.complete(grant, &ids, now).await? {
            // Reclaimed while the pipeline ran; the new holder reprocesses.
            warn!(
                participant = participant_id,
                token = %grant.token,
                generation = grant.generation,
                "Lock lost before completion, batch will be redone"
            );
            return Ok(ParticipantOutcome::Failed);
        }
        info!(
            participant = participant_id,
            conversation_id = %conversation.id,
            count = ids.len(),
            generation = grant.generation,
            "Batch processed"
        );

        if outcome.escalate {
            if let Err(e) = self.handoff.activate(conversation.id, now).await {
                warn!(conversation_id = %conversation.id, error = %e, "Escalation not applied");
            }
        }

        self.spawn_hooks(conversation.id, messages, Some(outcome));
        Ok(ParticipantOutcome::Completed)
    }

    async fn fail(
        &self,
        grant: &LockGrant,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<ParticipantOutcome, Error> {
        let participant_id = grant.participant_id.as_str();
        warn!(
            participant = participant_id,
            retry_count = grant.retry_count,
            "Pipeline failed: {detail}"
        );

        if !self.db.release(grant, now).await? {
            warn!(participant = participant_id, generation = grant.generation, "Lock lost before release");
        }
        if let Err(e) = self
            .db
            .insert_alert(AlertKind::ProcessingFailed, participant_id, detail, now)
            .await
        {
            warn!(participant = participant_id, error = %e, "Failed to record alert");
        }
        Ok(ParticipantOutcome::Failed)
    }

    fn spawn_hooks(
        &self,
        conversation_id: Uuid,
        messages: Vec<StoredMessage>,
        outcome: Option<PipelineOutcome>,
    ) {
        if self.hooks.is_empty() {
            return;
        }
        let Some(participant_id) = messages.first().map(|m| m.participant_id.clone()) else {
            return;
        };
        let batch = Arc::new(CompletedBatch {
            participant_id,
            conversation_id,
            messages,
            outcome,
        });
        for hook in &self.hooks {
            let hook = Arc::clone(hook);
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                if let Err(e) = hook.after_complete(&batch).await {
                    warn!(hook = hook.name(), participant = %batch.participant_id, error = %e, "Post-process hook failed");
                }
            });
        }
    }
}

/// Spawn the periodic sweep loop.
///
/// Sleeps for the configured `sweep_interval` between passes, so interval
/// changes take effect on the next pass. Returns a `JoinHandle` and
/// shutdown flag.
pub fn spawn_sweeper(sweeper: Arc<Sweeper>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Sweeper started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Sweeper shutting down");
                return;
            }

            match sweeper.sweep().await {
                Ok(report) if !report.is_empty() => info!(
                    claimed = report.claimed,
                    completed = report.completed,
                    suppressed = report.suppressed,
                    failed = report.failed,
                    skipped = report.skipped,
                    reclaimed = report.reclaimed,
                    "Sweep pass finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Sweep pass failed"),
            }

            let interval = sweeper.config().read().await.sweep_interval;
            tokio::time::sleep(interval).await;
        }
    });

    (handle, shutdown_flag)
}

//! Timeout sweeper: closes out handoffs on a timer, independent of
//! message traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::Error;
use crate::handoff::policy::evaluate_timeout;
use crate::store::Database;
use crate::store::model::{Conversation, ConversationStatus};

/// Summary of one timeout pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutReport {
    pub scanned: usize,
    pub finalized: usize,
    pub lost: usize,
}

pub struct TimeoutSweeper {
    db: Arc<dyn Database>,
}

impl TimeoutSweeper {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Apply the first matching timeout rule to every handoff conversation.
    pub async fn sweep_at(
        &self,
        config: &CoordinatorConfig,
        now: DateTime<Utc>,
    ) -> Result<TimeoutReport, Error> {
        let conversations = self.db.list_handoff_conversations().await?;
        let mut report = TimeoutReport {
            scanned: conversations.len(),
            ..Default::default()
        };

        for conversation in conversations {
            match self.apply(&conversation, config, now).await {
                Ok(Some(ConversationStatus::Finalized)) => report.finalized += 1,
                Ok(Some(ConversationStatus::Lost)) => report.lost += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(conversation_id = %conversation.id, error = %e, "Timeout check failed");
                }
            }
        }
        Ok(report)
    }

    async fn apply(
        &self,
        conversation: &Conversation,
        config: &CoordinatorConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationStatus>, Error> {
        let Some(started) = conversation.handoff_started_at else {
            return Ok(None);
        };
        let agent_replied = self
            .db
            .has_human_agent_message_since(conversation.id, started)
            .await?;
        let Some(action) = evaluate_timeout(conversation, agent_replied, config, now) else {
            return Ok(None);
        };

        let status = action.resulting_status();
        // Keyed on the observed start so a handoff that was ended and
        // restarted since the scan is left alone.
        if !self.db.end_handoff(conversation.id, started, status).await? {
            debug!(conversation_id = %conversation.id, "Handoff changed since scan");
            return Ok(None);
        }

        info!(
            conversation_id = %conversation.id,
            participant = %conversation.participant_id,
            rule = action.label(),
            status = %status,
            "Handoff timed out"
        );
        Ok(Some(status))
    }
}

/// Spawn the timeout sweep loop.
///
/// Configuration is re-read every pass. Returns a `JoinHandle` and shutdown
/// flag.
pub fn spawn_timeout_sweeper(
    db: Arc<dyn Database>,
    sweeper: Arc<TimeoutSweeper>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Timeout sweeper started");

        loop {
            let config = CoordinatorConfig::load(db.as_ref()).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Timeout sweeper shutting down");
                return;
            }

            match sweeper.sweep_at(&config, Utc::now()).await {
                Ok(report) if report.finalized + report.lost > 0 => info!(
                    scanned = report.scanned,
                    finalized = report.finalized,
                    lost = report.lost,
                    "Timeout pass finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Timeout pass failed"),
            }

            tokio::time::sleep(config.timeout_sweep_interval).await;
        }
    });

    (handle, shutdown_flag)
}

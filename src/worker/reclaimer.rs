//! Stuck-lock reclaimer: force-resets buffer locks held past the staleness
//! threshold.
//!
//! A sweeper that crashes mid-batch leaves its lock behind. This is the only
//! recovery path, so every reclaim is recorded as an alert.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::to_chrono;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::store::model::AlertKind;

pub struct StuckLockReclaimer {
    db: Arc<dyn Database>,
}

impl StuckLockReclaimer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Reclaim every lock acquired before `now - threshold`. Returns how
    /// many were reset.
    pub async fn reclaim_at(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let cutoff = now - to_chrono(threshold);
        let stale = self.db.list_stale_locks(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut reclaimed = 0;
        for entry in stale {
            let (Some(owner), Some(acquired_at)) = (entry.lock_owner.as_deref(), entry.lock_acquired_at)
            else {
                continue;
            };

            let reset = match self
                .db
                .reclaim_lock(&entry.participant_id, owner, entry.generation, cutoff, now)
                .await
            {
                Ok(reset) => reset,
                Err(e) => {
                    warn!(participant = %entry.participant_id, error = %e, "Failed to reclaim stale lock");
                    continue;
                }
            };
            if !reset {
                // The holder finished or released between the scan and now.
                debug!(participant = %entry.participant_id, "Stale lock already gone");
                continue;
            }

            reclaimed += 1;
            let held_secs = (now - acquired_at).num_seconds();
            warn!(
                participant = %entry.participant_id,
                token = owner,
                generation = entry.generation,
                held_secs,
                "Reclaimed stuck buffer lock"
            );

            let detail = format!(
                "lock held by {owner} (generation {}) for {held_secs}s, acquired at {}",
                entry.generation,
                acquired_at.to_rfc3339()
            );
            if let Err(e) = self
                .db
                .insert_alert(AlertKind::StuckLockReclaimed, &entry.participant_id, &detail, now)
                .await
            {
                warn!(participant = %entry.participant_id, error = %e, "Failed to record reclaim alert");
            }
        }

        Ok(reclaimed)
    }
}

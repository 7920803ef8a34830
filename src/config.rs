//! Configuration types.
//!
//! Every tunable is resolved per key: `settings` table row, then the
//! `BURSTLINE_*` environment variable, then the hard-coded default. Bad
//! values are logged and replaced by the default, so loading never fails.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::ConfigError;
use crate::store::Database;

/// Upper bound for any configured duration (ten years).
const MAX_DURATION_SECS: u64 = 315_360_000;

/// Convert a std duration into a chrono one for timestamp arithmetic.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Configuration snapshot shared between ingestion and the sweeper, which
/// refreshes it at the start of each pass.
pub type SharedConfig = Arc<RwLock<CoordinatorConfig>>;

// ── Off-hours window ────────────────────────────────────────────────

/// A daily local-time window during which handoffs are released back to
/// automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffHoursWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Local time = UTC + this many minutes.
    pub utc_offset_minutes: i32,
}

impl OffHoursWindow {
    /// Build a window from `HH:MM` bounds.
    pub fn parse(start: &str, end: &str, utc_offset_minutes: i32) -> Result<Self, ConfigError> {
        let parse_time = |key: &str, s: &str| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected HH:MM, got '{s}': {e}"),
            })
        };
        if utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::InvalidValue {
                key: "utc_offset_minutes".into(),
                message: format!("{utc_offset_minutes} is not within ±24h"),
            });
        }
        Ok(Self {
            start: parse_time("off_hours_start", start)?,
            end: parse_time("off_hours_end", end)?,
            utc_offset_minutes,
        })
    }

    /// Whether `now` falls inside the window in local time.
    ///
    /// `start > end` wraps midnight; `start == end` disables the window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if self.start == self.end {
            return false;
        }
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_minutes * 60) else {
            return false;
        };
        let local = now.with_timezone(&offset).time();
        if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

impl Default for OffHoursWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN),
            utc_offset_minutes: 0,
        }
    }
}

// ── Coordinator configuration ───────────────────────────────────────

/// Coordinator configuration, re-read at the start of every sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Sliding quiet period that coalesces a burst of messages.
    pub buffer_window: Duration,
    /// Locks held longer than this are force-reclaimed.
    pub lock_stale_threshold: Duration,
    /// Upper bound on one pipeline call. Kept below the stale threshold.
    pub pipeline_timeout: Duration,
    /// Delay between periodic sweeps.
    pub sweep_interval: Duration,
    /// Participants processed in parallel per sweep.
    pub max_concurrent_participants: usize,
    /// Handoff without a human reply for this long reactivates automation.
    pub agent_response_timeout: Duration,
    pub off_hours: OffHoursWindow,
    /// Handoffs older than this are finalized regardless of traffic.
    pub agent_inactivity_timeout: Duration,
    /// Unanswered handoffs idle for this long are marked lost.
    pub stale_handoff_threshold: Duration,
    /// Conversations idle for this long are closed.
    pub client_inactivity_timeout: Duration,
    /// Delay between timeout sweeps.
    pub timeout_sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            buffer_window: Duration::from_secs(5),
            lock_stale_threshold: Duration::from_secs(300), // 5 minutes
            pipeline_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(2),
            max_concurrent_participants: 8,
            agent_response_timeout: Duration::from_secs(1800), // 30 minutes
            off_hours: OffHoursWindow::default(),
            agent_inactivity_timeout: Duration::from_secs(14_400), // 4 hours
            stale_handoff_threshold: Duration::from_secs(7200),    // 2 hours
            client_inactivity_timeout: Duration::from_secs(86_400), // 24 hours
            timeout_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl CoordinatorConfig {
    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// Resolve configuration from the settings table and process environment.
    pub async fn load(db: &dyn Database) -> Self {
        Self::load_with(db, |name| std::env::var(name).ok()).await
    }

    /// Resolve configuration with an explicit environment lookup.
    pub async fn load_with<F>(db: &dyn Database, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let src = Source { db, env: &env };

        let buffer_window = src
            .duration("buffer_window_secs", "BURSTLINE_BUFFER_WINDOW_SECS", d.buffer_window)
            .await;
        let lock_stale_threshold = src
            .duration("lock_stale_secs", "BURSTLINE_LOCK_STALE_SECS", d.lock_stale_threshold)
            .await;
        let mut pipeline_timeout = src
            .duration(
                "pipeline_timeout_secs",
                "BURSTLINE_PIPELINE_TIMEOUT_SECS",
                d.pipeline_timeout,
            )
            .await;
        if pipeline_timeout >= lock_stale_threshold {
            let clamped = lock_stale_threshold / 2;
            warn!(
                pipeline_timeout_secs = pipeline_timeout.as_secs(),
                lock_stale_secs = lock_stale_threshold.as_secs(),
                "Pipeline timeout must stay below the lock staleness threshold; clamping to {}s",
                clamped.as_secs()
            );
            pipeline_timeout = clamped;
        }

        let max_concurrent_participants = src
            .value(
                "max_concurrent_participants",
                "BURSTLINE_MAX_CONCURRENT",
                d.max_concurrent_participants,
                |n: &usize| *n >= 1,
            )
            .await;

        let off_hours_start = src
            .value(
                "off_hours_start",
                "BURSTLINE_OFF_HOURS_START",
                "22:00".to_string(),
                |s: &String| NaiveTime::parse_from_str(s.trim(), "%H:%M").is_ok(),
            )
            .await;
        let off_hours_end = src
            .value(
                "off_hours_end",
                "BURSTLINE_OFF_HOURS_END",
                "07:00".to_string(),
                |s: &String| NaiveTime::parse_from_str(s.trim(), "%H:%M").is_ok(),
            )
            .await;
        let utc_offset_minutes = src
            .value(
                "utc_offset_minutes",
                "BURSTLINE_UTC_OFFSET_MINUTES",
                0i32,
                |m: &i32| m.abs() < 24 * 60,
            )
            .await;
        let off_hours = OffHoursWindow::parse(&off_hours_start, &off_hours_end, utc_offset_minutes)
            .unwrap_or_else(|e| {
                warn!("{e}; using default off-hours window");
                d.off_hours
            });

        Self {
            buffer_window,
            lock_stale_threshold,
            pipeline_timeout,
            sweep_interval: src
                .duration("sweep_interval_secs", "BURSTLINE_SWEEP_INTERVAL_SECS", d.sweep_interval)
                .await,
            max_concurrent_participants,
            agent_response_timeout: src
                .duration(
                    "agent_response_timeout_secs",
                    "BURSTLINE_AGENT_RESPONSE_TIMEOUT_SECS",
                    d.agent_response_timeout,
                )
                .await,
            off_hours,
            agent_inactivity_timeout: src
                .duration(
                    "agent_inactivity_timeout_secs",
                    "BURSTLINE_AGENT_INACTIVITY_TIMEOUT_SECS",
                    d.agent_inactivity_timeout,
                )
                .await,
            stale_handoff_threshold: src
                .duration(
                    "stale_handoff_secs",
                    "BURSTLINE_STALE_HANDOFF_SECS",
                    d.stale_handoff_threshold,
                )
                .await,
            client_inactivity_timeout: src
                .duration(
                    "client_inactivity_timeout_secs",
                    "BURSTLINE_CLIENT_INACTIVITY_TIMEOUT_SECS",
                    d.client_inactivity_timeout,
                )
                .await,
            timeout_sweep_interval: src
                .duration(
                    "timeout_sweep_interval_secs",
                    "BURSTLINE_TIMEOUT_SWEEP_INTERVAL_SECS",
                    d.timeout_sweep_interval,
                )
                .await,
        }
    }
}

/// Layered lookup over the settings table and an environment function.
struct Source<'a, F> {
    db: &'a dyn Database,
    env: &'a F,
}

impl<F> Source<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    async fn raw(&self, key: &str, env_var: &str) -> Option<(String, String)> {
        match self.db.get_setting(key).await {
            Ok(Some(serde_json::Value::String(s))) => return Some((key.to_string(), s)),
            Ok(Some(serde_json::Value::Number(n))) => return Some((key.to_string(), n.to_string())),
            Ok(Some(serde_json::Value::Null)) | Ok(None) => {}
            Ok(Some(other)) => {
                warn!(key, value = %other, "Ignoring non-scalar setting");
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to read setting; falling back");
            }
        }
        (self.env)(env_var).map(|v| (env_var.to_string(), v))
    }

    async fn value<T>(&self, key: &str, env_var: &str, default: T, valid: impl Fn(&T) -> bool) -> T
    where
        T: FromStr,
    {
        let Some((source, raw)) = self.raw(key, env_var).await else {
            return default;
        };
        match raw.trim().parse::<T>() {
            Ok(v) if valid(&v) => v,
            _ => {
                let err = ConfigError::InvalidValue {
                    key: source,
                    message: format!("'{raw}' rejected"),
                };
                warn!("{err}; using default");
                default
            }
        }
    }

    async fn duration(&self, key: &str, env_var: &str, default: Duration) -> Duration {
        let secs = self
            .value(key, env_var, default.as_secs(), |s: &u64| {
                *s > 0 && *s <= MAX_DURATION_SECS
            })
            .await;
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use super::*;
    use crate::store::LibSqlBackend;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[tokio::test]
    async fn defaults_when_nothing_configured() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let config = CoordinatorConfig::load_with(&db, no_env).await;
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.buffer_window, Duration::from_secs(5));
        assert_eq!(config.lock_stale_threshold, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn settings_table_beats_env() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.set_setting("buffer_window_secs", &serde_json::json!(9))
            .await
            .unwrap();
        let env: HashMap<&str, &str> = [
            ("BURSTLINE_BUFFER_WINDOW_SECS", "20"),
            ("BURSTLINE_MAX_CONCURRENT", "3"),
        ]
        .into();

        let config =
            CoordinatorConfig::load_with(&db, |k| env.get(k).map(|v| v.to_string())).await;
        assert_eq!(config.buffer_window, Duration::from_secs(9));
        assert_eq!(config.max_concurrent_participants, 3);
    }

    #[tokio::test]
    async fn string_settings_are_accepted() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.set_setting("lock_stale_secs", &serde_json::json!("600"))
            .await
            .unwrap();
        db.set_setting("off_hours_start", &serde_json::json!("21:30"))
            .await
            .unwrap();

        let config = CoordinatorConfig::load_with(&db, no_env).await;
        assert_eq!(config.lock_stale_threshold, Duration::from_secs(600));
        assert_eq!(config.off_hours.start, NaiveTime::from_hms_opt(21, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn invalid_values_fall_back_to_defaults() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.set_setting("buffer_window_secs", &serde_json::json!("soon"))
            .await
            .unwrap();
        db.set_setting("max_concurrent_participants", &serde_json::json!(0))
            .await
            .unwrap();
        db.set_setting("off_hours_end", &serde_json::json!("25:99"))
            .await
            .unwrap();
        db.set_setting("sweep_interval_secs", &serde_json::json!({"secs": 3}))
            .await
            .unwrap();

        let config = CoordinatorConfig::load_with(&db, no_env).await;
        assert_eq!(config, CoordinatorConfig::default());
    }

    #[tokio::test]
    async fn pipeline_timeout_is_clamped_below_stale_threshold() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.set_setting("lock_stale_secs", &serde_json::json!(60))
            .await
            .unwrap();

        let config = CoordinatorConfig::load_with(&db, no_env).await;
        assert!(config.pipeline_timeout < config.lock_stale_threshold);
        assert_eq!(config.pipeline_timeout, Duration::from_secs(30));
    }

    #[test]
    fn off_hours_wraps_midnight() {
        let window = OffHoursWindow::default();
        let at = |h, m| Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap();

        assert!(window.contains(at(23, 30)));
        assert!(window.contains(at(22, 0)));
        assert!(window.contains(at(3, 0)));
        assert!(!window.contains(at(7, 0)));
        assert!(!window.contains(at(12, 0)));
        assert!(!window.contains(at(21, 59)));
    }

    #[test]
    fn off_hours_same_day_window() {
        let window = OffHoursWindow::parse("12:00", "13:00", 0).unwrap();
        let at = |h, m| Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap();
        assert!(window.contains(at(12, 30)));
        assert!(!window.contains(at(13, 0)));
        assert!(!window.contains(at(23, 30)));
    }

    #[test]
    fn off_hours_respects_utc_offset() {
        // UTC-3: 02:30 UTC is 23:30 local
        let window = OffHoursWindow::parse("22:00", "07:00", -180).unwrap();
        assert!(window.contains(Utc.with_ymd_and_hms(2026, 3, 2, 2, 30, 0).unwrap()));
        // 12:00 UTC is 09:00 local
        assert!(!window.contains(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()));
    }

    #[test]
    fn off_hours_equal_bounds_disable_window() {
        let window = OffHoursWindow::parse("00:00", "00:00", 0).unwrap();
        assert!(!window.contains(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap()));
    }

    #[test]
    fn off_hours_rejects_bad_input() {
        assert!(OffHoursWindow::parse("10pm", "07:00", 0).is_err());
        assert!(OffHoursWindow::parse("22:00", "07:00", 1440).is_err());
    }
}

//! Reactivation rules evaluated on inbound traffic, and the timeout rules
//! applied by the periodic timeout sweep.

use chrono::{DateTime, Utc};

use super::state::ReactivationReason;
use crate::config::{CoordinatorConfig, to_chrono};
use crate::store::model::{Conversation, ConversationStatus};

/// Decide whether an active handoff should go back to automation.
///
/// `agent_replied` is whether any human-agent message exists since the
/// handoff started. Either condition is sufficient; off-hours wins when both
/// hold since it is unconditional.
pub fn evaluate_reactivation(
    conversation: &Conversation,
    agent_replied: bool,
    config: &CoordinatorConfig,
    now: DateTime<Utc>,
) -> Option<ReactivationReason> {
    if !conversation.handoff_active {
        return None;
    }
    if config.off_hours.contains(now) {
        return Some(ReactivationReason::OffHours);
    }
    let started = conversation.handoff_started_at?;
    if !agent_replied && now - started > to_chrono(config.agent_response_timeout) {
        return Some(ReactivationReason::AgentInactivity);
    }
    None
}

/// Which timeout rule applies to a handoff conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// No activity at all past the client-inactivity timeout.
    ClientInactive(ConversationStatus),
    /// Idle and never answered by a human.
    StaleHandoff,
    /// Handoff held past the agent-inactivity timeout.
    AgentInactive,
}

impl TimeoutAction {
    /// Status written when the rule fires.
    pub fn resulting_status(&self) -> ConversationStatus {
        match self {
            Self::ClientInactive(status) => *status,
            Self::StaleHandoff => ConversationStatus::Lost,
            Self::AgentInactive => ConversationStatus::Finalized,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ClientInactive(_) => "client_inactivity",
            Self::StaleHandoff => "stale_handoff",
            Self::AgentInactive => "agent_inactivity",
        }
    }
}

/// First matching timeout rule, in priority order: client inactivity, stale
/// handoff, agent inactivity.
pub fn evaluate_timeout(
    conversation: &Conversation,
    agent_replied: bool,
    config: &CoordinatorConfig,
    now: DateTime<Utc>,
) -> Option<TimeoutAction> {
    if !conversation.handoff_active {
        return None;
    }
    let started = conversation.handoff_started_at?;
    let idle = now - conversation.last_activity_at;

    if idle > to_chrono(config.client_inactivity_timeout) {
        let status = if agent_replied {
            ConversationStatus::Finalized
        } else {
            ConversationStatus::Lost
        };
        return Some(TimeoutAction::ClientInactive(status));
    }
    if !agent_replied && idle > to_chrono(config.stale_handoff_threshold) {
        return Some(TimeoutAction::StaleHandoff);
    }
    if now - started > to_chrono(config.agent_inactivity_timeout) {
        return Some(TimeoutAction::AgentInactive);
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    use super::*;
    use crate::config::OffHoursWindow;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn handoff(started: DateTime<Utc>, last_activity: DateTime<Utc>) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            participant_id: "p1".into(),
            handoff_active: true,
            handoff_started_at: Some(started),
            status: ConversationStatus::AwaitingAgent,
            last_activity_at: last_activity,
            created_at: started,
        }
    }

    #[test]
    fn agent_timeout_reactivates_without_human_reply() {
        let config = CoordinatorConfig::default();
        let conv = handoff(noon() - Duration::minutes(31), noon());
        assert_eq!(
            evaluate_reactivation(&conv, false, &config, noon()),
            Some(ReactivationReason::AgentInactivity)
        );
        assert_eq!(evaluate_reactivation(&conv, true, &config, noon()), None);
    }

    #[test]
    fn within_timeout_stays_in_handoff() {
        let config = CoordinatorConfig::default();
        let conv = handoff(noon() - Duration::minutes(29), noon());
        assert_eq!(evaluate_reactivation(&conv, false, &config, noon()), None);
    }

    #[test]
    fn off_hours_reactivates_unconditionally() {
        let config = CoordinatorConfig::default();
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap();
        let conv = handoff(late - Duration::minutes(1), late);
        assert_eq!(
            evaluate_reactivation(&conv, true, &config, late),
            Some(ReactivationReason::OffHours)
        );
    }

    #[test]
    fn disabled_off_hours_window_never_matches() {
        let config = CoordinatorConfig {
            off_hours: OffHoursWindow::parse("00:00", "00:00", 0).unwrap(),
            ..Default::default()
        };
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap();
        let conv = handoff(late - Duration::minutes(1), late);
        assert_eq!(evaluate_reactivation(&conv, false, &config, late), None);
    }

    #[test]
    fn automated_conversation_is_ignored() {
        let config = CoordinatorConfig::default();
        let mut conv = handoff(noon() - Duration::hours(10), noon());
        conv.handoff_active = false;
        conv.handoff_started_at = None;
        assert_eq!(evaluate_reactivation(&conv, false, &config, noon()), None);
        assert_eq!(evaluate_timeout(&conv, false, &config, noon()), None);
    }

    #[test]
    fn client_inactivity_takes_priority() {
        let config = CoordinatorConfig::default();
        let conv = handoff(noon() - Duration::hours(30), noon() - Duration::hours(25));

        let lost = evaluate_timeout(&conv, false, &config, noon()).unwrap();
        assert_eq!(lost, TimeoutAction::ClientInactive(ConversationStatus::Lost));

        let finalized = evaluate_timeout(&conv, true, &config, noon()).unwrap();
        assert_eq!(finalized.resulting_status(), ConversationStatus::Finalized);
    }

    #[test]
    fn stale_handoff_requires_no_human_reply() {
        let config = CoordinatorConfig::default();
        let conv = handoff(noon() - Duration::hours(3), noon() - Duration::hours(3));

        assert_eq!(
            evaluate_timeout(&conv, false, &config, noon()),
            Some(TimeoutAction::StaleHandoff)
        );
        assert_eq!(evaluate_timeout(&conv, true, &config, noon()), None);
    }

    #[test]
    fn agent_inactivity_ignores_recent_customer_traffic() {
        let config = CoordinatorConfig::default();
        let conv = handoff(noon() - Duration::hours(5), noon() - Duration::minutes(1));
        let action = evaluate_timeout(&conv, true, &config, noon()).unwrap();
        assert_eq!(action, TimeoutAction::AgentInactive);
        assert_eq!(action.resulting_status(), ConversationStatus::Finalized);
    }

    #[test]
    fn fresh_handoff_has_no_timeout() {
        let config = CoordinatorConfig::default();
        let conv = handoff(noon() - Duration::minutes(10), noon());
        assert_eq!(evaluate_timeout(&conv, false, &config, noon()), None);
    }
}

//! Handoff state machine.

use serde::{Deserialize, Serialize};

use crate::store::model::Conversation;

/// Whether automated replies are currently allowed for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    /// The pipeline answers the participant.
    Automated,
    /// A human operator owns the conversation; automated replies are suppressed.
    HandoffActive,
}

impl HandoffState {
    /// Current state of a stored conversation.
    pub fn of(conversation: &Conversation) -> Self {
        if conversation.handoff_active {
            Self::HandoffActive
        } else {
            Self::Automated
        }
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: HandoffState) -> bool {
        use HandoffState::*;

        matches!((self, target), (Automated, HandoffActive) | (HandoffActive, Automated))
    }

    pub fn suppresses_replies(&self) -> bool {
        matches!(self, Self::HandoffActive)
    }
}

impl std::fmt::Display for HandoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Automated => "automated",
            Self::HandoffActive => "handoff_active",
        };
        write!(f, "{s}")
    }
}

/// Why a handoff was handed back to automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationReason {
    /// No human reply within the agent-response timeout.
    AgentInactivity,
    /// The message arrived inside the configured off-hours window.
    OffHours,
}

impl std::fmt::Display for ReactivationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AgentInactivity => "agent_inactivity",
            Self::OffHours => "off_hours",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_flips_between_the_two_states() {
        use HandoffState::*;
        assert!(Automated.can_transition_to(HandoffActive));
        assert!(HandoffActive.can_transition_to(Automated));
        assert!(!Automated.can_transition_to(Automated));
        assert!(!HandoffActive.can_transition_to(HandoffActive));
    }

    #[test]
    fn display_strings() {
        assert_eq!(HandoffState::HandoffActive.to_string(), "handoff_active");
        assert_eq!(ReactivationReason::OffHours.to_string(), "off_hours");
    }
}

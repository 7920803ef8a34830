//! Persisted row types: buffer entries, inbound messages, conversations, alerts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Messages ────────────────────────────────────────────────────────

/// Who authored an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The external participant.
    Customer,
    /// A reply produced by the automated pipeline.
    AutomatedAgent,
    /// A reply written by a human operator.
    HumanAgent,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::AutomatedAgent => "automated_agent",
            Self::HumanAgent => "human_agent",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "automated_agent" => Ok(Self::AutomatedAgent),
            "human_agent" => Ok(Self::HumanAgent),
            other => Err(format!("unknown sender role: '{other}'")),
        }
    }
}

/// A persisted inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub participant_id: String,
    pub conversation_id: Uuid,
    pub sender_role: SenderRole,
    pub body: String,
    /// Channel-native id used for dedup. Unique when present.
    pub external_id: Option<String>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a new message.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub participant_id: &'a str,
    pub conversation_id: Uuid,
    pub sender_role: SenderRole,
    pub body: &'a str,
    pub external_id: Option<&'a str>,
    /// Agent-authored messages are stored already processed.
    pub processed: bool,
}

// ── Buffer ──────────────────────────────────────────────────────────

/// Per-participant buffer row. At most one exists per participant.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    pub participant_id: String,
    pub last_activity_at: DateTime<Utc>,
    pub window_expires_at: DateTime<Utc>,
    pub in_progress: bool,
    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Fencing counter, bumped on every successful acquire.
    pub generation: i64,
}

/// Proof of a successful `acquire`. Completion and release are keyed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub participant_id: String,
    pub token: String,
    pub generation: i64,
    pub acquired_at: DateTime<Utc>,
    pub retry_count: u32,
}

// ── Conversations ───────────────────────────────────────────────────

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    AwaitingAgent,
    Finalized,
    Lost,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::AwaitingAgent => "awaiting_agent",
            Self::Finalized => "finalized",
            Self::Lost => "lost",
        }
    }

    /// Finalized and lost conversations are never reopened.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Finalized | Self::Lost)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "awaiting_agent" => Ok(Self::AwaitingAgent),
            "finalized" => Ok(Self::Finalized),
            "lost" => Ok(Self::Lost),
            other => Err(format!("unknown conversation status: '{other}'")),
        }
    }
}

/// A participant's conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_id: String,
    pub handoff_active: bool,
    pub handoff_started_at: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Alerts ──────────────────────────────────────────────────────────

/// Kind of operator alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    ProcessingFailed,
    StuckLockReclaimed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessingFailed => "processing-failed",
            Self::StuckLockReclaimed => "stuck-lock-reclaimed",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing-failed" => Ok(Self::ProcessingFailed),
            "stuck-lock-reclaimed" => Ok(Self::StuckLockReclaimed),
            other => Err(format!("unknown alert kind: '{other}'")),
        }
    }
}

/// Append-only operator alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub participant_id: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

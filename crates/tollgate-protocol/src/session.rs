//! Session lifecycle types.

use crate::ids::{PolicySetId, SessionId};
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
    Errored,
}

/// Why a session loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    UserExit,
    FatalError { error: String },
    MaxTurns,
}

impl TerminationReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalError { .. })
    }

    /// Status the session is left in after terminating for this reason.
    pub fn final_status(&self) -> SessionStatus {
        if self.is_fatal() {
            SessionStatus::Errored
        } else {
            SessionStatus::Ended
        }
    }
}

/// Read-only view of a session handed to inspecting callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub active_policy_set_id: PolicySetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
}

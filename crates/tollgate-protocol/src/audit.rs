//! Audit events emitted once per evaluated tool call.

use crate::ids::{PolicySetId, SessionId};
use crate::message::{ToolCall, ToolOutcome};
use crate::policy::PolicyVerdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the gate reports for one evaluate/execute pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub session_id: SessionId,
    pub call: ToolCall,
    pub verdict: PolicyVerdict,
    pub outcome: ToolOutcome,
    pub latency_ms: u64,
    pub policy_set_id: PolicySetId,
    pub recorded_at: DateTime<Utc>,
}

/// An audit event after it has been assigned its queue sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: AuditEvent,
}

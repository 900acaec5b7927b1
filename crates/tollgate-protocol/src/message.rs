//! Conversation types: messages, tool calls, and tool results.

use std::collections::BTreeSet;

use crate::ids::{MessageId, ToolCallId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation proposed by the model.
///
/// `provenance` holds the ids of earlier messages whose content fed into the
/// arguments. It is forwarded verbatim to the policy-decision collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub provenance: BTreeSet<MessageId>,
}

impl ToolCall {
    pub fn new(
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        provenance: impl IntoIterator<Item = MessageId>,
    ) -> Self {
        Self {
            id: ToolCallId::default(),
            tool_name: tool_name.into(),
            arguments,
            provenance: provenance.into_iter().collect(),
        }
    }

    /// Whether two calls draw on at least one common upstream message.
    pub fn shares_provenance_with(&self, other: &ToolCall) -> bool {
        self.provenance
            .iter()
            .any(|id| other.provenance.contains(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Denied,
    Error,
    EscalationTimeout,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
            Self::EscalationTimeout => "escalation_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: ToolCallId,
    pub outcome: ToolOutcome,
    pub payload: String,
}

impl ToolResult {
    pub fn success(call_id: ToolCallId, payload: impl Into<String>) -> Self {
        Self {
            call_id,
            outcome: ToolOutcome::Success,
            payload: payload.into(),
        }
    }

    pub fn error(call_id: ToolCallId, payload: impl Into<String>) -> Self {
        Self {
            call_id,
            outcome: ToolOutcome::Error,
            payload: payload.into(),
        }
    }

    pub fn escalation_timeout(call_id: ToolCallId, payload: impl Into<String>) -> Self {
        Self {
            call_id,
            outcome: ToolOutcome::EscalationTimeout,
            payload: payload.into(),
        }
    }
}

/// One entry of a session's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::default(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_result: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// A tool message carries the result as its content so the model sees the
    /// payload (or refusal reason) as ordinary tool output.
    pub fn tool(result: ToolResult) -> Self {
        Self {
            tool_result: Some(result.clone()),
            ..Self::with_role(Role::Tool, result.payload)
        }
    }
}

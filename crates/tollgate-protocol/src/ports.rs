//! Collaborator ports for tollgate integrations.
//!
//! These traits are the only boundary between the orchestration layer and the
//! systems it coordinates: the policy-decision engine, tool transports, the
//! model provider, escalation handlers, and the enterprise policy server.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Implementations must be `Send + Sync`; the runtime shares them behind `Arc`.

use crate::audit::AuditRecord;
use crate::error::{KernelError, KernelResult};
use crate::ids::{AgentId, MessageId, PolicySetId, SessionId, ToolCallId};
use crate::message::{Message, ToolCall};
use crate::policy::{PolicySet, PolicyVerdict, RiskLevel, ToolMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything the policy-decision collaborator is told about one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecisionRequest {
    pub session_id: SessionId,
    pub call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub risk: RiskLevel,
    pub category: String,
    pub provenance_ids: Vec<MessageId>,
    pub active_policy_set_id: PolicySetId,
    pub active_policy_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationOutput {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCompletionRequest {
    pub session_id: SessionId,
    pub turn: u32,
    pub context: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

/// A tool call as proposed by the model, before the session assigns identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Adapter-supplied provenance. `None` means the session applies its
    /// default window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Vec<MessageId>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCompletion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ProposedToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub session_id: SessionId,
    pub call: ToolCall,
    pub metadata: ToolMetadata,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEnrollment {
    pub token: String,
    pub policy_set: PolicySet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAck {
    pub accepted: usize,
}

#[async_trait]
pub trait PolicyDecisionPort: Send + Sync {
    async fn evaluate(&self, request: PolicyDecisionRequest) -> KernelResult<PolicyVerdict>;
}

#[async_trait]
pub trait ToolTransportPort: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    async fn list_tools(&self) -> KernelResult<Vec<ToolDescriptor>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> KernelResult<ToolInvocationOutput>;
}

#[async_trait]
pub trait ModelProviderPort: Send + Sync {
    async fn complete(&self, request: ModelCompletionRequest) -> KernelResult<ModelCompletion>;

    /// Condense an evicted history prefix. Providers that cannot summarize
    /// leave the default, which makes the context window fall back to
    /// truncation.
    async fn summarize(&self, _messages: &[Message]) -> KernelResult<String> {
        Err(KernelError::ModelProvider(
            "summarization not supported".to_owned(),
        ))
    }
}

#[async_trait]
pub trait EscalationHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, request: &EscalationRequest) -> KernelResult<EscalationDecision>;
}

#[async_trait]
pub trait PolicyServerPort: Send + Sync {
    async fn enroll(&self, agent_id: &AgentId, tags: &[String])
    -> KernelResult<PolicyEnrollment>;

    async fn pull(&self, token: &str, tags: &[String]) -> KernelResult<PolicySet>;

    async fn push(&self, token: &str, events: &[AuditRecord]) -> KernelResult<PushAck>;
}

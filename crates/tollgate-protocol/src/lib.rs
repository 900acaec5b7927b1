//! # tollgate-protocol: shared contract for the tollgate agent runtime
//!
//! This crate defines the types and trait interfaces that every tollgate crate
//! depends on. It carries no runtime dependencies (no tokio, no HTTP client) so
//! it can be used as a pure contract crate by collaborator implementations.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId, MessageId, ToolCallId, PolicySetId, ...)
//! - [`message`]: Message, ToolCall, ToolResult, ToolOutcome
//! - [`policy`]: RiskLevel, ToolMetadata, PolicyVerdict, PolicySet
//! - [`audit`]: AuditEvent, AuditRecord
//! - [`session`]: SessionStatus, TerminationReason, SessionSnapshot
//! - [`ports`]: Collaborator ports (policy decisions, tools, model, escalation, policy server)
//! - [`error`]: KernelError, KernelResult

pub mod audit;
pub mod error;
pub mod ids;
pub mod message;
pub mod policy;
pub mod ports;
pub mod session;

// Re-export the most commonly used types at the crate root.
pub use audit::{AuditEvent, AuditRecord};
pub use error::{KernelError, KernelResult};
pub use ids::{AgentId, ApprovalId, MessageId, PolicySetId, SessionId, ToolCallId};
pub use message::{Message, Role, ToolCall, ToolOutcome, ToolResult};
pub use policy::{PolicySet, PolicyVerdict, RiskLevel, ToolMetadata};
pub use ports::{
    EscalationDecision, EscalationHandler, EscalationRequest, ModelCompletion,
    ModelCompletionRequest, ModelProviderPort, PolicyDecisionPort, PolicyDecisionRequest,
    PolicyEnrollment, PolicyServerPort, ProposedToolCall, PushAck, ToolDescriptor,
    ToolInvocationOutput, ToolTransportPort,
};
pub use session::{SessionSnapshot, SessionStatus, TerminationReason};

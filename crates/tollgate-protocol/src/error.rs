//! Error types shared by the tollgate crates and their collaborators.

use thiserror::Error;

/// Errors that can occur while orchestrating a session.
///
/// Tool execution failures and policy refusals are normally converted into
/// conversational content before they reach this type; the variants below are
/// what collaborators and invariants report to the orchestration layer.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("policy engine unavailable: {0}")]
    PolicyEngineUnavailable(String),
    #[error("tool execution failed: {0}")]
    ToolExecution(String),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("escalation timed out after {0} ms")]
    EscalationTimeout(u64),
    #[error("model provider error: {0}")]
    ModelProvider(String),
    #[error("enterprise sync error: {0}")]
    EnterpriseSync(String),
    #[error("invalid provenance: {0}")]
    InvalidProvenance(String),
    #[error("duplicate tool result for call {0}")]
    DuplicateToolResult(String),
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(String),
}

impl KernelError {
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for KernelError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Convenience result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

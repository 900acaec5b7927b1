//! Escalation dispatcher.
//!
//! Routes `escalate` verdicts to a pluggable [`EscalationHandler`] and owns
//! the timeout, so a handler that never answers blocks one tool call for a
//! bounded time and nothing else.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tollgate_protocol::{EscalationDecision, EscalationHandler, EscalationRequest};
use tracing::{info, instrument, warn};

mod console;
mod handlers;
mod queue;

pub use console::Console;
pub use handlers::{AutoDenyHandler, TerminalHandler};
pub use queue::{ApprovalQueue, ApprovalResolution, ApprovalTicket, QueueHandler};

pub const DEFAULT_ESCALATION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    Approved,
    Denied,
    TimedOut { after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    #[default]
    Terminal,
    AutoDeny,
    Queue,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::AutoDeny => "auto_deny",
            Self::Queue => "queue",
        }
    }

    pub fn build(&self, console: &Console, approvals: &ApprovalQueue) -> Arc<dyn EscalationHandler> {
        match self {
            Self::Terminal => Arc::new(TerminalHandler::new(console.clone())),
            Self::AutoDeny => Arc::new(AutoDenyHandler),
            Self::Queue => Arc::new(QueueHandler::new(approvals.clone())),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "terminal" => Ok(Self::Terminal),
            "auto_deny" => Ok(Self::AutoDeny),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown escalation handler: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct EscalationDispatcher {
    handler: Arc<dyn EscalationHandler>,
    timeout: Duration,
}

impl EscalationDispatcher {
    pub fn new(handler: Arc<dyn EscalationHandler>, timeout: Duration) -> Self {
        Self { handler, timeout }
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handler errors count as a denial.
    #[instrument(
        skip(self, request),
        fields(
            handler = self.handler.name(),
            call_id = %request.call.id,
            tool = %request.call.tool_name,
            timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
        )
    )]
    pub async fn dispatch(&self, request: &EscalationRequest) -> EscalationOutcome {
        match timeout(self.timeout, self.handler.decide(request)).await {
            Ok(Ok(EscalationDecision::Allow)) => {
                info!("escalation approved");
                EscalationOutcome::Approved
            }
            Ok(Ok(EscalationDecision::Deny)) => {
                info!("escalation denied");
                EscalationOutcome::Denied
            }
            Ok(Err(error)) => {
                warn!(%error, "escalation handler failed, treating as deny");
                EscalationOutcome::Denied
            }
            Err(_) => {
                warn!("escalation handler did not answer in time");
                EscalationOutcome::TimedOut {
                    after: self.timeout,
                }
            }
        }
    }
}

impl fmt::Debug for EscalationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationDispatcher")
            .field("handler", &self.handler.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tollgate_protocol::{
        KernelError, KernelResult, RiskLevel, SessionId, ToolCall, ToolMetadata,
    };

    use super::*;

    struct BrokenHandler;

    #[async_trait]
    impl EscalationHandler for BrokenHandler {
        fn name(&self) -> &str {
            "broken"
        }

        async fn decide(&self, _request: &EscalationRequest) -> KernelResult<EscalationDecision> {
            Err(KernelError::Io("reviewer channel closed".into()))
        }
    }

    struct ApproveAll;

    #[async_trait]
    impl EscalationHandler for ApproveAll {
        fn name(&self) -> &str {
            "approve_all"
        }

        async fn decide(&self, _request: &EscalationRequest) -> KernelResult<EscalationDecision> {
            Ok(EscalationDecision::Allow)
        }
    }

    fn request() -> EscalationRequest {
        EscalationRequest {
            session_id: SessionId::from_string("s1"),
            call: ToolCall::new("http_fetch", json!({"url": "https://example.com"}), []),
            metadata: ToolMetadata::new("http_fetch", RiskLevel::High, "network"),
            prompt: "confirm".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_reviewer_times_out_after_thirty_seconds() {
        let approvals = ApprovalQueue::default();
        let dispatcher = EscalationDispatcher::new(
            HandlerKind::Queue.build(&Console::new(tokio::io::empty(), tokio::io::sink()), &approvals),
            Duration::from_secs(30),
        );

        let started = tokio::time::Instant::now();
        let outcome = dispatcher.dispatch(&request()).await;

        assert_eq!(
            outcome,
            EscalationOutcome::TimedOut {
                after: Duration::from_secs(30)
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(approvals.pending().is_empty());
    }

    #[tokio::test]
    async fn handler_errors_deny() {
        let dispatcher = EscalationDispatcher::new(Arc::new(BrokenHandler), Duration::from_secs(1));
        assert_eq!(dispatcher.dispatch(&request()).await, EscalationOutcome::Denied);
    }

    #[tokio::test]
    async fn approvals_and_auto_deny() {
        let approve = EscalationDispatcher::new(Arc::new(ApproveAll), Duration::from_secs(1));
        assert_eq!(approve.dispatch(&request()).await, EscalationOutcome::Approved);

        let deny = EscalationDispatcher::new(Arc::new(AutoDenyHandler), Duration::from_secs(1));
        assert_eq!(deny.handler_name(), "auto_deny");
        assert_eq!(deny.dispatch(&request()).await, EscalationOutcome::Denied);
    }

    #[test]
    fn handler_kind_parses_config_names() {
        assert_eq!("auto_deny".parse::<HandlerKind>(), Ok(HandlerKind::AutoDeny));
        assert_eq!("queue".parse::<HandlerKind>(), Ok(HandlerKind::Queue));
        assert!("email".parse::<HandlerKind>().is_err());
        assert_eq!(HandlerKind::default(), HandlerKind::Terminal);
    }
}

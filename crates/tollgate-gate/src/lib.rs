//! Tool invocation gate.
//!
//! Every proposed tool call is evaluated by the policy-decision collaborator
//! before it may run. The gate hands back a ticket whose type says what the
//! caller is allowed to do next: only an [`AllowedCall`] can be executed, and
//! an [`EscalatedCall`] becomes one only through [`EscalatedCall::approve`].
//! Each ticket produces exactly one audit event when it is consumed (or
//! dropped).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::{Instant, timeout};
use tollgate_audit::AuditQueue;
use tollgate_protocol::{
    AuditEvent, KernelError, PolicyDecisionPort, PolicyDecisionRequest, PolicySet, PolicySetId,
    PolicyVerdict, SessionId, ToolCall, ToolMetadata, ToolOutcome, ToolResult,
};
use tollgate_tools::ToolHandle;
use tracing::{debug, info, instrument, warn};

mod http;

pub use http::HttpPolicyDecisionClient;

/// The enterprise policy set currently consulted by the gate.
///
/// Readers clone the inner `Arc` and keep evaluating against that snapshot;
/// a swap replaces the pointer, so no reader ever sees a partially installed
/// set. Only the enterprise sync agent writes.
#[derive(Debug, Clone)]
pub struct ActivePolicy {
    current: Arc<RwLock<Arc<PolicySet>>>,
}

impl ActivePolicy {
    pub fn new(initial: PolicySet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn current(&self) -> Arc<PolicySet> {
        self.current.read().clone()
    }

    pub fn id(&self) -> PolicySetId {
        self.current.read().id.clone()
    }

    /// Install `next` and return the set it replaced.
    pub fn swap(&self, next: PolicySet) -> Arc<PolicySet> {
        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.current.write(), next.clone());
        info!(
            previous = %previous.id,
            previous_version = previous.version,
            current = %next.id,
            current_version = next.version,
            "active policy set swapped"
        );
        previous
    }
}

impl Default for ActivePolicy {
    fn default() -> Self {
        Self::new(PolicySet::builtin())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub evaluate_timeout: Duration,
    pub execute_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            evaluate_timeout: Duration::from_secs(2),
            execute_timeout: Duration::from_secs(60),
        }
    }
}

struct CallTicket {
    session_id: SessionId,
    call: ToolCall,
    metadata: ToolMetadata,
    verdict: PolicyVerdict,
    policy_set_id: PolicySetId,
    started: Instant,
    audit: AuditQueue,
    recorded: bool,
}

impl CallTicket {
    fn record(&mut self, outcome: ToolOutcome) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let latency_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let sequence = self.audit.push(AuditEvent {
            session_id: self.session_id.clone(),
            call: self.call.clone(),
            verdict: self.verdict.clone(),
            outcome,
            latency_ms,
            policy_set_id: self.policy_set_id.clone(),
            recorded_at: Utc::now(),
        });
        debug!(
            sequence,
            call_id = %self.call.id,
            outcome = outcome.as_str(),
            latency_ms,
            "audit event queued"
        );
    }
}

impl Drop for CallTicket {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        // Cancelled sessions drop tickets mid-flight; they still get audited.
        let outcome = match self.verdict {
            PolicyVerdict::Deny { .. } => ToolOutcome::Denied,
            _ => ToolOutcome::Error,
        };
        debug!(call_id = %self.call.id, "call ticket abandoned before completion");
        self.record(outcome);
    }
}

/// A call the policy engine (or a human reviewer) allowed.
pub struct AllowedCall(CallTicket);

impl AllowedCall {
    pub fn call(&self) -> &ToolCall {
        &self.0.call
    }

    pub fn metadata(&self) -> &ToolMetadata {
        &self.0.metadata
    }
}

pub struct DeniedCall {
    ticket: CallTicket,
    reason: String,
}

impl DeniedCall {
    pub fn call(&self) -> &ToolCall {
        &self.ticket.call
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A call waiting on a human decision.
pub struct EscalatedCall {
    ticket: CallTicket,
    prompt: String,
}

impl EscalatedCall {
    pub fn call(&self) -> &ToolCall {
        &self.ticket.call
    }

    pub fn metadata(&self) -> &ToolMetadata {
        &self.ticket.metadata
    }

    pub fn session_id(&self) -> &SessionId {
        &self.ticket.session_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn approve(self) -> AllowedCall {
        debug!(call_id = %self.ticket.call.id, "escalation approved");
        AllowedCall(self.ticket)
    }
}

/// Why an escalated call is not going to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationRefusal {
    Denied,
    TimedOut { after: Duration },
}

pub enum GateDecision {
    Allow(AllowedCall),
    Deny(DeniedCall),
    Escalate(EscalatedCall),
}

impl GateDecision {
    pub fn verdict_kind(&self) -> &'static str {
        match self {
            Self::Allow(_) => "allow",
            Self::Deny(_) => "deny",
            Self::Escalate(_) => "escalate",
        }
    }
}

#[derive(Clone)]
pub struct ToolInvocationGate {
    decisions: Arc<dyn PolicyDecisionPort>,
    active_policy: ActivePolicy,
    audit: AuditQueue,
    config: GateConfig,
}

impl ToolInvocationGate {
    pub fn new(
        decisions: Arc<dyn PolicyDecisionPort>,
        active_policy: ActivePolicy,
        audit: AuditQueue,
        config: GateConfig,
    ) -> Self {
        Self {
            decisions,
            active_policy,
            audit,
            config,
        }
    }

    pub fn active_policy(&self) -> &ActivePolicy {
        &self.active_policy
    }

    pub fn audit(&self) -> &AuditQueue {
        &self.audit
    }

    /// Ask the policy-decision collaborator about one call.
    ///
    /// Transport errors, malformed answers and timeouts all fail closed with
    /// `deny("policy_engine_unavailable")`.
    #[instrument(
        skip(self, call, metadata),
        fields(
            session_id = %session_id,
            call_id = %call.id,
            tool = %call.tool_name,
            risk = %metadata.risk,
            provenance = call.provenance.len()
        )
    )]
    pub async fn evaluate(
        &self,
        session_id: &SessionId,
        call: ToolCall,
        metadata: ToolMetadata,
    ) -> GateDecision {
        let started = Instant::now();
        let policy = self.active_policy.current();
        let request = PolicyDecisionRequest {
            session_id: session_id.clone(),
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            risk: metadata.risk,
            category: metadata.category.clone(),
            provenance_ids: call.provenance.iter().cloned().collect(),
            active_policy_set_id: policy.id.clone(),
            active_policy_version: policy.version,
        };

        let verdict = match timeout(self.config.evaluate_timeout, self.decisions.evaluate(request))
            .await
        {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(error)) => {
                warn!(%error, "policy engine unavailable, failing closed");
                PolicyVerdict::engine_unavailable()
            }
            Err(_) => {
                let error = KernelError::timeout("policy evaluation", self.config.evaluate_timeout);
                warn!(%error, "policy engine unavailable, failing closed");
                PolicyVerdict::engine_unavailable()
            }
        };
        debug!(verdict = verdict.kind(), "policy verdict received");

        let decided = verdict.clone();
        let ticket = CallTicket {
            session_id: session_id.clone(),
            call,
            metadata,
            verdict,
            policy_set_id: policy.id.clone(),
            started,
            audit: self.audit.clone(),
            recorded: false,
        };
        match decided {
            PolicyVerdict::Allow => GateDecision::Allow(AllowedCall(ticket)),
            PolicyVerdict::Deny { reason } => GateDecision::Deny(DeniedCall { ticket, reason }),
            PolicyVerdict::Escalate { prompt } => {
                GateDecision::Escalate(EscalatedCall { ticket, prompt })
            }
        }
    }

    /// Run an allowed call. `handle` is `None` when the model named a tool no
    /// transport offers.
    #[instrument(
        skip(self, allowed, handle),
        fields(call_id = %allowed.call().id, tool = %allowed.call().tool_name)
    )]
    pub async fn execute(&self, mut allowed: AllowedCall, handle: Option<&ToolHandle>) -> ToolResult {
        let call_id = allowed.0.call.id.clone();
        let Some(handle) = handle else {
            warn!("allowed call names an unregistered tool");
            allowed.0.record(ToolOutcome::Error);
            return ToolResult::error(call_id, format!("tool not found: {}", allowed.0.call.tool_name));
        };

        let arguments = allowed.0.call.arguments.clone();
        let result = match timeout(self.config.execute_timeout, handle.call(arguments)).await {
            Ok(Ok(output)) if output.is_error => ToolResult::error(call_id, output.content),
            Ok(Ok(output)) => ToolResult::success(call_id, output.content),
            Ok(Err(error)) => {
                warn!(%error, "tool execution failed");
                ToolResult::error(call_id, error.to_string())
            }
            Err(_) => {
                let error = KernelError::timeout("tool execution", self.config.execute_timeout);
                warn!(%error, "tool execution timed out");
                ToolResult::error(call_id, error.to_string())
            }
        };
        debug!(
            outcome = result.outcome.as_str(),
            transport = handle.transport_name(),
            "tool execution finished"
        );
        allowed.0.record(result.outcome);
        result
    }

    /// Turn a policy denial into the error result the model sees.
    pub fn refuse(&self, mut denied: DeniedCall) -> ToolResult {
        info!(call_id = %denied.ticket.call.id, reason = %denied.reason, "tool call denied by policy");
        denied.ticket.record(ToolOutcome::Denied);
        ToolResult::error(
            denied.ticket.call.id.clone(),
            format!("Policy denied: {}", denied.reason),
        )
    }

    pub fn refuse_escalation(
        &self,
        mut escalated: EscalatedCall,
        refusal: EscalationRefusal,
    ) -> ToolResult {
        let call_id = escalated.ticket.call.id.clone();
        match refusal {
            EscalationRefusal::Denied => {
                info!(call_id = %call_id, "escalated call denied by reviewer");
                escalated.ticket.record(ToolOutcome::Denied);
                ToolResult::error(
                    call_id,
                    format!("Escalation denied: {}", escalated.prompt),
                )
            }
            EscalationRefusal::TimedOut { after } => {
                let error = KernelError::EscalationTimeout(
                    u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                );
                warn!(call_id = %call_id, %error, "escalation timed out");
                escalated.ticket.record(ToolOutcome::EscalationTimeout);
                ToolResult::escalation_timeout(call_id, error.to_string())
            }
        }
    }
}

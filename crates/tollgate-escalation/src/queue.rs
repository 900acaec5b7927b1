use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tollgate_protocol::{
    ApprovalId, EscalationDecision, EscalationHandler, EscalationRequest, KernelError,
    KernelResult, SessionId, ToolCall,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub approval_id: ApprovalId,
    pub session_id: SessionId,
    pub call: ToolCall,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResolution {
    pub approved: bool,
    pub actor: String,
    pub resolved_at: DateTime<Utc>,
}

struct PendingApproval {
    ticket: ApprovalTicket,
    responder: oneshot::Sender<EscalationDecision>,
}

/// Resolutions remembered by a default queue.
pub const DEFAULT_RESOLUTION_HISTORY: usize = 1024;

/// Escalations parked for an external reviewer. Only the newest resolutions
/// are remembered.
#[derive(Clone)]
pub struct ApprovalQueue {
    pending: Arc<Mutex<IndexMap<ApprovalId, PendingApproval>>>,
    resolved: Arc<Mutex<IndexMap<ApprovalId, ApprovalResolution>>>,
    history: usize,
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::with_history(DEFAULT_RESOLUTION_HISTORY)
    }
}

impl ApprovalQueue {
    pub fn with_history(history: usize) -> Self {
        Self {
            pending: Arc::default(),
            resolved: Arc::default(),
            history: history.max(1),
        }
    }

    fn enqueue(&self, request: &EscalationRequest) -> (ApprovalId, oneshot::Receiver<EscalationDecision>) {
        let approval_id = ApprovalId::default();
        let (responder, receiver) = oneshot::channel();
        let ticket = ApprovalTicket {
            approval_id: approval_id.clone(),
            session_id: request.session_id.clone(),
            call: request.call.clone(),
            prompt: request.prompt.clone(),
            created_at: Utc::now(),
        };
        self.pending
            .lock()
            .insert(approval_id.clone(), PendingApproval { ticket, responder });
        info!(approval_id = %approval_id, tool = %request.call.tool_name, "approval requested");
        (approval_id, receiver)
    }

    fn withdraw(&self, approval_id: &ApprovalId) {
        if self.pending.lock().shift_remove(approval_id).is_some() {
            debug!(approval_id = %approval_id, "approval ticket withdrawn");
        }
    }

    pub fn pending(&self) -> Vec<ApprovalTicket> {
        self.pending
            .lock()
            .values()
            .map(|pending| pending.ticket.clone())
            .collect()
    }

    pub fn pending_for_session(&self, session_id: &SessionId) -> Vec<ApprovalTicket> {
        self.pending
            .lock()
            .values()
            .filter(|pending| pending.ticket.session_id == *session_id)
            .map(|pending| pending.ticket.clone())
            .collect()
    }

    /// Answer a pending ticket. Returns `None` if the ticket is unknown or
    /// was already withdrawn.
    pub fn resolve(
        &self,
        approval_id: &ApprovalId,
        approved: bool,
        actor: impl Into<String>,
    ) -> Option<ApprovalResolution> {
        let pending = self.pending.lock().shift_remove(approval_id)?;
        let resolution = ApprovalResolution {
            approved,
            actor: actor.into(),
            resolved_at: Utc::now(),
        };
        let decision = if approved {
            EscalationDecision::Allow
        } else {
            EscalationDecision::Deny
        };
        if pending.responder.send(decision).is_err() {
            debug!(approval_id = %approval_id, "approval resolved after the caller stopped waiting");
        }
        info!(approval_id = %approval_id, approved, actor = %resolution.actor, "approval resolved");
        let mut resolved = self.resolved.lock();
        resolved.insert(approval_id.clone(), resolution.clone());
        while resolved.len() > self.history {
            resolved.shift_remove_index(0);
        }
        Some(resolution)
    }

    pub fn resolution(&self, approval_id: &ApprovalId) -> Option<ApprovalResolution> {
        self.resolved.lock().get(approval_id).cloned()
    }
}

impl std::fmt::Debug for ApprovalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalQueue")
            .field("pending", &self.pending.lock().len())
            .field("resolved", &self.resolved.lock().len())
            .finish()
    }
}

struct Withdraw<'a> {
    queue: &'a ApprovalQueue,
    approval_id: ApprovalId,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        self.queue.withdraw(&self.approval_id);
    }
}

/// Parks the escalation in an [`ApprovalQueue`] and waits for a reviewer.
/// When the dispatcher gives up, the ticket disappears from the queue.
#[derive(Debug, Clone)]
pub struct QueueHandler {
    queue: ApprovalQueue,
}

impl QueueHandler {
    pub fn new(queue: ApprovalQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &ApprovalQueue {
        &self.queue
    }
}

#[async_trait]
impl EscalationHandler for QueueHandler {
    fn name(&self) -> &str {
        "queue"
    }

    async fn decide(&self, request: &EscalationRequest) -> KernelResult<EscalationDecision> {
        let (approval_id, receiver) = self.queue.enqueue(request);
        let _withdraw = Withdraw {
            queue: &self.queue,
            approval_id,
        };
        receiver
            .await
            .map_err(|_| KernelError::InvalidState("approval ticket dropped".to_owned()))
    }
}

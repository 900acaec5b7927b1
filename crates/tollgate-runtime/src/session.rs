use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tollgate_protocol::{
    PolicySetId, SessionId, SessionSnapshot, SessionStatus, TerminationReason,
};

use crate::context::{ContextConfig, ContextWindow};

/// Stops a running session. In-flight tool executions are aborted.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    pub(crate) status: SessionStatus,
    pub(crate) context: ContextWindow,
    pub(crate) termination: Option<TerminationReason>,
    pub(crate) turns: u32,
    cancel: CancelHandle,
    pub(crate) cancelled: watch::Receiver<bool>,
}

impl Session {
    pub fn new(context: ContextConfig) -> Self {
        Self::with_id(SessionId::default(), context)
    }

    pub fn with_id(id: SessionId, context: ContextConfig) -> Self {
        let (sender, cancelled) = watch::channel(false);
        Self {
            id,
            created_at: Utc::now(),
            status: SessionStatus::Active,
            context: ContextWindow::new(context),
            termination: None,
            turns: 0,
            cancel: CancelHandle {
                sender: Arc::new(sender),
            },
            cancelled,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn context(&self) -> &ContextWindow {
        &self.context
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    /// Model turns taken so far.
    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn snapshot(&self, active_policy_set_id: PolicySetId) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            messages: self.context.messages().to_vec(),
            active_policy_set_id,
            termination: self.termination.clone(),
        }
    }
}

/// Finished sessions a default directory keeps.
pub const DEFAULT_FINISHED_SESSIONS: usize = 256;

/// Read-only snapshots of the sessions this process ran, for inspection.
/// Active sessions are always listed; only the newest finished ones are kept.
#[derive(Debug, Clone)]
pub struct SessionDirectory {
    sessions: Arc<RwLock<HashMap<SessionId, SessionSnapshot>>>,
    keep_finished: usize,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::with_limit(DEFAULT_FINISHED_SESSIONS)
    }
}

impl SessionDirectory {
    pub fn with_limit(keep_finished: usize) -> Self {
        Self {
            sessions: Arc::default(),
            keep_finished,
        }
    }

    pub fn publish(&self, snapshot: SessionSnapshot) {
        let finished = snapshot.status != SessionStatus::Active;
        let mut sessions = self.sessions.write();
        sessions.insert(snapshot.session_id.clone(), snapshot);
        if finished {
            Self::evict_finished(&mut sessions, self.keep_finished);
        }
    }

    fn evict_finished(sessions: &mut HashMap<SessionId, SessionSnapshot>, keep: usize) {
        let mut finished: Vec<(DateTime<Utc>, SessionId)> = sessions
            .values()
            .filter(|snapshot| snapshot.status != SessionStatus::Active)
            .map(|snapshot| (snapshot.created_at, snapshot.session_id.clone()))
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, session_id) in finished.into_iter().take(excess) {
            sessions.remove(&session_id);
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|snapshot| snapshot.created_at);
        sessions
    }
}

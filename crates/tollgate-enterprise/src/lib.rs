//! Enterprise policy synchronisation.
//!
//! A process-wide background agent that enrolls with the fleet policy
//! server, keeps the gate's active policy set current, and drains the audit
//! queue. Failures here degrade functionality but never stop a session: the
//! last successfully installed policy set stays active.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until, timeout};
use tollgate_audit::AuditQueue;
use tollgate_gate::ActivePolicy;
use tollgate_protocol::{AgentId, KernelError, KernelResult, PolicyServerPort, PolicySetId};
use tracing::{debug, info, instrument, warn};

mod backoff;
mod http;

pub use backoff::{Backoff, BackoffConfig};
pub use http::HttpPolicyServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unenrolled,
    Enrolling,
    Synced,
    Refreshing,
    Degraded,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unenrolled => "unenrolled",
            Self::Enrolling => "enrolling",
            Self::Synced => "synced",
            Self::Refreshing => "refreshing",
            Self::Degraded => "degraded",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub agent_id: AgentId,
    pub tags: Vec<String>,
    pub refresh_interval: Duration,
    pub flush_interval: Duration,
    pub batch_size: usize,
    /// Consecutive refresh failures before the agent reports `degraded`.
    pub degrade_after: u32,
    pub request_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl SyncConfig {
    pub fn new(agent_id: AgentId, tags: Vec<String>) -> Self {
        Self {
            agent_id,
            tags,
            refresh_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(30),
            batch_size: 100,
            degrade_after: 3,
            request_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Mutable bookkeeping of the sync agent.
#[derive(Debug)]
pub struct PolicySyncState {
    state: SyncState,
    token: Option<String>,
    policy_set_id: Option<PolicySetId>,
    policy_version: Option<u64>,
    consecutive_failures: u32,
    backoff: Backoff,
    next_retry: Option<Duration>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    pushed_total: u64,
}

impl PolicySyncState {
    fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: SyncState::Unenrolled,
            token: None,
            policy_set_id: None,
            policy_version: None,
            consecutive_failures: 0,
            backoff: Backoff::new(backoff),
            next_retry: None,
            last_success_at: None,
            last_error: None,
            pushed_total: 0,
        }
    }
}

/// Read-only view for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub enrolled: bool,
    pub policy_set_id: Option<PolicySetId>,
    pub policy_version: Option<u64>,
    pub consecutive_failures: u32,
    pub next_retry_ms: Option<u64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_audit: usize,
    pub dropped_audit: u64,
    pub pushed_audit: u64,
}

pub struct EnterpriseSyncAgent {
    server: Arc<dyn PolicyServerPort>,
    active_policy: ActivePolicy,
    audit: AuditQueue,
    config: SyncConfig,
    state: Mutex<PolicySyncState>,
}

impl EnterpriseSyncAgent {
    pub fn new(
        server: Arc<dyn PolicyServerPort>,
        active_policy: ActivePolicy,
        audit: AuditQueue,
        config: SyncConfig,
    ) -> Self {
        let state = Mutex::new(PolicySyncState::new(config.backoff));
        Self {
            server,
            active_policy,
            audit,
            config,
            state,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.lock().state
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.state.lock();
        SyncStatus {
            state: state.state,
            enrolled: state.token.is_some(),
            policy_set_id: state.policy_set_id.clone(),
            policy_version: state.policy_version,
            consecutive_failures: state.consecutive_failures,
            next_retry_ms: state
                .next_retry
                .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            last_success_at: state.last_success_at,
            last_error: state.last_error.clone(),
            pending_audit: self.audit.len(),
            dropped_audit: self.audit.dropped(),
            pushed_audit: state.pushed_total,
        }
    }

    fn token(&self) -> Option<String> {
        self.state.lock().token.clone()
    }

    fn transition(&self, next: SyncState) {
        let mut state = self.state.lock();
        if state.state != next {
            debug!(from = %state.state, to = %next, "sync state transition");
            state.state = next;
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.state = SyncState::Synced;
        state.consecutive_failures = 0;
        state.backoff.reset();
        state.next_retry = None;
        state.last_success_at = Some(Utc::now());
        state.last_error = None;
    }

    /// Book a failed enroll/refresh and return the delay before the retry.
    fn record_failure(&self, fallback: SyncState, error: &KernelError) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.state = if state.token.is_some()
            && state.consecutive_failures >= self.config.degrade_after
        {
            SyncState::Degraded
        } else {
            fallback
        };
        let delay = state.backoff.next_delay();
        state.next_retry = Some(delay);
        state.last_error = Some(error.to_string());
        warn!(
            %error,
            state = %state.state,
            consecutive_failures = state.consecutive_failures,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "enterprise sync failed, keeping last known-good policy set"
        );
        delay
    }

    fn install(&self, policy_set: tollgate_protocol::PolicySet) {
        {
            let mut state = self.state.lock();
            state.policy_set_id = Some(policy_set.id.clone());
            state.policy_version = Some(policy_set.version);
        }
        let current = self.active_policy.current();
        if current.id == policy_set.id && current.version == policy_set.version {
            debug!(policy_set = %policy_set.id, "policy set unchanged");
            return;
        }
        self.active_policy.swap(policy_set);
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        future: impl std::future::Future<Output = KernelResult<T>>,
    ) -> KernelResult<T> {
        timeout(self.config.request_timeout, future)
            .await
            .map_err(|_| KernelError::timeout(operation, self.config.request_timeout))?
    }

    #[instrument(skip(self), fields(agent_id = %self.config.agent_id, tags = ?self.config.tags))]
    pub async fn enroll(&self) -> KernelResult<()> {
        self.transition(SyncState::Enrolling);
        let result = self
            .bounded(
                "enrollment",
                self.server.enroll(&self.config.agent_id, &self.config.tags),
            )
            .await;
        match result {
            Ok(enrollment) => {
                self.state.lock().token = Some(enrollment.token);
                info!(
                    policy_set = %enrollment.policy_set.id,
                    version = enrollment.policy_set.version,
                    "enrolled with policy server"
                );
                self.install(enrollment.policy_set);
                self.record_success();
                Ok(())
            }
            Err(error) => {
                self.record_failure(SyncState::Unenrolled, &error);
                Err(error)
            }
        }
    }

    #[instrument(skip(self), fields(agent_id = %self.config.agent_id))]
    pub async fn refresh(&self) -> KernelResult<()> {
        let Some(token) = self.token() else {
            return Err(KernelError::EnterpriseSync("agent is not enrolled".to_owned()));
        };
        let previous = self.state();
        self.transition(SyncState::Refreshing);
        let result = self
            .bounded("policy pull", self.server.pull(&token, &self.config.tags))
            .await;
        match result {
            Ok(policy_set) => {
                debug!(policy_set = %policy_set.id, version = policy_set.version, "policies pulled");
                self.install(policy_set);
                self.record_success();
                Ok(())
            }
            Err(error) => {
                let fallback = match previous {
                    SyncState::Degraded => SyncState::Degraded,
                    _ => SyncState::Synced,
                };
                self.record_failure(fallback, &error);
                Err(error)
            }
        }
    }

    /// Enroll if needed, otherwise refresh. Returns how long to wait before
    /// the next attempt.
    pub async fn sync_once(&self) -> Duration {
        let outcome = if self.token().is_some() {
            self.refresh().await
        } else {
            self.enroll().await
        };
        match outcome {
            Ok(()) => self.config.refresh_interval,
            Err(_) => self
                .state
                .lock()
                .next_retry
                .unwrap_or(self.config.refresh_interval),
        }
    }

    /// Push queued audit events oldest-first in batches. Events leave the
    /// queue only after the server accepted their batch.
    #[instrument(skip(self), fields(pending = self.audit.len()))]
    pub async fn flush(&self) -> KernelResult<usize> {
        let Some(token) = self.token() else {
            return Err(KernelError::EnterpriseSync("agent is not enrolled".to_owned()));
        };
        let mut pushed = 0;
        loop {
            let batch = self.audit.batch(self.config.batch_size.max(1));
            if batch.is_empty() {
                break;
            }
            let result = self
                .bounded("audit push", self.server.push(&token, &batch))
                .await;
            match result {
                Ok(ack) => {
                    let removed = self.audit.acknowledge(batch.iter().map(|r| r.sequence));
                    pushed += removed;
                    self.state.lock().pushed_total += removed as u64;
                    debug!(batch = batch.len(), accepted = ack.accepted, "audit batch pushed");
                }
                Err(error) => {
                    warn!(
                        %error,
                        pending = self.audit.len(),
                        dropped = self.audit.dropped(),
                        "audit push failed, events stay queued"
                    );
                    self.state.lock().last_error = Some(error.to_string());
                    return Err(error);
                }
            }
        }
        if pushed > 0 {
            info!(pushed, "audit events flushed");
        }
        Ok(pushed)
    }

    /// Run the refresh and flush timers until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let agent = self.clone();
        let task = tokio::spawn(async move {
            let mut next_sync = Instant::now();
            let mut flush_timer = tokio::time::interval(agent.config.flush_interval);
            flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(agent_id = %agent.config.agent_id, "enterprise sync agent started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = sleep_until(next_sync) => {
                        let delay = agent.sync_once().await;
                        next_sync = Instant::now() + delay;
                    }
                    _ = flush_timer.tick() => {
                        if agent.token().is_some() && !agent.audit.is_empty() {
                            let _ = agent.flush().await;
                        }
                    }
                }
            }

            if agent.token().is_some() && !agent.audit.is_empty() {
                if let Err(error) = agent.flush().await {
                    warn!(%error, "final audit flush failed");
                }
            }
            info!("enterprise sync agent stopped");
        });
        SyncHandle {
            agent: self,
            shutdown: shutdown_tx,
            task,
        }
    }
}

impl fmt::Debug for EnterpriseSyncAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterpriseSyncAgent")
            .field("agent_id", &self.config.agent_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Owner of the running sync task.
#[derive(Debug)]
pub struct SyncHandle {
    agent: Arc<EnterpriseSyncAgent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn agent(&self) -> &Arc<EnterpriseSyncAgent> {
        &self.agent
    }

    pub fn status(&self) -> SyncStatus {
        self.agent.status()
    }

    /// Stop the timers and wait for the final flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            warn!(%error, "enterprise sync task ended abnormally");
        }
    }
}

//! Wiring for a tollgate process.
//!
//! [`KernelBuilder`] turns a [`TollgateConfig`] into running components:
//! audit queue, active policy set, gate, tool registry, escalation
//! dispatcher, session runtime and (when configured) the enterprise sync
//! agent. Every collaborator can be replaced before `build`, which is how
//! tests run the whole stack without network access.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tollgate_audit::{AuditQueue, JsonlAuditSink, spawn_audit_log};
use tollgate_enterprise::{EnterpriseSyncAgent, HttpPolicyServer, SyncHandle, SyncStatus};
use tollgate_escalation::{ApprovalQueue, Console, EscalationDispatcher};
use tollgate_gate::{ActivePolicy, HttpPolicyDecisionClient, ToolInvocationGate};
use tollgate_protocol::{
    EscalationHandler, KernelError, KernelResult, ModelProviderPort, PolicyDecisionPort,
    PolicyDecisionRequest, PolicyServerPort, PolicySet, PolicySetId, PolicyVerdict, SessionId,
    SessionSnapshot, TerminationReason, ToolMetadata, ToolTransportPort,
};
use tollgate_runtime::{ChatSurface, HttpModelBridge, Session, SessionDirectory, SessionRuntime};
use tollgate_tools::{LocalToolTransport, ToolRegistry};
use tracing::{info, instrument, warn};

pub mod config;

pub use config::{ConfigError, TollgateConfig};

/// Stand-in when no policy engine endpoint is configured: every evaluation
/// fails, so the gate denies every call.
struct NoPolicyEngine;

#[async_trait]
impl PolicyDecisionPort for NoPolicyEngine {
    async fn evaluate(&self, _request: PolicyDecisionRequest) -> KernelResult<PolicyVerdict> {
        Err(KernelError::PolicyEngineUnavailable(
            "no policy engine endpoint configured".to_owned(),
        ))
    }
}

/// Build the tool registry from the configured transports plus `extra`.
pub async fn discover_tools(
    config: &TollgateConfig,
    extra: Vec<Arc<dyn ToolTransportPort>>,
) -> Result<ToolRegistry> {
    let mut transports: Vec<Arc<dyn ToolTransportPort>> = Vec::new();
    if config.tools.enable_builtin {
        transports.push(Arc::new(LocalToolTransport::new(
            config.tools.builtin.clone(),
        )?));
    }
    transports.extend(extra);
    let mut registry =
        ToolRegistry::new(config.tools.classification.clone(), config.tools.unknown_risk);
    registry.discover(&transports).await;
    Ok(registry)
}

pub struct KernelBuilder {
    config: TollgateConfig,
    model: Option<Arc<dyn ModelProviderPort>>,
    decisions: Option<Arc<dyn PolicyDecisionPort>>,
    transports: Vec<Arc<dyn ToolTransportPort>>,
    escalation_handler: Option<Arc<dyn EscalationHandler>>,
    policy_server: Option<Arc<dyn PolicyServerPort>>,
    console: Option<Console>,
}

impl KernelBuilder {
    pub fn new(config: TollgateConfig) -> Self {
        Self {
            config,
            model: None,
            decisions: None,
            transports: Vec::new(),
            escalation_handler: None,
            policy_server: None,
            console: None,
        }
    }

    pub fn model(mut self, model: Arc<dyn ModelProviderPort>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn decisions(mut self, decisions: Arc<dyn PolicyDecisionPort>) -> Self {
        self.decisions = Some(decisions);
        self
    }

    /// Serve tools from `transport` in addition to the built-in ones.
    pub fn transport(mut self, transport: Arc<dyn ToolTransportPort>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn escalation_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation_handler = Some(handler);
        self
    }

    pub fn policy_server(mut self, server: Arc<dyn PolicyServerPort>) -> Self {
        self.policy_server = Some(server);
        self
    }

    /// Console shared by the chat loop and the terminal escalation handler.
    pub fn console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    #[instrument(skip(self))]
    pub async fn build(self) -> Result<TollgateKernel> {
        let config = self.config;
        config.validate()?;

        let model: Arc<dyn ModelProviderPort> = match (self.model, &config.model.endpoint) {
            (Some(model), _) => model,
            (None, Some(endpoint)) => Arc::new(HttpModelBridge::new(
                endpoint,
                Duration::from_secs(config.model.timeout_secs),
            )?),
            (None, None) => {
                bail!("no model endpoint configured (set [model].endpoint or TOLLGATE_MODEL_URL)")
            }
        };

        let audit = AuditQueue::with_capacity(config.audit.capacity);
        let audit_log = config.audit.log_path.as_ref().map(|path| {
            info!(path = %path.display(), "mirroring audit records to file");
            spawn_audit_log(&audit, Arc::new(JsonlAuditSink::new(path)))
        });

        let active_policy = ActivePolicy::new(PolicySet::builtin());
        let gate_config = config.gate_config();
        let decisions: Arc<dyn PolicyDecisionPort> =
            match (self.decisions, &config.policy_engine.endpoint) {
                (Some(decisions), _) => decisions,
                (None, Some(endpoint)) => Arc::new(HttpPolicyDecisionClient::new(
                    endpoint,
                    gate_config.evaluate_timeout,
                )?),
                (None, None) => {
                    warn!("no policy engine configured; every tool call will be denied");
                    Arc::new(NoPolicyEngine)
                }
            };
        let gate = ToolInvocationGate::new(decisions, active_policy.clone(), audit.clone(), gate_config);

        let registry = discover_tools(&config, self.transports).await?;

        let console = self.console.unwrap_or_else(Console::stdio);
        let approvals = ApprovalQueue::default();
        let handler = self
            .escalation_handler
            .unwrap_or_else(|| config.escalation.handler.build(&console, &approvals));
        let escalation = EscalationDispatcher::new(handler, config.escalation_timeout());
        info!(
            handler = escalation.handler_name(),
            timeout_secs = config.escalation.timeout_secs,
            "escalation dispatcher ready"
        );

        let runtime = SessionRuntime::new(
            config.runtime_config(),
            model,
            gate,
            Arc::new(registry),
            escalation,
            SessionDirectory::default(),
        );

        let sync = match &config.enterprise {
            Some(enterprise) => {
                let agent_id = enterprise.agent_id();
                let server: Arc<dyn PolicyServerPort> = match self.policy_server {
                    Some(server) => server,
                    None => Arc::new(HttpPolicyServer::new(
                        &enterprise.url,
                        agent_id.clone(),
                        Duration::from_secs(enterprise.request_timeout_secs),
                    )?),
                };
                let agent = EnterpriseSyncAgent::new(
                    server,
                    active_policy.clone(),
                    audit.clone(),
                    enterprise.sync_config(agent_id.clone()),
                );
                info!(url = %enterprise.url, agent_id = %agent_id, "enterprise sync enabled");
                Some(Arc::new(agent).spawn())
            }
            None => None,
        };

        Ok(TollgateKernel {
            config,
            runtime,
            approvals,
            audit,
            active_policy,
            console,
            sync,
            audit_log,
        })
    }
}

pub struct TollgateKernel {
    config: TollgateConfig,
    runtime: SessionRuntime,
    approvals: ApprovalQueue,
    audit: AuditQueue,
    active_policy: ActivePolicy,
    console: Console,
    sync: Option<SyncHandle>,
    audit_log: Option<JoinHandle<()>>,
}

impl TollgateKernel {
    pub fn config(&self) -> &TollgateConfig {
        &self.config
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn open_session(&self) -> Session {
        self.runtime.open_session()
    }

    #[instrument(skip(self, session, initial_input, surface), fields(session_id = %session.id()))]
    pub async fn run(
        &self,
        session: &mut Session,
        initial_input: Option<String>,
        surface: &mut dyn ChatSurface,
    ) -> TerminationReason {
        self.runtime.run(session, initial_input, surface).await
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.runtime.directory().list()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.runtime.directory().get(session_id)
    }

    /// Discovered tools with their classification.
    pub fn tools(&self) -> Vec<ToolMetadata> {
        self.runtime.registry().metadata()
    }

    pub fn audit(&self) -> &AuditQueue {
        &self.audit
    }

    pub fn active_policy_set_id(&self) -> PolicySetId {
        self.active_policy.id()
    }

    pub fn active_policy_set(&self) -> Arc<PolicySet> {
        self.active_policy.current()
    }

    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.sync.as_ref().map(SyncHandle::status)
    }

    /// Pending escalations, when the `queue` handler is configured.
    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    /// Stop background tasks after a final audit flush.
    pub async fn shutdown(self) {
        if let Some(sync) = self.sync {
            sync.shutdown().await;
        }
        if let Some(audit_log) = self.audit_log {
            // Let the writer drain what is already queued.
            tokio::task::yield_now().await;
            audit_log.abort();
        }
        info!("kernel stopped");
    }
}

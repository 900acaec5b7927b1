//! Policy types: risk levels, tool metadata, verdicts, and policy sets.
//!
//! Nothing in here interprets policies. A [`PolicySet`] is an opaque snapshot
//! that the policy-decision collaborator understands; this crate only names it.

use std::fmt;
use std::str::FromStr;

use crate::ids::PolicySetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("invalid risk level: {other}")),
        }
    }
}

/// Static classification of a tool, held by the tool registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub risk: RiskLevel,
    pub category: String,
}

impl ToolMetadata {
    pub const UNCATEGORIZED: &'static str = "uncategorized";

    pub fn new(name: impl Into<String>, risk: RiskLevel, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            risk,
            category: category.into(),
        }
    }
}

/// The policy-decision collaborator's answer for one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PolicyVerdict {
    Allow,
    Deny { reason: String },
    Escalate { prompt: String },
}

impl PolicyVerdict {
    pub const ENGINE_UNAVAILABLE: &'static str = "policy_engine_unavailable";

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn escalate(prompt: impl Into<String>) -> Self {
        Self::Escalate {
            prompt: prompt.into(),
        }
    }

    /// The verdict used whenever the collaborator cannot be consulted.
    pub fn engine_unavailable() -> Self {
        Self::deny(Self::ENGINE_UNAVAILABLE)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny { .. } => "deny",
            Self::Escalate { .. } => "escalate",
        }
    }
}

/// An installed set of enterprise policies consulted alongside the
/// collaborator's built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    pub id: PolicySetId,
    pub version: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub policies: Vec<serde_json::Value>,
    pub installed_at: DateTime<Utc>,
}

impl PolicySet {
    /// Defaults only: no additional policies installed.
    pub fn builtin() -> Self {
        Self {
            id: PolicySetId::builtin(),
            version: 0,
            tags: Vec::new(),
            policies: Vec::new(),
            installed_at: Utc::now(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id == PolicySetId::builtin()
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_parses_case_insensitively() {
        assert_eq!("LOW".parse::<RiskLevel>(), Ok(RiskLevel::Low));
        assert_eq!(" high ".parse::<RiskLevel>(), Ok(RiskLevel::High));
        assert!("critical".parse::<RiskLevel>().is_err());
        assert_eq!(RiskLevel::default(), RiskLevel::Medium);
    }

    #[test]
    fn verdict_wire_shape() {
        let deny = PolicyVerdict::deny("external_trace");
        let json = serde_json::to_value(&deny).unwrap();
        assert_eq!(json["verdict"], "deny");
        assert_eq!(json["reason"], "external_trace");

        let back: PolicyVerdict =
            serde_json::from_str(r#"{"verdict":"escalate","prompt":"confirm?"}"#).unwrap();
        assert_eq!(back, PolicyVerdict::escalate("confirm?"));
        assert_eq!(back.kind(), "escalate");
    }

    #[test]
    fn engine_unavailable_is_a_denial() {
        assert_eq!(
            PolicyVerdict::engine_unavailable(),
            PolicyVerdict::deny("policy_engine_unavailable")
        );
    }

    #[test]
    fn builtin_policy_set() {
        let set = PolicySet::default();
        assert!(set.is_builtin());
        assert_eq!(set.version, 0);
        assert!(set.policies.is_empty());
    }
}

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tollgate_protocol::{
    AgentId, AuditRecord, KernelError, KernelResult, PolicyEnrollment, PolicyServerPort,
    PolicySet, PolicySetId, PushAck,
};
use tracing::{debug, instrument};

#[derive(Debug, Default, Deserialize)]
struct PolicyPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    policies: Vec<Value>,
}

impl PolicyPayload {
    fn into_policy_set(self, tags: &[String]) -> PolicySet {
        let version = self.version.unwrap_or(0);
        PolicySet {
            id: PolicySetId::from_string(
                self.id
                    .unwrap_or_else(|| format!("enterprise-v{version}")),
            ),
            version,
            tags: tags.to_vec(),
            policies: self.policies,
            installed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    token: String,
    #[serde(flatten)]
    policy: PolicyPayload,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    agent_id: &'a AgentId,
    events: &'a [AuditRecord],
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    accepted: Option<usize>,
}

/// Client for the enterprise policy server's agent API.
#[derive(Debug, Clone)]
pub struct HttpPolicyServer {
    client: reqwest::Client,
    base_url: String,
    agent_id: AgentId,
}

impl HttpPolicyServer {
    pub fn new(base_url: &str, agent_id: AgentId, timeout: Duration) -> KernelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| KernelError::InvalidState(format!("http client: {error}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            agent_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn checked(response: reqwest::Response, what: &str) -> KernelResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(KernelError::EnterpriseSync(format!(
            "{what} failed: HTTP {status} {body}"
        )))
    }

    fn transport_error(what: &str, error: reqwest::Error) -> KernelError {
        KernelError::EnterpriseSync(format!("{what} request failed: {error}"))
    }
}

#[async_trait]
impl PolicyServerPort for HttpPolicyServer {
    #[instrument(skip(self, tags), fields(agent_id = %agent_id, url = %self.base_url))]
    async fn enroll(&self, agent_id: &AgentId, tags: &[String]) -> KernelResult<PolicyEnrollment> {
        let body = json!({
            "agent_id": agent_id,
            "tags": tags,
            "capabilities": { "policy_refresh": true, "audit_push": true },
        });
        let response = self
            .client
            .post(self.url("/api/v1/agents/enroll"))
            .json(&body)
            .send()
            .await
            .map_err(|error| Self::transport_error("enrollment", error))?;
        let enrolled: EnrollResponse = Self::checked(response, "enrollment")
            .await?
            .json()
            .await
            .map_err(|error| KernelError::EnterpriseSync(format!("malformed enrollment: {error}")))?;
        debug!(policies = enrolled.policy.policies.len(), "enrollment accepted");
        Ok(PolicyEnrollment {
            token: enrolled.token,
            policy_set: enrolled.policy.into_policy_set(tags),
        })
    }

    #[instrument(skip(self, token, tags), fields(agent_id = %self.agent_id))]
    async fn pull(&self, token: &str, tags: &[String]) -> KernelResult<PolicySet> {
        let joined_tags = tags.join(",");
        let response = self
            .client
            .get(self.url("/api/v1/policies"))
            .bearer_auth(token)
            .query(&[
                ("agent_id", self.agent_id.as_str()),
                ("tags", joined_tags.as_str()),
            ])
            .send()
            .await
            .map_err(|error| Self::transport_error("policy pull", error))?;
        let payload: PolicyPayload = Self::checked(response, "policy pull")
            .await?
            .json()
            .await
            .map_err(|error| KernelError::EnterpriseSync(format!("malformed policy set: {error}")))?;
        debug!(policies = payload.policies.len(), version = ?payload.version, "policies pulled");
        Ok(payload.into_policy_set(tags))
    }

    #[instrument(skip(self, token, events), fields(agent_id = %self.agent_id, events = events.len()))]
    async fn push(&self, token: &str, events: &[AuditRecord]) -> KernelResult<PushAck> {
        let response = self
            .client
            .post(self.url("/api/v1/audit/push"))
            .bearer_auth(token)
            .json(&PushRequest {
                agent_id: &self.agent_id,
                events,
            })
            .send()
            .await
            .map_err(|error| Self::transport_error("audit push", error))?;
        let ack: PushResponse = Self::checked(response, "audit push")
            .await?
            .json()
            .await
            .unwrap_or(PushResponse { accepted: None });
        Ok(PushAck {
            accepted: ack.accepted.unwrap_or(events.len()),
        })
    }
}

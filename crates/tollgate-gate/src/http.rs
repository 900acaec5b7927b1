use std::time::Duration;

use async_trait::async_trait;
use tollgate_protocol::{
    KernelError, KernelResult, PolicyDecisionPort, PolicyDecisionRequest, PolicyVerdict,
};
use tracing::{debug, instrument};

/// Policy-decision bridge to an engine running as an HTTP sidecar.
///
/// The engine receives the serialized [`PolicyDecisionRequest`] at
/// `POST {endpoint}/v1/evaluate` and answers with a tagged verdict such as
/// `{"verdict":"deny","reason":"external_trace"}`.
#[derive(Debug, Clone)]
pub struct HttpPolicyDecisionClient {
    client: reqwest::Client,
    evaluate_url: String,
}

impl HttpPolicyDecisionClient {
    pub fn new(endpoint: &str, timeout: Duration) -> KernelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| KernelError::InvalidState(format!("http client: {error}")))?;
        Ok(Self {
            client,
            evaluate_url: format!("{}/v1/evaluate", endpoint.trim_end_matches('/')),
        })
    }

    pub fn evaluate_url(&self) -> &str {
        &self.evaluate_url
    }
}

#[async_trait]
impl PolicyDecisionPort for HttpPolicyDecisionClient {
    #[instrument(skip(self, request), fields(call_id = %request.call_id, url = %self.evaluate_url))]
    async fn evaluate(&self, request: PolicyDecisionRequest) -> KernelResult<PolicyVerdict> {
        let response = self
            .client
            .post(&self.evaluate_url)
            .json(&request)
            .send()
            .await
            .map_err(|error| KernelError::PolicyEngineUnavailable(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KernelError::PolicyEngineUnavailable(format!(
                "policy engine answered HTTP {status}"
            )));
        }

        let verdict = response.json::<PolicyVerdict>().await.map_err(|error| {
            KernelError::PolicyEngineUnavailable(format!("malformed verdict: {error}"))
        })?;
        debug!(verdict = verdict.kind(), "policy engine answered");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_url_ignores_trailing_slash() -> anyhow::Result<()> {
        let client = HttpPolicyDecisionClient::new("http://127.0.0.1:7700/", Duration::from_secs(1))?;
        assert_eq!(client.evaluate_url(), "http://127.0.0.1:7700/v1/evaluate");
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_sidecar_is_reported_as_unavailable() -> anyhow::Result<()> {
        // Port 9 (discard) is closed on test hosts; the connect fails fast.
        let client = HttpPolicyDecisionClient::new("http://127.0.0.1:9", Duration::from_secs(2))?;
        let request = PolicyDecisionRequest {
            session_id: "s1".into(),
            call_id: "c1".into(),
            tool_name: "http_fetch".into(),
            arguments: serde_json::json!({}),
            risk: tollgate_protocol::RiskLevel::Medium,
            category: "network".into(),
            provenance_ids: Vec::new(),
            active_policy_set_id: tollgate_protocol::PolicySetId::builtin(),
            active_policy_version: 0,
        };
        let err = client.evaluate(request).await.expect_err("nothing listens");
        assert!(matches!(err, KernelError::PolicyEngineUnavailable(_)));
        Ok(())
    }
}

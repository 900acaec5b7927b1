use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tollgate_protocol::{
    KernelError, KernelResult, Message, ModelCompletion, ModelCompletionRequest,
    ModelProviderPort,
};
use tracing::{debug, instrument};

/// Bridge to an external model adapter speaking tollgate's own JSON shape:
/// `POST {endpoint}/v1/complete` takes a [`ModelCompletionRequest`] and
/// returns a [`ModelCompletion`]; `POST {endpoint}/v1/summarize` takes
/// `{"messages": [...]}` and returns `{"summary": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpModelBridge {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
}

impl HttpModelBridge {
    pub fn new(endpoint: &str, timeout: Duration) -> KernelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| KernelError::InvalidState(format!("http client: {error}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> KernelResult<T> {
        let response = self
            .client
            .post(format!("{}{path}", self.endpoint))
            .json(body)
            .send()
            .await
            .map_err(|error| KernelError::ModelProvider(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KernelError::ModelProvider(format!("HTTP {status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|error| KernelError::ModelProvider(format!("malformed response: {error}")))
    }
}

#[async_trait]
impl ModelProviderPort for HttpModelBridge {
    #[instrument(skip(self, request), fields(session_id = %request.session_id, turn = request.turn, context = request.context.len()))]
    async fn complete(&self, request: ModelCompletionRequest) -> KernelResult<ModelCompletion> {
        let completion: ModelCompletion = self.post("/v1/complete", &request).await?;
        debug!(
            tool_calls = completion.tool_calls.len(),
            has_text = completion.text.is_some(),
            "model answered"
        );
        Ok(completion)
    }

    async fn summarize(&self, messages: &[Message]) -> KernelResult<String> {
        let response: SummaryResponse = self
            .post("/v1/summarize", &json!({ "messages": messages }))
            .await?;
        Ok(response.summary)
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tollgate_protocol::{
    KernelError, KernelResult, ToolDescriptor, ToolInvocationOutput, ToolTransportPort,
};
use tracing::{debug, instrument};

const FILESYSTEM_READ: &str = "filesystem_read";
const HTTP_FETCH: &str = "http_fetch";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalToolsConfig {
    /// Relative paths given to `filesystem_read` resolve against this root.
    pub workspace_root: PathBuf,
    pub max_output_bytes: usize,
    pub http_timeout_secs: u64,
}

impl Default for LocalToolsConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            max_output_bytes: 64 * 1024,
            http_timeout_secs: 20,
        }
    }
}

/// In-process tools served without any external tool server.
#[derive(Debug, Clone)]
pub struct LocalToolTransport {
    config: LocalToolsConfig,
    http: reqwest::Client,
}

impl LocalToolTransport {
    pub fn new(config: LocalToolsConfig) -> KernelResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs.max(1)))
            .build()
            .map_err(|error| KernelError::InvalidState(format!("http client: {error}")))?;
        Ok(Self { config, http })
    }

    fn truncate(output: Vec<u8>, max_output_bytes: usize) -> String {
        let mut output = output;
        if output.len() > max_output_bytes {
            output.truncate(max_output_bytes);
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    /// Upper bound on bytes pulled from a source: one past the output cap, so
    /// an overlong source is seen as such without reading all of it.
    fn read_limit(&self) -> usize {
        self.config.max_output_bytes.saturating_add(1)
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.config.workspace_root.join(candidate)
        }
    }

    fn required_str<'a>(tool: &str, arguments: &'a Value, field: &str) -> KernelResult<&'a str> {
        arguments
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| KernelError::ToolExecution(format!("{tool} requires arguments.{field}")))
    }

    #[instrument(skip(self, arguments), fields(tool = FILESYSTEM_READ))]
    async fn filesystem_read(&self, arguments: &Value) -> KernelResult<ToolInvocationOutput> {
        let path = Self::required_str(FILESYSTEM_READ, arguments, "path")?;
        let absolute = self.resolve_path(path);
        let failed = |error: std::io::Error| {
            KernelError::ToolExecution(format!("failed reading {}: {error}", absolute.display()))
        };
        let file = File::open(&absolute).await.map_err(failed)?;
        let limit = self.read_limit();
        let mut bytes = Vec::with_capacity(limit.min(64 * 1024));
        file.take(u64::try_from(limit).unwrap_or(u64::MAX))
            .read_to_end(&mut bytes)
            .await
            .map_err(failed)?;
        debug!(bytes = bytes.len(), truncated = bytes.len() >= limit, "file read");
        Ok(ToolInvocationOutput {
            content: Self::truncate(bytes, self.config.max_output_bytes),
            is_error: false,
        })
    }

    #[instrument(skip(self, arguments), fields(tool = HTTP_FETCH))]
    async fn http_fetch(&self, arguments: &Value) -> KernelResult<ToolInvocationOutput> {
        let url = Self::required_str(HTTP_FETCH, arguments, "url")?;
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| KernelError::ToolExecution(format!("request to {url} failed: {error}")))?;
        let status = response.status();
        let limit = self.read_limit();
        let mut body = Vec::new();
        while body.len() < limit {
            let chunk = response
                .chunk()
                .await
                .map_err(|error| KernelError::ToolExecution(format!("reading body failed: {error}")))?;
            let Some(chunk) = chunk else {
                break;
            };
            let take = chunk.len().min(limit - body.len());
            body.extend_from_slice(&chunk[..take]);
        }
        debug!(
            status = status.as_u16(),
            bytes = body.len(),
            truncated = body.len() >= limit,
            "http fetch finished"
        );
        let body = Self::truncate(body, self.config.max_output_bytes);
        Ok(ToolInvocationOutput {
            content: format!("HTTP {}\n\n{body}", status.as_u16()),
            is_error: !status.is_success(),
        })
    }
}

#[async_trait]
impl ToolTransportPort for LocalToolTransport {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn list_tools(&self) -> KernelResult<Vec<ToolDescriptor>> {
        Ok(vec![
            ToolDescriptor {
                name: FILESYSTEM_READ.to_owned(),
                description: "Read a text file from the local filesystem".to_owned(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"],
                }),
            },
            ToolDescriptor {
                name: HTTP_FETCH.to_owned(),
                description: "Fetch a URL with HTTP GET and return the response body".to_owned(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "url": { "type": "string" } },
                    "required": ["url"],
                }),
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> KernelResult<ToolInvocationOutput> {
        match name {
            FILESYSTEM_READ => self.filesystem_read(&arguments).await,
            HTTP_FETCH => self.http_fetch(&arguments).await,
            other => Err(KernelError::ToolNotFound(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn filesystem_read_resolves_relative_to_workspace() -> Result<()> {
        let root = unique_test_root("tollgate-tools-read");
        fs::create_dir_all(&root).await?;
        fs::write(root.join("notes.txt"), "hello tollgate").await?;

        let transport = LocalToolTransport::new(LocalToolsConfig {
            workspace_root: root.clone(),
            max_output_bytes: 5,
            http_timeout_secs: 1,
        })?;
        let output = transport
            .call_tool(FILESYSTEM_READ, json!({ "path": "notes.txt" }))
            .await?;
        assert_eq!(output.content, "hello");
        assert!(!output.is_error);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn large_file_read_stops_at_output_cap() -> Result<()> {
        let root = unique_test_root("tollgate-tools-large");
        fs::create_dir_all(&root).await?;
        fs::write(root.join("big.log"), "a".repeat(1024 * 1024)).await?;

        let transport = LocalToolTransport::new(LocalToolsConfig {
            workspace_root: root.clone(),
            max_output_bytes: 100,
            http_timeout_secs: 1,
        })?;
        let output = transport
            .call_tool(FILESYSTEM_READ, json!({ "path": "big.log" }))
            .await?;
        assert_eq!(output.content.len(), 100);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn endless_file_read_is_capped() -> Result<()> {
        let transport = LocalToolTransport::new(LocalToolsConfig {
            max_output_bytes: 32,
            ..LocalToolsConfig::default()
        })?;
        let output = tokio::time::timeout(
            Duration::from_secs(5),
            transport.call_tool(FILESYSTEM_READ, json!({ "path": "/dev/zero" })),
        )
        .await??;
        assert_eq!(output.content.len(), 32);
        Ok(())
    }

    #[tokio::test]
    async fn missing_argument_is_a_tool_error() -> Result<()> {
        let transport = LocalToolTransport::new(LocalToolsConfig::default())?;
        let err = transport
            .call_tool(FILESYSTEM_READ, json!({}))
            .await
            .expect_err("path is required");
        assert!(matches!(err, KernelError::ToolExecution(_)));
        assert!(err.to_string().contains("arguments.path"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_builtin_is_not_found() -> Result<()> {
        let transport = LocalToolTransport::new(LocalToolsConfig::default())?;
        let err = transport
            .call_tool("shell_exec", json!({}))
            .await
            .expect_err("not a builtin");
        assert!(matches!(err, KernelError::ToolNotFound(_)));
        assert_eq!(transport.list_tools().await?.len(), 2);
        Ok(())
    }
}

use async_trait::async_trait;
use tollgate_protocol::{EscalationDecision, EscalationHandler, EscalationRequest, KernelResult};
use tracing::{debug, instrument};

use crate::console::Console;

/// Asks whoever sits at the console. Only `y`/`yes` approves; anything else,
/// including end of input, denies.
#[derive(Debug, Clone)]
pub struct TerminalHandler {
    console: Console,
}

impl TerminalHandler {
    pub fn new(console: Console) -> Self {
        Self { console }
    }

    fn render(request: &EscalationRequest) -> String {
        let arguments = serde_json::to_string_pretty(&request.call.arguments)
            .unwrap_or_else(|_| request.call.arguments.to_string());
        format!(
            "\n[approval required] tool `{}` (risk {}, category {})\n  reason: {}\n  arguments: {}\nAllow this call? [y/N] ",
            request.call.tool_name,
            request.metadata.risk,
            request.metadata.category,
            request.prompt,
            arguments.replace('\n', "\n  "),
        )
    }
}

#[async_trait]
impl EscalationHandler for TerminalHandler {
    fn name(&self) -> &str {
        "terminal"
    }

    #[instrument(skip(self, request), fields(call_id = %request.call.id, tool = %request.call.tool_name))]
    async fn decide(&self, request: &EscalationRequest) -> KernelResult<EscalationDecision> {
        let answer = self.console.ask(&Self::render(request)).await?;
        let approved = answer
            .map(|line| matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
            .unwrap_or(false);
        debug!(approved, "terminal answered");
        Ok(if approved {
            EscalationDecision::Allow
        } else {
            EscalationDecision::Deny
        })
    }
}

/// Headless operation: nobody is there to ask.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDenyHandler;

#[async_trait]
impl EscalationHandler for AutoDenyHandler {
    fn name(&self) -> &str {
        "auto_deny"
    }

    async fn decide(&self, _request: &EscalationRequest) -> KernelResult<EscalationDecision> {
        Ok(EscalationDecision::Deny)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tollgate_protocol::{RiskLevel, SessionId, ToolCall, ToolMetadata};

    use super::*;

    fn request() -> EscalationRequest {
        EscalationRequest {
            session_id: SessionId::from_string("s1"),
            call: ToolCall::new("http_fetch", json!({"url": "https://example.com"}), []),
            metadata: ToolMetadata::new("http_fetch", RiskLevel::High, "network"),
            prompt: "outbound request after reading local files".into(),
        }
    }

    #[tokio::test]
    async fn terminal_yes_allows_and_shows_the_call() -> anyhow::Result<()> {
        let (writer, mut shown) = tokio::io::duplex(8192);
        let handler = TerminalHandler::new(Console::new(&b"YES\n"[..], writer));

        assert_eq!(handler.decide(&request()).await?, EscalationDecision::Allow);

        let mut buf = vec![0_u8; 8192];
        let n = shown.read(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("http_fetch"));
        assert!(text.contains("outbound request"));
        Ok(())
    }

    #[tokio::test]
    async fn terminal_other_answers_and_eof_deny() -> anyhow::Result<()> {
        let handler = TerminalHandler::new(Console::new(&b"n\n"[..], tokio::io::sink()));
        assert_eq!(handler.decide(&request()).await?, EscalationDecision::Deny);
        assert_eq!(handler.decide(&request()).await?, EscalationDecision::Deny);
        Ok(())
    }

    #[tokio::test]
    async fn auto_deny_always_denies() -> anyhow::Result<()> {
        assert_eq!(
            AutoDenyHandler.decide(&request()).await?,
            EscalationDecision::Deny
        );
        Ok(())
    }
}

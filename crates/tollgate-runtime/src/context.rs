//! Bounded conversation history.
//!
//! The window keeps the full append-only history of a session and derives
//! from it the token-bounded view handed to the model. System messages,
//! the latest user message and the tool results the model still has to
//! answer are always part of the view; older messages are evicted from the
//! front (optionally replaced by a model-written summary).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tollgate_protocol::{
    KernelError, KernelResult, Message, MessageId, ModelProviderPort, Role, ToolCall, ToolCallId,
};
use tracing::{debug, warn};

const CHARS_PER_TOKEN: usize = 4;
const CLIP_MARKER: &str = " [truncated]";

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub per_message_overhead: usize,
    pub summarize: bool,
    pub summary_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            per_message_overhead: 4,
            summarize: false,
            summary_timeout: Duration::from_secs(30),
        }
    }
}

fn text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn calls_tokens(calls: &[ToolCall]) -> usize {
    if calls.is_empty() {
        return 0;
    }
    serde_json::to_string(calls)
        .map(|json| text_tokens(&json))
        .unwrap_or(0)
}

fn clip_content(content: &str, max_tokens: usize) -> String {
    clip_chars(content, max_tokens * CHARS_PER_TOKEN)
}

fn clip_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_owned();
    }
    let marker = CLIP_MARKER.chars().count();
    if max_chars <= marker {
        return content.chars().take(max_chars).collect();
    }
    let mut clipped: String = content.chars().take(max_chars - marker).collect();
    clipped.push_str(CLIP_MARKER);
    clipped
}

fn longest_string(value: &Value) -> usize {
    match value {
        Value::String(text) => text.chars().count(),
        Value::Array(items) => items.iter().map(longest_string).max().unwrap_or(0),
        Value::Object(fields) => fields.values().map(longest_string).max().unwrap_or(0),
        _ => 0,
    }
}

fn clip_strings(value: &mut Value, max_chars: usize) {
    match value {
        Value::String(text) => {
            if text.chars().count() > max_chars {
                *text = clip_chars(text, max_chars);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| clip_strings(item, max_chars)),
        Value::Object(fields) => fields
            .values_mut()
            .for_each(|field| clip_strings(field, max_chars)),
        _ => {}
    }
}

/// Copy of `calls` with every argument string cut to `max_chars`.
fn clip_call_arguments(calls: &[ToolCall], max_chars: usize) -> Vec<ToolCall> {
    let mut calls = calls.to_vec();
    for call in &mut calls {
        clip_strings(&mut call.arguments, max_chars);
    }
    calls
}

/// Clip the argument strings of `calls` just enough to save `excess` tokens,
/// or as far as they go.
fn shrink_calls(calls: &[ToolCall], excess: usize) -> Vec<ToolCall> {
    let before = calls_tokens(calls);
    let saves_enough =
        |cap: usize| before.saturating_sub(calls_tokens(&clip_call_arguments(calls, cap))) >= excess;
    let mut low = 0;
    let mut high = calls
        .iter()
        .map(|call| longest_string(&call.arguments))
        .max()
        .unwrap_or(0);
    while low < high {
        let mid = (low + high).div_ceil(2);
        if saves_enough(mid) {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    clip_call_arguments(calls, low)
}

/// Which history positions go into a view, with replacement contents and
/// tool calls for clipped ones.
#[derive(Debug, Default)]
struct Plan {
    included: Vec<usize>,
    evicted: Vec<usize>,
    clipped: HashMap<usize, String>,
    clipped_calls: HashMap<usize, Vec<ToolCall>>,
}

#[derive(Debug)]
pub struct ContextWindow {
    config: ContextConfig,
    messages: Vec<Message>,
    positions: HashMap<MessageId, usize>,
    issued_calls: HashMap<ToolCallId, usize>,
    answered_calls: HashSet<ToolCallId>,
    summary: Option<(usize, Message)>,
}

impl ContextWindow {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
            positions: HashMap::new(),
            issued_calls: HashMap::new(),
            answered_calls: HashSet::new(),
            summary: None,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn has_call(&self, id: &ToolCallId) -> bool {
        self.issued_calls.contains_key(id)
    }

    /// Calls issued but not yet answered, in the order they were issued.
    pub fn unanswered_calls(&self) -> Vec<ToolCallId> {
        self.messages
            .iter()
            .flat_map(|message| &message.tool_calls)
            .filter(|call| !self.answered_calls.contains(&call.id))
            .map(|call| call.id.clone())
            .collect()
    }

    /// Ids of the newest `window` messages, used as provenance when a call
    /// arrives without a usable one.
    pub fn recent_ids(&self, window: usize) -> BTreeSet<MessageId> {
        let start = self.messages.len().saturating_sub(window);
        self.messages[start..]
            .iter()
            .map(|message| message.id.clone())
            .collect()
    }

    /// Append one message, rejecting anything that would break the history's
    /// invariants: provenance may only point backwards, every tool result
    /// answers a call issued earlier, and no call is answered twice.
    pub fn append(&mut self, message: Message) -> KernelResult<()> {
        if self.positions.contains_key(&message.id) {
            return Err(KernelError::InvalidState(format!(
                "message {} already appended",
                message.id
            )));
        }

        let mut new_calls = HashSet::new();
        for call in &message.tool_calls {
            if let Some(missing) = call.provenance.iter().find(|id| !self.contains(id)) {
                return Err(KernelError::InvalidProvenance(format!(
                    "call {} references unknown message {missing}",
                    call.id
                )));
            }
            if self.issued_calls.contains_key(&call.id) || !new_calls.insert(call.id.clone()) {
                return Err(KernelError::InvalidState(format!(
                    "tool call id {} reused",
                    call.id
                )));
            }
        }

        match (&message.role, &message.tool_result) {
            (Role::Tool, Some(result)) => {
                if !self.issued_calls.contains_key(&result.call_id) {
                    return Err(KernelError::InvalidState(format!(
                        "tool result for unknown call {}",
                        result.call_id
                    )));
                }
                if self.answered_calls.contains(&result.call_id) {
                    return Err(KernelError::DuplicateToolResult(result.call_id.to_string()));
                }
            }
            (Role::Tool, None) => {
                return Err(KernelError::InvalidState(
                    "tool message without a result".to_owned(),
                ));
            }
            _ => {}
        }

        let position = self.messages.len();
        for call in &message.tool_calls {
            self.issued_calls.insert(call.id.clone(), position);
        }
        if let Some(result) = &message.tool_result {
            self.answered_calls.insert(result.call_id.clone());
        }
        self.positions.insert(message.id.clone(), position);
        self.messages.push(message);
        Ok(())
    }

    pub fn estimate_message(&self, message: &Message) -> usize {
        self.content_tokens(&message.content) + self.fixed_tokens(message)
    }

    pub fn estimate(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    fn content_tokens(&self, content: &str) -> usize {
        text_tokens(content)
    }

    /// Cost of a message beyond its content.
    fn fixed_tokens(&self, message: &Message) -> usize {
        calls_tokens(&message.tool_calls) + self.config.per_message_overhead
    }

    fn protected(&self) -> Vec<bool> {
        let mut protected = vec![false; self.messages.len()];
        let last_user = self.messages.iter().rposition(|m| m.role == Role::User);
        if let Some(user) = last_user {
            protected[user] = true;
        }
        let pending_issuer = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
            .filter(|assistant| !self.messages[*assistant].tool_calls.is_empty())
            .filter(|assistant| last_user.is_none_or(|user| *assistant > user));
        if let Some(assistant) = pending_issuer {
            protected[assistant] = true;
            for (offset, message) in self.messages[assistant + 1..].iter().enumerate() {
                if message.role == Role::Tool {
                    protected[assistant + 1 + offset] = true;
                }
            }
        }
        protected
    }

    fn plan(&self, budget: usize) -> Plan {
        let count = self.messages.len();
        let protected = self.protected();
        let mut keep = vec![false; count];
        let mut used = 0;
        for (index, message) in self.messages.iter().enumerate() {
            if message.role == Role::System || protected[index] {
                keep[index] = true;
                used += self.estimate_message(message);
            }
        }

        let mut clipped = HashMap::new();
        let mut clipped_calls = HashMap::new();
        if used > budget {
            let mut candidates: Vec<usize> = (0..count).filter(|i| keep[*i]).collect();
            candidates.sort_by_key(|i| {
                std::cmp::Reverse(self.content_tokens(&self.messages[*i].content))
            });
            let mut excess = used - budget;
            for &index in &candidates {
                if excess == 0 {
                    break;
                }
                let message = &self.messages[index];
                let before = self.content_tokens(&message.content);
                let cut = before.min(excess);
                if cut == 0 {
                    continue;
                }
                let content = clip_content(&message.content, before - cut);
                let after = self.content_tokens(&content);
                excess = excess.saturating_sub(before - after);
                clipped.insert(index, content);
            }
            // Proposed call arguments can be as large as any content.
            for index in candidates {
                if excess == 0 {
                    break;
                }
                let calls = &self.messages[index].tool_calls;
                if calls.is_empty() {
                    continue;
                }
                let before = calls_tokens(calls);
                let shrunk = shrink_calls(calls, excess);
                excess = excess.saturating_sub(before.saturating_sub(calls_tokens(&shrunk)));
                clipped_calls.insert(index, shrunk);
            }
            warn!(
                budget,
                required = used,
                clipped = clipped.len() + clipped_calls.len(),
                "protected messages exceed the context budget, clipping"
            );
        } else {
            let mut remaining = budget - used;
            for index in (0..count).rev() {
                if keep[index] {
                    continue;
                }
                let cost = self.estimate_message(&self.messages[index]);
                if cost > remaining {
                    break;
                }
                keep[index] = true;
                remaining -= cost;
            }
        }

        for index in 0..count {
            let message = &self.messages[index];
            if !keep[index] || protected[index] || message.role != Role::Tool {
                continue;
            }
            let issuer = message
                .tool_result
                .as_ref()
                .and_then(|result| self.issued_calls.get(&result.call_id));
            if !issuer.is_some_and(|position| keep[*position]) {
                keep[index] = false;
            }
        }

        let (included, evicted): (Vec<usize>, Vec<usize>) = (0..count).partition(|i| keep[*i]);
        Plan {
            included,
            evicted,
            clipped,
            clipped_calls,
        }
    }

    fn materialize(&self, plan: &Plan, summary: Option<&Message>) -> Vec<Message> {
        let render = |index: &usize| {
            let mut message = self.messages[*index].clone();
            if let Some(content) = plan.clipped.get(index) {
                message.content = content.clone();
            }
            if let Some(calls) = plan.clipped_calls.get(index) {
                message.tool_calls = calls.clone();
            }
            message
        };
        let mut view: Vec<Message> = plan
            .included
            .iter()
            .filter(|i| self.messages[**i].role == Role::System)
            .map(render)
            .collect();
        view.extend(summary.cloned());
        view.extend(
            plan.included
                .iter()
                .filter(|i| self.messages[**i].role != Role::System)
                .map(render),
        );
        view
    }

    /// Token-bounded view by hard truncation.
    pub fn snapshot(&self) -> Vec<Message> {
        let plan = self.plan(self.config.max_tokens);
        if !plan.evicted.is_empty() {
            debug!(
                evicted = plan.evicted.len(),
                included = plan.included.len(),
                "context truncated"
            );
        }
        self.materialize(&plan, None)
    }

    /// Like [`ContextWindow::snapshot`], but with the evicted prefix replaced
    /// by a summary from the model when summarisation is enabled. Summaries
    /// are cached per evicted-prefix length; any failure falls back to plain
    /// truncation.
    pub async fn snapshot_for_model(&mut self, model: &dyn ModelProviderPort) -> Vec<Message> {
        let full = self.plan(self.config.max_tokens);
        if !self.config.summarize || full.evicted.is_empty() {
            return self.materialize(&full, None);
        }

        let reserve = (self.config.max_tokens / 8).max(self.config.per_message_overhead + 1);
        let reduced = self.plan(self.config.max_tokens.saturating_sub(reserve));
        if reduced.evicted.is_empty() {
            return self.materialize(&full, None);
        }

        let key = reduced.evicted.len();
        if let Some((cached_key, summary)) = &self.summary {
            if *cached_key == key {
                return self.materialize(&reduced, Some(summary));
            }
        }

        let evicted: Vec<Message> = reduced
            .evicted
            .iter()
            .map(|index| self.messages[*index].clone())
            .collect();
        match timeout(self.config.summary_timeout, model.summarize(&evicted)).await {
            Ok(Ok(text)) => {
                let content = clip_content(
                    &format!("Summary of earlier conversation:\n{text}"),
                    reserve - self.config.per_message_overhead,
                );
                let summary = Message::system(content);
                debug!(evicted = key, "context prefix summarised");
                let view = self.materialize(&reduced, Some(&summary));
                self.summary = Some((key, summary));
                view
            }
            Ok(Err(error)) => {
                warn!(%error, "summarisation failed, truncating instead");
                self.materialize(&full, None)
            }
            Err(_) => {
                warn!(
                    timeout_ms = u64::try_from(self.config.summary_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "summarisation timed out, truncating instead"
                );
                self.materialize(&full, None)
            }
        }
    }
}

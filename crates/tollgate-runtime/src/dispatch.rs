use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tollgate_escalation::{EscalationDispatcher, EscalationOutcome};
use tollgate_gate::{EscalationRefusal, GateDecision, ToolInvocationGate};
use tollgate_protocol::{EscalationRequest, SessionId, ToolCall, ToolResult};
use tollgate_tools::ToolRegistry;
use tracing::{Instrument, debug, info_span, warn};

use crate::context::ContextWindow;

/// Everything one tool call passes through: registry lookup, gate,
/// escalation, execution.
#[derive(Clone)]
pub(crate) struct CallPipeline {
    pub(crate) gate: ToolInvocationGate,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) escalation: EscalationDispatcher,
}

impl CallPipeline {
    pub(crate) async fn process(&self, session_id: &SessionId, call: ToolCall) -> ToolResult {
        let span = info_span!(
            "tool.dispatch",
            session_id = %session_id,
            call_id = %call.id,
            tool = %call.tool_name,
            provenance = call.provenance.len()
        );
        self.decide_and_run(session_id, call).instrument(span).await
    }

    async fn decide_and_run(&self, session_id: &SessionId, call: ToolCall) -> ToolResult {
        let resolved = self.registry.resolve(&call.tool_name);
        let handle = resolved.handle.as_ref();
        match self.gate.evaluate(session_id, call, resolved.metadata.clone()).await {
            GateDecision::Allow(allowed) => self.gate.execute(allowed, handle).await,
            GateDecision::Deny(denied) => self.gate.refuse(denied),
            GateDecision::Escalate(escalated) => {
                let request = EscalationRequest {
                    session_id: session_id.clone(),
                    call: escalated.call().clone(),
                    metadata: escalated.metadata().clone(),
                    prompt: escalated.prompt().to_owned(),
                };
                match self.escalation.dispatch(&request).await {
                    EscalationOutcome::Approved => {
                        self.gate.execute(escalated.approve(), handle).await
                    }
                    EscalationOutcome::Denied => self
                        .gate
                        .refuse_escalation(escalated, EscalationRefusal::Denied),
                    EscalationOutcome::TimedOut { after } => self
                        .gate
                        .refuse_escalation(escalated, EscalationRefusal::TimedOut { after }),
                }
            }
        }
    }
}

fn root(parent: &mut [usize], mut index: usize) -> usize {
    while parent[index] != index {
        parent[index] = parent[parent[index]];
        index = parent[index];
    }
    index
}

/// Partition calls into groups connected through shared provenance.
pub(crate) fn provenance_groups(calls: &[ToolCall]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..calls.len()).collect();
    for a in 0..calls.len() {
        for b in a + 1..calls.len() {
            if calls[a].shares_provenance_with(&calls[b]) {
                let (ra, rb) = (root(&mut parent, a), root(&mut parent, b));
                if ra != rb {
                    parent[ra.max(rb)] = ra.min(rb);
                }
            }
        }
    }
    let mut groups: IndexMap<usize, Vec<usize>> = IndexMap::new();
    for index in 0..calls.len() {
        let group = root(&mut parent, index);
        groups.entry(group).or_default().push(index);
    }
    groups.into_values().collect()
}

/// Call indices in the order their results are recorded: earliest
/// provenance position first (calls without provenance lead), then call
/// order.
pub(crate) fn recording_order(calls: &[ToolCall], context: &ContextWindow) -> Vec<usize> {
    let mut order: Vec<usize> = (0..calls.len()).collect();
    order.sort_by_key(|index| {
        let earliest = calls[*index]
            .provenance
            .iter()
            .filter_map(|id| context.position(id))
            .min();
        (earliest, *index)
    });
    order
}

/// Run every call of one turn and return the results in `order`.
///
/// Independent groups run concurrently, bounded by `max_parallel`; calls in
/// one group run one after another in `order`. Dropping the returned future
/// aborts whatever is still running.
pub(crate) async fn dispatch_calls(
    pipeline: &CallPipeline,
    session_id: &SessionId,
    calls: &[ToolCall],
    order: &[usize],
    max_parallel: usize,
) -> Vec<ToolResult> {
    let mut rank = vec![0; calls.len()];
    for (position, index) in order.iter().enumerate() {
        rank[*index] = position;
    }

    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut tasks = JoinSet::new();
    let groups = provenance_groups(calls);
    debug!(calls = calls.len(), groups = groups.len(), "dispatching tool calls");
    for mut group in groups {
        group.sort_by_key(|index| rank[*index]);
        let members: Vec<(usize, ToolCall)> = group
            .into_iter()
            .map(|index| (index, calls[index].clone()))
            .collect();
        let pipeline = pipeline.clone();
        let semaphore = semaphore.clone();
        let session_id = session_id.clone();
        tasks.spawn(async move {
            let mut results = Vec::with_capacity(members.len());
            for (index, call) in members {
                let _permit = semaphore.acquire().await.ok();
                results.push((index, pipeline.process(&session_id, call).await));
            }
            results
        });
    }

    let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(results) => {
                for (index, result) in results {
                    slots[index] = Some(result);
                }
            }
            Err(error) => warn!(%error, "tool dispatch task failed"),
        }
    }

    order
        .iter()
        .map(|index| {
            slots[*index]
                .take()
                .unwrap_or_else(|| ToolResult::error(calls[*index].id.clone(), "tool dispatch failed"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tollgate_protocol::{Message, MessageId};

    use super::*;
    use crate::context::ContextConfig;

    fn call(ids: &[&MessageId]) -> ToolCall {
        ToolCall::new("t", json!({}), ids.iter().map(|id| (*id).clone()))
    }

    #[test]
    fn groups_follow_transitive_sharing() {
        let (m1, m2, m3, m4) = (
            MessageId::from_string("m1"),
            MessageId::from_string("m2"),
            MessageId::from_string("m3"),
            MessageId::from_string("m4"),
        );
        let calls = vec![
            call(&[&m1]),
            call(&[&m3]),
            call(&[&m1, &m2]),
            call(&[&m2]),
            call(&[&m4]),
            call(&[]),
        ];
        assert_eq!(
            provenance_groups(&calls),
            vec![vec![0, 2, 3], vec![1], vec![4], vec![5]]
        );
    }

    #[test]
    fn recording_order_uses_earliest_provenance_then_index() {
        let mut ctx = ContextWindow::new(ContextConfig::default());
        let first = Message::system("sys");
        let second = Message::user("hi");
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        ctx.append(first).unwrap();
        ctx.append(second).unwrap();

        let calls = vec![
            call(&[&second_id]),
            call(&[&second_id, &first_id]),
            call(&[]),
            call(&[&first_id]),
        ];
        assert_eq!(recording_order(&calls, &ctx), vec![2, 1, 3, 0]);
    }
}

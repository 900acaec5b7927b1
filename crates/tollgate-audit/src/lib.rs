use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tollgate_protocol::{AuditEvent, AuditRecord};
use tracing::{debug, instrument, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Clone, Debug)]
pub struct AuditStreamHub {
    sender: broadcast::Sender<AuditRecord>,
}

impl AuditStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, record: AuditRecord) {
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<AuditRecord> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

#[derive(Debug)]
struct QueueState {
    pending: IndexMap<u64, AuditRecord>,
    next_sequence: u64,
    capacity: usize,
    dropped: u64,
}

/// Outbound audit events waiting to be pushed to a policy server.
///
/// Events are keyed by a monotonically increasing sequence number and kept in
/// insertion order. Once `capacity` is exceeded the oldest pending event is
/// discarded and the dropped counter is incremented.
#[derive(Clone, Debug)]
pub struct AuditQueue {
    state: Arc<Mutex<QueueState>>,
    stream: AuditStreamHub,
}

impl AuditQueue {
    pub fn new(capacity: usize, stream: AuditStreamHub) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: IndexMap::new(),
                next_sequence: 1,
                capacity: capacity.max(1),
                dropped: 0,
            })),
            stream,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, AuditStreamHub::new(1024))
    }

    /// Assign the next sequence number and enqueue. Returns the sequence.
    pub fn push(&self, event: AuditEvent) -> u64 {
        let record = {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let record = AuditRecord { sequence, event };
            state.pending.insert(sequence, record.clone());

            while state.pending.len() > state.capacity {
                if let Some((dropped_sequence, _)) = state.pending.shift_remove_index(0) {
                    state.dropped += 1;
                    warn!(
                        dropped_sequence,
                        dropped_total = state.dropped,
                        capacity = state.capacity,
                        "audit queue full, dropped oldest event"
                    );
                }
            }
            record
        };
        let sequence = record.sequence;
        self.stream.publish(record);
        sequence
    }

    /// Oldest-first copy of at most `max` pending events. Events stay queued
    /// until [`AuditQueue::acknowledge`] removes them.
    pub fn batch(&self, max: usize) -> Vec<AuditRecord> {
        self.state
            .lock()
            .pending
            .values()
            .take(max)
            .cloned()
            .collect()
    }

    /// Remove pushed events. Sequences already dropped are ignored.
    pub fn acknowledge(&self, sequences: impl IntoIterator<Item = u64>) -> usize {
        let mut state = self.state.lock();
        sequences
            .into_iter()
            .filter(|sequence| state.pending.shift_remove(sequence).is_some())
            .count()
    }

    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.state.lock().pending.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.stream.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<AuditRecord> {
        self.stream.subscribe_stream()
    }
}

/// Append-only JSONL file holding every audit record this process produced.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create audit log dir {parent:?}"))?;
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(sequence = record.sequence, path = %self.path.display()))]
    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        Self::ensure_parent(&self.path).await?;
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed opening audit log {:?}", self.path))?;

        let line = serde_json::to_string(record).context("failed serializing audit record")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        debug!("audit record appended");
        Ok(())
    }

    pub async fn read_all(&self) -> Result<Vec<AuditRecord>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing audit line in {:?}", self.path))?;
            out.push(record);
        }
        Ok(out)
    }
}

/// Mirror every queued record into `sink` until the queue's stream closes.
pub fn spawn_audit_log(queue: &AuditQueue, sink: Arc<JsonlAuditSink>) -> JoinHandle<()> {
    let mut records = queue.subscribe_stream();
    tokio::spawn(async move {
        while let Some(next) = records.next().await {
            match next {
                Ok(record) => {
                    if let Err(error) = sink.append(&record).await {
                        warn!(%error, sequence = record.sequence, "failed writing audit log");
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "audit log writer lagged behind the queue");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use chrono::Utc;
    use serde_json::json;
    use tokio::fs;
    use tollgate_protocol::{
        AuditEvent, PolicySetId, PolicyVerdict, SessionId, ToolCall, ToolOutcome,
    };

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn event(tool: &str) -> AuditEvent {
        AuditEvent {
            session_id: SessionId::from_string("s1"),
            call: ToolCall::new(tool, json!({}), []),
            verdict: PolicyVerdict::Allow,
            outcome: ToolOutcome::Success,
            latency_ms: 1,
            policy_set_id: PolicySetId::builtin(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn batch_preserves_insertion_order() {
        let queue = AuditQueue::with_capacity(16);
        for tool in ["a", "b", "c", "d"] {
            queue.push(event(tool));
        }

        let batch = queue.batch(3);
        let names: Vec<_> = batch.iter().map(|r| r.event.call.tool_name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(
            batch.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            [1, 2, 3]
        );
        assert_eq!(queue.len(), 4, "batch must not remove events");
    }

    #[test]
    fn acknowledge_removes_only_pushed_events() {
        let queue = AuditQueue::with_capacity(16);
        for tool in ["a", "b", "c"] {
            queue.push(event(tool));
        }
        let batch = queue.batch(2);
        assert_eq!(queue.acknowledge(batch.iter().map(|r| r.sequence)), 2);

        let remaining = queue.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event.call.tool_name, "c");
        assert_eq!(queue.acknowledge([1, 2]), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let queue = AuditQueue::with_capacity(3);
        for i in 0..10 {
            queue.push(event(&format!("tool-{i}")));
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.dropped(), 7);
        let names: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|r| r.event.call.tool_name)
            .collect();
        assert_eq!(names, ["tool-7", "tool-8", "tool-9"]);
    }

    #[tokio::test]
    async fn subscribers_see_every_record() -> Result<()> {
        let queue = AuditQueue::with_capacity(2);
        let mut rx = queue.subscribe();
        queue.push(event("a"));
        queue.push(event("b"));
        queue.push(event("c"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await?.sequence);
        }
        assert_eq!(seen, [1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn jsonl_sink_round_trips_records() -> Result<()> {
        let root = unique_test_root("tollgate-audit");
        let sink = JsonlAuditSink::new(root.join("audit.jsonl"));
        let queue = AuditQueue::with_capacity(8);
        queue.push(event("filesystem_read"));
        queue.push(event("http_fetch"));

        for record in queue.snapshot() {
            sink.append(&record).await?;
        }

        let read = sink.read_all().await?;
        assert_eq!(read.len(), 2);
        assert_eq!(read[1].event.call.tool_name, "http_fetch");
        assert_eq!(read[1].sequence, 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn audit_log_writer_mirrors_queue() -> Result<()> {
        let root = unique_test_root("tollgate-audit-writer");
        let sink = Arc::new(JsonlAuditSink::new(root.join("audit.jsonl")));
        let queue = AuditQueue::with_capacity(8);
        let writer = spawn_audit_log(&queue, sink.clone());

        queue.push(event("filesystem_read"));
        for _ in 0..50 {
            if !sink.read_all().await?.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(sink.read_all().await?.len(), 1);

        writer.abort();
        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}

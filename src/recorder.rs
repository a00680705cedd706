//! Append-only event trail for dialogue runs.
//!
//! The engine reports every turn and tool call as it happens so that aborted
//! runs still leave a complete trail. Recording is fire-and-forget: the
//! engine never waits on storage and never sees its failures.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};

use crate::{
    config::RetryPolicy,
    conversation::{ConversationRecord, TerminalState, ToolCall, Turn, Usage},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordedEvent {
    ToolCall {
        run_id: String,
        recorded_at: DateTime<Utc>,
        turn_index: usize,
        call_index: usize,
        call: ToolCall,
    },
    Turn {
        run_id: String,
        recorded_at: DateTime<Utc>,
        turn: Turn,
    },
    Outcome {
        run_id: String,
        recorded_at: DateTime<Utc>,
        scenario_id: String,
        version: String,
        terminal_state: TerminalState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
        usage: Usage,
        cost_usd: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EventKind {
    ToolCall,
    Turn,
    Outcome,
}

/// Identity of an event; a second event with the same key is a retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    run_id: String,
    kind: EventKind,
    turn_index: Option<usize>,
    call_index: Option<usize>,
}

impl RecordedEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RecordedEvent::ToolCall { run_id, .. }
            | RecordedEvent::Turn { run_id, .. }
            | RecordedEvent::Outcome { run_id, .. } => run_id,
        }
    }

    pub fn key(&self) -> EventKey {
        let (kind, turn_index, call_index) = match self {
            RecordedEvent::ToolCall {
                turn_index,
                call_index,
                ..
            } => (EventKind::ToolCall, Some(*turn_index), Some(*call_index)),
            RecordedEvent::Turn { turn, .. } => (EventKind::Turn, Some(turn.index), None),
            RecordedEvent::Outcome { .. } => (EventKind::Outcome, None, None),
        };
        EventKey {
            run_id: self.run_id().to_string(),
            kind,
            turn_index,
            call_index,
        }
    }

    fn outcome(record: &ConversationRecord) -> Option<Self> {
        let terminal_state = record.terminal_state()?;
        Some(RecordedEvent::Outcome {
            run_id: record.run_id.clone(),
            recorded_at: Utc::now(),
            scenario_id: record.scenario_id.clone(),
            version: record.version.clone(),
            terminal_state,
            error: record.error.clone(),
            duration_ms: record.duration_ms,
            usage: record.usage,
            cost_usd: record.cost_usd,
        })
    }
}

/// Sink for dialogue events. Implementations must be idempotent on the event
/// key and must not block.
pub trait EventRecorder: Send + Sync {
    fn append(&self, event: RecordedEvent);

    fn record_tool_call(&self, run_id: &str, turn_index: usize, call_index: usize, call: &ToolCall) {
        self.append(RecordedEvent::ToolCall {
            run_id: run_id.to_string(),
            recorded_at: Utc::now(),
            turn_index,
            call_index,
            call: call.clone(),
        });
    }

    fn record_turn(&self, run_id: &str, turn: &Turn) {
        self.append(RecordedEvent::Turn {
            run_id: run_id.to_string(),
            recorded_at: Utc::now(),
            turn: turn.clone(),
        });
    }

    /// Records the terminal state; ignored for records that are not finalized.
    fn record_outcome(&self, record: &ConversationRecord) {
        if let Some(event) = RecordedEvent::outcome(record) {
            self.append(event);
        }
    }
}

/// Remembers event keys per run until the run's outcome is admitted. After
/// that only the run id is kept, and every later event for it is a retry.
#[derive(Debug, Default)]
struct EventLedger {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    open: HashMap<String, HashSet<EventKey>>,
    closed: HashSet<String>,
}

impl LedgerState {
    fn admit(&mut self, event: &RecordedEvent) -> bool {
        let run_id = event.run_id();
        if self.closed.contains(run_id) {
            return false;
        }
        if let RecordedEvent::Outcome { .. } = event {
            self.open.remove(run_id);
            self.closed.insert(run_id.to_string());
            return true;
        }
        self.open
            .entry(run_id.to_string())
            .or_default()
            .insert(event.key())
    }
}

impl EventLedger {
    /// Returns `true` the first time a key is offered.
    fn admit(&self, event: &RecordedEvent) -> bool {
        match self.state.lock() {
            Ok(mut state) => state.admit(event),
            Err(poisoned) => poisoned.into_inner().admit(event),
        }
    }

    #[cfg(test)]
    fn open_keys(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.open.values().map(HashSet::len).sum())
            .unwrap_or_default()
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl EventRecorder for NullRecorder {
    fn append(&self, _event: RecordedEvent) {}
}

/// Keeps the trail in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    ledger: EventLedger,
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_for(&self, run_id: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.run_id() == run_id)
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn append(&self, event: RecordedEvent) {
        if !self.ledger.admit(&event) {
            return;
        }
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

enum WriterCommand {
    Append(RecordedEvent),
    Flush(oneshot::Sender<()>),
}

/// Writes one JSON line per event to `<dir>/<run_id>.jsonl` from a
/// background task. Failed writes are retried with backoff inside that task
/// and logged; callers are never blocked.
pub struct JsonlRecorder {
    dir: PathBuf,
    ledger: EventLedger,
    sender: mpsc::UnboundedSender<WriterCommand>,
}

impl JsonlRecorder {
    /// Starts the writer task. Must be called inside a tokio runtime.
    pub fn spawn(dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        let dir = dir.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(dir.clone(), retry, receiver));

        Self {
            dir,
            ledger: EventLedger::default(),
            sender,
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        trail_path(&self.dir, run_id)
    }

    /// Waits until every event queued so far has been written or given up on.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(WriterCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

impl EventRecorder for JsonlRecorder {
    fn append(&self, event: RecordedEvent) {
        if !self.ledger.admit(&event) {
            return;
        }
        if self.sender.send(WriterCommand::Append(event)).is_err() {
            tracing::error!("event writer task has stopped; dropping event");
        }
    }
}

fn trail_path(dir: &Path, run_id: &str) -> PathBuf {
    let safe: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{safe}.jsonl"))
}

async fn writer_loop(
    dir: PathBuf,
    retry: RetryPolicy,
    mut receiver: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            WriterCommand::Append(event) => write_with_retry(&dir, &retry, &event).await,
            WriterCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn write_with_retry(dir: &Path, retry: &RetryPolicy, event: &RecordedEvent) {
    let mut line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(error) => {
            tracing::error!(run_id = event.run_id(), %error, "event is not serializable");
            return;
        }
    };
    line.push('\n');
    let path = trail_path(dir, event.run_id());

    let mut attempt = 0;
    loop {
        attempt += 1;
        match append_line(dir, &path, &line).await {
            Ok(()) => return,
            Err(error) if attempt < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    ?delay,
                    %error,
                    "event write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                tracing::error!(
                    path = %path.display(),
                    attempt,
                    %error,
                    "giving up on event write"
                );
                return;
            }
        }
    }
}

async fn append_line(dir: &Path, path: &Path, line: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Reads a trail written by [`JsonlRecorder`].
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<RecordedEvent>, std::io::Error> {
    let file = fs::File::open(path)?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        events.push(event);
    }
    Ok(events)
}

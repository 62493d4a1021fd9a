//! Append-only execution log.
//!
//! Entries are buffered in memory and flushed to a [`LogSink`]. A sink failure
//! never loses an entry: it stays queued and is retried on the next
//! `record`/`flush`.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::board::Board;
use crate::core::types::{
    ExecutionLogEntry, LogEvent, LogId, Metadata, StoryId, StoryStatus,
};

/// Durable destination for log entries.
pub trait LogSink: Send + Sync {
    fn append(&self, entries: &[ExecutionLogEntry]) -> Result<()>;
    fn load(&self) -> Result<Vec<ExecutionLogEntry>>;
}

/// One JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlLogSink {
    path: PathBuf,
}

impl JsonlLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LogSink for JsonlLogSink {
    fn append(&self, entries: &[ExecutionLogEntry]) -> Result<()> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry).context("serialize log entry")?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open log {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append log {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush log {}", self.path.display()))?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<ExecutionLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read log {}", self.path.display()))?;
        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: ExecutionLogEntry = serde_json::from_str(line)
                .with_context(|| format!("parse log {} line {}", self.path.display(), idx + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Fields of a log entry before it is assigned an id and timestamp.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub story: StoryId,
    pub event: LogEvent,
    pub details: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<Metadata>,
}

impl LogRecord {
    pub fn new(story: StoryId, event: LogEvent) -> Self {
        Self {
            story,
            event,
            details: None,
            error_message: None,
            metadata: None,
        }
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.to_string(), value.into());
        self
    }
}

pub struct ExecutionLog {
    sink: Arc<dyn LogSink>,
    history: Vec<ExecutionLogEntry>,
    pending: Vec<ExecutionLogEntry>,
    last_id: u64,
    last_timestamp: HashMap<StoryId, DateTime<Utc>>,
}

impl std::fmt::Debug for ExecutionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLog")
            .field("entries", &self.history.len())
            .field("pending", &self.pending.len())
            .field("last_id", &self.last_id)
            .finish_non_exhaustive()
    }
}

impl ExecutionLog {
    /// Load existing history from `sink`.
    ///
    /// Entries duplicated by a partially retried append are kept once.
    pub fn open(sink: Arc<dyn LogSink>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut history = Vec::new();
        for entry in sink.load()? {
            if seen.insert(entry.id) {
                history.push(entry);
            }
        }
        let last_id = history.iter().map(|entry| entry.id.0).max().unwrap_or(0);
        let mut last_timestamp: HashMap<StoryId, DateTime<Utc>> = HashMap::new();
        for entry in &history {
            let slot = last_timestamp.entry(entry.story_id).or_insert(entry.timestamp);
            *slot = (*slot).max(entry.timestamp);
        }
        debug!(entries = history.len(), last_id, "execution log opened");
        Ok(Self {
            sink,
            history,
            pending: Vec::new(),
            last_id,
            last_timestamp,
        })
    }

    /// Append an entry. Always succeeds locally; persistence is best effort
    /// until the next successful flush.
    pub fn record(&mut self, record: LogRecord, now: DateTime<Utc>) -> LogId {
        self.last_id += 1;
        let id = LogId(self.last_id);
        let timestamp = match self.last_timestamp.get(&record.story) {
            Some(last) if *last > now => *last,
            _ => now,
        };
        self.last_timestamp.insert(record.story, timestamp);
        let entry = ExecutionLogEntry {
            id,
            story_id: record.story,
            event: record.event,
            timestamp,
            details: record.details,
            error_message: record.error_message,
            metadata: record.metadata,
        };
        debug!(story = %entry.story_id, event = %entry.event, id = %id, "log entry recorded");
        self.history.push(entry.clone());
        self.pending.push(entry);
        if let Err(err) = self.flush() {
            warn!(err = %format!("{err:#}"), pending = self.pending.len(), "log flush failed, will retry");
        }
        id
    }

    /// Push queued entries to the sink.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.pending)?;
        self.pending.clear();
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn entries(&self) -> &[ExecutionLogEntry] {
        &self.history
    }

    /// History of `story`, ordered by (timestamp, id).
    pub fn query_by_story(&self, story: StoryId) -> Vec<ExecutionLogEntry> {
        let mut entries: Vec<ExecutionLogEntry> = self
            .history
            .iter()
            .filter(|entry| entry.story_id == story)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        entries
    }

    /// True if a prior run of `story` created `branch`.
    pub fn story_created_branch(&self, story: StoryId, branch: &str) -> bool {
        self.history.iter().any(|entry| {
            entry.story_id == story
                && entry.event == LogEvent::BranchCreated
                && entry
                    .metadata
                    .as_ref()
                    .and_then(|meta| meta.get("branch"))
                    .and_then(Value::as_str)
                    == Some(branch)
        })
    }

    /// Branch and path of the worktree `story` created and has not removed since.
    pub fn live_worktree(&self, story: StoryId) -> Option<(String, PathBuf)> {
        let last = self
            .query_by_story(story)
            .into_iter()
            .rev()
            .find(|entry| {
                matches!(
                    entry.event,
                    LogEvent::WorktreeCreated | LogEvent::WorktreeRemoved
                )
            })?;
        if last.event != LogEvent::WorktreeCreated {
            return None;
        }
        let meta = last.metadata.as_ref()?;
        let branch = meta.get("branch").and_then(Value::as_str)?;
        let path = meta.get("path").and_then(Value::as_str)?;
        Some((branch.to_string(), PathBuf::from(path)))
    }

    /// Last `Started`/`Completed`/`Failed` event for `story`.
    pub fn last_lifecycle_event(&self, story: StoryId) -> Option<LogEvent> {
        self.query_by_story(story)
            .into_iter()
            .rev()
            .map(|entry| entry.event)
            .find(|event| *event == LogEvent::Started || event.is_terminal())
    }
}

/// InProgress stories whose latest attempt never reached a terminal event.
pub fn find_orphans(board: &Board, log: &ExecutionLog) -> Vec<StoryId> {
    board
        .stories
        .values()
        .filter(|story| story.status == StoryStatus::InProgress)
        .filter(|story| {
            !log.last_lifecycle_event(story.id())
                .is_some_and(LogEvent::is_terminal)
        })
        .map(|story| story.id())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryLogSink, fixed_now, story_with_status};
    use chrono::Duration;

    fn open(sink: &Arc<MemoryLogSink>) -> ExecutionLog {
        ExecutionLog::open(sink.clone()).expect("open")
    }

    #[test]
    fn ids_increase_and_timestamps_never_go_backwards() {
        let sink = Arc::new(MemoryLogSink::default());
        let mut log = open(&sink);
        let later = fixed_now() + Duration::seconds(10);
        let a = log.record(LogRecord::new(StoryId(1), LogEvent::Started), later);
        let b = log.record(LogRecord::new(StoryId(1), LogEvent::Completed), fixed_now());
        assert!(b > a);

        let history = log.query_by_story(StoryId(1));
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].timestamp, later);
        assert_eq!(history[1].event, LogEvent::Completed);
    }

    #[test]
    fn sink_failure_keeps_entries_queued_until_flush_succeeds() {
        let sink = Arc::new(MemoryLogSink::default());
        let mut log = open(&sink);
        sink.set_failing(true);
        log.record(LogRecord::new(StoryId(1), LogEvent::Started), fixed_now());
        log.record(LogRecord::new(StoryId(1), LogEvent::Failed).error("boom"), fixed_now());
        assert_eq!(log.pending_len(), 2);
        assert!(sink.entries().is_empty());
        assert!(log.flush().is_err());

        sink.set_failing(false);
        log.flush().expect("flush");
        assert_eq!(log.pending_len(), 0);
        assert_eq!(sink.entries().len(), 2);
    }

    #[test]
    fn reopening_continues_numbering() {
        let sink = Arc::new(MemoryLogSink::default());
        let mut log = open(&sink);
        log.record(LogRecord::new(StoryId(1), LogEvent::Started), fixed_now());
        let mut reopened = open(&sink);
        let id = reopened.record(LogRecord::new(StoryId(2), LogEvent::Info), fixed_now());
        assert_eq!(id, LogId(2));
    }

    #[test]
    fn branch_ownership_needs_matching_story_and_branch() {
        let sink = Arc::new(MemoryLogSink::default());
        let mut log = open(&sink);
        log.record(
            LogRecord::new(StoryId(3), LogEvent::BranchCreated).meta("branch", "us-1-3"),
            fixed_now(),
        );
        assert!(log.story_created_branch(StoryId(3), "us-1-3"));
        assert!(!log.story_created_branch(StoryId(4), "us-1-3"));
        assert!(!log.story_created_branch(StoryId(3), "us-1-4"));
    }

    #[test]
    fn live_worktree_follows_create_and_remove() {
        let sink = Arc::new(MemoryLogSink::default());
        let mut log = open(&sink);
        let created = || {
            LogRecord::new(StoryId(5), LogEvent::WorktreeCreated)
                .meta("branch", "us-1-5")
                .meta("path", "/trees/us-1-5")
        };
        assert_eq!(log.live_worktree(StoryId(5)), None);

        log.record(created(), fixed_now());
        log.record(LogRecord::new(StoryId(5), LogEvent::Info), fixed_now());
        assert_eq!(
            log.live_worktree(StoryId(5)),
            Some(("us-1-5".to_string(), PathBuf::from("/trees/us-1-5")))
        );
        assert_eq!(log.live_worktree(StoryId(6)), None);

        log.record(LogRecord::new(StoryId(5), LogEvent::WorktreeRemoved), fixed_now());
        assert_eq!(log.live_worktree(StoryId(5)), None);
        log.record(created(), fixed_now());
        assert!(log.live_worktree(StoryId(5)).is_some());
    }

    #[test]
    fn orphans_are_in_progress_without_terminal_event() {
        let sink = Arc::new(MemoryLogSink::default());
        let mut log = open(&sink);
        let mut board = Board::default();
        for (id, status) in [
            (1, StoryStatus::InProgress),
            (2, StoryStatus::InProgress),
            (3, StoryStatus::Ready),
        ] {
            board
                .stories
                .insert(StoryId(id), story_with_status(id, 1, 1, status));
        }
        log.record(LogRecord::new(StoryId(1), LogEvent::Started), fixed_now());
        log.record(LogRecord::new(StoryId(2), LogEvent::Started), fixed_now());
        log.record(LogRecord::new(StoryId(2), LogEvent::Failed), fixed_now());
        log.record(LogRecord::new(StoryId(3), LogEvent::Started), fixed_now());

        assert_eq!(find_orphans(&board, &log), vec![StoryId(1)]);
    }

    #[test]
    fn jsonl_sink_round_trips_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = Arc::new(JsonlLogSink::new(temp.path().join("log.jsonl")));
        let mut log = ExecutionLog::open(sink.clone()).expect("open");
        log.record(
            LogRecord::new(StoryId(1), LogEvent::Info).details("hello"),
            fixed_now(),
        );
        let loaded = sink.load().expect("load");
        assert_eq!(loaded, log.entries());
    }
}

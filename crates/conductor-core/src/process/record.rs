//! Process records and their client-facing view.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bookmarks::BookmarkScope;
use crate::spawn::{ChildControl, StreamKind};

/// In-memory output capacity per process.
pub const MAX_OUTPUT_CHUNKS: usize = 1000;

/// Output chunks kept per process in the on-disk snapshot.
pub const PERSISTED_OUTPUT_CHUNKS: usize = 100;

/// Unique identifier for a process record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Error,
    Killed,
}

impl ProcessStatus {
    pub fn is_running(self) -> bool {
        self == ProcessStatus::Running
    }
}

/// One chunk of captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
}

/// Fixed-capacity chunk log; the oldest chunk goes when a new one arrives at capacity.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: OutputChunk) {
        if self.capacity == 0 {
            return;
        }
        while self.chunks.len() >= self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All chunks, oldest first.
    pub fn to_vec(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }

    /// The newest `n` chunks, oldest first.
    pub fn tail(&self, n: usize) -> Vec<OutputChunk> {
        let skip = self.chunks.len().saturating_sub(n);
        self.chunks.iter().skip(skip).cloned().collect()
    }
}

/// Links a record to the bookmark whose watch spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTag {
    pub bookmark_id: String,
    pub scope: BookmarkScope,
}

/// A tracked subprocess.
pub struct ProcessRecord {
    pub id: ProcessId,
    /// Owning key, normally the project slug.
    pub key: String,
    pub command: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub output: OutputBuffer,
    pub watch: Option<WatchTag>,
    /// Set once a kill was requested, so a signal death reads as `killed`.
    pub kill_requested: bool,
    /// OS handle; `None` for restored or failed records.
    pub(crate) control: Option<ChildControl>,
}

impl ProcessRecord {
    pub fn is_watch(&self) -> bool {
        self.watch.is_some()
    }

    /// Client-facing view, omitting OS handles.
    pub fn serialize(&self) -> ProcessView {
        self.view_with_output(self.output.to_vec())
    }

    pub(crate) fn persisted_view(&self, chunks: usize) -> ProcessView {
        self.view_with_output(self.output.tail(chunks))
    }

    fn view_with_output(&self, output: Vec<OutputChunk>) -> ProcessView {
        ProcessView {
            id: self.id.clone(),
            project_slug: self.key.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            pid: self.pid,
            status: self.status,
            started_at: self.started_at,
            exit_code: self.exit_code,
            signal: self.exit_signal.clone(),
            output,
            is_watch: self.is_watch(),
            watch_bookmark_id: self.watch.as_ref().map(|w| w.bookmark_id.clone()),
            watch_bookmark_scope: self.watch.as_ref().map(|w| w.scope),
        }
    }

    pub(crate) fn from_view(view: ProcessView, capacity: usize) -> Self {
        let mut output = OutputBuffer::new(capacity);
        for chunk in view.output {
            output.push(chunk);
        }
        let watch = match (view.watch_bookmark_id, view.watch_bookmark_scope) {
            (Some(bookmark_id), Some(scope)) => Some(WatchTag { bookmark_id, scope }),
            _ => None,
        };
        Self {
            id: view.id,
            key: view.project_slug,
            command: view.command,
            cwd: view.cwd,
            pid: view.pid,
            status: view.status,
            started_at: view.started_at,
            exit_code: view.exit_code,
            exit_signal: view.signal,
            output,
            watch,
            kill_requested: false,
            control: None,
        }
    }
}

/// Serialized form of a [`ProcessRecord`], used on the wire and in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessView {
    pub id: ProcessId,
    pub project_slug: String,
    pub command: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    #[serde(default)]
    pub output: Vec<OutputChunk>,
    #[serde(default)]
    pub is_watch: bool,
    #[serde(default)]
    pub watch_bookmark_id: Option<String>,
    #[serde(default)]
    pub watch_bookmark_scope: Option<BookmarkScope>,
}

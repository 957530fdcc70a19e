//! ProcessTable - owner of every tracked subprocess.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::record::{
    OutputBuffer, OutputChunk, ProcessId, ProcessRecord, ProcessStatus, ProcessView, WatchTag,
    MAX_OUTPUT_CHUNKS, PERSISTED_OUTPUT_CHUNKS,
};
use super::snapshot::{load_snapshot, save_snapshot, Snapshot, SnapshotError};
use crate::spawn::{ChildEvent, ChildProcess, ExitInfo, Signal, SpawnConfig, StreamKind};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Process not found: {0}")]
    NotFound(ProcessId),

    #[error("Process is still running: {0}")]
    StillRunning(ProcessId),
}

/// Settings for a [`ProcessTable`].
#[derive(Debug, Clone)]
pub struct ProcessTableConfig {
    /// Where snapshots go; `None` keeps the table in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub shell_prefix: Option<String>,
    pub default_cwd: Option<String>,
    pub max_output_chunks: usize,
    pub persist_output_chunks: usize,
}

impl Default for ProcessTableConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            shell_prefix: None,
            default_cwd: None,
            max_output_chunks: MAX_OUTPUT_CHUNKS,
            persist_output_chunks: PERSISTED_OUTPUT_CHUNKS,
        }
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub watch: Option<WatchTag>,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            watch: None,
        }
    }

    pub fn cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn watch(mut self, tag: WatchTag) -> Self {
        self.watch = Some(tag);
        self
    }
}

/// Events delivered to whoever spawned a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: StreamKind, data: String },
    /// The process could not be started.
    Failed { message: String },
    /// Terminal transition; sent at most once per record.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
        status: ProcessStatus,
    },
}

/// Result of [`ProcessTable::spawn`].
pub struct SpawnedProcess {
    pub record: ProcessView,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Owns the set of process records, keyed by owner (project slug).
///
/// All mutation goes through `&self` methods that take the lock for the
/// duration of one operation and never across an await point.
pub struct ProcessTable {
    records: Mutex<HashMap<String, Vec<ProcessRecord>>>,
    /// Held from building a snapshot until its rename lands, so an older
    /// snapshot can never replace a newer one. Taken before `records`.
    snapshot_write: Mutex<()>,
    config: ProcessTableConfig,
}

impl ProcessTable {
    pub fn new(config: ProcessTableConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            snapshot_write: Mutex::new(()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ProcessRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch `request.command` under the login shell.
    ///
    /// Returns immediately. A spawn failure does not surface as an `Err`: the
    /// record is stored with `error` status and the event stream carries
    /// `Failed` followed by `Exit`.
    pub fn spawn(self: &Arc<Self>, key: &str, request: SpawnRequest) -> SpawnedProcess {
        let id = ProcessId::new();
        let cwd = request
            .cwd
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.config.default_cwd.clone())
            .unwrap_or_else(|| ".".to_string());

        let mut spawn_config = SpawnConfig::new(&request.command).working_dir(&cwd);
        if let Some(prefix) = &self.config.shell_prefix {
            spawn_config = spawn_config.shell_prefix(prefix);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut record = ProcessRecord {
            id: id.clone(),
            key: key.to_string(),
            command: request.command,
            cwd,
            pid: None,
            status: ProcessStatus::Running,
            started_at: Utc::now(),
            exit_code: None,
            exit_signal: None,
            output: OutputBuffer::new(self.config.max_output_chunks),
            watch: request.watch,
            kill_requested: false,
            control: None,
        };

        match ChildProcess::spawn(spawn_config) {
            Ok(child) => {
                log::info!(
                    "Spawned process {} (pid {:?}) for {}: {}",
                    id,
                    child.pid,
                    key,
                    record.command
                );
                record.pid = child.pid;
                record.control = Some(child.control);
                let view = self.insert(record);
                tokio::spawn(Arc::clone(self).pump(key.to_string(), id, child.events, tx));
                SpawnedProcess { record: view, events: rx }
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("Failed to spawn `{}` for {}: {}", record.command, key, message);
                record.status = ProcessStatus::Error;
                record.output.push(OutputChunk {
                    stream: StreamKind::Stderr,
                    data: format!("{}\n", message),
                });
                let view = self.insert(record);
                let _ = tx.send(ProcessEvent::Failed { message });
                let _ = tx.send(ProcessEvent::Exit {
                    code: None,
                    signal: None,
                    status: ProcessStatus::Error,
                });
                SpawnedProcess { record: view, events: rx }
            }
        }
    }

    fn insert(&self, record: ProcessRecord) -> ProcessView {
        let view = record.serialize();
        self.lock()
            .entry(record.key.clone())
            .or_default()
            .push(record);
        self.persist();
        view
    }

    async fn pump(
        self: Arc<Self>,
        key: String,
        id: ProcessId,
        mut child_events: mpsc::UnboundedReceiver<ChildEvent>,
        tx: mpsc::UnboundedSender<ProcessEvent>,
    ) {
        while let Some(event) = child_events.recv().await {
            match event {
                ChildEvent::Output { stream, data } => {
                    self.add_output(&key, &id, stream, &data);
                    let _ = tx.send(ProcessEvent::Output { stream, data });
                }
                ChildEvent::Exit(exit) => {
                    if let Some(event) = self.finish(&key, &id, exit) {
                        let _ = tx.send(event);
                    }
                    break;
                }
            }
        }
    }

    /// Append a chunk to a record's ring buffer. Returns false if the record is gone.
    pub fn add_output(&self, key: &str, id: &ProcessId, stream: StreamKind, text: &str) -> bool {
        let mut records = self.lock();
        match find_mut(&mut records, key, id) {
            Some(record) => {
                record.output.push(OutputChunk {
                    stream,
                    data: text.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Move a running record to its terminal state.
    ///
    /// First writer wins: returns `None` when the record is missing or
    /// already finalised, in which case nothing should be broadcast.
    fn finish(&self, key: &str, id: &ProcessId, exit: ExitInfo) -> Option<ProcessEvent> {
        let event = {
            let mut records = self.lock();
            let record = find_mut(&mut records, key, id)?;
            if !record.status.is_running() {
                return None;
            }

            record.status = if record.kill_requested {
                ProcessStatus::Killed
            } else if exit.code == Some(0) {
                ProcessStatus::Completed
            } else {
                ProcessStatus::Error
            };
            record.exit_code = exit.code;
            record.exit_signal = exit.signal;
            record.control = None;

            log::info!(
                "Process {} exited (code {:?}, signal {:?}) -> {:?}",
                id,
                record.exit_code,
                record.exit_signal,
                record.status
            );

            ProcessEvent::Exit {
                code: record.exit_code,
                signal: record.exit_signal.clone(),
                status: record.status,
            }
        };
        self.persist();
        Some(event)
    }

    /// Send `signal` to a running process.
    ///
    /// Returns `Ok(false)` when the process has already exited.
    pub fn kill(&self, key: &str, id: &ProcessId, signal: Signal) -> Result<bool, ProcessError> {
        let mut records = self.lock();
        let record =
            find_mut(&mut records, key, id).ok_or_else(|| ProcessError::NotFound(id.clone()))?;

        if !record.status.is_running() {
            return Ok(false);
        }
        let Some(control) = &record.control else {
            return Ok(false);
        };

        log::info!("Sending {} to process {}", signal, id);
        record.kill_requested = true;
        Ok(control.signal(signal))
    }

    pub fn get_process(&self, key: &str, id: &ProcessId) -> Option<ProcessView> {
        let records = self.lock();
        records
            .get(key)?
            .iter()
            .find(|r| &r.id == id)
            .map(ProcessRecord::serialize)
    }

    pub fn is_running(&self, key: &str, id: &ProcessId) -> bool {
        self.get_process(key, id)
            .map(|p| p.status.is_running())
            .unwrap_or(false)
    }

    /// All records for `key`, oldest first.
    pub fn list(&self, key: &str) -> Vec<ProcessView> {
        let records = self.lock();
        records
            .get(key)
            .map(|list| list.iter().map(ProcessRecord::serialize).collect())
            .unwrap_or_default()
    }

    /// Forget a record. Does not signal the process.
    pub fn remove(&self, key: &str, id: &ProcessId) -> Option<ProcessView> {
        let removed = {
            let mut records = self.lock();
            let list = records.get_mut(key)?;
            let index = list.iter().position(|r| &r.id == id)?;
            let record = list.remove(index);
            if list.is_empty() {
                records.remove(key);
            }
            record.serialize()
        };
        self.persist();
        Some(removed)
    }

    /// Remove finished records.
    ///
    /// With an id, removes just that record and refuses while it runs.
    /// Without one, removes every non-running record under `key`.
    pub fn clear(&self, key: &str, id: Option<&ProcessId>) -> Result<Vec<ProcessId>, ProcessError> {
        let removed = {
            let mut records = self.lock();
            let Some(list) = records.get_mut(key) else {
                return match id {
                    Some(id) => Err(ProcessError::NotFound(id.clone())),
                    None => Ok(Vec::new()),
                };
            };

            let removed = match id {
                Some(id) => {
                    let index = list
                        .iter()
                        .position(|r| &r.id == id)
                        .ok_or_else(|| ProcessError::NotFound(id.clone()))?;
                    if list[index].status.is_running() {
                        return Err(ProcessError::StillRunning(id.clone()));
                    }
                    vec![list.remove(index).id]
                }
                None => {
                    let mut removed = Vec::new();
                    list.retain(|r| {
                        if r.status.is_running() {
                            true
                        } else {
                            removed.push(r.id.clone());
                            false
                        }
                    });
                    removed
                }
            };

            if list.is_empty() {
                records.remove(key);
            }
            removed
        };

        if !removed.is_empty() {
            self.persist();
        }
        Ok(removed)
    }

    /// Signal every running process. Returns how many were signalled.
    pub fn kill_all(&self, signal: Signal) -> usize {
        let mut records = self.lock();
        let mut count = 0;
        for record in records.values_mut().flat_map(|list| list.iter_mut()) {
            if !record.status.is_running() {
                continue;
            }
            if let Some(control) = &record.control {
                record.kill_requested = true;
                if control.signal(signal) {
                    count += 1;
                }
            }
        }
        count
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|list| list.iter())
            .filter(|r| r.status.is_running())
            .count()
    }

    /// Write the snapshot. A table without a snapshot path is a no-op.
    pub fn save_state(&self) -> Result<(), SnapshotError> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        let _writing = self
            .snapshot_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let records = self.lock();
            Snapshot {
                processes: records
                    .values()
                    .flat_map(|list| list.iter())
                    .map(|r| r.persisted_view(self.config.persist_output_chunks))
                    .collect(),
            }
        };
        save_snapshot(path, &snapshot)
    }

    fn persist(&self) {
        if let Err(e) = self.save_state() {
            log::warn!("Failed to save process snapshot: {}", e);
        }
    }

    /// Replace the table with the snapshot on disk.
    ///
    /// A process cannot survive a restart, so every record still marked
    /// `running` is rewritten to `killed`. Unreadable snapshots are logged
    /// and leave the table empty. Returns the number of restored records.
    pub fn restore_state(&self) -> usize {
        let Some(path) = &self.config.snapshot_path else {
            return 0;
        };
        let snapshot = match load_snapshot(path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Ignoring unreadable process snapshot {}: {}", path.display(), e);
                Snapshot::default()
            }
        };

        let mut restored: HashMap<String, Vec<ProcessRecord>> = HashMap::new();
        let mut recovered = 0;
        for view in snapshot.processes {
            let mut record = ProcessRecord::from_view(view, self.config.max_output_chunks);
            if record.status.is_running() {
                record.status = ProcessStatus::Killed;
                recovered += 1;
            }
            restored.entry(record.key.clone()).or_default().push(record);
        }
        for list in restored.values_mut() {
            list.sort_by_key(|r| r.started_at);
        }

        let count = restored.values().map(Vec::len).sum();
        *self.lock() = restored;
        log::info!(
            "Restored {} process records ({} marked killed)",
            count,
            recovered
        );
        if recovered > 0 {
            self.persist();
        }
        count
    }
}

fn find_mut<'a>(
    records: &'a mut HashMap<String, Vec<ProcessRecord>>,
    key: &str,
    id: &ProcessId,
) -> Option<&'a mut ProcessRecord> {
    records.get_mut(key)?.iter_mut().find(|r| &r.id == id)
}

// ============================================================================
// TESTS
// ============================================================================

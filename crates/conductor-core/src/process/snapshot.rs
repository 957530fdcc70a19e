//! Process table snapshot persistence.
//!
//! The snapshot is a single JSON file rewritten after every state change and
//! read once at boot. Writes go through a temp file and a rename so a crash
//! mid-write leaves the previous snapshot intact.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::ProcessView;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub processes: Vec<ProcessView>,
}

pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let temp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(snapshot)?;
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

/// Load a snapshot; a missing file is an empty snapshot.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, SnapshotError> {
    if !path.exists() {
        return Ok(Snapshot::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::record::{ProcessId, ProcessStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    fn view(id: &str) -> ProcessView {
        ProcessView {
            id: ProcessId::from(id),
            project_slug: "demo".to_string(),
            command: "ls".to_string(),
            cwd: "/".to_string(),
            pid: Some(1),
            status: ProcessStatus::Completed,
            started_at: Utc::now(),
            exit_code: Some(0),
            signal: None,
            output: vec![],
            is_watch: false,
            watch_bookmark_id: None,
            watch_bookmark_scope: None,
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let snapshot = load_snapshot(&dir.path().join("processes.json")).unwrap();
        assert!(snapshot.processes.is_empty());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("processes.json");
        let snapshot = Snapshot {
            processes: vec![view("a"), view("b")],
        };

        save_snapshot(&path, &snapshot).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded.processes.len(), 2);
        assert_eq!(loaded.processes[1].id, ProcessId::from("b"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("processes.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_snapshot(&path), Err(SnapshotError::Json(_))));
    }
}

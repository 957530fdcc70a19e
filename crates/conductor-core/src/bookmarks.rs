//! Bookmarked commands and their watch settings.
//!
//! Bookmarks are the only persisted description of which watches should run,
//! so this file is read at boot to resume them.
//!
//! ```text
//! <data_dir>/bookmarks.json
//! {
//!   "global":   [ { bookmark... } ],
//!   "projects": { "<project-slug>": [ { bookmark... } ] }
//! }
//! ```
//!
//! Saves use write-then-rename so a crash never leaves a truncated file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MIN_WATCH_INTERVAL_SECS: f64 = 1.0;
pub const MAX_WATCH_INTERVAL_SECS: f64 = 3600.0;
pub const DEFAULT_WATCH_INTERVAL_SECS: f64 = 60.0;
pub const MIN_WATCH_TIMEOUT_SECS: f64 = 1.0;
pub const MAX_WATCH_TIMEOUT_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkScope {
    Global,
    Project,
}

impl std::fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookmarkScope::Global => f.write_str("global"),
            BookmarkScope::Project => f.write_str("project"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BookmarkError {
    #[error("Bookmark not found: {0}")]
    NotFound(String),

    #[error("Project-scoped bookmarks need a project")]
    MissingProject,

    #[error("Bookmark command cannot be empty")]
    EmptyCommand,

    #[error("Invalid watch config: {0}")]
    InvalidWatch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Recurring-execution settings for a bookmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    pub enabled: bool,
    /// Seconds between the end of one run and the start of the next.
    pub interval: f64,
    /// Client display hint, stored verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Per-run ceiling in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// Watch settings as submitted by a client, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfigInput {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval: Option<f64>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl WatchConfigInput {
    /// Validate and normalise.
    ///
    /// Intervals below one second are rejected; long intervals are clamped
    /// to an hour. Timeouts follow the same rule.
    pub fn validate(self) -> Result<WatchConfig, BookmarkError> {
        let interval = self.interval.unwrap_or(DEFAULT_WATCH_INTERVAL_SECS);
        if !interval.is_finite() || interval < MIN_WATCH_INTERVAL_SECS {
            return Err(BookmarkError::InvalidWatch(format!(
                "interval must be at least {} second(s), got {}",
                MIN_WATCH_INTERVAL_SECS, interval
            )));
        }

        let timeout = match self.timeout {
            Some(t) if !t.is_finite() || t < MIN_WATCH_TIMEOUT_SECS => {
                return Err(BookmarkError::InvalidWatch(format!(
                    "timeout must be at least {} second(s), got {}",
                    MIN_WATCH_TIMEOUT_SECS, t
                )));
            }
            Some(t) => Some(t.min(MAX_WATCH_TIMEOUT_SECS)),
            None => None,
        };

        Ok(WatchConfig {
            enabled: self.enabled,
            interval: interval.min(MAX_WATCH_INTERVAL_SECS),
            mode: self.mode,
            timeout,
        })
    }
}

impl From<WatchConfig> for WatchConfigInput {
    fn from(config: WatchConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: Some(config.interval),
            mode: config.mode,
            timeout: config.timeout,
        }
    }
}

impl WatchConfig {
    /// Re-apply the client-side rules to settings read back from disk.
    pub fn revalidate(self) -> Result<WatchConfig, BookmarkError> {
        WatchConfigInput::from(self).validate()
    }
}

/// A saved, reusable shell command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: String,
    pub scope: BookmarkScope,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
}

impl Bookmark {
    pub fn new(scope: BookmarkScope, command: impl Into<String>, cwd: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            scope,
            command: command.into(),
            cwd,
            created_at: Utc::now(),
            watch: None,
        }
    }

    pub fn watch_enabled(&self) -> bool {
        self.watch.as_ref().map(|w| w.enabled).unwrap_or(false)
    }
}

/// On-disk layout of the bookmarks file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkFile {
    #[serde(default)]
    pub global: Vec<Bookmark>,
    #[serde(default)]
    pub projects: HashMap<String, Vec<Bookmark>>,
}

/// Bookmarks visible from one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookmarkList {
    pub global: Vec<Bookmark>,
    pub project: Vec<Bookmark>,
}

pub fn save_bookmarks(path: &Path, file: &BookmarkFile) -> Result<(), BookmarkError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let temp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(file)?;
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read the bookmarks file. Watch settings that no longer pass validation
/// are normalised, or disabled when they cannot be.
pub fn load_bookmarks(path: &Path) -> Result<BookmarkFile, BookmarkError> {
    if !path.exists() {
        return Ok(BookmarkFile::default());
    }
    let contents = fs::read_to_string(path)?;
    let mut file: BookmarkFile = serde_json::from_str(&contents)?;
    let disabled = sanitize_watches(&mut file);
    if disabled > 0 {
        log::warn!(
            "Disabled {} watches with invalid settings in {}",
            disabled,
            path.display()
        );
    }
    Ok(file)
}

/// Returns how many watches had to be disabled.
fn sanitize_watches(file: &mut BookmarkFile) -> usize {
    let mut disabled = 0;
    let bookmarks = file
        .global
        .iter_mut()
        .chain(file.projects.values_mut().flatten());
    for bookmark in bookmarks {
        let Some(watch) = bookmark.watch.take() else {
            continue;
        };
        let mode = watch.mode.clone();
        bookmark.watch = Some(match watch.revalidate() {
            Ok(valid) => valid,
            Err(e) => {
                log::warn!("Bookmark {}: {}", bookmark.id, e);
                disabled += 1;
                WatchConfig {
                    enabled: false,
                    interval: DEFAULT_WATCH_INTERVAL_SECS,
                    mode,
                    timeout: None,
                }
            }
        });
    }
    disabled
}

/// Thread-safe bookmark registry backed by the bookmarks file.
///
/// Disk failures are logged and the in-memory copy stays authoritative.
pub struct BookmarkStore {
    path: Option<PathBuf>,
    data: Mutex<BookmarkFile>,
}

impl BookmarkStore {
    /// Load from `path`, or start empty when it is missing or unreadable.
    pub fn load(path: Option<PathBuf>) -> Self {
        let data = match &path {
            Some(p) => load_bookmarks(p).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable bookmarks file {}: {}", p.display(), e);
                BookmarkFile::default()
            }),
            None => BookmarkFile::default(),
        };
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn in_memory() -> Self {
        Self::load(None)
    }

    fn lock(&self) -> MutexGuard<'_, BookmarkFile> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, data: &BookmarkFile) {
        if let Some(path) = &self.path {
            if let Err(e) = save_bookmarks(path, data) {
                log::warn!("Failed to save bookmarks to {}: {}", path.display(), e);
            }
        }
    }

    /// Snapshot of every bookmark.
    pub fn all(&self) -> BookmarkFile {
        self.lock().clone()
    }

    pub fn list(&self, project: Option<&str>) -> BookmarkList {
        let data = self.lock();
        BookmarkList {
            global: data.global.clone(),
            project: project
                .and_then(|p| data.projects.get(p))
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn find(&self, scope: BookmarkScope, project: Option<&str>, id: &str) -> Option<Bookmark> {
        let data = self.lock();
        bucket(&data, scope, project)?
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    pub fn add(
        &self,
        scope: BookmarkScope,
        project: Option<&str>,
        command: &str,
        cwd: Option<String>,
    ) -> Result<Bookmark, BookmarkError> {
        if command.trim().is_empty() {
            return Err(BookmarkError::EmptyCommand);
        }
        let bookmark = Bookmark::new(scope, command.trim(), cwd.filter(|c| !c.trim().is_empty()));

        let mut data = self.lock();
        bucket_or_insert(&mut data, scope, project)?.push(bookmark.clone());
        self.persist(&data);
        Ok(bookmark)
    }

    pub fn remove(
        &self,
        scope: BookmarkScope,
        project: Option<&str>,
        id: &str,
    ) -> Result<Bookmark, BookmarkError> {
        let mut data = self.lock();
        let list = bucket_mut(&mut data, scope, project, id)?;
        let index = list
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| BookmarkError::NotFound(id.to_string()))?;
        let removed = list.remove(index);
        if scope == BookmarkScope::Project && list.is_empty() {
            if let Some(p) = project {
                data.projects.remove(p);
            }
        }
        self.persist(&data);
        Ok(removed)
    }

    /// Replace a bookmark's watch settings. The bookmark is untouched on error.
    pub fn set_watch(
        &self,
        scope: BookmarkScope,
        project: Option<&str>,
        id: &str,
        watch: WatchConfig,
    ) -> Result<Bookmark, BookmarkError> {
        let mut data = self.lock();
        let bookmark = bucket_mut(&mut data, scope, project, id)?
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| BookmarkError::NotFound(id.to_string()))?;
        bookmark.watch = Some(watch);
        let updated = bookmark.clone();
        self.persist(&data);
        Ok(updated)
    }
}

fn bucket<'a>(
    data: &'a BookmarkFile,
    scope: BookmarkScope,
    project: Option<&str>,
) -> Option<&'a Vec<Bookmark>> {
    match scope {
        BookmarkScope::Global => Some(&data.global),
        BookmarkScope::Project => data.projects.get(project?),
    }
}

fn project_key(project: Option<&str>) -> Result<&str, BookmarkError> {
    project
        .filter(|p| !p.is_empty())
        .ok_or(BookmarkError::MissingProject)
}

/// Existing bucket only; an unknown project is reported as `NotFound(id)`.
fn bucket_mut<'a>(
    data: &'a mut BookmarkFile,
    scope: BookmarkScope,
    project: Option<&str>,
    id: &str,
) -> Result<&'a mut Vec<Bookmark>, BookmarkError> {
    match scope {
        BookmarkScope::Global => Ok(&mut data.global),
        BookmarkScope::Project => data
            .projects
            .get_mut(project_key(project)?)
            .ok_or_else(|| BookmarkError::NotFound(id.to_string())),
    }
}

fn bucket_or_insert<'a>(
    data: &'a mut BookmarkFile,
    scope: BookmarkScope,
    project: Option<&str>,
) -> Result<&'a mut Vec<Bookmark>, BookmarkError> {
    match scope {
        BookmarkScope::Global => Ok(&mut data.global),
        BookmarkScope::Project => Ok(data
            .projects
            .entry(project_key(project)?.to_string())
            .or_default()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

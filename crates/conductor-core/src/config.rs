//! Engine configuration.
//!
//! ```text
//! <data_dir>/
//!   processes.json   process table snapshot
//!   bookmarks.json   bookmarks and their watch settings
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::{ProcessTableConfig, MAX_OUTPUT_CHUNKS, PERSISTED_OUTPUT_CHUNKS};
use crate::watch::{WatchSchedulerConfig, DEFAULT_STATE_DEBOUNCE, DEFAULT_TICK_TIMEOUT};

pub const DATA_DIR_NAME: &str = ".conductor";
pub const PROCESSES_FILE: &str = "processes.json";
pub const BOOKMARKS_FILE: &str = "bookmarks.json";
pub const DEFAULT_TASK_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where state files live; `None` runs fully in memory.
    pub data_dir: Option<PathBuf>,
    /// Shell wrapper such as `/bin/zsh -l -c`; `None` uses `$SHELL -l -c`.
    pub shell_prefix: Option<String>,
    /// Working directory for commands that do not name one.
    pub default_cwd: Option<String>,
    pub default_tick_timeout: Duration,
    pub state_debounce: Duration,
    pub max_output_chunks: usize,
    pub persist_output_chunks: usize,
    /// Finished tasks older than this are swept.
    pub task_max_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            shell_prefix: None,
            default_cwd: None,
            default_tick_timeout: DEFAULT_TICK_TIMEOUT,
            state_debounce: DEFAULT_STATE_DEBOUNCE,
            max_output_chunks: MAX_OUTPUT_CHUNKS,
            persist_output_chunks: PERSISTED_OUTPUT_CHUNKS,
            task_max_age: DEFAULT_TASK_MAX_AGE,
        }
    }
}

impl EngineConfig {
    /// Persist under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// `$HOME/.conductor`, falling back to `USERPROFILE` on Windows.
    pub fn default_data_dir() -> Result<PathBuf, String> {
        home_dir(|key| env::var(key).ok()).map(|home| home.join(DATA_DIR_NAME))
    }

    pub fn processes_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(PROCESSES_FILE))
    }

    pub fn bookmarks_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(BOOKMARKS_FILE))
    }

    pub fn process_table(&self) -> ProcessTableConfig {
        ProcessTableConfig {
            snapshot_path: self.processes_path(),
            shell_prefix: self.shell_prefix.clone(),
            default_cwd: self.default_cwd.clone(),
            max_output_chunks: self.max_output_chunks,
            persist_output_chunks: self.persist_output_chunks,
        }
    }

    pub fn watch_scheduler(&self) -> WatchSchedulerConfig {
        WatchSchedulerConfig {
            default_tick_timeout: self.default_tick_timeout,
            state_debounce: self.state_debounce,
        }
    }
}

fn home_dir(lookup: impl Fn(&str) -> Option<String>) -> Result<PathBuf, String> {
    ["HOME", "USERPROFILE"]
        .into_iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| "Home directory not set".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_by_default() {
        let config = EngineConfig::default();
        assert!(config.processes_path().is_none());
        assert!(config.bookmarks_path().is_none());
        assert!(config.process_table().snapshot_path.is_none());
        assert_eq!(config.default_tick_timeout, Duration::from_secs(300));
    }

    #[test]
    fn files_live_under_data_dir() {
        let config = EngineConfig::default().with_data_dir("/tmp/conductor-test");
        assert_eq!(
            config.processes_path(),
            Some(PathBuf::from("/tmp/conductor-test/processes.json"))
        );
        assert_eq!(
            config.bookmarks_path(),
            Some(PathBuf::from("/tmp/conductor-test/bookmarks.json"))
        );
    }

    #[test]
    fn sub_configs_carry_limits() {
        let config = EngineConfig {
            max_output_chunks: 10,
            persist_output_chunks: 2,
            state_debounce: Duration::from_millis(5),
            ..Default::default()
        };
        assert_eq!(config.process_table().max_output_chunks, 10);
        assert_eq!(config.process_table().persist_output_chunks, 2);
        assert_eq!(
            config.watch_scheduler().state_debounce,
            Duration::from_millis(5)
        );
    }

    #[test]
    fn home_prefers_home_over_userprofile() {
        let lookup = |key: &str| match key {
            "HOME" => Some("/tmp/home".to_string()),
            "USERPROFILE" => Some("/tmp/profile".to_string()),
            _ => None,
        };
        assert_eq!(home_dir(lookup), Ok(PathBuf::from("/tmp/home")));
    }

    #[test]
    fn home_skips_empty_values() {
        let lookup = |key: &str| match key {
            "HOME" => Some(String::new()),
            "USERPROFILE" => Some("C:\\Users\\dev".to_string()),
            _ => None,
        };
        assert_eq!(home_dir(lookup), Ok(PathBuf::from("C:\\Users\\dev")));
        assert!(home_dir(|_| None).is_err());
    }
}

//! Per-session task bookkeeping for the prompt pipeline.
//!
//! The pipeline itself lives outside this crate. It only ever:
//! - creates or queries the task for a session
//! - appends results as they stream in
//! - checks the task's [`CancelToken`] at its own suspension points
//!
//! Cancellation is cooperative: [`TaskRegistry::cancel_task`] flips the token
//! and the pipeline decides when to stop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

/// Results kept per task; older ones are dropped first.
pub const MAX_TASK_RESULTS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl TaskStatus {
    fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

/// Shared cancellation flag handed to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Task {
    status: TaskStatus,
    results: VecDeque<serde_json::Value>,
    error: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    cancel: CancelToken,
}

impl Task {
    fn new() -> Self {
        Self {
            status: TaskStatus::Idle,
            results: VecDeque::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            cancel: CancelToken::new(),
        }
    }

    fn view(&self, session_id: &str) -> TaskView {
        TaskView {
            session_id: session_id.to_string(),
            status: self.status,
            results: self.results.iter().cloned().collect(),
            error: self.error.clone(),
            started_at: self.started_at,
        }
    }

    fn age_reference(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

/// Client-facing copy of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub session_id: String,
    pub status: TaskStatus,
    pub results: Vec<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Exactly one task per session id, created lazily.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create_task(&self, session_id: &str) -> TaskView {
        let mut tasks = self.lock();
        tasks
            .entry(session_id.to_string())
            .or_insert_with(Task::new)
            .view(session_id)
    }

    pub fn get_task(&self, session_id: &str) -> Option<TaskView> {
        self.lock().get(session_id).map(|t| t.view(session_id))
    }

    /// Mark the session's task running with fresh results and a new token.
    pub fn start_task(&self, session_id: &str) -> CancelToken {
        let mut tasks = self.lock();
        let task = tasks
            .entry(session_id.to_string())
            .or_insert_with(Task::new);
        task.status = TaskStatus::Running;
        task.results.clear();
        task.error = None;
        task.started_at = Some(Utc::now());
        task.cancel = CancelToken::new();
        task.cancel.clone()
    }

    /// Append a result, dropping the oldest beyond [`MAX_TASK_RESULTS`].
    pub fn add_task_result(&self, session_id: &str, result: serde_json::Value) {
        let mut tasks = self.lock();
        let task = tasks
            .entry(session_id.to_string())
            .or_insert_with(Task::new);
        task.results.push_back(result);
        while task.results.len() > MAX_TASK_RESULTS {
            task.results.pop_front();
        }
    }

    pub fn complete_task(&self, session_id: &str) {
        if let Some(task) = self.lock().get_mut(session_id) {
            task.status = TaskStatus::Completed;
        }
    }

    pub fn fail_task(&self, session_id: &str, error: serde_json::Value) {
        if let Some(task) = self.lock().get_mut(session_id) {
            task.status = TaskStatus::Error;
            task.error = Some(error);
        }
    }

    /// Signal cancellation. Returns false when nothing was running.
    pub fn cancel_task(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(task) if task.status == TaskStatus::Running => {
                log::info!("Cancelling task for session {}", session_id);
                task.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Drop a finished task once its client has seen the outcome.
    pub fn clear_completed_task(&self, session_id: &str) -> bool {
        let mut tasks = self.lock();
        let terminal = tasks
            .get(session_id)
            .map(|t| t.status.is_terminal())
            .unwrap_or(false);
        if terminal {
            tasks.remove(session_id);
        }
        terminal
    }

    /// Remove non-running tasks whose start (or creation) is older than `max_age`.
    pub fn clear_old_tasks(&self, max_age: std::time::Duration) -> usize {
        let max_age = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.clear_tasks_before(cutoff)
    }

    /// Remove non-running tasks last started before `cutoff`.
    pub fn clear_tasks_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, t| t.status == TaskStatus::Running || t.age_reference() >= cutoff);
        let removed = before - tasks.len();
        if removed > 0 {
            log::debug!("Swept {} stale tasks", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_or_create_is_lazy_and_idle() {
        let registry = TaskRegistry::new();
        assert!(registry.get_task("s1").is_none());

        let task = registry.get_or_create_task("s1");
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.results.is_empty());
        assert!(task.error.is_none());
        assert_eq!(registry.len(), 1);

        registry.get_or_create_task("s1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn results_are_capped_dropping_oldest() {
        let registry = TaskRegistry::new();
        for i in 0..(MAX_TASK_RESULTS + 20) {
            registry.add_task_result("s1", json!(i));
        }
        let task = registry.get_task("s1").unwrap();
        assert_eq!(task.results.len(), MAX_TASK_RESULTS);
        assert_eq!(task.results[0], json!(20));
        assert_eq!(task.results.last().unwrap(), &json!(MAX_TASK_RESULTS + 19));
    }

    mod cancellation {
        use super::*;

        #[test]
        fn cancel_running_flips_token() {
            let registry = TaskRegistry::new();
            let token = registry.start_task("s1");
            assert!(!token.is_cancelled());

            assert!(registry.cancel_task("s1"));
            assert!(token.is_cancelled());
        }

        #[test]
        fn cancel_without_running_task_is_false() {
            let registry = TaskRegistry::new();
            assert!(!registry.cancel_task("missing"));

            registry.get_or_create_task("idle");
            assert!(!registry.cancel_task("idle"));

            let token = registry.start_task("done");
            registry.complete_task("done");
            assert!(!registry.cancel_task("done"));
            assert!(!token.is_cancelled());
        }

        #[test]
        fn restart_issues_fresh_token() {
            let registry = TaskRegistry::new();
            let first = registry.start_task("s1");
            registry.cancel_task("s1");
            let second = registry.start_task("s1");
            assert!(first.is_cancelled());
            assert!(!second.is_cancelled());
        }
    }

    mod clearing {
        use super::*;

        #[test]
        fn clear_completed_only_removes_terminal_tasks() {
            let registry = TaskRegistry::new();
            registry.start_task("running");
            registry.start_task("done");
            registry.complete_task("done");
            registry.start_task("failed");
            registry.fail_task("failed", json!({"message": "boom"}));

            assert!(!registry.clear_completed_task("running"));
            assert!(registry.clear_completed_task("done"));
            assert_eq!(registry.get_task("failed").unwrap().error, Some(json!({"message": "boom"})));
            assert!(registry.clear_completed_task("failed"));
            assert!(!registry.clear_completed_task("missing"));
            assert_eq!(registry.len(), 1);
        }

        #[test]
        fn sweep_keeps_running_tasks() {
            let registry = TaskRegistry::new();
            registry.start_task("running");
            registry.get_or_create_task("idle");
            registry.start_task("done");
            registry.complete_task("done");

            let future = Utc::now() + ChronoDuration::hours(1);
            assert_eq!(registry.clear_tasks_before(future), 2);
            assert!(registry.get_task("running").is_some());
        }

        #[test]
        fn sweep_keeps_recent_tasks() {
            let registry = TaskRegistry::new();
            registry.get_or_create_task("fresh");
            assert_eq!(registry.clear_old_tasks(std::time::Duration::from_secs(3600)), 0);
            assert_eq!(registry.len(), 1);
        }
    }
}

//! WatchScheduler - re-runs watched bookmarks on an interval.
//!
//! A watch spawns its command, waits for it to exit, then sleeps for the
//! interval before the next run. Runs never overlap: the next tick is only
//! scheduled from the exit of the current one, and a tick that outlives its
//! timeout is killed so the exit path still fires.
//!
//! Everything that can fire late (timers, timeouts, process events) carries a
//! [`TickToken`] and is ignored once the watch has moved on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::state::{TickTimer, TickToken, WatchPhase, WatchState};
use crate::bookmarks::{Bookmark, BookmarkFile, BookmarkScope};
use crate::clients::ClientRegistry;
use crate::process::{ProcessEvent, ProcessId, ProcessTable, SpawnRequest};
use crate::protocol::Outbound;
use crate::spawn::{Signal, StreamKind};

pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_STATE_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct WatchSchedulerConfig {
    /// Ceiling for a tick whose bookmark sets no timeout.
    pub default_tick_timeout: Duration,
    /// Quiet period before `watch:state` goes out.
    pub state_debounce: Duration,
}

impl Default for WatchSchedulerConfig {
    fn default() -> Self {
        Self {
            default_tick_timeout: DEFAULT_TICK_TIMEOUT,
            state_debounce: DEFAULT_STATE_DEBOUNCE,
        }
    }
}

pub struct WatchScheduler {
    processes: Arc<ProcessTable>,
    clients: Arc<ClientRegistry>,
    config: WatchSchedulerConfig,
    watches: Mutex<HashMap<String, WatchState>>,
    generation: AtomicU64,
    pending_state: Mutex<Option<JoinHandle<()>>>,
}

impl WatchScheduler {
    pub fn new(
        processes: Arc<ProcessTable>,
        clients: Arc<ClientRegistry>,
        config: WatchSchedulerConfig,
    ) -> Self {
        Self {
            processes,
            clients,
            config,
            watches: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            pending_state: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WatchState>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) the watch for `bookmark` under `project_slug`.
    ///
    /// The first tick runs immediately. Restarting tears the previous run
    /// down first, killing its process if one is still attached.
    pub fn start_watch(self: &Arc<Self>, project_slug: &str, bookmark: Bookmark) {
        let bookmark_id = bookmark.id.clone();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let replaced = {
            let mut watches = self.lock();
            let state = WatchState::new(project_slug, bookmark, generation);
            watches
                .insert(bookmark_id.clone(), state)
                .map(|mut old| (old.project_slug.clone(), old.teardown()))
        };
        if let Some((key, Some(previous))) = replaced {
            self.discard(&key, &previous);
        }

        log::info!("Watch {} started for {}", bookmark_id, project_slug);
        self.run_tick(&bookmark_id, generation);
        self.schedule_state_broadcast();
    }

    /// Stop a watch and kill its current process. Unknown ids are a no-op.
    pub fn stop_watch(self: &Arc<Self>, bookmark_id: &str) -> bool {
        let Some(mut state) = self.lock().remove(bookmark_id) else {
            return false;
        };

        if let Some(current) = state.teardown() {
            self.discard(&state.project_slug, &current);
            self.broadcast_processes(&state.project_slug);
        }

        log::info!("Watch {} stopped", bookmark_id);
        self.schedule_state_broadcast();
        true
    }

    /// Resume every enabled project-scoped watch. Returns how many started.
    ///
    /// Global bookmarks have no project to run under, so they are left for a
    /// client to start explicitly.
    pub fn load_from_bookmarks(self: &Arc<Self>, file: &BookmarkFile) -> usize {
        let mut projects: Vec<_> = file.projects.iter().collect();
        projects.sort_by(|a, b| a.0.cmp(b.0));

        let mut started = 0;
        for (project_slug, bookmarks) in projects {
            for bookmark in bookmarks {
                if bookmark.scope == BookmarkScope::Project && bookmark.watch_enabled() {
                    self.start_watch(project_slug, bookmark.clone());
                    started += 1;
                }
            }
        }
        if started > 0 {
            log::info!("Resumed {} watches from bookmarks", started);
        }
        started
    }

    /// Stop every watch. Used on shutdown.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<WatchState> = self.lock().drain().map(|(_, state)| state).collect();
        let count = drained.len();
        for mut state in drained {
            if let Some(current) = state.teardown() {
                self.discard(&state.project_slug, &current);
            }
        }
        if let Some(pending) = self.lock_pending().take() {
            pending.abort();
        }
        count
    }

    /// Ids of the running watches, sorted.
    pub fn active_watches(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_watching(&self, bookmark_id: &str) -> bool {
        self.lock().contains_key(bookmark_id)
    }

    pub fn phase(&self, bookmark_id: &str) -> Option<WatchPhase> {
        self.lock().get(bookmark_id).map(|s| s.phase)
    }

    pub fn current_process(&self, bookmark_id: &str) -> Option<ProcessId> {
        self.lock().get(bookmark_id).and_then(|s| s.current.clone())
    }

    /// When the next tick is due, if one is scheduled.
    pub fn next_fire_time(&self, bookmark_id: &str) -> Option<Instant> {
        self.lock()
            .get(bookmark_id)
            .and_then(|s| s.timer.as_ref())
            .map(|t| t.next_fire)
    }

    /// Send the current `watch:state` to every client right away.
    pub fn broadcast_state(&self) -> usize {
        self.clients.broadcast(&Outbound::WatchState {
            active: self.active_watches(),
        })
    }

    // ------------------------------------------------------------------------
    // Tick cycle
    // ------------------------------------------------------------------------

    fn run_tick(self: &Arc<Self>, bookmark_id: &str, generation: u64) {
        let prepared = {
            let mut watches = self.lock();
            let Some(state) = watches.get_mut(bookmark_id) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            // Detach rather than abort: this may be running inside the timer task.
            state.timer = None;
            state.tick += 1;
            state.phase = WatchPhase::Ticking;
            let request = SpawnRequest::new(state.bookmark.command.clone())
                .cwd(state.bookmark.cwd.clone())
                .watch(state.tag());
            (
                state.project_slug.clone(),
                state.current.take(),
                request,
                state.token(),
                state.tick_timeout(self.config.default_tick_timeout),
            )
        };
        let (key, previous, request, token, timeout) = prepared;

        if let Some(previous) = previous {
            self.discard(&key, &previous);
        }

        let spawned = self.processes.spawn(&key, request);
        let process_id = spawned.record.id.clone();

        let attached = {
            let mut watches = self.lock();
            match watches.get_mut(bookmark_id) {
                Some(state) if state.token() == token => {
                    state.current = Some(process_id.clone());
                    state.phase = WatchPhase::WaitingForExit;
                    if spawned.record.status.is_running() {
                        state.timeout = Some(self.arm_timeout(bookmark_id, token, timeout));
                    }
                    true
                }
                _ => false,
            }
        };
        if !attached {
            // Stopped or restarted while spawning.
            self.discard(&key, &process_id);
            return;
        }

        log::debug!(
            "Watch {} tick {} spawned process {}",
            bookmark_id,
            token.tick,
            process_id
        );
        self.clients.broadcast(&Outbound::WatchTick {
            project_slug: key.clone(),
            process: spawned.record,
        });
        tokio::spawn(Arc::clone(self).follow_tick(
            bookmark_id.to_string(),
            token,
            key,
            process_id,
            spawned.events,
        ));
    }

    fn arm_timeout(
        self: &Arc<Self>,
        bookmark_id: &str,
        token: TickToken,
        after: Duration,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let bookmark_id = bookmark_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            scheduler.on_timeout(&bookmark_id, token);
        })
    }

    fn on_timeout(&self, bookmark_id: &str, token: TickToken) {
        let target = {
            let mut watches = self.lock();
            match watches.get_mut(bookmark_id) {
                Some(state) if state.token() == token => {
                    state.timeout = None;
                    state
                        .current
                        .clone()
                        .map(|id| (state.project_slug.clone(), id))
                }
                _ => None,
            }
        };
        let Some((key, id)) = target else {
            return;
        };

        log::warn!(
            "Watch {} tick {} timed out, killing process {}",
            bookmark_id,
            token.tick,
            id
        );
        if let Err(e) = self.processes.kill(&key, &id, Signal::Kill) {
            log::debug!("Timed-out watch process already gone: {}", e);
        }
    }

    async fn follow_tick(
        self: Arc<Self>,
        bookmark_id: String,
        token: TickToken,
        key: String,
        process_id: ProcessId,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(&bookmark_id, token) {
                break;
            }
            match event {
                ProcessEvent::Output { stream, data } => {
                    self.clients.broadcast(&Outbound::Output {
                        process_id: process_id.clone(),
                        stream,
                        data,
                        project_slug: key.clone(),
                    });
                }
                ProcessEvent::Failed { message } => {
                    self.clients.broadcast(&Outbound::Output {
                        process_id: process_id.clone(),
                        stream: StreamKind::Stderr,
                        data: message,
                        project_slug: key.clone(),
                    });
                }
                ProcessEvent::Exit {
                    code,
                    signal,
                    status,
                } => {
                    self.clients.broadcast(&Outbound::Exit {
                        process_id: process_id.clone(),
                        code,
                        signal,
                        status,
                        project_slug: key.clone(),
                    });
                    self.schedule_next(&bookmark_id, token);
                    break;
                }
            }
        }
    }

    /// Arm the timer for the tick after `token`.
    fn schedule_next(self: &Arc<Self>, bookmark_id: &str, token: TickToken) {
        let mut watches = self.lock();
        let Some(state) = watches.get_mut(bookmark_id) else {
            return;
        };
        if state.token() != token {
            return;
        }
        if let Some(timeout) = state.timeout.take() {
            timeout.abort();
        }

        let next_fire = Instant::now() + state.interval();
        let scheduler = Arc::clone(self);
        let id = bookmark_id.to_string();
        let generation = token.generation;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(next_fire).await;
            scheduler.run_tick(&id, generation);
        });
        state.timer = Some(TickTimer { next_fire, handle });
        state.phase = WatchPhase::Scheduled;
        log::debug!(
            "Watch {} next tick in {:?}",
            bookmark_id,
            state.interval()
        );
    }

    fn is_current(&self, bookmark_id: &str, token: TickToken) -> bool {
        self.lock()
            .get(bookmark_id)
            .map(|s| s.token() == token)
            .unwrap_or(false)
    }

    /// Kill a watch process if it still runs and drop its record.
    fn discard(&self, key: &str, id: &ProcessId) {
        if self.processes.is_running(key, id) {
            if let Err(e) = self.processes.kill(key, id, Signal::Kill) {
                log::debug!("Failed to kill watch process {}: {}", id, e);
            }
        }
        self.processes.remove(key, id);
    }

    fn broadcast_processes(&self, key: &str) {
        self.clients.broadcast(&Outbound::Processes {
            project_slug: key.to_string(),
            processes: self.processes.list(key),
        });
    }

    // ------------------------------------------------------------------------
    // watch:state debounce
    // ------------------------------------------------------------------------

    fn lock_pending(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Coalesce bursts of start/stop into one `watch:state` broadcast.
    fn schedule_state_broadcast(self: &Arc<Self>) {
        let mut pending = self.lock_pending();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let scheduler = Arc::clone(self);
        let delay = self.config.state_debounce;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.broadcast_state();
        }));
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bookmarks::WatchConfig;
    use crate::process::ProcessTableConfig;
    use serde_json::Value;

    struct Harness {
        scheduler: Arc<WatchScheduler>,
        table: Arc<ProcessTable>,
        frames: mpsc::UnboundedReceiver<String>,
    }

    fn harness() -> Harness {
        let table = Arc::new(ProcessTable::new(ProcessTableConfig {
            shell_prefix: Some("/bin/sh -c".to_string()),
            default_cwd: Some(std::env::temp_dir().to_string_lossy().into_owned()),
            ..Default::default()
        }));
        let clients = Arc::new(ClientRegistry::new());
        let (tx, frames) = mpsc::unbounded_channel();
        clients.register(tx);
        let scheduler = Arc::new(WatchScheduler::new(
            Arc::clone(&table),
            clients,
            WatchSchedulerConfig::default(),
        ));
        Harness {
            scheduler,
            table,
            frames,
        }
    }

    fn watched(command: &str, interval: f64, timeout: Option<f64>) -> Bookmark {
        let mut bookmark = Bookmark::new(BookmarkScope::Project, command, None);
        bookmark.watch = Some(WatchConfig {
            enabled: true,
            interval,
            mode: None,
            timeout,
        });
        bookmark
    }

    async fn next_frame(
        frames: &mut mpsc::UnboundedReceiver<String>,
        frame_type: &str,
        within: Duration,
    ) -> Value {
        let wait = async {
            loop {
                let raw = frames.recv().await.expect("client channel closed");
                let frame: Value = serde_json::from_str(&raw).unwrap();
                if frame["type"] == frame_type {
                    return frame;
                }
            }
        };
        match tokio::time::timeout(within, wait).await {
            Ok(frame) => frame,
            Err(_) => panic!("no {} frame within {:?}", frame_type, within),
        }
    }

    fn running_watch_processes(table: &ProcessTable) -> usize {
        table
            .list("web")
            .iter()
            .filter(|p| p.is_watch && p.status.is_running())
            .count()
    }

    mod cycle {
        use super::*;

        #[tokio::test]
        async fn first_tick_is_immediate_and_next_waits_for_exit() {
            let mut h = harness();
            let bookmark = watched("echo tick", 1.0, None);
            let id = bookmark.id.clone();

            h.scheduler.start_watch("web", bookmark);
            let tick = next_frame(&mut h.frames, "watch:tick", Duration::from_secs(2)).await;
            assert_eq!(tick["projectSlug"], "web");
            assert_eq!(tick["process"]["isWatch"], true);
            assert_eq!(tick["process"]["watchBookmarkId"], id.as_str());
            let first = tick["process"]["id"].clone();

            let output = next_frame(&mut h.frames, "output", Duration::from_secs(2)).await;
            assert_eq!(output["data"], "tick\n");
            let exit = next_frame(&mut h.frames, "exit", Duration::from_secs(2)).await;
            assert_eq!(exit["status"], "completed");

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(h.scheduler.phase(&id), Some(WatchPhase::Scheduled));
            assert!(h.scheduler.next_fire_time(&id).is_some());

            let tick = next_frame(&mut h.frames, "watch:tick", Duration::from_secs(3)).await;
            assert_ne!(tick["process"]["id"], first);
            let history = h.table.list("web");
            assert!(history.iter().all(|p| p.id.0 != first.as_str().unwrap_or_default()));

            h.scheduler.stop_all();
        }

        #[tokio::test]
        async fn ticks_never_overlap() {
            let mut h = harness();
            h.scheduler.start_watch("web", watched("sleep 1", 1.0, None));

            let mut ticks = 0;
            let deadline = Instant::now() + Duration::from_millis(2500);
            while Instant::now() < deadline {
                assert!(running_watch_processes(&h.table) <= 1);
                while let Ok(raw) = h.frames.try_recv() {
                    if raw.contains("\"watch:tick\"") {
                        ticks += 1;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            // Run (1s) + interval (1s) per cycle: at most two starts in 2.5s.
            assert!((1..=2).contains(&ticks), "saw {} ticks", ticks);

            h.scheduler.stop_all();
        }

        #[tokio::test]
        async fn slow_tick_is_killed_at_timeout() {
            let mut h = harness();
            let bookmark = watched("exec sleep 30", 60.0, Some(1.0));
            let id = bookmark.id.clone();

            h.scheduler.start_watch("web", bookmark);
            let exit = next_frame(&mut h.frames, "exit", Duration::from_secs(4)).await;
            assert_eq!(exit["status"], "killed");
            assert_eq!(exit["signal"], "SIGKILL");

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(h.scheduler.phase(&id), Some(WatchPhase::Scheduled));
            h.scheduler.stop_all();
        }

        #[tokio::test]
        async fn out_of_range_settings_still_wait_between_ticks() {
            let mut h = harness();
            let bookmark = watched("true", 0.0, Some(-1.0));
            let id = bookmark.id.clone();

            h.scheduler.start_watch("web", bookmark);
            next_frame(&mut h.frames, "exit", Duration::from_secs(2)).await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            let next = h.scheduler.next_fire_time(&id).expect("next tick scheduled");
            assert!(next > Instant::now() + Duration::from_millis(500));
            h.scheduler.stop_all();
        }

        #[tokio::test]
        #[cfg(target_os = "linux")]
        async fn timeout_kill_takes_the_whole_command_down() {
            let mut h = harness();
            h.scheduler
                .start_watch("web", watched("sleep 30 & echo $!; wait", 60.0, Some(1.0)));

            let output = next_frame(&mut h.frames, "output", Duration::from_secs(2)).await;
            let sleeper: i32 = output["data"].as_str().unwrap().trim().parse().unwrap();
            let exit = next_frame(&mut h.frames, "exit", Duration::from_secs(4)).await;
            assert_eq!(exit["status"], "killed");

            // Reaped by init once orphaned; a zombie counts as gone.
            let mut gone = false;
            for _ in 0..40 {
                let stat = std::fs::read_to_string(format!("/proc/{}/stat", sleeper));
                gone = match stat {
                    Ok(stat) => stat
                        .rsplit_once(')')
                        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                        .unwrap_or(false),
                    Err(_) => true,
                };
                if gone {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(gone, "background sleep {} survived the timeout", sleeper);
            h.scheduler.stop_all();
        }

        #[tokio::test]
        async fn failed_spawn_still_reschedules() {
            let mut h = harness();
            let mut bookmark = watched("true", 60.0, None);
            bookmark.cwd = Some("/definitely/not/a/dir".to_string());
            let id = bookmark.id.clone();

            h.scheduler.start_watch("web", bookmark);
            let exit = next_frame(&mut h.frames, "exit", Duration::from_secs(2)).await;
            assert_eq!(exit["status"], "error");

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(h.scheduler.phase(&id), Some(WatchPhase::Scheduled));
            h.scheduler.stop_all();
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn stop_is_idempotent_and_kills_current_run() {
            let mut h = harness();
            let bookmark = watched("exec sleep 30", 60.0, None);
            let id = bookmark.id.clone();

            h.scheduler.start_watch("web", bookmark);
            next_frame(&mut h.frames, "watch:tick", Duration::from_secs(2)).await;
            assert_eq!(running_watch_processes(&h.table), 1);

            assert!(h.scheduler.stop_watch(&id));
            assert!(!h.scheduler.stop_watch(&id));
            assert!(!h.scheduler.stop_watch("never-started"));

            assert!(!h.scheduler.is_watching(&id));
            assert!(h.table.list("web").is_empty());
            assert_eq!(h.table.running_count(), 0);

            // The killed run must not produce a late exit broadcast.
            tokio::time::sleep(Duration::from_millis(300)).await;
            while let Ok(raw) = h.frames.try_recv() {
                assert!(!raw.contains("\"type\":\"exit\""), "stale exit: {}", raw);
            }
        }

        #[tokio::test]
        async fn restart_replaces_previous_run() {
            let mut h = harness();
            let bookmark = watched("exec sleep 30", 60.0, None);
            let id = bookmark.id.clone();

            h.scheduler.start_watch("web", bookmark.clone());
            let first = h.scheduler.current_process(&id).unwrap();
            h.scheduler.start_watch("web", bookmark);
            let second = h.scheduler.current_process(&id).unwrap();

            assert_ne!(first, second);
            assert_eq!(h.scheduler.active_watches(), vec![id.clone()]);
            let history = h.table.list("web");
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].id, second);

            h.scheduler.stop_all();
            assert!(h.scheduler.active_watches().is_empty());
        }

        #[tokio::test]
        async fn resume_only_enabled_project_watches() {
            let h = harness();
            let enabled = watched("exec sleep 30", 60.0, None);
            let mut disabled = watched("exec sleep 30", 60.0, None);
            if let Some(w) = disabled.watch.as_mut() {
                w.enabled = false;
            }
            let mut global = watched("exec sleep 30", 60.0, None);
            global.scope = BookmarkScope::Global;

            let mut file = BookmarkFile::default();
            file.global.push(global);
            file.projects
                .insert("web".to_string(), vec![enabled.clone(), disabled]);

            assert_eq!(h.scheduler.load_from_bookmarks(&file), 1);
            assert_eq!(h.scheduler.active_watches(), vec![enabled.id]);

            assert_eq!(h.scheduler.stop_all(), 1);
        }
    }

    mod state_broadcast {
        use super::*;

        #[tokio::test]
        async fn bursts_collapse_to_one_broadcast() {
            let mut h = harness();
            let a = watched("exec sleep 30", 60.0, None);
            let b = watched("exec sleep 30", 60.0, None);
            let c = watched("exec sleep 30", 60.0, None);
            let c_id = c.id.clone();
            let mut expected = vec![a.id.clone(), b.id.clone()];
            expected.sort();

            h.scheduler.start_watch("web", a);
            h.scheduler.start_watch("web", b);
            h.scheduler.start_watch("web", c);
            h.scheduler.stop_watch(&c_id);

            tokio::time::sleep(Duration::from_millis(300)).await;
            let states: Vec<Value> = std::iter::from_fn(|| h.frames.try_recv().ok())
                .map(|raw| serde_json::from_str::<Value>(&raw).unwrap())
                .filter(|f| f["type"] == "watch:state")
                .collect();
            assert_eq!(states.len(), 1);
            assert_eq!(states[0]["active"], serde_json::json!(expected));

            h.scheduler.stop_all();
        }
    }
}

//! Per-watch bookkeeping.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bookmarks::{
    Bookmark, DEFAULT_WATCH_INTERVAL_SECS, MAX_WATCH_INTERVAL_SECS, MAX_WATCH_TIMEOUT_SECS,
    MIN_WATCH_INTERVAL_SECS, MIN_WATCH_TIMEOUT_SECS,
};
use crate::process::{ProcessId, WatchTag};

/// Where a watch is in its cycle.
///
/// ```text
/// Idle --start--> Ticking --spawned--> WaitingForExit --exit--> Scheduled
///                    ^                                              |
///                    +------------------ timer fires ---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchPhase {
    Idle,
    Ticking,
    WaitingForExit,
    Scheduled,
}

/// Identifies one tick of one watch run.
///
/// `generation` changes each time a watch is (re)started, `tick` each time it
/// spawns. Events carrying a stale token belong to a run nobody is listening
/// to any more and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TickToken {
    pub generation: u64,
    pub tick: u64,
}

/// Pending next tick.
pub(crate) struct TickTimer {
    pub next_fire: Instant,
    pub handle: JoinHandle<()>,
}

pub(crate) struct WatchState {
    pub project_slug: String,
    pub bookmark: Bookmark,
    pub generation: u64,
    pub tick: u64,
    pub phase: WatchPhase,
    pub timer: Option<TickTimer>,
    pub timeout: Option<JoinHandle<()>>,
    pub current: Option<ProcessId>,
}

impl WatchState {
    pub fn new(project_slug: &str, bookmark: Bookmark, generation: u64) -> Self {
        Self {
            project_slug: project_slug.to_string(),
            bookmark,
            generation,
            tick: 0,
            phase: WatchPhase::Idle,
            timer: None,
            timeout: None,
            current: None,
        }
    }

    pub fn token(&self) -> TickToken {
        TickToken {
            generation: self.generation,
            tick: self.tick,
        }
    }

    /// Delay between an exit and the next tick, always within [1s, 1h].
    pub fn interval(&self) -> Duration {
        let secs = self
            .bookmark
            .watch
            .as_ref()
            .map(|w| w.interval)
            .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS);
        bounded_secs(secs, MIN_WATCH_INTERVAL_SECS, MAX_WATCH_INTERVAL_SECS)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_WATCH_INTERVAL_SECS))
    }

    /// The bookmark's own per-tick ceiling, or `default`.
    pub fn tick_timeout(&self, default: Duration) -> Duration {
        self.bookmark
            .watch
            .as_ref()
            .and_then(|w| w.timeout)
            .and_then(|t| bounded_secs(t, MIN_WATCH_TIMEOUT_SECS, MAX_WATCH_TIMEOUT_SECS))
            .unwrap_or(default)
    }

    pub fn tag(&self) -> WatchTag {
        WatchTag {
            bookmark_id: self.bookmark.id.clone(),
            scope: self.bookmark.scope,
        }
    }

    /// Cancel pending timers and hand back the process still attached, if any.
    pub fn teardown(&mut self) -> Option<ProcessId> {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
        self.phase = WatchPhase::Idle;
        self.current.take()
    }
}

/// `None` for NaN; anything else is clamped into `[min, max]`.
fn bounded_secs(secs: f64, min: f64, max: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs.clamp(min, max)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::{BookmarkScope, WatchConfig};

    fn bookmark(interval: f64, timeout: Option<f64>) -> Bookmark {
        let mut bookmark = Bookmark::new(BookmarkScope::Project, "date", None);
        bookmark.watch = Some(WatchConfig {
            enabled: true,
            interval,
            mode: None,
            timeout,
        });
        bookmark
    }

    #[test]
    fn interval_and_timeout_come_from_bookmark() {
        let state = WatchState::new("web", bookmark(2.5, Some(10.0)), 1);
        assert_eq!(state.interval(), Duration::from_millis(2500));
        assert_eq!(
            state.tick_timeout(Duration::from_secs(300)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn missing_timeout_uses_default() {
        let state = WatchState::new("web", bookmark(5.0, None), 1);
        assert_eq!(
            state.tick_timeout(Duration::from_secs(300)),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn out_of_range_settings_never_panic() {
        let default = Duration::from_secs(300);

        let state = WatchState::new("web", bookmark(0.0, Some(-1.0)), 1);
        assert_eq!(state.interval(), Duration::from_secs(1));
        assert_eq!(state.tick_timeout(default), Duration::from_secs(1));

        let state = WatchState::new("web", bookmark(-5.0, Some(1e300)), 1);
        assert_eq!(state.interval(), Duration::from_secs(1));
        assert_eq!(state.tick_timeout(default), Duration::from_secs(3600));

        let state = WatchState::new("web", bookmark(f64::NAN, Some(f64::NAN)), 1);
        assert_eq!(state.interval(), Duration::from_secs(60));
        assert_eq!(state.tick_timeout(default), default);
    }

    #[test]
    fn tokens_differ_per_tick_and_generation() {
        let mut state = WatchState::new("web", bookmark(5.0, None), 3);
        let first = state.token();
        state.tick += 1;
        assert_ne!(first, state.token());
        assert_eq!(state.token().generation, 3);
    }

    #[test]
    fn teardown_returns_current_process() {
        let mut state = WatchState::new("web", bookmark(5.0, None), 1);
        state.current = Some(ProcessId::from("p1"));
        state.phase = WatchPhase::WaitingForExit;

        assert_eq!(state.teardown(), Some(ProcessId::from("p1")));
        assert_eq!(state.phase, WatchPhase::Idle);
        assert_eq!(state.teardown(), None);
    }
}

//! Interval re-execution of bookmarked commands.

mod scheduler;
mod state;

pub use scheduler::{
    WatchScheduler, WatchSchedulerConfig, DEFAULT_STATE_DEBOUNCE, DEFAULT_TICK_TIMEOUT,
};
pub use state::WatchPhase;

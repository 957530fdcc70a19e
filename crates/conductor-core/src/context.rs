//! Engine - the shared state behind every connection.
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │          Engine          │
//!                 ├──────────────────────────┤
//!                 │  - ProcessTable          │
//!                 │  - WatchScheduler        │
//!                 │  - TaskRegistry          │
//!                 │  - ClientRegistry        │
//!                 │  - BookmarkStore         │
//!                 └────────────┬─────────────┘
//!                              │
//!                 ┌────────────┴─────────────┐
//!                 ▼                          ▼
//!        ┌──────────────────┐        ┌───────────────┐
//!        │ ConnectionRouter │        │ daemon sweeps │
//!        └──────────────────┘        └───────────────┘
//! ```
//!
//! Cloning an `Engine` clones the `Arc`s, not the state.
//!
//! ## Building
//!
//! [`Engine::new`] builds every component from an [`EngineConfig`]. Tests and
//! embedders that need to share or pre-populate a component hand it to
//! [`EngineBuilder`] instead; anything not provided is created from the
//! config.
//!
//! ```ignore
//! let clients = Arc::new(ClientRegistry::new());
//! let engine = Engine::builder()
//!     .config(EngineConfig::default().with_data_dir("/var/lib/conductor"))
//!     .clients(Arc::clone(&clients))
//!     .build();
//! ```
//!
//! ## Lifecycle
//!
//! 1. [`Engine::start`] restores `processes.json` and resumes enabled watches
//! 2. connections come and go through the router
//! 3. [`Engine::shutdown`] stops watches, kills survivors and snapshots

use std::sync::Arc;

use crate::bookmarks::BookmarkStore;
use crate::clients::ClientRegistry;
use crate::config::EngineConfig;
use crate::process::ProcessTable;
use crate::spawn::Signal;
use crate::tasks::TaskRegistry;
use crate::watch::WatchScheduler;

/// Builder for [`Engine`] with optional pre-made components.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    processes: Option<Arc<ProcessTable>>,
    clients: Option<Arc<ClientRegistry>>,
    tasks: Option<Arc<TaskRegistry>>,
    bookmarks: Option<Arc<BookmarkStore>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration used for every component not supplied directly.
    ///
    /// # Arguments
    /// * `config` - data directory, shell prefix, timeouts and buffer limits
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing ProcessTable (for testing or custom configurations).
    pub fn processes(mut self, table: Arc<ProcessTable>) -> Self {
        self.processes = Some(table);
        self
    }

    /// Use an existing ClientRegistry (for testing or custom configurations).
    pub fn clients(mut self, registry: Arc<ClientRegistry>) -> Self {
        self.clients = Some(registry);
        self
    }

    /// Use an existing TaskRegistry (for testing or custom configurations).
    pub fn tasks(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.tasks = Some(registry);
        self
    }

    /// Use an existing BookmarkStore (for testing or custom configurations).
    pub fn bookmarks(mut self, store: Arc<BookmarkStore>) -> Self {
        self.bookmarks = Some(store);
        self
    }

    /// Assemble the engine.
    ///
    /// The bookmark store is loaded from disk here, but the process snapshot
    /// is not restored until [`Engine::start`]. The watch scheduler is always
    /// built fresh around the final process table and client registry.
    pub fn build(self) -> Engine {
        let config = self.config;
        let processes = self
            .processes
            .unwrap_or_else(|| Arc::new(ProcessTable::new(config.process_table())));
        let clients = self
            .clients
            .unwrap_or_else(|| Arc::new(ClientRegistry::new()));
        let tasks = self.tasks.unwrap_or_else(|| Arc::new(TaskRegistry::new()));
        let bookmarks = self
            .bookmarks
            .unwrap_or_else(|| Arc::new(BookmarkStore::load(config.bookmarks_path())));
        let watches = Arc::new(WatchScheduler::new(
            Arc::clone(&processes),
            Arc::clone(&clients),
            config.watch_scheduler(),
        ));

        Engine {
            config: Arc::new(config),
            processes,
            watches,
            tasks,
            clients,
            bookmarks,
        }
    }
}

/// Shared handle to every engine component.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub processes: Arc<ProcessTable>,
    pub watches: Arc<WatchScheduler>,
    pub tasks: Arc<TaskRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub bookmarks: Arc<BookmarkStore>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Build an engine with every component created from `config`.
    ///
    /// # Arguments
    /// * `config` - engine configuration; `data_dir: None` keeps all state in memory
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Boot sequence: restore the process snapshot, then resume watches.
    ///
    /// Must run inside a tokio runtime. Returns the number of resumed watches.
    pub fn start(&self) -> usize {
        let restored = self.processes.restore_state();
        let resumed = self.watches.load_from_bookmarks(&self.bookmarks.all());
        log::info!(
            "Engine started: {} process records restored, {} watches resumed",
            restored,
            resumed
        );
        resumed
    }

    /// Stop watches, kill what is still running and write a final snapshot.
    pub fn shutdown(&self) {
        let stopped = self.watches.stop_all();
        let killed = self.processes.kill_all(Signal::Kill);
        if let Err(e) = self.processes.save_state() {
            log::warn!("Failed to save process snapshot on shutdown: {}", e);
        }
        log::info!(
            "Engine shut down: {} watches stopped, {} processes killed",
            stopped,
            killed
        );
    }

    /// Drop finished tasks older than the configured age.
    pub fn sweep_tasks(&self) -> usize {
        self.tasks.clear_old_tasks(self.config.task_max_age)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::builder().build()
    }
}

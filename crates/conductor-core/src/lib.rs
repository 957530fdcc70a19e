//! # conductor-core
//!
//! Process supervision and multi-client sync engine.
//!
//! This crate is transport-agnostic and can be used by:
//! - the HTTP/WebSocket server (`conductor-http`)
//! - the standalone daemon (`conductor-daemon`)
//! - tests, which drive a [`ConnectionRouter`] over plain channels
//!
//! ## Key Concepts
//!
//! - **ProcessTable**: every spawned command, its status and bounded output
//! - **WatchScheduler**: re-runs bookmarked commands on an interval, never overlapping
//! - **TaskRegistry**: per-session state of the external prompt pipeline
//! - **ClientRegistry**: connected clients and who is watching which session
//! - **ConnectionRouter**: turns inbound frames into calls on the above

pub mod bookmarks;
pub mod clients;
pub mod config;
pub mod context;
pub mod process;
pub mod protocol;
pub mod router;
pub mod shell;
pub mod spawn;
pub mod tasks;
pub mod watch;

// Re-export commonly used types
pub use clients::{ClientHandle, ClientRegistry};
pub use config::EngineConfig;
pub use context::{Engine, EngineBuilder};
pub use process::{ProcessId, ProcessStatus, ProcessTable};
pub use protocol::Outbound;
pub use router::{Connection, ConnectionContext, ConnectionRouter, RouterError};
pub use tasks::{CancelToken, TaskRegistry};
pub use watch::WatchScheduler;

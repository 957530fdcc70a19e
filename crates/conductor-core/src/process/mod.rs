//! Process tracking.
//!
//! - [`ProcessTable`] owns every record and is the only writer
//! - [`ProcessRecord`] keeps a bounded ring of output chunks
//! - snapshots are written after each state change and restored at boot

mod record;
mod snapshot;
mod table;

pub use record::{
    OutputBuffer, OutputChunk, ProcessId, ProcessRecord, ProcessStatus, ProcessView, WatchTag,
    MAX_OUTPUT_CHUNKS, PERSISTED_OUTPUT_CHUNKS,
};
pub use snapshot::{load_snapshot, save_snapshot, Snapshot, SnapshotError};
pub use table::{
    ProcessError, ProcessEvent, ProcessTable, ProcessTableConfig, SpawnRequest, SpawnedProcess,
};

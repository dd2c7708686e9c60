// sync/mod.rs - Sync engine: apply pipeline, batch logic, runner, transport

pub mod apply;
pub mod diff;
pub mod engine;
pub mod runner;
pub mod transport;

#[cfg(test)]
mod sync_tests;

pub use apply::{apply_incoming_change, ApplyOutcome};
pub use diff::{diff_lines, DiffRow, DiffRowKind};
pub use engine::{
    acknowledge_push_result, advance_cursor, apply_pull_batch, prepare_push_batch,
};
pub use runner::{backoff_delay, CycleOptions, PullStageSummary, SyncRunner, SyncSummary};
pub use transport::{HttpTransport, SyncTransport, DEFAULT_DEADLINE};

// lib.rs - SoloStack sync core
//
// Offline-first task and project store with a durable outbox, a
// deterministic push/pull protocol, conflict detection and resolution, and
// provider/runtime configuration. Presentation layers sit on top of this
// crate; only the runner talks to the network.

pub mod db;
pub mod device;
pub mod protocol;
pub mod provider;
pub mod sync;

mod error;

pub use db::Database;
pub use error::{Error, Result};
pub use sync::{CycleOptions, HttpTransport, SyncRunner, SyncSummary, SyncTransport};

//! Incremental Synchronization Module
//!
//! This module holds the engine that turns upstream blocks into the derived ledger:
//!
//! - `controller`: The generic catch-up state machine (`RECOVERING`, `CATCHING_UP`, `STEADY`) and the `BlockHandler` seam.
//! - `pipeline`: The main chain-sync `BlockHandler` wiring source, processor, caches and store together.
//! - `transaction_processor`: Turns one expanded block into records and balance deltas.
//! - `events`: Closed enum of known log shapes and the signature table decoding into it.
//! - `trace`: Attribution of receipt logs to the call-trace tree and internal transaction rows.
//! - `cache`: Write-back balance caches of one processing window.
//! - `reconcile`: Point and recovery-time reconciliation against the upstream source.
//! - `probe`: Interface probing of newly created contracts.
//! - `progress_tracker`: Counters and periodic progress logs.
//!
//! Blocks are processed strictly in order; derived records are flushed before caches and
//! caches before the head, so any crash is repaired by truncating above the head and
//! replaying.

/// Write-back balance caches of one window
pub mod cache;
/// Catch-up state machine
pub mod controller;
/// Typed log decoding
pub mod events;
/// Main chain-sync pipeline
pub mod pipeline;
/// Contract interface probing
pub mod probe;
/// Progress counters
pub mod progress_tracker;
/// Reconciliation against the authoritative source
pub mod reconcile;
/// Trace/log attribution
pub mod trace;
/// Block and transaction processing
pub mod transaction_processor;
/// Error types
mod types;

pub use controller::{BlockHandler, CatchUpController, ShutdownHandle, SyncMode};
pub use pipeline::ChainSyncPipeline;
pub use types::*;

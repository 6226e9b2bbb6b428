//! Upstream chain source integration
//!
//! This module provides the client and types for reading blocks, accounts, execution traces
//! and read-only contract calls from the upstream node API, plus a best-effort block prefetcher.

/// REST client and the `SourceClient` call contract
mod client;
/// Scripted source for unit tests
#[cfg(test)]
pub mod mock;
/// Read-ahead cache of upcoming blocks
mod prefetch;
/// Type definitions for the upstream wire format
mod types;

pub use client::{HttpSourceClient, SourceClient};
pub use prefetch::BlockPrefetcher;
pub use types::*;

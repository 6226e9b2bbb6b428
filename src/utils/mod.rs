//!
//! Utility module for the ledger sync service.
//!
//! Re-exports formatting helpers used in log lines throughout the codebase.
/// Utility functions for formatting and display
pub mod index;

pub use index::{NATIVE_DECIMALS, format_token_amount};

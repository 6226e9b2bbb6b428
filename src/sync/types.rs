use crate::ledger::StoreError;
use crate::source::SourceError;

/// Why a clause's outputs could not be attributed to its call trace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
	#[error("unsupported trace operation {0}")]
	UnsupportedOp(String),

	#[error("trace consumed {consumed_events}/{events} events and {consumed_transfers}/{transfers} transfers")]
	CountMismatch {
		events: usize,
		consumed_events: usize,
		transfers: usize,
		consumed_transfers: usize,
	},
}

/// Error types for the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Source error: {0}")]
	SourceError(#[from] SourceError),

	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	#[error("Consistency error: {0}")]
	ConsistencyError(String),

	#[error("Trace mismatch: {0}")]
	TraceMismatch(#[from] ReconcileError),

	#[error("Bootstrap failed: {0}")]
	BootstrapError(String),
}

impl SyncError {
	/// Only a failed bootstrap stops the process; everything else is retried by the loop.
	pub fn is_fatal(&self) -> bool {
		matches!(self, SyncError::BootstrapError(_))
	}
}

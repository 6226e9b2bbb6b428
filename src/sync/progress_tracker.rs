//! Progress tracking for one sync pipeline.
//!
//! `SyncProgressTracker` counts processed blocks, transactions and movements, flushed
//! windows and recovery runs, and logs a summary every 1000 blocks or when forced.

use tracing::info;

const LOG_EVERY_BLOCKS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
	/// Head the session started from
	start_block: u64,
	/// Highest block processed so far (not necessarily flushed)
	highest_processed: u64,
	/// Highest block whose window was flushed and whose head was saved
	highest_flushed: u64,
	blocks_processed: u64,
	transactions_processed: usize,
	movements_processed: usize,
	windows_flushed: usize,
	recoveries: usize,
	last_logged_block: u64,
}

impl SyncProgressTracker {
	pub fn new(start_block: u64) -> Self {
		Self {
			start_block,
			highest_processed: start_block,
			highest_flushed: start_block,
			blocks_processed: 0,
			transactions_processed: 0,
			movements_processed: 0,
			windows_flushed: 0,
			recoveries: 0,
			last_logged_block: start_block,
		}
	}

	pub fn record_block(&mut self, number: u64, transactions: usize, movements: usize) {
		self.highest_processed = self.highest_processed.max(number);
		self.blocks_processed += 1;
		self.transactions_processed += transactions;
		self.movements_processed += movements;
	}

	pub fn record_flush(&mut self, head: u64) {
		self.highest_flushed = self.highest_flushed.max(head);
		self.windows_flushed += 1;
	}

	/// A recovery rewinds unflushed progress back to `head`.
	pub fn record_recovery(&mut self, head: u64) {
		self.recoveries += 1;
		self.highest_processed = head;
		self.highest_flushed = head;
	}

	/// Logs progress every 1000 blocks, or immediately when `force` is set.
	pub fn log_progress(&mut self, force: bool) {
		let since_last = self.highest_flushed.saturating_sub(self.last_logged_block);
		if !force && since_last < LOG_EVERY_BLOCKS {
			return;
		}
		info!("Sync progress: {}", self.stats().summary());
		self.last_logged_block = self.highest_flushed;
	}

	pub fn stats(&self) -> SyncStats {
		SyncStats {
			start_block: self.start_block,
			head: self.highest_flushed,
			blocks_processed: self.blocks_processed,
			transactions_processed: self.transactions_processed,
			movements_processed: self.movements_processed,
			windows_flushed: self.windows_flushed,
			recoveries: self.recoveries,
		}
	}
}

/// Snapshot of the tracker's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
	pub start_block: u64,
	pub head: u64,
	pub blocks_processed: u64,
	pub transactions_processed: usize,
	pub movements_processed: usize,
	pub windows_flushed: usize,
	pub recoveries: usize,
}

impl SyncStats {
	pub fn summary(&self) -> String {
		format!(
			"blocks {} to {}: {} blocks, {} transactions, {} movements in {} windows{}",
			self.start_block,
			self.head,
			self.blocks_processed,
			self.transactions_processed,
			self.movements_processed,
			self.windows_flushed,
			if self.recoveries == 0 {
				String::new()
			} else {
				format!(" ({} recoveries)", self.recoveries)
			}
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recovery_rewinds_to_the_saved_head() {
		let mut tracker = SyncProgressTracker::new(10);
		tracker.record_block(11, 3, 5);
		tracker.record_block(12, 1, 0);
		tracker.record_flush(11);
		tracker.record_recovery(11);

		let stats = tracker.stats();
		assert_eq!(stats.head, 11);
		assert_eq!(stats.blocks_processed, 2);
		assert_eq!(stats.transactions_processed, 4);
		assert_eq!(stats.recoveries, 1);
		assert!(stats.summary().ends_with("(1 recoveries)"));
	}

	#[test]
	fn summary_omits_recoveries_when_none_happened() {
		let mut tracker = SyncProgressTracker::new(0);
		tracker.record_block(1, 2, 2);
		tracker.record_flush(1);
		assert_eq!(
			tracker.stats().summary(),
			"blocks 0 to 1: 1 blocks, 2 transactions, 2 movements in 1 windows"
		);
	}
}

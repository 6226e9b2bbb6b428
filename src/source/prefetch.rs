//! Best-effort read-ahead of upcoming blocks.
//!
//! `BlockPrefetcher` serves expanded blocks to the processor and, after every request,
//! spawns detached fetches for the next few block numbers so that the following requests
//! are answered from memory. A failed or empty prefetch is dropped; the block is simply
//! fetched again on demand.

use super::client::SourceClient;
use super::types::{ExpandedBlock, SourceError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub struct BlockPrefetcher<S> {
	source: Arc<S>,
	depth: u64,
	cache: Arc<Mutex<HashMap<u64, ExpandedBlock>>>,
	in_flight: Arc<Mutex<HashSet<u64>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: SourceClient + 'static> BlockPrefetcher<S> {
	pub fn new(source: Arc<S>, depth: u64) -> Self {
		Self {
			source,
			depth,
			cache: Arc::new(Mutex::new(HashMap::new())),
			in_flight: Arc::new(Mutex::new(HashSet::new())),
		}
	}

	/// Expanded block `number`, from the read-ahead cache when available. Schedules the
	/// next `depth` blocks up to `best`.
	pub async fn fetch(
		&self,
		number: u64,
		best: u64,
	) -> Result<Option<ExpandedBlock>, SourceError> {
		let cached = {
			let mut cache = guard(&self.cache);
			cache.retain(|n, _| *n >= number);
			cache.remove(&number)
		};
		self.warm(number + 1, best);

		match cached {
			Some(block) => {
				debug!(block = number, "Served block from prefetch cache");
				Ok(Some(block))
			}
			None => self.source.get_expanded_block(number).await,
		}
	}

	/// Drops every cached block.
	pub fn clear(&self) {
		guard(&self.cache).clear();
	}

	fn warm(&self, from: u64, best: u64) {
		if self.depth == 0 || from > best {
			return;
		}
		let until = best.min(from + self.depth - 1);
		for number in from..=until {
			if guard(&self.cache).contains_key(&number) || !guard(&self.in_flight).insert(number)
			{
				continue;
			}

			let source = Arc::clone(&self.source);
			let cache = Arc::clone(&self.cache);
			let in_flight = Arc::clone(&self.in_flight);
			tokio::spawn(async move {
				match source.get_expanded_block(number).await {
					Ok(Some(block)) => {
						guard(&cache).insert(number, block);
					}
					Ok(None) => debug!(block = number, "Prefetch found no block"),
					Err(e) => debug!(block = number, "Prefetch failed: {}", e),
				}
				guard(&in_flight).remove(&number);
			});
		}
	}

	#[cfg(test)]
	pub fn cached(&self, number: u64) -> bool {
		guard(&self.cache).contains_key(&number)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::mock::{MockSource, fixtures};
	use std::sync::atomic::Ordering;
	use std::time::Duration;

	async fn wait_until_cached(prefetcher: &BlockPrefetcher<MockSource>, number: u64) {
		for _ in 0..100 {
			if prefetcher.cached(number) {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("block {} was never prefetched", number);
	}

	#[tokio::test]
	async fn serves_prefetched_blocks_from_cache() {
		let source = Arc::new(MockSource::new());
		for n in 1..=3 {
			source.add_block(fixtures::block(n, vec![]));
		}
		let prefetcher = BlockPrefetcher::new(Arc::clone(&source), 2);

		let first = prefetcher.fetch(1, 3).await.unwrap().unwrap();
		assert_eq!(first.header.number, 1);
		wait_until_cached(&prefetcher, 2).await;
		wait_until_cached(&prefetcher, 3).await;
		let fetches = source.block_fetches.load(Ordering::SeqCst);

		let second = prefetcher.fetch(2, 3).await.unwrap().unwrap();
		assert_eq!(second.header.number, 2);
		assert_eq!(source.block_fetches.load(Ordering::SeqCst), fetches);
	}

	#[tokio::test]
	async fn prefetch_failures_are_ignored() {
		let source = Arc::new(MockSource::new());
		source.add_block(fixtures::block(1, vec![]));
		source.add_block(fixtures::block(2, vec![]));
		source.fail_block(2);
		let prefetcher = BlockPrefetcher::new(Arc::clone(&source), 1);

		assert!(prefetcher.fetch(1, 2).await.unwrap().is_some());
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(!prefetcher.cached(2));

		source.heal_block(2);
		assert!(prefetcher.fetch(2, 2).await.unwrap().is_some());
	}
}

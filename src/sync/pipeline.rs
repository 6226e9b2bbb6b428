//! The main chain-sync pipeline: expanded blocks in, ledger records and balances out.

use super::cache::WindowCache;
use super::controller::{BlockHandler, ProcessedBlock};
use super::reconcile::{Reconciler, apply_account_state};
use super::transaction_processor::{BlockProcessor, ProcessorConfig};
use super::types::SyncError;
use crate::config::{IndexerConfig, NativeAlias};
use crate::ledger::{
	Account, BlockPointer, Contract, ContractKind, DerivedRecords, Head, LedgerStore,
};
use crate::source::{BlockPrefetcher, Revision, SourceClient};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ChainSyncPipeline<S, L: ?Sized> {
	name: String,
	seed_from: Option<String>,
	source: Arc<S>,
	store: Arc<L>,
	processor: BlockProcessor<S, L>,
	reconciler: Arc<Reconciler<S>>,
	prefetcher: BlockPrefetcher<S>,
	cache: WindowCache,
	pending: DerivedRecords,
	/// Total score of the last processed block, parent of the next one
	parent_total_score: Option<u64>,
	genesis_accounts: Vec<Address>,
	native_aliases: Vec<NativeAlias>,
}

impl<S, L> ChainSyncPipeline<S, L>
where
	S: SourceClient + 'static,
	L: LedgerStore + ?Sized,
{
	pub fn new(source: Arc<S>, store: Arc<L>, config: &IndexerConfig) -> Self {
		let reconciler = Arc::new(Reconciler::new(
			Arc::clone(&source),
			config.reconcile_concurrency,
		));
		Self {
			name: config.pipeline.clone(),
			seed_from: config.seed_from.clone(),
			processor: BlockProcessor::new(
				Arc::clone(&source),
				Arc::clone(&store),
				Arc::clone(&reconciler),
				ProcessorConfig::from(config),
			),
			prefetcher: BlockPrefetcher::new(Arc::clone(&source), config.prefetch_depth),
			source,
			store,
			reconciler,
			cache: WindowCache::new(),
			pending: DerivedRecords::default(),
			parent_total_score: None,
			genesis_accounts: config.genesis_accounts.clone(),
			native_aliases: config.native_aliases.clone(),
		}
	}

	/// Native balances of the preallocated accounts, read at genesis.
	async fn seed_accounts(&self, genesis: BlockPointer) -> Result<Vec<Account>, SyncError> {
		let mut accounts = Vec::with_capacity(self.genesis_accounts.len());
		for address in &self.genesis_accounts {
			let state = self
				.source
				.get_account(*address, Revision::Number(0))
				.await
				.map_err(|e| {
					SyncError::BootstrapError(format!("genesis account {}: {}", address, e))
				})?;
			let mut account = Account::new(*address, genesis);
			apply_account_state(&mut account, &state, 0);
			accounts.push(account);
		}
		Ok(accounts)
	}

	fn alias_contracts(&self, genesis: BlockPointer) -> Vec<Contract> {
		self.native_aliases
			.iter()
			.map(|alias| Contract {
				address: alias.address,
				kind: ContractKind::Erc20,
				name: None,
				symbol: None,
				decimals: 18,
				total_supply: U256::ZERO,
				creator: Address::ZERO,
				created: genesis,
				creation_tx: None,
				creation_input_hash: None,
				verified: false,
				verified_from: None,
			})
			.collect()
	}

	/// Total score of block `number`, from the store or else from the source.
	async fn total_score_at(&self, number: u64) -> Result<(BlockPointer, u64), SyncError> {
		if let Some(block) = self.store.find_block(number).await? {
			return Ok((block.pointer(), block.total_score));
		}
		let block = self
			.source
			.get_block(Revision::Number(number))
			.await?
			.ok_or_else(|| SyncError::ConsistencyError(format!("block {} missing upstream", number)))?;
		let header = block.header;
		Ok((
			BlockPointer::new(header.number, header.id, header.timestamp),
			header.total_score,
		))
	}
}

#[async_trait]
impl<S, L> BlockHandler for ChainSyncPipeline<S, L>
where
	S: SourceClient + 'static,
	L: LedgerStore + ?Sized,
{
	fn name(&self) -> &str {
		&self.name
	}

	fn seed_from(&self) -> Option<&str> {
		self.seed_from.as_deref()
	}

	async fn bootstrap(&mut self) -> Result<BlockPointer, SyncError> {
		let genesis = self
			.source
			.get_expanded_block(0)
			.await
			.map_err(|e| SyncError::BootstrapError(format!("genesis block unavailable: {}", e)))?
			.ok_or_else(|| SyncError::BootstrapError("genesis block not found upstream".to_string()))?;
		let header = &genesis.header;
		let pointer = BlockPointer::new(header.number, header.id, header.timestamp);

		let mut records = self
			.processor
			.process_block(&genesis, None, &mut self.cache)
			.await?;
		records.contracts.extend(self.alias_contracts(pointer));
		self.pending.append(records);
		self.parent_total_score = Some(header.total_score);

		let accounts = self.seed_accounts(pointer).await?;
		info!(
			"[{}] Bootstrapped genesis {} with {} seeded accounts and {} alias contracts",
			self.name,
			pointer.hash,
			accounts.len(),
			self.native_aliases.len()
		);
		self.store.save_accounts(accounts).await?;
		self.flush().await?;
		Ok(pointer)
	}

	async fn recover(&mut self, head: &Head) -> Result<(), SyncError> {
		self.discard_window();

		let removed = self.store.truncate_above(head.number).await?;
		if removed.total() > 0 {
			info!(
				"[{}] Truncated {} records above head {}: {:?}",
				self.name,
				removed.total(),
				head.number,
				removed
			);
		}

		let (pointer, total_score) = self.total_score_at(head.number).await?;
		self.reconciler.recover(&*self.store, pointer).await?;
		self.store.persist().await?;
		self.parent_total_score = Some(total_score);
		Ok(())
	}

	async fn best_block_number(&mut self) -> Result<u64, SyncError> {
		Ok(self.source.best_block_number().await?)
	}

	async fn process_block(&mut self, number: u64, best: u64) -> Result<ProcessedBlock, SyncError> {
		let block = self
			.prefetcher
			.fetch(number, best)
			.await?
			.ok_or_else(|| SyncError::ConsistencyError(format!("block {} missing upstream", number)))?;
		if block.header.number != number {
			return Err(SyncError::ConsistencyError(format!(
				"asked for block {} but got {}",
				number, block.header.number
			)));
		}

		let records = self
			.processor
			.process_block(&block, self.parent_total_score, &mut self.cache)
			.await?;
		self.parent_total_score = Some(block.header.total_score);

		let processed = ProcessedBlock {
			pointer: BlockPointer::new(number, block.header.id, block.header.timestamp),
			transactions: records.transactions.len(),
			movements: records.movements.len(),
		};
		self.pending.append(records);
		Ok(processed)
	}

	async fn flush(&mut self) -> Result<(), SyncError> {
		let records = std::mem::take(&mut self.pending);
		let dirty = self.cache.take_dirty();
		let (blocks, transactions, movements) = (
			records.blocks.len(),
			records.transactions.len(),
			records.movements.len(),
		);
		let aggregates = dirty.len();

		self.store.save_derived(records).await?;
		self.store.save_accounts(dirty.accounts).await?;
		self.store.save_token_balances(dirty.token_balances).await?;
		self.store.save_nfts(dirty.nfts).await?;
		self.store.persist().await?;

		debug!(
			"[{}] Flushed {} blocks, {} transactions, {} movements, {} aggregates",
			self.name, blocks, transactions, movements, aggregates
		);
		Ok(())
	}

	fn discard_window(&mut self) {
		self.pending = DerivedRecords::default();
		self.cache = WindowCache::new();
		self.prefetcher.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::{MemoryLedgerStore, TokenKind};
	use crate::source::mock::{MockSource, fixtures};

	fn config() -> IndexerConfig {
		IndexerConfig {
			pipeline: "main".to_string(),
			prefetch_depth: 0,
			reconcile_concurrency: 2,
			trace_clauses: false,
			genesis_accounts: vec![fixtures::addr(1)],
			..Default::default()
		}
	}

	/// A chain where block n (1..=3) moves 10 units of token 0 from account 1 to account 2.
	fn chain(source: &MockSource) {
		chain_with_fees(source, 0, 0);
	}

	/// Blocks 1..=3 each carry a transfer of 10 from addr(1) to addr(2), paying `paid` in
	/// gas and rewarding addr(3) with `reward`.
	fn chain_with_fees(source: &MockSource, paid: u64, reward: u64) {
		source.add_block(fixtures::block(0, vec![]));
		for n in 1..=3 {
			let (a, b) = (fixtures::addr(1), fixtures::addr(2));
			let mut tx = fixtures::tx(
				fixtures::tx_hash(n),
				a,
				vec![fixtures::transfer_clause(b, 10, 0)],
				vec![crate::source::ClauseOutput {
					contract_address: None,
					events: vec![],
					transfers: vec![fixtures::transfer(a, b, 10, 0)],
				}],
			);
			tx.paid = U256::from(paid);
			tx.reward = U256::from(reward);
			let mut block = fixtures::block(n, vec![tx]);
			block.header.beneficiary = fixtures::addr(3);
			source.add_block(block);
		}
		source.set_account(fixtures::addr(1), fixtures::account(100, 0));
	}

	fn pipeline(
		source: &Arc<MockSource>,
		store: &Arc<MemoryLedgerStore>,
	) -> ChainSyncPipeline<MockSource, MemoryLedgerStore> {
		ChainSyncPipeline::new(Arc::clone(source), Arc::clone(store), &config())
	}

	fn head(number: u64) -> Head {
		Head::new("main", number, fixtures::hash(number))
	}

	#[tokio::test]
	async fn bootstrap_seeds_genesis_accounts() {
		let source = Arc::new(MockSource::new());
		chain(&source);
		let store = Arc::new(MemoryLedgerStore::new());

		let genesis = pipeline(&source, &store).bootstrap().await.unwrap();
		assert_eq!(genesis.number, 0);
		assert!(store.find_block(0).await.unwrap().is_some());
		let seeded = store.find_account(fixtures::addr(1)).await.unwrap().unwrap();
		assert_eq!(seeded.balance, U256::from(100));
	}

	#[tokio::test]
	async fn missing_genesis_is_a_bootstrap_error() {
		let source = Arc::new(MockSource::new());
		let store = Arc::new(MemoryLedgerStore::new());
		let err = pipeline(&source, &store).bootstrap().await.unwrap_err();
		assert!(err.is_fatal());
	}

	#[tokio::test]
	async fn window_reaches_the_store_only_on_flush() {
		let source = Arc::new(MockSource::new());
		chain(&source);
		let store = Arc::new(MemoryLedgerStore::new());
		let mut pipeline = pipeline(&source, &store);
		pipeline.bootstrap().await.unwrap();

		let processed = pipeline.process_block(1, 3).await.unwrap();
		assert_eq!(processed.movements, 1);
		assert!(store.find_block(1).await.unwrap().is_none());

		pipeline.flush().await.unwrap();
		let block = store.find_block(1).await.unwrap().unwrap();
		assert_eq!(block.score, 2);
		let b = store.find_account(fixtures::addr(2)).await.unwrap().unwrap();
		assert_eq!(b.balance, U256::from(10));
	}

	#[tokio::test]
	async fn crash_before_head_save_replays_to_the_same_state() {
		let source = Arc::new(MockSource::new());
		chain(&source);

		// Uninterrupted run.
		let clean = Arc::new(MemoryLedgerStore::new());
		let mut run = pipeline(&source, &clean);
		run.bootstrap().await.unwrap();
		for n in 1..=3 {
			run.process_block(n, 3).await.unwrap();
			run.flush().await.unwrap();
		}

		// Blocks 2 and 3 are flushed but the head stayed at 1 when the process died.
		let crashed = Arc::new(MemoryLedgerStore::new());
		let mut first = pipeline(&source, &crashed);
		first.bootstrap().await.unwrap();
		for n in 1..=3 {
			first.process_block(n, 3).await.unwrap();
			first.flush().await.unwrap();
		}

		// Authoritative state at block 1: 90 / 10.
		source.set_account(fixtures::addr(1), fixtures::account(90, 0));
		source.set_account(fixtures::addr(2), fixtures::account(10, 0));
		let mut restarted = pipeline(&source, &crashed);
		restarted.recover(&head(1)).await.unwrap();
		assert!(crashed.find_block(2).await.unwrap().is_none());
		assert_eq!(
			crashed
				.find_account(fixtures::addr(2))
				.await
				.unwrap()
				.unwrap()
				.balance,
			U256::from(10)
		);

		for n in 2..=3 {
			restarted.process_block(n, 3).await.unwrap();
			restarted.flush().await.unwrap();
		}

		let (expected, actual) = (clean.snapshot(), crashed.snapshot());
		assert_eq!(actual.movements, expected.movements);
		assert_eq!(actual.blocks, expected.blocks);
		let balances = |snapshot: &crate::ledger::LedgerSnapshot| {
			snapshot
				.accounts
				.iter()
				.map(|a| (a.address, a.balance, a.secondary_balance))
				.collect::<Vec<_>>()
		};
		assert_eq!(balances(&actual), balances(&expected));
	}

	#[tokio::test]
	async fn replaying_a_flushed_block_does_not_duplicate_movements() {
		let source = Arc::new(MockSource::new());
		chain(&source);
		let store = Arc::new(MemoryLedgerStore::new());
		let mut pipeline = pipeline(&source, &store);
		pipeline.bootstrap().await.unwrap();
		pipeline.process_block(1, 3).await.unwrap();
		pipeline.flush().await.unwrap();
		pipeline.process_block(1, 3).await.unwrap();
		pipeline.flush().await.unwrap();

		let movements = store.snapshot().movements;
		assert_eq!(movements.len(), 1);
		assert_eq!(movements[0].key.token, TokenKind::Primary);
	}

	#[rstest::rstest]
	#[case::without_fees(0, 0)]
	#[case::with_fees(2, 1)]
	#[tokio::test]
	async fn native_movements_conserve_balances(#[case] paid: u64, #[case] reward: u64) {
		let source = Arc::new(MockSource::new());
		chain_with_fees(&source, paid, reward);
		let store = Arc::new(MemoryLedgerStore::new());
		let mut pipeline = pipeline(&source, &store);
		pipeline.bootstrap().await.unwrap();
		let before = store.find_account(fixtures::addr(1)).await.unwrap().unwrap();
		for n in 1..=3 {
			pipeline.process_block(n, 3).await.unwrap();
		}
		pipeline.flush().await.unwrap();

		let a = fixtures::addr(1);
		let after = store.find_account(a).await.unwrap().unwrap();
		let (mut inflow, mut outflow) = (U256::ZERO, U256::ZERO);
		for movement in store.snapshot().movements {
			if movement.to == a {
				inflow += movement.amount;
			}
			if movement.from == a {
				outflow += movement.amount;
			}
		}
		assert_eq!(after.balance + outflow, before.balance + inflow);
		assert_eq!(after.balance, U256::from(100 - 3 * (10 + paid)));

		let validator = store.find_account(fixtures::addr(3)).await.unwrap();
		let rewarded = validator.map(|v| v.balance).unwrap_or_default();
		assert_eq!(rewarded, U256::from(3 * reward));
	}
}

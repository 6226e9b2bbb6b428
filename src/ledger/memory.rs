//! Keyed in-memory ledger store with an optional on-disk JSON snapshot.
//!
//! Every collection is keyed by the record's unique identity, so inserting the same record
//! twice overwrites it. This is what makes a replayed window idempotent.
//!
//! A durable store appends the writes made since the last `persist` to a JSON-lines
//! journal next to the snapshot and only rewrites the full snapshot every
//! `compact_after` journal entries. Opening the store loads the snapshot and replays the
//! journal on top of it.

use super::repositories::{HeadRepository, LedgerStore, NftChanges, StoreError, write_atomic};
use super::types::*;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const DEFAULT_COMPACT_AFTER: usize = 10_000;

#[derive(Debug, Default)]
struct LedgerState {
	blocks: BTreeMap<u64, BlockRecord>,
	transactions: HashMap<B256, TransactionRecord>,
	movements: BTreeMap<MovementKey, Movement>,
	internal_txs: BTreeMap<(B256, u32, String), InternalTx>,
	bounds: BTreeMap<(B256, u32, u32), Bound>,
	unbounds: BTreeMap<(B256, u32, u32), Unbound>,
	contracts: HashMap<Address, Contract>,
	committees: BTreeMap<u64, Committee>,
	digests: BTreeMap<(B256, B256), TxDigest>,
	accounts: HashMap<Address, Account>,
	token_balances: HashMap<(Address, Address), TokenBalance>,
	nfts: BTreeMap<NftKey, Nft>,
}

/// Serialized form of the whole store, with collections in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
	pub blocks: Vec<BlockRecord>,
	pub transactions: Vec<TransactionRecord>,
	pub movements: Vec<Movement>,
	pub internal_txs: Vec<InternalTx>,
	pub bounds: Vec<Bound>,
	pub unbounds: Vec<Unbound>,
	pub contracts: Vec<Contract>,
	pub committees: Vec<Committee>,
	pub digests: Vec<TxDigest>,
	pub accounts: Vec<Account>,
	pub token_balances: Vec<TokenBalance>,
	pub nfts: Vec<Nft>,
}

/// One write to the store, as recorded in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
enum JournalEntry {
	Derived(DerivedRecords),
	Accounts(Vec<Account>),
	TokenBalances(Vec<TokenBalance>),
	Nfts(Vec<Nft>),
	Contract(Contract),
	Truncate(u64),
}

impl LedgerState {
	fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
		let mut state = LedgerState::default();
		state.insert_derived(DerivedRecords {
			blocks: snapshot.blocks,
			transactions: snapshot.transactions,
			movements: snapshot.movements,
			internal_txs: snapshot.internal_txs,
			bounds: snapshot.bounds,
			unbounds: snapshot.unbounds,
			contracts: snapshot.contracts,
			committees: snapshot.committees,
			closed_epochs: Vec::new(),
			digests: snapshot.digests,
		});
		for account in snapshot.accounts {
			state.accounts.insert(account.address, account);
		}
		for balance in snapshot.token_balances {
			state
				.token_balances
				.insert((balance.address, balance.token_address), balance);
		}
		for nft in snapshot.nfts {
			state.nfts.insert(nft.key, nft);
		}
		state
	}

	fn to_snapshot(&self) -> LedgerSnapshot {
		let mut transactions: Vec<_> = self.transactions.values().cloned().collect();
		transactions.sort_by_key(|t| (t.block.number, t.tx_index));
		let mut contracts: Vec<_> = self.contracts.values().cloned().collect();
		contracts.sort_by_key(|c| c.address);
		let mut accounts: Vec<_> = self.accounts.values().cloned().collect();
		accounts.sort_by_key(|a| a.address);
		let mut token_balances: Vec<_> = self.token_balances.values().cloned().collect();
		token_balances.sort_by_key(|b| (b.address, b.token_address));

		LedgerSnapshot {
			blocks: self.blocks.values().cloned().collect(),
			transactions,
			movements: self.movements.values().cloned().collect(),
			internal_txs: self.internal_txs.values().cloned().collect(),
			bounds: self.bounds.values().cloned().collect(),
			unbounds: self.unbounds.values().cloned().collect(),
			contracts,
			committees: self.committees.values().cloned().collect(),
			digests: self.digests.values().cloned().collect(),
			accounts,
			token_balances,
			nfts: self.nfts.values().cloned().collect(),
		}
	}

	/// Applies one write. Every write is a keyed overwrite or a truncation, so replaying a
	/// journal that was already folded into the snapshot leaves the state unchanged.
	fn apply(&mut self, entry: JournalEntry) -> TruncateStats {
		match entry {
			JournalEntry::Derived(records) => self.insert_derived(records),
			JournalEntry::Accounts(accounts) => {
				for account in accounts {
					self.accounts.insert(account.address, account);
				}
			}
			JournalEntry::TokenBalances(balances) => {
				for balance in balances {
					self.token_balances
						.insert((balance.address, balance.token_address), balance);
				}
			}
			JournalEntry::Nfts(nfts) => {
				for nft in nfts {
					self.nfts.insert(nft.key, nft);
				}
			}
			JournalEntry::Contract(contract) => {
				self.contracts.insert(contract.address, contract);
			}
			JournalEntry::Truncate(number) => return self.truncate_above(number),
		}
		TruncateStats::default()
	}

	fn truncate_above(&mut self, number: u64) -> TruncateStats {
		let mut stats = TruncateStats::default();

		let before = self.blocks.len();
		self.blocks.retain(|n, _| *n <= number);
		stats.blocks = before - self.blocks.len();

		let before = self.transactions.len();
		self.transactions.retain(|_, t| t.block.number <= number);
		stats.transactions = before - self.transactions.len();

		let before = self.movements.len();
		self.movements.retain(|_, m| m.block.number <= number);
		stats.movements = before - self.movements.len();

		let before = self.internal_txs.len();
		self.internal_txs.retain(|_, i| i.block.number <= number);
		stats.internal_txs = before - self.internal_txs.len();

		let before = self.bounds.len() + self.unbounds.len();
		self.bounds.retain(|_, b| b.block.number <= number);
		self.unbounds.retain(|_, u| u.block.number <= number);
		stats.staking_events = before - self.bounds.len() - self.unbounds.len();

		let before = self.contracts.len();
		self.contracts.retain(|_, c| c.created.number <= number);
		stats.contracts = before - self.contracts.len();

		let before = self.committees.len();
		self.committees.retain(|_, c| c.start_block.number <= number);
		stats.committees = before - self.committees.len();
		for committee in self.committees.values_mut() {
			if committee.end_block.is_some_and(|end| end.number > number) {
				committee.end_block = None;
			}
		}

		let before = self.digests.len();
		self.digests.retain(|_, d| d.block.number <= number);
		stats.digests = before - self.digests.len();
		stats
	}

	fn insert_derived(&mut self, records: DerivedRecords) {
		for block in records.blocks {
			self.blocks.insert(block.number, block);
		}
		for tx in records.transactions {
			self.transactions.insert(tx.hash, tx);
		}
		for movement in records.movements {
			self.movements.insert(movement.key, movement);
		}
		for itx in records.internal_txs {
			self.internal_txs.insert(itx.key(), itx);
		}
		for bound in records.bounds {
			self.bounds.insert(bound.key(), bound);
		}
		for unbound in records.unbounds {
			self.unbounds.insert(unbound.key(), unbound);
		}
		for contract in records.contracts {
			// Verification status survives a re-insert of the same contract.
			let merged = match self.contracts.get(&contract.address) {
				Some(existing) if existing.verified && !contract.verified => Contract {
					verified: true,
					verified_from: existing.verified_from,
					..contract
				},
				_ => contract,
			};
			self.contracts.insert(merged.address, merged);
		}
		for committee in records.committees {
			// The earliest block announcing an epoch's committee opens it.
			match self.committees.get(&committee.epoch) {
				Some(open) if open.start_block.number <= committee.start_block.number => {}
				_ => {
					self.committees.insert(committee.epoch, committee);
				}
			}
		}
		for (epoch, end) in records.closed_epochs {
			if let Some(committee) = self.committees.get_mut(&epoch) {
				if committee.end_block.is_none() {
					committee.end_block = Some(end);
				}
			}
		}
		for digest in records.digests {
			self.digests
				.insert((digest.tx_hash, digest.content_hash), digest);
		}
	}
}

pub struct MemoryLedgerStore {
	state: RwLock<LedgerState>,
	snapshot_path: Option<PathBuf>,
	/// Writes not yet appended to the journal
	pending: Mutex<Vec<JournalEntry>>,
	/// Entries in the journal file
	journal_len: Mutex<usize>,
	compact_after: usize,
}

impl Default for MemoryLedgerStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryLedgerStore {
	/// A store that lives only in memory.
	pub fn new() -> Self {
		Self {
			state: RwLock::new(LedgerState::default()),
			snapshot_path: None,
			pending: Mutex::new(Vec::new()),
			journal_len: Mutex::new(0),
			compact_after: DEFAULT_COMPACT_AFTER,
		}
	}

	/// Rewrites the full snapshot once the journal holds `entries` entries.
	pub fn compact_after(mut self, entries: usize) -> Self {
		self.compact_after = entries.max(1);
		self
	}

	/// Opens a store backed by the snapshot at `path`, restoring it and replaying its
	/// journal if they exist.
	pub async fn open(path: Option<PathBuf>) -> Result<Self, StoreError> {
		let Some(path) = path else {
			return Ok(Self::new());
		};

		let mut state = if tokio::fs::try_exists(&path).await? {
			let content = tokio::fs::read(&path).await?;
			let snapshot: LedgerSnapshot = serde_json::from_slice(&content)?;
			info!(
				"Restored ledger snapshot from {:?}: {} blocks, {} accounts",
				path,
				snapshot.blocks.len(),
				snapshot.accounts.len()
			);
			LedgerState::from_snapshot(snapshot)
		} else {
			info!("No ledger snapshot at {:?}, starting empty", path);
			LedgerState::default()
		};
		let journal_len = replay_journal(&journal_path(&path), &mut state).await?;

		Ok(Self {
			state: RwLock::new(state),
			snapshot_path: Some(path),
			pending: Mutex::new(Vec::new()),
			journal_len: Mutex::new(journal_len),
			compact_after: DEFAULT_COMPACT_AFTER,
		})
	}

	fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
		self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
		self.state
			.write()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Applies `entry` and queues it for the journal when the store is durable.
	fn commit(&self, entry: JournalEntry) -> TruncateStats {
		if self.snapshot_path.is_none() {
			return self.write().apply(entry);
		}
		let stats = self.write().apply(entry.clone());
		lock(&self.pending).push(entry);
		stats
	}

	/// Copy of every collection, in key order.
	pub fn snapshot(&self) -> LedgerSnapshot {
		self.read().to_snapshot()
	}

	pub fn committee(&self, epoch: u64) -> Option<Committee> {
		self.read().committees.get(&epoch).cloned()
	}

	/// Overwrites or inserts a contract record, e.g. after out-of-band verification.
	pub fn upsert_contract(&self, contract: Contract) {
		self.commit(JournalEntry::Contract(contract));
	}

	async fn append_journal(
		&self,
		path: &Path,
		entries: Vec<JournalEntry>,
	) -> Result<(), StoreError> {
		let mut lines = Vec::new();
		for entry in &entries {
			serde_json::to_writer(&mut lines, entry)?;
			lines.push(b'\n');
		}
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(journal_path(path))
			.await?;
		file.write_all(&lines).await?;
		file.sync_data().await?;
		*lock(&self.journal_len) += entries.len();
		Ok(())
	}

	async fn compact(&self, path: &Path) -> Result<(), StoreError> {
		let content = serde_json::to_vec(&self.snapshot())?;
		write_atomic(path, &content).await?;
		let journal = journal_path(path);
		if tokio::fs::try_exists(&journal).await? {
			tokio::fs::remove_file(&journal).await?;
		}
		*lock(&self.journal_len) = 0;
		debug!("Compacted ledger snapshot at {:?}", path);
		Ok(())
	}
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
	async fn find_block(&self, number: u64) -> Result<Option<BlockRecord>, StoreError> {
		Ok(self.read().blocks.get(&number).cloned())
	}

	async fn save_derived(&self, records: DerivedRecords) -> Result<(), StoreError> {
		self.commit(JournalEntry::Derived(records));
		Ok(())
	}

	async fn find_contract(&self, address: Address) -> Result<Option<Contract>, StoreError> {
		Ok(self.read().contracts.get(&address).cloned())
	}

	async fn find_verified_by_creation_hash(
		&self,
		hash: B256,
	) -> Result<Option<Contract>, StoreError> {
		let state = self.read();
		let mut matches: Vec<&Contract> = state
			.contracts
			.values()
			.filter(|c| c.verified && c.creation_input_hash == Some(hash))
			.collect();
		// Earliest verified contract wins so that the match does not depend on map order.
		matches.sort_by_key(|c| (c.created.number, c.address));
		Ok(matches.first().map(|c| (*c).clone()))
	}

	async fn find_account(&self, address: Address) -> Result<Option<Account>, StoreError> {
		Ok(self.read().accounts.get(&address).cloned())
	}

	async fn save_accounts(&self, accounts: Vec<Account>) -> Result<(), StoreError> {
		if !accounts.is_empty() {
			self.commit(JournalEntry::Accounts(accounts));
		}
		Ok(())
	}

	async fn find_token_balance(
		&self,
		address: Address,
		token_address: Address,
	) -> Result<Option<TokenBalance>, StoreError> {
		Ok(self
			.read()
			.token_balances
			.get(&(address, token_address))
			.cloned())
	}

	async fn save_token_balances(&self, balances: Vec<TokenBalance>) -> Result<(), StoreError> {
		if !balances.is_empty() {
			self.commit(JournalEntry::TokenBalances(balances));
		}
		Ok(())
	}

	async fn find_nft(&self, key: &NftKey) -> Result<Option<Nft>, StoreError> {
		Ok(self.read().nfts.get(key).cloned())
	}

	async fn save_nfts(&self, changes: NftChanges) -> Result<(), StoreError> {
		if !changes.is_empty() {
			let nfts = changes.minted.into_iter().chain(changes.updated).collect();
			self.commit(JournalEntry::Nfts(nfts));
		}
		Ok(())
	}

	async fn accounts_to_reconcile(&self, number: u64) -> Result<Vec<Account>, StoreError> {
		let mut found: Vec<Account> = self
			.read()
			.accounts
			.values()
			.filter(|a| a.last_update.number > number || a.needs_reconcile)
			.cloned()
			.collect();
		found.sort_by_key(|a| a.address);
		Ok(found)
	}

	async fn token_balances_to_reconcile(
		&self,
		number: u64,
	) -> Result<Vec<TokenBalance>, StoreError> {
		let mut found: Vec<TokenBalance> = self
			.read()
			.token_balances
			.values()
			.filter(|b| b.last_update.number > number || b.needs_reconcile || !b.is_consistent())
			.cloned()
			.collect();
		found.sort_by_key(|b| (b.address, b.token_address));
		Ok(found)
	}

	async fn nfts_to_reconcile(&self, number: u64) -> Result<Vec<Nft>, StoreError> {
		Ok(self
			.read()
			.nfts
			.values()
			.filter(|n| n.last_update.number > number || n.needs_reconcile)
			.cloned()
			.collect())
	}

	async fn truncate_above(&self, number: u64) -> Result<TruncateStats, StoreError> {
		let stats = self.commit(JournalEntry::Truncate(number));
		debug!("Truncated ledger above block {}: {:?}", number, stats);
		Ok(stats)
	}

	async fn persist(&self) -> Result<(), StoreError> {
		let Some(path) = &self.snapshot_path else {
			return Ok(());
		};
		let entries = std::mem::take(&mut *lock(&self.pending));
		if !entries.is_empty() {
			self.append_journal(path, entries).await?;
		}
		let journal_len = *lock(&self.journal_len);
		if journal_len >= self.compact_after || !tokio::fs::try_exists(path).await? {
			self.compact(path).await?;
		}
		Ok(())
	}
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn journal_path(snapshot: &Path) -> PathBuf {
	snapshot.with_extension("journal")
}

/// Applies every complete journal line to `state` and returns how many were applied. A
/// torn last line from an interrupted append is cut off so later appends start clean.
async fn replay_journal(path: &Path, state: &mut LedgerState) -> Result<usize, StoreError> {
	if !tokio::fs::try_exists(path).await? {
		return Ok(0);
	}
	let content = tokio::fs::read_to_string(path).await?;
	let lines: Vec<&str> = content.split_inclusive('\n').collect();
	let mut applied = 0;
	let mut valid_len = 0;
	for (index, line) in lines.iter().enumerate() {
		if line.trim().is_empty() {
			valid_len += line.len();
			continue;
		}
		let complete = line.ends_with('\n');
		match serde_json::from_str::<JournalEntry>(line) {
			Ok(entry) if complete => {
				state.apply(entry);
				applied += 1;
				valid_len += line.len();
			}
			_ if index + 1 == lines.len() => {
				warn!("Cutting torn last journal entry from {:?}", path);
				tokio::fs::write(path, &content[..valid_len]).await?;
			}
			_ => {
				return Err(StoreError::InvalidRecord(format!(
					"journal {:?} is corrupt at entry {}",
					path, index
				)));
			}
		}
	}
	if applied > 0 {
		info!("Replayed {} journal entries from {:?}", applied, path);
	}
	Ok(applied)
}

/// Head cursor store kept in memory, for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryHeadRepository {
	heads: RwLock<HashMap<String, Head>>,
}

impl MemoryHeadRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl HeadRepository for MemoryHeadRepository {
	async fn load(&self, pipeline: &str) -> Result<Option<Head>, StoreError> {
		let heads = self
			.heads
			.read()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		Ok(heads.get(pipeline).cloned())
	}

	async fn save(&self, head: &Head) -> Result<(), StoreError> {
		self.heads
			.write()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.insert(head.pipeline.clone(), head.clone());
		Ok(())
	}
}

//! Write-back balance caches valid for one processing window.
//!
//! The first touch of a key reads it through from the ledger store (or starts from zero)
//! and every later delta mutates the memoized copy. A delta that would drive a value
//! negative is not applied; instead the key is reconciled against the source at the block
//! being processed and is then *settled* for the rest of that block, since the
//! authoritative value already includes the block's remaining deltas. At flush,
//! [`WindowCache::take_dirty`] drains every touched key and leaves an empty cache behind.

use super::reconcile::Reconciler;
use super::types::SyncError;
use crate::ledger::{
	Account, BlockPointer, LedgerStore, NativeToken, Nft, NftBalance, NftChanges,
	NftKey, TokenBalance, TokenKind,
};
use crate::source::SourceClient;
use alloy_primitives::{Address, U256};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::{debug, warn};

/// Everything a window changed, ready to be written in one batch.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
	pub accounts: Vec<Account>,
	pub token_balances: Vec<TokenBalance>,
	pub nfts: NftChanges,
}

impl DirtySet {
	pub fn len(&self) -> usize {
		self.accounts.len()
			+ self.token_balances.len()
			+ self.nfts.minted.len()
			+ self.nfts.updated.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Per-address native balances.
#[derive(Debug, Default)]
pub struct AccountCache {
	entries: HashMap<Address, Account>,
	settled: HashMap<Address, u64>,
}

impl AccountCache {
	pub fn get(&self, address: &Address) -> Option<&Account> {
		self.entries.get(address)
	}

	fn is_settled(&self, address: &Address, number: u64) -> bool {
		self.settled.get(address) == Some(&number)
	}

	async fn load<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		address: Address,
		block: BlockPointer,
	) -> Result<&mut Account, SyncError> {
		match self.entries.entry(address) {
			Entry::Occupied(entry) => Ok(entry.into_mut()),
			Entry::Vacant(entry) => {
				let stored = store.find_account(address).await?;
				Ok(entry.insert(stored.unwrap_or_else(|| Account::new(address, block))))
			}
		}
	}

	pub async fn plus<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		address: Address,
		token: NativeToken,
		amount: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		if self.is_settled(&address, block.number) {
			return Ok(());
		}
		let account = self.load(store, address, block).await?;
		let free = account.free_mut(token);
		*free = free.saturating_add(amount);
		account.last_update = block;
		Ok(())
	}

	pub async fn minus<L: LedgerStore + ?Sized, S: SourceClient>(
		&mut self,
		store: &L,
		reconciler: &Reconciler<S>,
		address: Address,
		token: NativeToken,
		amount: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		self.apply(store, reconciler, address, block, |account| {
			let free = account.free(token).checked_sub(amount)?;
			*account.free_mut(token) = free;
			Some(())
		})
		.await
	}

	/// Moves `amount` from the free into the bounded balance.
	pub async fn bound<L: LedgerStore + ?Sized, S: SourceClient>(
		&mut self,
		store: &L,
		reconciler: &Reconciler<S>,
		address: Address,
		token: NativeToken,
		amount: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		self.apply(store, reconciler, address, block, |account| {
			let free = account.free(token).checked_sub(amount)?;
			*account.free_mut(token) = free;
			let bounded = account.bounded(token).saturating_add(amount);
			*account.bounded_mut(token) = bounded;
			Some(())
		})
		.await
	}

	/// Moves `amount` from the bounded back into the free balance.
	pub async fn unbound<L: LedgerStore + ?Sized, S: SourceClient>(
		&mut self,
		store: &L,
		reconciler: &Reconciler<S>,
		address: Address,
		token: NativeToken,
		amount: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		self.apply(store, reconciler, address, block, |account| {
			let bounded = account.bounded(token).checked_sub(amount)?;
			*account.bounded_mut(token) = bounded;
			let free = account.free(token).saturating_add(amount);
			*account.free_mut(token) = free;
			Some(())
		})
		.await
	}

	/// Runs `op` on a scratch copy; commits it unless a value would underflow, in which case
	/// the account is reconciled and settled instead.
	async fn apply<L, S, F>(
		&mut self,
		store: &L,
		reconciler: &Reconciler<S>,
		address: Address,
		block: BlockPointer,
		op: F,
	) -> Result<(), SyncError>
	where
		L: LedgerStore + ?Sized,
		S: SourceClient,
		F: FnOnce(&mut Account) -> Option<()>,
	{
		if self.is_settled(&address, block.number) {
			return Ok(());
		}
		let account = self.load(store, address, block).await?;
		let mut next = account.clone();
		if op(&mut next).is_some() {
			*account = next;
			account.last_update = block;
			return Ok(());
		}

		warn!(
			"Balance of {} would go negative at block {}, reconciling",
			address, block.number
		);
		if let Err(e) = reconciler.reconcile_account(account, block.number).await {
			warn!(
				"Could not reconcile {} at block {}: {}; flagged for recovery",
				address, block.number, e
			);
			account.needs_reconcile = true;
		}
		account.last_update = block;
		self.settled.insert(address, block.number);
		Ok(())
	}

	fn drain(&mut self) -> Vec<Account> {
		self.settled.clear();
		let mut accounts: Vec<Account> = self.entries.drain().map(|(_, a)| a).collect();
		accounts.sort_by_key(|a| a.address);
		accounts
	}
}

type BalanceKey = (Address, Address);

/// Per-`(holder, token contract)` fungible balances and NFT id maps.
#[derive(Debug, Default)]
pub struct TokenBalanceCache {
	entries: HashMap<BalanceKey, TokenBalance>,
	/// Working copies of `nft_balances`, merged back into `entries` at flush.
	nft_deltas: HashMap<BalanceKey, Vec<NftBalance>>,
	/// `None` settles the fungible balance, `Some(id)` one NFT entry.
	settled: HashMap<(Address, Address, Option<U256>), u64>,
}

impl TokenBalanceCache {
	pub fn get(&self, address: Address, token: Address) -> Option<&TokenBalance> {
		self.entries.get(&(address, token))
	}

	/// Current amount of NFT `id`, including unflushed deltas.
	pub fn nft_amount(&self, address: Address, token: Address, id: U256) -> U256 {
		let key = (address, token);
		let entries = self
			.nft_deltas
			.get(&key)
			.or_else(|| self.entries.get(&key).map(|b| &b.nft_balances));
		entries
			.and_then(|list| list.iter().find(|n| n.token_id == id))
			.map(|n| n.value)
			.unwrap_or_default()
	}

	async fn load<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		address: Address,
		token: Address,
		block: BlockPointer,
	) -> Result<&mut TokenBalance, SyncError> {
		match self.entries.entry((address, token)) {
			Entry::Occupied(entry) => Ok(entry.into_mut()),
			Entry::Vacant(entry) => {
				let stored = store.find_token_balance(address, token).await?;
				Ok(entry.insert(
					stored.unwrap_or_else(|| TokenBalance::new(address, token, block)),
				))
			}
		}
	}

	pub async fn plus<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		address: Address,
		token: Address,
		amount: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		if self.settled.get(&(address, token, None)) == Some(&block.number) {
			return Ok(());
		}
		let balance = self.load(store, address, token, block).await?;
		balance.balance = balance.balance.saturating_add(amount);
		balance.last_update = block;
		Ok(())
	}

	pub async fn minus<L: LedgerStore + ?Sized, S: SourceClient>(
		&mut self,
		store: &L,
		reconciler: &Reconciler<S>,
		address: Address,
		token: Address,
		amount: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		let settle_key = (address, token, None);
		if self.settled.get(&settle_key) == Some(&block.number) {
			return Ok(());
		}
		let balance = self.load(store, address, token, block).await?;
		balance.last_update = block;
		if let Some(next) = balance.balance.checked_sub(amount) {
			balance.balance = next;
			return Ok(());
		}

		warn!(
			"Token balance of {} in {} would go negative at block {}, reconciling",
			address, token, block.number
		);
		match reconciler.fungible_balance(token, address, block.number).await {
			Ok(value) => {
				warn!(
					"Reconciled token balance of {} in {}: {} -> {}",
					address, token, balance.balance, value
				);
				balance.balance = value;
			}
			Err(e) => {
				warn!(
					"Could not reconcile {} in {}: {}; flagged for recovery",
					address, token, e
				);
				balance.needs_reconcile = true;
			}
		}
		self.settled.insert(settle_key, block.number);
		Ok(())
	}

	async fn nft_entries<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		address: Address,
		token: Address,
		block: BlockPointer,
	) -> Result<&mut Vec<NftBalance>, SyncError> {
		let balance = self.load(store, address, token, block).await?;
		balance.last_update = block;
		let initial = balance.nft_balances.clone();
		Ok(self
			.nft_deltas
			.entry((address, token))
			.or_insert(initial))
	}

	pub async fn nft_plus<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		address: Address,
		token: Address,
		id: U256,
		value: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		if self.settled.get(&(address, token, Some(id))) == Some(&block.number) {
			return Ok(());
		}
		let entries = self.nft_entries(store, address, token, block).await?;
		match entries.iter_mut().find(|n| n.token_id == id) {
			Some(entry) => entry.value = entry.value.saturating_add(value),
			None => entries.push(NftBalance { token_id: id, value }),
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	pub async fn nft_minus<L: LedgerStore + ?Sized, S: SourceClient>(
		&mut self,
		store: &L,
		reconciler: &Reconciler<S>,
		address: Address,
		token: Address,
		kind: TokenKind,
		id: U256,
		value: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		let settle_key = (address, token, Some(id));
		if self.settled.get(&settle_key) == Some(&block.number) {
			return Ok(());
		}
		let entries = self.nft_entries(store, address, token, block).await?;
		if let Some(entry) = entries.iter_mut().find(|n| n.token_id == id) {
			if let Some(next) = entry.value.checked_sub(value) {
				entry.value = next;
				return Ok(());
			}
		}

		warn!(
			"NFT #{} of {} in {} would go negative at block {}, reconciling",
			id, address, token, block.number
		);
		let amount = match reconciler
			.nft_amount(kind, token, address, id, block.number)
			.await
		{
			Ok(amount) => amount,
			Err(e) => {
				warn!(
					"Could not reconcile NFT #{} of {} in {}: {}; flagged for recovery",
					id, address, token, e
				);
				if let Some(balance) = self.entries.get_mut(&(address, token)) {
					balance.needs_reconcile = true;
				}
				return Ok(());
			}
		};
		let entries = self.nft_deltas.entry((address, token)).or_default();
		match entries.iter_mut().find(|n| n.token_id == id) {
			Some(entry) => entry.value = amount,
			None => entries.push(NftBalance {
				token_id: id,
				value: amount,
			}),
		}
		self.settled.insert(settle_key, block.number);
		Ok(())
	}

	fn drain(&mut self) -> Vec<TokenBalance> {
		self.settled.clear();
		for (key, entries) in self.nft_deltas.drain() {
			if let Some(balance) = self.entries.get_mut(&key) {
				balance.nft_balances = entries.into_iter().filter(|n| !n.value.is_zero()).collect();
				balance.nft_balances.sort_by_key(|n| n.token_id);
				balance.balance = balance
					.nft_balances
					.iter()
					.fold(U256::ZERO, |sum, n| sum.saturating_add(n.value));
			}
		}
		let mut balances: Vec<TokenBalance> = self.entries.drain().map(|(_, b)| b).collect();
		balances.sort_by_key(|b| (b.address, b.token_address));
		balances
	}
}

/// Per-`(contract, token id, owner)` NFT holdings.
///
/// Holdings created in this window live in `minted`; holdings that already existed in the
/// store live in `updated`. A mint followed by a transfer within one window leaves a zero
/// entry for the first owner in `minted`, which is dropped at flush, so only the final
/// owner is inserted.
#[derive(Debug, Default)]
pub struct NftCache {
	minted: HashMap<NftKey, Nft>,
	updated: HashMap<NftKey, Nft>,
	settled: HashMap<NftKey, u64>,
}

impl NftCache {
	pub fn get(&self, key: &NftKey) -> Option<&Nft> {
		self.minted.get(key).or_else(|| self.updated.get(key))
	}

	async fn load<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		key: NftKey,
		kind: TokenKind,
		block: BlockPointer,
	) -> Result<&mut Nft, SyncError> {
		if self.minted.contains_key(&key) {
			return Ok(self.minted.entry(key).or_insert_with(|| new_nft(key, kind, block)));
		}
		match self.updated.entry(key) {
			Entry::Occupied(entry) => Ok(entry.into_mut()),
			Entry::Vacant(entry) => match store.find_nft(&key).await? {
				Some(existing) => Ok(entry.insert(existing)),
				None => Ok(self.minted.entry(key).or_insert_with(|| new_nft(key, kind, block))),
			},
		}
	}

	pub async fn credit<L: LedgerStore + ?Sized>(
		&mut self,
		store: &L,
		key: NftKey,
		kind: TokenKind,
		value: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		if self.settled.get(&key) == Some(&block.number) {
			return Ok(());
		}
		let nft = self.load(store, key, kind, block).await?;
		nft.value = nft.value.saturating_add(value);
		nft.last_update = block;
		Ok(())
	}

	pub async fn debit<L: LedgerStore + ?Sized, S: SourceClient>(
		&mut self,
		store: &L,
		reconciler: &Reconciler<S>,
		key: NftKey,
		kind: TokenKind,
		value: U256,
		block: BlockPointer,
	) -> Result<(), SyncError> {
		if self.settled.get(&key) == Some(&block.number) {
			return Ok(());
		}
		let nft = self.load(store, key, kind, block).await?;
		nft.last_update = block;
		if let Some(next) = nft.value.checked_sub(value) {
			nft.value = next;
			return Ok(());
		}

		warn!(
			"NFT #{} of {} in {} would go negative at block {}, reconciling",
			key.token_id, key.owner, key.contract, block.number
		);
		if let Err(e) = reconciler.reconcile_nft(nft, block.number).await {
			warn!("Could not reconcile NFT {:?}, flagging it: {}", key, e);
			nft.needs_reconcile = true;
		}
		self.settled.insert(key, block.number);
		Ok(())
	}

	fn drain(&mut self) -> NftChanges {
		self.settled.clear();
		let mut minted: Vec<Nft> = self
			.minted
			.drain()
			.map(|(_, n)| n)
			.filter(|n| !n.value.is_zero() || n.needs_reconcile)
			.collect();
		minted.sort_by_key(|n| n.key);
		let mut updated: Vec<Nft> = self.updated.drain().map(|(_, n)| n).collect();
		updated.sort_by_key(|n| n.key);
		NftChanges { minted, updated }
	}
}

fn new_nft(key: NftKey, kind: TokenKind, block: BlockPointer) -> Nft {
	Nft {
		key,
		kind,
		value: U256::ZERO,
		minted: block,
		last_update: block,
		needs_reconcile: false,
	}
}

/// Caches of one processing window, discarded after flush or failure.
#[derive(Debug, Default)]
pub struct WindowCache {
	pub accounts: AccountCache,
	pub tokens: TokenBalanceCache,
	pub nfts: NftCache,
}

impl WindowCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Drains every touched aggregate and leaves the cache empty.
	pub fn take_dirty(&mut self) -> DirtySet {
		let dirty = DirtySet {
			accounts: self.accounts.drain(),
			token_balances: self.tokens.drain(),
			nfts: self.nfts.drain(),
		};
		debug!("Drained {} cached aggregates", dirty.len());
		dirty
	}
}

//! Self-repair of balance aggregates against the upstream source.
//!
//! Point reconciliation runs when a cache mutation would drive a balance negative;
//! systematic reconciliation runs during recovery over every aggregate touched above the
//! head or flagged as inconsistent. Both overwrite the derived value with the
//! authoritative one and log the difference.

use super::events::abi;
use super::types::SyncError;
use crate::ledger::{
	Account, BlockPointer, ContractKind, LedgerStore, Nft, NftBalance, NftChanges, TokenBalance,
	TokenKind,
};
use crate::source::{AccountState, CallClause, Revision, SourceClient, SourceError};
use crate::utils::{NATIVE_DECIMALS, format_token_amount};
use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use futures::{StreamExt, stream};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts of aggregates re-checked and corrected by one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
	pub checked: usize,
	pub corrected: usize,
}

pub struct Reconciler<S> {
	source: Arc<S>,
	concurrency: usize,
}

impl<S: SourceClient> Reconciler<S> {
	pub fn new(source: Arc<S>, concurrency: usize) -> Self {
		Self {
			source,
			concurrency: concurrency.max(1),
		}
	}

	/// Overwrites `account` with the authoritative state at block `number`. Returns whether
	/// any field changed.
	pub async fn reconcile_account(
		&self,
		account: &mut Account,
		number: u64,
	) -> Result<bool, SourceError> {
		let state = self
			.source
			.get_account(account.address, Revision::Number(number))
			.await?;
		Ok(apply_account_state(account, &state, number))
	}

	/// Authoritative fungible balance of `owner` in `token` at block `number`.
	pub async fn fungible_balance(
		&self,
		token: Address,
		owner: Address,
		number: u64,
	) -> Result<U256, SourceError> {
		let data = abi::balanceOfCall { owner }.abi_encode();
		let output = self.call(token, data, number).await?.ok_or_else(|| {
			SourceError::NoData(format!("balanceOf({}) on {} at {}", owner, token, number))
		})?;
		decode_word(&output)
	}

	/// Amount of token `id` held by `owner`: 0 or 1 for ERC-721, the balance for ERC-1155.
	pub async fn nft_amount(
		&self,
		kind: TokenKind,
		contract: Address,
		owner: Address,
		id: U256,
		number: u64,
	) -> Result<U256, SourceError> {
		match kind {
			TokenKind::Erc1155 => {
				let data = abi::erc1155::balanceOfCall { account: owner, id }.abi_encode();
				match self.call(contract, data, number).await? {
					Some(output) => decode_word(&output),
					None => Ok(U256::ZERO),
				}
			}
			_ => {
				let data = abi::ownerOfCall { tokenId: id }.abi_encode();
				// A reverted ownerOf means the token does not exist (burned or never minted).
				let Some(output) = self.call(contract, data, number).await? else {
					return Ok(U256::ZERO);
				};
				let holder = abi::ownerOfCall::abi_decode_returns(&output, true)
					.map_err(|e| SourceError::Malformed(format!("ownerOf output: {}", e)))?
					._0;
				Ok(if holder == owner { U256::from(1) } else { U256::ZERO })
			}
		}
	}

	/// Re-derives the fungible balance and every NFT entry of `balance`. Duplicate and
	/// zero NFT entries are dropped.
	pub async fn reconcile_token_balance(
		&self,
		balance: &mut TokenBalance,
		kind: ContractKind,
		number: u64,
	) -> Result<bool, SourceError> {
		let before = balance.clone();

		match kind {
			ContractKind::Erc721 | ContractKind::Erc1155 => {
				let token_kind = kind.token_kind().unwrap_or(TokenKind::Erc721);
				let ids: BTreeSet<U256> = balance.nft_balances.iter().map(|n| n.token_id).collect();
				let mut entries = Vec::with_capacity(ids.len());
				for id in ids {
					let value = self
						.nft_amount(token_kind, balance.token_address, balance.address, id, number)
						.await?;
					if !value.is_zero() {
						entries.push(NftBalance { token_id: id, value });
					}
				}
				balance.nft_balances = entries;
				balance.balance = balance
					.nft_balances
					.iter()
					.fold(U256::ZERO, |sum, n| sum.saturating_add(n.value));
			}
			ContractKind::Erc20 | ContractKind::Unknown => {
				balance.balance = self
					.fungible_balance(balance.token_address, balance.address, number)
					.await?;
			}
		}
		balance.needs_reconcile = false;

		let changed = before.balance != balance.balance || before.nft_balances != balance.nft_balances;
		if changed {
			warn!(
				"Reconciled token balance of {} in {} at block {}: {} -> {}",
				balance.address, balance.token_address, number, before.balance, balance.balance
			);
		}
		Ok(changed)
	}

	/// Re-derives the amount of one NFT holding.
	pub async fn reconcile_nft(&self, nft: &mut Nft, number: u64) -> Result<bool, SourceError> {
		let value = self
			.nft_amount(
				nft.kind,
				nft.key.contract,
				nft.key.owner,
				nft.key.token_id,
				number,
			)
			.await?;
		nft.needs_reconcile = false;
		if value == nft.value {
			return Ok(false);
		}
		warn!(
			"Reconciled NFT {} #{} of {} at block {}: {} -> {}",
			nft.key.contract, nft.key.token_id, nft.key.owner, number, nft.value, value
		);
		nft.value = value;
		Ok(true)
	}

	/// Systematic reconciliation after truncating above `head`: every account, token
	/// balance and NFT holding updated above the head, or flagged, is overwritten with its
	/// authoritative value at the head and re-stamped with the head pointer.
	pub async fn recover<L: LedgerStore + ?Sized>(
		&self,
		store: &L,
		head: BlockPointer,
	) -> Result<ReconcileStats, SyncError> {
		let mut stats = ReconcileStats::default();
		let number = head.number;

		let accounts = store.accounts_to_reconcile(number).await?;
		stats.checked += accounts.len();
		let results: Vec<Result<(Account, bool), SourceError>> = stream::iter(accounts)
			.map(|mut account| async move {
				let changed = self.reconcile_account(&mut account, number).await?;
				account.last_update = head;
				account.needs_reconcile = false;
				Ok::<_, SourceError>((account, changed))
			})
			.buffer_unordered(self.concurrency)
			.collect()
			.await;
		let mut repaired = Vec::with_capacity(results.len());
		for result in results {
			let (account, changed) = result?;
			stats.corrected += changed as usize;
			repaired.push(account);
		}
		store.save_accounts(repaired).await?;

		let balances = store.token_balances_to_reconcile(number).await?;
		stats.checked += balances.len();
		let mut kinds = BTreeMap::new();
		for balance in &balances {
			if !kinds.contains_key(&balance.token_address) {
				let kind = store
					.find_contract(balance.token_address)
					.await?
					.map(|c| c.kind)
					.unwrap_or(ContractKind::Unknown);
				kinds.insert(balance.token_address, kind);
			}
		}
		let kinds = &kinds;
		let results: Vec<Result<(TokenBalance, bool), SourceError>> = stream::iter(balances)
			.map(|mut balance| async move {
				let kind = match kinds.get(&balance.token_address).copied() {
					Some(ContractKind::Unknown) | None if !balance.nft_balances.is_empty() => {
						ContractKind::Erc721
					}
					Some(kind) => kind,
					None => ContractKind::Unknown,
				};
				let changed = self
					.reconcile_token_balance(&mut balance, kind, number)
					.await?;
				balance.last_update = head;
				Ok::<_, SourceError>((balance, changed))
			})
			.buffer_unordered(self.concurrency)
			.collect()
			.await;
		let mut repaired = Vec::with_capacity(results.len());
		for result in results {
			let (balance, changed) = result?;
			stats.corrected += changed as usize;
			repaired.push(balance);
		}
		store.save_token_balances(repaired).await?;

		let nfts = store.nfts_to_reconcile(number).await?;
		stats.checked += nfts.len();
		let results: Vec<Result<(Nft, bool), SourceError>> = stream::iter(nfts)
			.map(|mut nft| async move {
				let changed = self.reconcile_nft(&mut nft, number).await?;
				nft.last_update = head;
				Ok::<_, SourceError>((nft, changed))
			})
			.buffer_unordered(self.concurrency)
			.collect()
			.await;
		let mut updated = Vec::with_capacity(results.len());
		for result in results {
			let (nft, changed) = result?;
			stats.corrected += changed as usize;
			updated.push(nft);
		}
		store
			.save_nfts(NftChanges {
				minted: Vec::new(),
				updated,
			})
			.await?;

		if stats.checked > 0 {
			info!(
				"Recovery reconciled {} aggregates at block {}, {} corrected",
				stats.checked, number, stats.corrected
			);
		}
		Ok(stats)
	}

	async fn call(
		&self,
		to: Address,
		data: Vec<u8>,
		number: u64,
	) -> Result<Option<Vec<u8>>, SourceError> {
		let results = self
			.source
			.explain(&[CallClause::call(to, data)], Revision::Number(number))
			.await?;
		Ok(results
			.first()
			.and_then(|r| r.output())
			.map(|output| output.to_vec()))
	}
}

/// Copies authoritative native balances into `account`. Token 0 is `energy` upstream,
/// token 1 is `balance`.
pub fn apply_account_state(account: &mut Account, state: &AccountState, number: u64) -> bool {
	let before = account.clone();
	account.balance = state.energy;
	account.bounded_balance = state.bound_energy;
	account.secondary_balance = state.balance;
	account.secondary_bounded = state.bound_balance;
	account.needs_reconcile = false;

	let changed = before.balance != account.balance
		|| before.bounded_balance != account.bounded_balance
		|| before.secondary_balance != account.secondary_balance
		|| before.secondary_bounded != account.secondary_bounded;
	if changed {
		warn!(
			"Reconciled account {} at block {}: primary {}/{} -> {}/{}, secondary {}/{} -> {}/{}",
			account.address,
			number,
			format_token_amount(before.balance, NATIVE_DECIMALS),
			format_token_amount(before.bounded_balance, NATIVE_DECIMALS),
			format_token_amount(account.balance, NATIVE_DECIMALS),
			format_token_amount(account.bounded_balance, NATIVE_DECIMALS),
			format_token_amount(before.secondary_balance, NATIVE_DECIMALS),
			format_token_amount(before.secondary_bounded, NATIVE_DECIMALS),
			format_token_amount(account.secondary_balance, NATIVE_DECIMALS),
			format_token_amount(account.secondary_bounded, NATIVE_DECIMALS),
		);
	} else {
		debug!("Account {} matches source at block {}", account.address, number);
	}
	changed
}

fn decode_word(output: &[u8]) -> Result<U256, SourceError> {
	output
		.get(..32)
		.map(U256::from_be_slice)
		.ok_or_else(|| SourceError::Malformed(format!("{} byte word", output.len())))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::{MemoryLedgerStore, NftKey};
	use crate::source::mock::{MockSource, fixtures};

	fn pointer(n: u64) -> BlockPointer {
		BlockPointer::new(n, fixtures::hash(n), 0)
	}

	#[tokio::test]
	async fn one_pass_converges_a_diverged_account() {
		let source = Arc::new(MockSource::new());
		let owner = fixtures::addr(1);
		source.set_account(owner, fixtures::account(500, 70));
		let reconciler = Reconciler::new(Arc::clone(&source), 2);

		let mut account = Account::new(owner, pointer(3));
		account.balance = U256::from(1_000);
		assert!(reconciler.reconcile_account(&mut account, 3).await.unwrap());
		assert_eq!(account.balance, U256::from(500));
		assert_eq!(account.secondary_balance, U256::from(70));

		assert!(!reconciler.reconcile_account(&mut account, 3).await.unwrap());
	}

	#[tokio::test]
	async fn token_balance_drops_stale_nft_entries() {
		let source = Arc::new(MockSource::new());
		let (owner, contract) = (fixtures::addr(1), fixtures::addr(9));
		source.set_call(
			contract,
			abi::ownerOfCall { tokenId: U256::from(1) }.abi_encode(),
			fixtures::word(U256::from_be_slice(owner.as_slice())),
		);
		let reconciler = Reconciler::new(Arc::clone(&source), 1);

		let mut balance = TokenBalance::new(owner, contract, pointer(2));
		balance.nft_balances = vec![
			NftBalance {
				token_id: U256::from(1),
				value: U256::from(1),
			},
			NftBalance {
				token_id: U256::from(1),
				value: U256::from(1),
			},
			NftBalance {
				token_id: U256::from(2),
				value: U256::from(1),
			},
		];
		assert!(!balance.is_consistent());

		let changed = reconciler
			.reconcile_token_balance(&mut balance, ContractKind::Erc721, 2)
			.await
			.unwrap();
		assert!(changed);
		assert!(balance.is_consistent());
		assert_eq!(balance.nft_balances.len(), 1);
		assert_eq!(balance.balance, U256::from(1));
	}

	#[tokio::test]
	async fn recovery_rewrites_aggregates_above_head() {
		let source = Arc::new(MockSource::new());
		let store = MemoryLedgerStore::new();
		let (a, b, token) = (fixtures::addr(1), fixtures::addr(2), fixtures::addr(9));
		source.set_account(a, fixtures::account(10, 0));
		source.set_call(
			token,
			abi::balanceOfCall { owner: b }.abi_encode(),
			fixtures::word(U256::from(40)),
		);

		let mut stale = Account::new(a, pointer(8));
		stale.balance = U256::from(99);
		let untouched = Account::new(b, pointer(2));
		store
			.save_accounts(vec![stale, untouched.clone()])
			.await
			.unwrap();
		let mut balance = TokenBalance::new(b, token, pointer(9));
		balance.balance = U256::from(45);
		store.save_token_balances(vec![balance]).await.unwrap();
		store
			.save_nfts(NftChanges {
				minted: vec![Nft {
					key: NftKey {
						contract: token,
						token_id: U256::from(3),
						owner: a,
					},
					kind: TokenKind::Erc721,
					value: U256::from(1),
					minted: pointer(7),
					last_update: pointer(7),
					needs_reconcile: false,
				}],
				updated: Vec::new(),
			})
			.await
			.unwrap();

		let reconciler = Reconciler::new(Arc::clone(&source), 4);
		let stats = reconciler.recover(&store, pointer(5)).await.unwrap();
		assert_eq!(
			stats,
			ReconcileStats {
				checked: 3,
				corrected: 3
			}
		);

		let repaired = store.find_account(a).await.unwrap().unwrap();
		assert_eq!(repaired.balance, U256::from(10));
		assert_eq!(repaired.last_update, pointer(5));
		assert_eq!(store.find_account(b).await.unwrap(), Some(untouched));
		let repaired = store.find_token_balance(b, token).await.unwrap().unwrap();
		assert_eq!(repaired.balance, U256::from(40));
		assert!(store.nfts_to_reconcile(5).await.unwrap().is_empty());
	}
}

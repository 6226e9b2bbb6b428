//! Persisted entities of the derived ledger.
//!
//! Every record carries an embedded [`BlockPointer`] so that rollbacks can delete by block
//! number and recovery can find aggregates touched above a given head.

use crate::source::{BlockType, CommitteeMember};
use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

/// Position of a record in the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
	pub number: u64,
	pub hash: B256,
	pub timestamp: u64,
}

impl BlockPointer {
	pub fn new(number: u64, hash: B256, timestamp: u64) -> Self {
		Self {
			number,
			hash,
			timestamp,
		}
	}
}

/// Durable progress marker of one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
	pub pipeline: String,
	pub number: u64,
	pub hash: B256,
}

impl Head {
	pub fn new(pipeline: impl Into<String>, number: u64, hash: B256) -> Self {
		Self {
			pipeline: pipeline.into(),
			number,
			hash,
		}
	}
}

/// The two native tokens of the chain. Token 0 pays for gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NativeToken {
	Primary,
	Secondary,
}

impl NativeToken {
	pub fn from_wire(token: u8) -> Option<Self> {
		match token {
			0 => Some(NativeToken::Primary),
			1 => Some(NativeToken::Secondary),
			_ => None,
		}
	}

	pub fn token_kind(self) -> TokenKind {
		match self {
			NativeToken::Primary => TokenKind::Primary,
			NativeToken::Secondary => TokenKind::Secondary,
		}
	}
}

/// Asset moved by a [`Movement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenKind {
	Primary,
	Secondary,
	Erc20,
	Erc721,
	Erc1155,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
	pub number: u64,
	pub hash: B256,
	pub parent_hash: B256,
	pub timestamp: u64,
	pub signer: Address,
	pub beneficiary: Address,
	pub gas_limit: u64,
	pub gas_used: u64,
	pub total_score: u64,
	pub score: u64,
	pub size: u64,
	pub block_type: BlockType,
	pub epoch: u64,
	pub tx_hashes: Vec<B256>,
	pub tx_count: u32,
	pub clause_count: u32,
	pub total_fees: U256,
	pub total_reward: U256,
}

impl BlockRecord {
	pub fn pointer(&self) -> BlockPointer {
		BlockPointer::new(self.number, self.hash, self.timestamp)
	}
}

/// How a clause payload was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClauseKind {
	Transfer,
	Call,
	Script,
	Create,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClauseRecord {
	pub to: Option<Address>,
	pub value: U256,
	pub token: u8,
	pub data: Bytes,
	pub kind: ClauseKind,
	/// `0x`-prefixed 4-byte method selector of generic calls.
	pub selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
	pub address: Address,
	pub topics: Vec<B256>,
	pub data: Bytes,
	pub overall_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
	pub sender: Address,
	pub recipient: Address,
	pub amount: U256,
	pub token: u8,
	pub overall_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
	pub contract_address: Option<Address>,
	pub events: Vec<EventRecord>,
	pub transfers: Vec<TransferRecord>,
}

/// Failure information of a reverted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmError {
	pub reverted: bool,
	pub error: String,
	pub reason: Option<String>,
	pub clause_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
	pub hash: B256,
	pub block: BlockPointer,
	pub tx_index: u32,
	pub origin: Address,
	pub gas_payer: Address,
	pub clauses: Vec<ClauseRecord>,
	pub outputs: Vec<OutputRecord>,
	/// Raw call-trace JSON per clause, when the clause was traced.
	pub traces: Vec<Option<String>>,
	pub gas_used: u64,
	pub paid: U256,
	pub reward: U256,
	pub reverted: bool,
	pub vm_error: Option<VmError>,
}

/// Idempotency key of a [`Movement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MovementKey {
	pub tx_hash: B256,
	pub clause_index: u32,
	pub log_index: u32,
	pub token: TokenKind,
}

impl MovementKey {
	/// Clause index of the gas fee and reward movements, which belong to no clause.
	pub const TX_LEVEL_CLAUSE: u32 = u32::MAX;
	pub const FEE_LOG: u32 = 0;
	pub const REWARD_LOG: u32 = 1;
}

/// One value transfer, native or token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
	pub key: MovementKey,
	pub from: Address,
	pub to: Address,
	pub amount: U256,
	/// Contract of a token movement; `None` for native movements.
	pub token_address: Option<Address>,
	pub token_id: Option<U256>,
	/// Every `(id, value)` of an ERC-1155 batch; `amount` is then their sum.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub batch: Vec<NftBalance>,
	pub block: BlockPointer,
}

/// Flattened call-trace node. `name` encodes the path, e.g. `call_0_1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTx {
	pub tx_hash: B256,
	pub clause_index: u32,
	pub name: String,
	pub kind: String,
	pub from: Address,
	pub to: Option<Address>,
	pub value: U256,
	pub error: Option<String>,
	pub block: BlockPointer,
}

impl InternalTx {
	pub fn key(&self) -> (B256, u32, String) {
		(self.tx_hash, self.clause_index, self.name.clone())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
	pub address: Address,
	pub balance: U256,
	pub bounded_balance: U256,
	pub secondary_balance: U256,
	pub secondary_bounded: U256,
	pub first_seen: BlockPointer,
	pub last_update: BlockPointer,
	pub needs_reconcile: bool,
}

impl Account {
	pub fn new(address: Address, block: BlockPointer) -> Self {
		Self {
			address,
			balance: U256::ZERO,
			bounded_balance: U256::ZERO,
			secondary_balance: U256::ZERO,
			secondary_bounded: U256::ZERO,
			first_seen: block,
			last_update: block,
			needs_reconcile: false,
		}
	}

	pub fn free(&self, token: NativeToken) -> U256 {
		match token {
			NativeToken::Primary => self.balance,
			NativeToken::Secondary => self.secondary_balance,
		}
	}

	pub fn free_mut(&mut self, token: NativeToken) -> &mut U256 {
		match token {
			NativeToken::Primary => &mut self.balance,
			NativeToken::Secondary => &mut self.secondary_balance,
		}
	}

	pub fn bounded(&self, token: NativeToken) -> U256 {
		match token {
			NativeToken::Primary => self.bounded_balance,
			NativeToken::Secondary => self.secondary_bounded,
		}
	}

	pub fn bounded_mut(&mut self, token: NativeToken) -> &mut U256 {
		match token {
			NativeToken::Primary => &mut self.bounded_balance,
			NativeToken::Secondary => &mut self.secondary_bounded,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftBalance {
	pub token_id: U256,
	pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
	pub address: Address,
	pub token_address: Address,
	pub balance: U256,
	pub nft_balances: Vec<NftBalance>,
	pub last_update: BlockPointer,
	pub needs_reconcile: bool,
}

impl TokenBalance {
	pub fn new(address: Address, token_address: Address, block: BlockPointer) -> Self {
		Self {
			address,
			token_address,
			balance: U256::ZERO,
			nft_balances: Vec::new(),
			last_update: block,
			needs_reconcile: false,
		}
	}

	/// A balance is structurally consistent when no token id appears twice and no entry
	/// is zero.
	pub fn is_consistent(&self) -> bool {
		let mut seen = std::collections::HashSet::new();
		self.nft_balances
			.iter()
			.all(|n| !n.value.is_zero() && seen.insert(n.token_id))
	}
}

/// Identity of one NFT holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NftKey {
	pub contract: Address,
	pub token_id: U256,
	pub owner: Address,
}

/// NFT holding. A holding whose value dropped to zero is kept with `value == 0` so
/// that recovery can still re-check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nft {
	pub key: NftKey,
	pub kind: TokenKind,
	pub value: U256,
	pub minted: BlockPointer,
	pub last_update: BlockPointer,
	/// Set when a point reconciliation could not reach the source.
	#[serde(default)]
	pub needs_reconcile: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractKind {
	Erc20,
	Erc721,
	Erc1155,
	Unknown,
}

impl ContractKind {
	pub fn token_kind(self) -> Option<TokenKind> {
		match self {
			ContractKind::Erc20 => Some(TokenKind::Erc20),
			ContractKind::Erc721 => Some(TokenKind::Erc721),
			ContractKind::Erc1155 => Some(TokenKind::Erc1155),
			ContractKind::Unknown => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
	pub address: Address,
	pub kind: ContractKind,
	pub name: Option<String>,
	pub symbol: Option<String>,
	pub decimals: u8,
	pub total_supply: U256,
	pub creator: Address,
	pub created: BlockPointer,
	pub creation_tx: Option<B256>,
	pub creation_input_hash: Option<B256>,
	pub verified: bool,
	pub verified_from: Option<Address>,
}

/// Staking lock (`Bound`) or release (`Unbound`) of native funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingEvent {
	pub tx_hash: B256,
	pub clause_index: u32,
	pub log_index: u32,
	pub owner: Address,
	pub amount: U256,
	pub token: NativeToken,
	pub block: BlockPointer,
}

impl StakingEvent {
	pub fn key(&self) -> (B256, u32, u32) {
		(self.tx_hash, self.clause_index, self.log_index)
	}
}

pub type Bound = StakingEvent;
pub type Unbound = StakingEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
	pub epoch: u64,
	pub start_block: BlockPointer,
	pub end_block: Option<BlockPointer>,
	pub members: Vec<CommitteeMember>,
}

/// Per-transaction summary of native value moved between one `(from, to)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDigest {
	pub tx_hash: B256,
	/// keccak256 of `from ++ to`.
	pub content_hash: B256,
	pub from: Address,
	pub to: Address,
	pub primary_amount: U256,
	pub secondary_amount: U256,
	pub clause_indexes: Vec<u32>,
	pub block: BlockPointer,
}

/// Everything one processed block produces besides balance aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedRecords {
	pub blocks: Vec<BlockRecord>,
	pub transactions: Vec<TransactionRecord>,
	pub movements: Vec<Movement>,
	pub internal_txs: Vec<InternalTx>,
	pub bounds: Vec<Bound>,
	pub unbounds: Vec<Unbound>,
	pub contracts: Vec<Contract>,
	pub committees: Vec<Committee>,
	/// K-blocks closing an epoch: `(epoch, closing block)`.
	pub closed_epochs: Vec<(u64, BlockPointer)>,
	pub digests: Vec<TxDigest>,
}

impl DerivedRecords {
	pub fn append(&mut self, mut other: DerivedRecords) {
		self.blocks.append(&mut other.blocks);
		self.transactions.append(&mut other.transactions);
		self.movements.append(&mut other.movements);
		self.internal_txs.append(&mut other.internal_txs);
		self.bounds.append(&mut other.bounds);
		self.unbounds.append(&mut other.unbounds);
		self.contracts.append(&mut other.contracts);
		self.committees.append(&mut other.committees);
		self.closed_epochs.append(&mut other.closed_epochs);
		self.digests.append(&mut other.digests);
	}

	pub fn is_empty(&self) -> bool {
		self.blocks.is_empty()
	}
}

/// Counts of records removed by a rollback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncateStats {
	pub blocks: usize,
	pub transactions: usize,
	pub movements: usize,
	pub internal_txs: usize,
	pub staking_events: usize,
	pub contracts: usize,
	pub committees: usize,
	pub digests: usize,
}

impl TruncateStats {
	pub fn total(&self) -> usize {
		self.blocks
			+ self.transactions
			+ self.movements
			+ self.internal_txs
			+ self.staking_events
			+ self.contracts
			+ self.committees
			+ self.digests
	}
}

//! Scripted in-memory source used by unit tests.

use super::client::SourceClient;
use super::types::*;
use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type CallKey = (Address, Vec<u8>);

#[derive(Default)]
pub struct MockSource {
	pub blocks: Mutex<HashMap<u64, ExpandedBlock>>,
	/// Authoritative account state, keyed by address; the latest value applies to every revision.
	pub accounts: Mutex<HashMap<Address, AccountState>>,
	pub code: Mutex<HashMap<Address, Bytes>>,
	pub calls: Mutex<HashMap<CallKey, CallResult>>,
	pub traces: Mutex<HashMap<(B256, usize), TraceNode>>,
	pub fail_blocks: Mutex<Vec<u64>>,
	/// Read-only calls and traces fail while set.
	pub offline: AtomicBool,
	pub block_fetches: AtomicUsize,
	pub account_fetches: AtomicUsize,
	pub trace_fetches: AtomicUsize,
}

impl MockSource {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_block(&self, block: ExpandedBlock) {
		self.blocks
			.lock()
			.unwrap()
			.insert(block.header.number, block);
	}

	pub fn set_account(&self, address: Address, state: AccountState) {
		self.accounts.lock().unwrap().insert(address, state);
	}

	pub fn set_call(&self, to: Address, data: Vec<u8>, output: Vec<u8>) {
		self.calls.lock().unwrap().insert(
			(to, data),
			CallResult {
				data: output.into(),
				reverted: false,
				vm_error: String::new(),
			},
		);
	}

	pub fn set_code(&self, address: Address, code: Vec<u8>) {
		self.code.lock().unwrap().insert(address, code.into());
	}

	pub fn set_trace(&self, tx: B256, clause_index: usize, trace: TraceNode) {
		self.traces.lock().unwrap().insert((tx, clause_index), trace);
	}

	pub fn fail_block(&self, number: u64) {
		self.fail_blocks.lock().unwrap().push(number);
	}

	pub fn heal_block(&self, number: u64) {
		self.fail_blocks.lock().unwrap().retain(|n| *n != number);
	}

	pub fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::SeqCst);
	}

	fn check_online(&self) -> Result<(), SourceError> {
		if self.offline.load(Ordering::SeqCst) {
			return Err(SourceError::Malformed("source offline".to_string()));
		}
		Ok(())
	}
}

#[async_trait]
impl SourceClient for MockSource {
	async fn get_block(&self, revision: Revision) -> Result<Option<RegularBlock>, SourceError> {
		let blocks = self.blocks.lock().unwrap();
		let found = match revision {
			Revision::Best => blocks.keys().max().and_then(|n| blocks.get(n)),
			Revision::Number(n) => blocks.get(&n),
			Revision::Hash(h) => blocks.values().find(|b| b.header.id == h),
		};
		Ok(found.map(|b| Block {
			header: b.header.clone(),
			transactions: b.transactions.iter().map(|tx| tx.id).collect(),
		}))
	}

	async fn get_expanded_block(&self, number: u64) -> Result<Option<ExpandedBlock>, SourceError> {
		self.block_fetches.fetch_add(1, Ordering::SeqCst);
		if self.fail_blocks.lock().unwrap().contains(&number) {
			return Err(SourceError::Malformed(format!("injected failure at {}", number)));
		}
		Ok(self.blocks.lock().unwrap().get(&number).cloned())
	}

	async fn get_account(
		&self,
		address: Address,
		_revision: Revision,
	) -> Result<AccountState, SourceError> {
		self.account_fetches.fetch_add(1, Ordering::SeqCst);
		Ok(self
			.accounts
			.lock()
			.unwrap()
			.get(&address)
			.cloned()
			.unwrap_or_default())
	}

	async fn get_code(&self, address: Address, _revision: Revision) -> Result<Bytes, SourceError> {
		Ok(self
			.code
			.lock()
			.unwrap()
			.get(&address)
			.cloned()
			.unwrap_or_default())
	}

	async fn explain(
		&self,
		clauses: &[CallClause],
		_revision: Revision,
	) -> Result<Vec<CallResult>, SourceError> {
		self.check_online()?;
		let calls = self.calls.lock().unwrap();
		Ok(clauses
			.iter()
			.map(|c| {
				calls
					.get(&(c.to, c.data.to_vec()))
					.cloned()
					.unwrap_or(CallResult {
						data: Bytes::new(),
						reverted: true,
						vm_error: "execution reverted".to_string(),
					})
			})
			.collect())
	}

	async fn trace_clause(
		&self,
		_block_hash: B256,
		tx_hash: B256,
		clause_index: usize,
	) -> Result<TraceNode, SourceError> {
		self.trace_fetches.fetch_add(1, Ordering::SeqCst);
		self.check_online()?;
		self.traces
			.lock()
			.unwrap()
			.get(&(tx_hash, clause_index))
			.cloned()
			.ok_or_else(|| SourceError::NoData(format!("trace {}/{}", tx_hash, clause_index)))
	}

	async fn probe(&self) -> Result<NodeProbe, SourceError> {
		Ok(NodeProbe {
			name: "mock".to_string(),
			pubkey_valid: true,
			..Default::default()
		})
	}
}

/// Builders for canned chain data.
pub mod fixtures {
	use super::*;

	pub fn addr(n: u8) -> Address {
		Address::with_last_byte(n)
	}

	pub fn hash(n: u64) -> B256 {
		B256::left_padding_from(&n.to_be_bytes())
	}

	pub fn tx_hash(n: u64) -> B256 {
		let mut bytes = [0u8; 32];
		bytes[0] = 0xee;
		bytes[24..].copy_from_slice(&n.to_be_bytes());
		B256::from(bytes)
	}

	pub fn header(number: u64) -> BlockHeader {
		BlockHeader {
			number,
			id: hash(number),
			parent_id: if number == 0 { B256::ZERO } else { hash(number - 1) },
			timestamp: 1_700_000_000 + number * 10,
			gas_limit: 0,
			gas_used: 0,
			total_score: number * 2,
			beneficiary: Address::ZERO,
			signer: Address::ZERO,
			size: 0,
			block_type: BlockType::MBlock,
			epoch: 0,
			committee: Vec::new(),
		}
	}

	pub fn block(number: u64, transactions: Vec<ExpandedTransaction>) -> ExpandedBlock {
		Block {
			header: header(number),
			transactions,
		}
	}

	pub fn transfer_clause(to: Address, value: u64, token: u8) -> Clause {
		Clause {
			to: Some(to),
			value: U256::from(value),
			token,
			data: Bytes::new(),
		}
	}

	pub fn call_clause(to: Address, data: Vec<u8>) -> Clause {
		Clause {
			to: Some(to),
			value: U256::ZERO,
			token: 0,
			data: data.into(),
		}
	}

	pub fn transfer(from: Address, to: Address, amount: u64, token: u8) -> TransferLog {
		TransferLog {
			sender: from,
			recipient: to,
			amount: U256::from(amount),
			token,
		}
	}

	pub fn tx(
		id: B256,
		origin: Address,
		clauses: Vec<Clause>,
		outputs: Vec<ClauseOutput>,
	) -> ExpandedTransaction {
		ExpandedTransaction {
			id,
			origin,
			delegator: None,
			clauses,
			gas: 21_000,
			gas_used: 21_000,
			gas_payer: Some(origin),
			paid: U256::ZERO,
			reward: U256::ZERO,
			reverted: false,
			outputs,
		}
	}

	pub fn account(energy: u64, balance: u64) -> AccountState {
		AccountState {
			balance: U256::from(balance),
			energy: U256::from(energy),
			..Default::default()
		}
	}

	pub fn word(value: U256) -> Vec<u8> {
		value.to_be_bytes::<32>().to_vec()
	}
}

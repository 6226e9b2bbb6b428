use super::cache::WindowCache;
use super::events::{LogEvent, classify_clause, revert_reason};
use super::probe::ContractProber;
use super::reconcile::Reconciler;
use super::trace::{OverallIndexes, flatten_internal_txs, reconcile_outputs};
use super::types::SyncError;
use crate::config::IndexerConfig;
use crate::ledger::{
	BlockPointer, BlockRecord, ClauseKind, ClauseRecord, Committee, Contract,
	DerivedRecords, EventRecord, LedgerStore, Movement, MovementKey, NativeToken, NftBalance,
	NftKey, OutputRecord, StakingEvent, TokenKind, TransactionRecord, TransferRecord, TxDigest,
	VmError,
};
use crate::source::{
	BlockType, ClauseOutput, EventLog, ExpandedBlock, ExpandedTransaction, SourceClient,
	TraceKind, TraceNode, TransferLog,
};
use alloy_primitives::{Address, B256, U256, keccak256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Chain-specific interpretation rules of the processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
	pub trace_clauses: bool,
	pub staking_module: Option<Address>,
	/// System contracts whose fungible transfers are native-token movements.
	pub native_aliases: HashMap<Address, NativeToken>,
	pub wrapped_native: HashSet<Address>,
}

impl From<&IndexerConfig> for ProcessorConfig {
	fn from(config: &IndexerConfig) -> Self {
		Self {
			trace_clauses: config.trace_clauses,
			staking_module: config.staking_module,
			native_aliases: config
				.native_aliases
				.iter()
				.map(|alias| (alias.address, alias.token))
				.collect(),
			wrapped_native: config.wrapped_native.iter().copied().collect(),
		}
	}
}

/// Position of the clause being processed.
#[derive(Debug, Clone, Copy)]
struct ClauseRef {
	tx_hash: B256,
	clause_index: u32,
	block: BlockPointer,
}

impl ClauseRef {
	fn movement_key(&self, log_index: u32, token: TokenKind) -> MovementKey {
		MovementKey {
			tx_hash: self.tx_hash,
			clause_index: self.clause_index,
			log_index,
			token,
		}
	}
}

/// Turns expanded blocks into ledger records and balance deltas.
pub struct BlockProcessor<S, L: ?Sized> {
	source: Arc<S>,
	store: Arc<L>,
	reconciler: Arc<Reconciler<S>>,
	prober: ContractProber<S>,
	config: ProcessorConfig,
}

impl<S: SourceClient, L: LedgerStore + ?Sized> BlockProcessor<S, L> {
	pub fn new(
		source: Arc<S>,
		store: Arc<L>,
		reconciler: Arc<Reconciler<S>>,
		config: ProcessorConfig,
	) -> Self {
		Self {
			prober: ContractProber::new(Arc::clone(&source)),
			source,
			store,
			reconciler,
			config,
		}
	}

	/// Processes one block: every transaction in order, then the block record itself.
	/// `parent_total_score` is the accumulated score of the parent block.
	pub async fn process_block(
		&self,
		block: &ExpandedBlock,
		parent_total_score: Option<u64>,
		cache: &mut WindowCache,
	) -> Result<DerivedRecords, SyncError> {
		let header = &block.header;
		let pointer = BlockPointer::new(header.number, header.id, header.timestamp);
		let mut records = DerivedRecords::default();

		let mut clause_count = 0u32;
		let mut total_fees = U256::ZERO;
		let mut total_reward = U256::ZERO;
		for (index, tx) in block.transactions.iter().enumerate() {
			clause_count += tx.clauses.len() as u32;
			total_fees = total_fees.saturating_add(tx.paid);
			total_reward = total_reward.saturating_add(tx.reward);
			self.process_transaction(
				tx,
				index as u32,
				pointer,
				header.beneficiary,
				cache,
				&mut records,
			)
			.await?;
		}

		if !header.committee.is_empty() {
			records.committees.push(Committee {
				epoch: header.epoch,
				start_block: pointer,
				end_block: None,
				members: header.committee.clone(),
			});
		}
		if header.block_type == BlockType::KBlock {
			records.closed_epochs.push((header.epoch, pointer));
		}

		records.blocks.push(BlockRecord {
			number: header.number,
			hash: header.id,
			parent_hash: header.parent_id,
			timestamp: header.timestamp,
			signer: header.signer,
			beneficiary: header.beneficiary,
			gas_limit: header.gas_limit,
			gas_used: header.gas_used,
			total_score: header.total_score,
			score: parent_total_score
				.map(|parent| header.total_score.saturating_sub(parent))
				.unwrap_or(0),
			size: header.size,
			block_type: header.block_type,
			epoch: header.epoch,
			tx_hashes: block.transactions.iter().map(|tx| tx.id).collect(),
			tx_count: block.transactions.len() as u32,
			clause_count,
			total_fees,
			total_reward,
		});

		debug!(
			block = header.number,
			"Processed {} transactions, {} movements",
			block.transactions.len(),
			records.movements.len()
		);
		Ok(records)
	}

	async fn process_transaction(
		&self,
		tx: &ExpandedTransaction,
		tx_index: u32,
		block: BlockPointer,
		beneficiary: Address,
		cache: &mut WindowCache,
		records: &mut DerivedRecords,
	) -> Result<(), SyncError> {
		let clauses: Vec<ClauseRecord> = tx
			.clauses
			.iter()
			.map(|clause| {
				let (kind, selector) = classify_clause(clause);
				ClauseRecord {
					to: clause.to,
					value: clause.value,
					token: clause.token,
					data: clause.data.clone(),
					kind,
					selector,
				}
			})
			.collect();

		let mut record = TransactionRecord {
			hash: tx.id,
			block,
			tx_index,
			origin: tx.origin,
			gas_payer: tx.fee_payer(),
			clauses,
			outputs: Vec::with_capacity(tx.outputs.len()),
			traces: vec![None; tx.clauses.len()],
			gas_used: tx.gas_used,
			paid: tx.paid,
			reward: tx.reward,
			reverted: tx.reverted,
			vm_error: None,
		};

		if tx.reverted {
			record.vm_error = Some(self.revert_info(tx, block, &mut record.traces).await?);
			records.transactions.push(record);
			return Ok(());
		}

		if block.number > 0 {
			self.apply_fee(tx, block, beneficiary, cache, records).await?;
		}

		let mut digests = DigestBuilder::default();
		let empty = ClauseOutput::default();
		for (index, clause) in tx.clauses.iter().enumerate() {
			let at = ClauseRef {
				tx_hash: tx.id,
				clause_index: index as u32,
				block,
			};
			let output = tx.outputs.get(index).unwrap_or(&empty);

			let (trace, indexes) = if self.should_trace(&record.clauses[index]) {
				let (trace, indexes) = self.traced_indexes(output, at).await?;
				(Some(trace), indexes)
			} else {
				(None, OverallIndexes::sequential(output))
			};

			let mut creation_hashes: HashMap<Address, B256> = HashMap::new();
			match &trace {
				Some(trace) => {
					record.traces[index] = serde_json::to_string(trace).ok();
					records.internal_txs.extend(flatten_internal_txs(
						trace,
						at.tx_hash,
						at.clause_index,
						block,
					));
					collect_creation_hashes(trace, &mut creation_hashes);
				}
				None => {
					if let (None, Some(created)) = (clause.to, output.contract_address) {
						creation_hashes.insert(created, keccak256(&clause.data));
					}
				}
			}

			record.outputs.push(OutputRecord {
				contract_address: output.contract_address,
				events: output
					.events
					.iter()
					.zip(&indexes.events)
					.map(|(event, index)| EventRecord {
						address: event.address,
						topics: event.topics.clone(),
						data: event.data.clone(),
						overall_index: *index,
					})
					.collect(),
				transfers: output
					.transfers
					.iter()
					.zip(&indexes.transfers)
					.map(|(transfer, index)| TransferRecord {
						sender: transfer.sender,
						recipient: transfer.recipient,
						amount: transfer.amount,
						token: transfer.token,
						overall_index: *index,
					})
					.collect(),
			});

			let mut matched = vec![false; output.transfers.len()];
			for (transfer, index) in output.transfers.iter().zip(&indexes.transfers) {
				self.apply_native_transfer(transfer, *index, at, cache, records, &mut digests)
					.await?;
			}
			for (event, index) in output.events.iter().zip(&indexes.events) {
				let ctx = EventContext {
					at,
					log_index: *index,
					native_transfers: &output.transfers,
					creation_hashes: &creation_hashes,
				};
				self.apply_event(event, &ctx, &mut matched, cache, records, &mut digests)
					.await?;
			}
		}

		records.digests.extend(digests.finish(tx.id, block));
		records.transactions.push(record);
		Ok(())
	}

	fn should_trace(&self, clause: &ClauseRecord) -> bool {
		self.config.trace_clauses && clause.kind != ClauseKind::Transfer
	}

	/// A source failure fails the block, so a clause is never numbered differently just
	/// because its trace was briefly unavailable.
	async fn fetch_trace(&self, at: ClauseRef) -> Result<TraceNode, SyncError> {
		Ok(self
			.source
			.trace_clause(at.block.hash, at.tx_hash, at.clause_index as usize)
			.await?)
	}

	/// The clause's trace and the overall index of each of its outputs. A trace that does
	/// not match the outputs is fetched once more before falling back to sequential
	/// numbering.
	async fn traced_indexes(
		&self,
		output: &ClauseOutput,
		at: ClauseRef,
	) -> Result<(TraceNode, OverallIndexes), SyncError> {
		let trace = self.fetch_trace(at).await?;
		let first = match reconcile_outputs(&trace, output) {
			Ok(indexes) => return Ok((trace, indexes)),
			Err(e) => e,
		};
		debug!(
			block = at.block.number,
			"Trace of {} clause {} does not match its outputs ({}), fetching it again",
			at.tx_hash,
			at.clause_index,
			first
		);

		let trace = self.fetch_trace(at).await?;
		match reconcile_outputs(&trace, output) {
			Ok(indexes) => Ok((trace, indexes)),
			Err(e) => {
				let mismatch = SyncError::from(e);
				warn!(
					block = at.block.number,
					"{} in {} clause {}, numbering sequentially",
					mismatch,
					at.tx_hash,
					at.clause_index
				);
				Ok((trace, OverallIndexes::sequential(output)))
			}
		}
	}

	/// Debits the gas fee from the payer and credits the reward to the block beneficiary,
	/// recording both as primary-token movements outside of any clause.
	async fn apply_fee(
		&self,
		tx: &ExpandedTransaction,
		block: BlockPointer,
		beneficiary: Address,
		cache: &mut WindowCache,
		records: &mut DerivedRecords,
	) -> Result<(), SyncError> {
		let at = ClauseRef {
			tx_hash: tx.id,
			clause_index: MovementKey::TX_LEVEL_CLAUSE,
			block,
		};
		let legs = [
			(MovementKey::FEE_LOG, tx.fee_payer(), Address::ZERO, tx.paid),
			(MovementKey::REWARD_LOG, Address::ZERO, beneficiary, tx.reward),
		];
		for (log_index, from, to, amount) in legs {
			if amount.is_zero() {
				continue;
			}
			self.move_native(from, to, NativeToken::Primary, amount, at, cache)
				.await?;
			records.movements.push(Movement {
				key: at.movement_key(log_index, TokenKind::Primary),
				from,
				to,
				amount,
				token_address: None,
				token_id: None,
				batch: Vec::new(),
				block,
			});
		}
		Ok(())
	}

	/// Failure details of a reverted transaction, read from the first failing clause trace.
	async fn revert_info(
		&self,
		tx: &ExpandedTransaction,
		block: BlockPointer,
		traces: &mut [Option<String>],
	) -> Result<VmError, SyncError> {
		let mut vm_error = VmError {
			reverted: true,
			error: "execution reverted".to_string(),
			reason: None,
			clause_index: None,
		};
		if !self.config.trace_clauses {
			return Ok(vm_error);
		}

		for (index, clause) in tx.clauses.iter().enumerate() {
			if clause.data.is_empty() && clause.to.is_some() {
				continue;
			}
			let at = ClauseRef {
				tx_hash: tx.id,
				clause_index: index as u32,
				block,
			};
			let trace = self.fetch_trace(at).await?;
			traces[index] = serde_json::to_string(&trace).ok();
			if let Some(error) = &trace.error {
				vm_error.error = error.clone();
				vm_error.reason = revert_reason(&trace.output);
				vm_error.clause_index = Some(index as u32);
				break;
			}
		}
		Ok(vm_error)
	}

	async fn apply_native_transfer(
		&self,
		transfer: &TransferLog,
		log_index: u32,
		at: ClauseRef,
		cache: &mut WindowCache,
		records: &mut DerivedRecords,
		digests: &mut DigestBuilder,
	) -> Result<(), SyncError> {
		let Some(token) = NativeToken::from_wire(transfer.token) else {
			warn!(
				block = at.block.number,
				"Skipping transfer of unknown native token {} in {}", transfer.token, at.tx_hash
			);
			return Ok(());
		};
		self.move_native(
			transfer.sender,
			transfer.recipient,
			token,
			transfer.amount,
			at,
			cache,
		)
		.await?;
		records.movements.push(Movement {
			key: at.movement_key(log_index, token.token_kind()),
			from: transfer.sender,
			to: transfer.recipient,
			amount: transfer.amount,
			token_address: None,
			token_id: None,
			batch: Vec::new(),
			block: at.block,
		});
		digests.add(
			transfer.sender,
			transfer.recipient,
			token,
			transfer.amount,
			at.clause_index,
		);
		Ok(())
	}

	/// Applies a native delta; the zero address is a mint or burn side and has no balance.
	async fn move_native(
		&self,
		from: Address,
		to: Address,
		token: NativeToken,
		amount: U256,
		at: ClauseRef,
		cache: &mut WindowCache,
	) -> Result<(), SyncError> {
		if from != Address::ZERO {
			cache
				.accounts
				.minus(&*self.store, &*self.reconciler, from, token, amount, at.block)
				.await?;
		}
		if to != Address::ZERO {
			cache
				.accounts
				.plus(&*self.store, to, token, amount, at.block)
				.await?;
		}
		Ok(())
	}

	async fn move_fungible(
		&self,
		contract: Address,
		from: Address,
		to: Address,
		amount: U256,
		at: ClauseRef,
		cache: &mut WindowCache,
	) -> Result<(), SyncError> {
		if from != Address::ZERO {
			cache
				.tokens
				.minus(&*self.store, &*self.reconciler, from, contract, amount, at.block)
				.await?;
		}
		if to != Address::ZERO {
			cache
				.tokens
				.plus(&*self.store, to, contract, amount, at.block)
				.await?;
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	async fn move_nft(
		&self,
		contract: Address,
		kind: TokenKind,
		from: Address,
		to: Address,
		id: U256,
		value: U256,
		at: ClauseRef,
		cache: &mut WindowCache,
	) -> Result<(), SyncError> {
		let store = &*self.store;
		if from != Address::ZERO {
			cache
				.tokens
				.nft_minus(store, &*self.reconciler, from, contract, kind, id, value, at.block)
				.await?;
			let key = NftKey {
				contract,
				token_id: id,
				owner: from,
			};
			cache
				.nfts
				.debit(store, &*self.reconciler, key, kind, value, at.block)
				.await?;
		}
		if to != Address::ZERO {
			cache
				.tokens
				.nft_plus(store, to, contract, id, value, at.block)
				.await?;
			let key = NftKey {
				contract,
				token_id: id,
				owner: to,
			};
			cache.nfts.credit(store, key, kind, value, at.block).await?;
		}
		Ok(())
	}

	async fn apply_event(
		&self,
		event: &EventLog,
		ctx: &EventContext<'_>,
		matched: &mut [bool],
		cache: &mut WindowCache,
		records: &mut DerivedRecords,
		digests: &mut DigestBuilder,
	) -> Result<(), SyncError> {
		let at = ctx.at;
		let decoded = match LogEvent::decode(event) {
			Ok(decoded) => decoded,
			Err(e) => {
				warn!(
					block = at.block.number,
					"Skipping undecodable event {} of {} from {}: {}",
					ctx.log_index,
					at.tx_hash,
					event.address,
					e
				);
				return Ok(());
			}
		};
		let contract = event.address;
		let token_movement = |token: TokenKind, from, to, amount, token_id| Movement {
			key: at.movement_key(ctx.log_index, token),
			from,
			to,
			amount,
			token_address: Some(contract),
			token_id,
			batch: Vec::new(),
			block: at.block,
		};

		match decoded {
			LogEvent::ContractCreated { master } => {
				let created = self.create_contract(contract, master, ctx).await?;
				records.contracts.push(created);
			}
			LogEvent::Bound {
				owner,
				amount,
				token,
			} => {
				if Some(contract) != self.config.staking_module {
					debug!("Ignoring Bound from non-staking contract {}", contract);
					return Ok(());
				}
				cache
					.accounts
					.bound(&*self.store, &*self.reconciler, owner, token, amount, at.block)
					.await?;
				records
					.bounds
					.push(staking_event(at, ctx.log_index, owner, amount, token));
			}
			LogEvent::Unbound {
				owner,
				amount,
				token,
			} => {
				if Some(contract) != self.config.staking_module {
					debug!("Ignoring Unbound from non-staking contract {}", contract);
					return Ok(());
				}
				cache
					.accounts
					.unbound(&*self.store, &*self.reconciler, owner, token, amount, at.block)
					.await?;
				records
					.unbounds
					.push(staking_event(at, ctx.log_index, owner, amount, token));
			}
			LogEvent::Deposit { owner, amount } => {
				if !self.config.wrapped_native.contains(&contract) {
					return Ok(());
				}
				self.move_fungible(contract, Address::ZERO, owner, amount, at, cache)
					.await?;
				records.movements.push(token_movement(
					TokenKind::Erc20,
					Address::ZERO,
					owner,
					amount,
					None,
				));
			}
			LogEvent::Withdrawal { owner, amount } => {
				if !self.config.wrapped_native.contains(&contract) {
					return Ok(());
				}
				self.move_fungible(contract, owner, Address::ZERO, amount, at, cache)
					.await?;
				records.movements.push(token_movement(
					TokenKind::Erc20,
					owner,
					Address::ZERO,
					amount,
					None,
				));
			}
			LogEvent::FungibleTransfer { from, to, amount } => {
				if let Some(token) = self.config.native_aliases.get(&contract).copied() {
					let duplicate = ctx.native_transfers.iter().enumerate().position(|(i, t)| {
						!matched[i]
							&& t.sender == from && t.recipient == to
							&& t.amount == amount
							&& NativeToken::from_wire(t.token) == Some(token)
					});
					if let Some(i) = duplicate {
						matched[i] = true;
						debug!(
							"Alias transfer of {} in {} already applied as native transfer",
							contract, at.tx_hash
						);
						return Ok(());
					}
					self.move_native(from, to, token, amount, at, cache).await?;
					records.movements.push(Movement {
						key: at.movement_key(ctx.log_index, token.token_kind()),
						from,
						to,
						amount,
						token_address: None,
						token_id: None,
						batch: Vec::new(),
						block: at.block,
					});
					digests.add(from, to, token, amount, at.clause_index);
					return Ok(());
				}

				self.move_fungible(contract, from, to, amount, at, cache)
					.await?;
				records
					.movements
					.push(token_movement(TokenKind::Erc20, from, to, amount, None));
			}
			LogEvent::NftTransfer { from, to, token_id } => {
				let one = U256::from(1);
				self.move_nft(contract, TokenKind::Erc721, from, to, token_id, one, at, cache)
					.await?;
				records.movements.push(token_movement(
					TokenKind::Erc721,
					from,
					to,
					one,
					Some(token_id),
				));
			}
			LogEvent::SingleTransfer {
				from, to, id, value, ..
			} => {
				self.move_nft(contract, TokenKind::Erc1155, from, to, id, value, at, cache)
					.await?;
				records.movements.push(token_movement(
					TokenKind::Erc1155,
					from,
					to,
					value,
					Some(id),
				));
			}
			LogEvent::BatchTransfer {
				from,
				to,
				ids,
				values,
				..
			} => {
				let mut batch = Vec::with_capacity(ids.len());
				let mut total = U256::ZERO;
				for (id, value) in ids.into_iter().zip(values) {
					self.move_nft(contract, TokenKind::Erc1155, from, to, id, value, at, cache)
						.await?;
					total = total.saturating_add(value);
					batch.push(NftBalance {
						token_id: id,
						value,
					});
				}
				let mut movement = token_movement(TokenKind::Erc1155, from, to, total, None);
				movement.batch = batch;
				records.movements.push(movement);
			}
			LogEvent::Unknown => {}
		}
		Ok(())
	}

	/// Builds the record of a contract announced by `$Master`: probes its interface and
	/// matches its creation input against verified contracts. A failed probe fails the
	/// block like any other source error.
	async fn create_contract(
		&self,
		address: Address,
		master: Address,
		ctx: &EventContext<'_>,
	) -> Result<Contract, SyncError> {
		let at = ctx.at;
		let probe = self.prober.probe(address, at.block.number).await?;

		let creation_input_hash = ctx.creation_hashes.get(&address).copied();
		let verified_from = match creation_input_hash {
			Some(hash) => self
				.store
				.find_verified_by_creation_hash(hash)
				.await?
				.map(|c| c.address)
				.filter(|matched| *matched != address),
			None => None,
		};
		if let Some(source) = verified_from {
			debug!("Contract {} verified by match with {}", address, source);
		}

		Ok(Contract {
			address,
			kind: probe.kind,
			name: probe.name,
			symbol: probe.symbol,
			decimals: probe.decimals,
			total_supply: probe.total_supply,
			creator: master,
			created: at.block,
			creation_tx: Some(at.tx_hash),
			creation_input_hash,
			verified: verified_from.is_some(),
			verified_from,
		})
	}
}

struct EventContext<'a> {
	at: ClauseRef,
	log_index: u32,
	native_transfers: &'a [TransferLog],
	creation_hashes: &'a HashMap<Address, B256>,
}

fn staking_event(
	at: ClauseRef,
	log_index: u32,
	owner: Address,
	amount: U256,
	token: NativeToken,
) -> StakingEvent {
	StakingEvent {
		tx_hash: at.tx_hash,
		clause_index: at.clause_index,
		log_index,
		owner,
		amount,
		token,
		block: at.block,
	}
}

/// keccak256 of the creation input of every contract created in `trace`.
fn collect_creation_hashes(trace: &TraceNode, hashes: &mut HashMap<Address, B256>) {
	if matches!(trace.kind, TraceKind::Create | TraceKind::Create2) {
		if let Some(created) = trace.to {
			hashes.insert(created, keccak256(&trace.input));
		}
	}
	for child in &trace.calls {
		collect_creation_hashes(child, hashes);
	}
}

/// Groups a transaction's native value movements by `(from, to)`.
#[derive(Default)]
struct DigestBuilder {
	order: Vec<(Address, Address)>,
	entries: HashMap<(Address, Address), (U256, U256, Vec<u32>)>,
}

impl DigestBuilder {
	fn add(&mut self, from: Address, to: Address, token: NativeToken, amount: U256, clause: u32) {
		if !self.entries.contains_key(&(from, to)) {
			self.order.push((from, to));
		}
		let entry = self.entries.entry((from, to)).or_default();
		match token {
			NativeToken::Primary => entry.0 = entry.0.saturating_add(amount),
			NativeToken::Secondary => entry.1 = entry.1.saturating_add(amount),
		}
		if !entry.2.contains(&clause) {
			entry.2.push(clause);
		}
	}

	fn finish(mut self, tx_hash: B256, block: BlockPointer) -> Vec<TxDigest> {
		self.order
			.into_iter()
			.filter_map(|(from, to)| {
				let (primary, secondary, clauses) = self.entries.remove(&(from, to))?;
				let mut pair = Vec::with_capacity(40);
				pair.extend_from_slice(from.as_slice());
				pair.extend_from_slice(to.as_slice());
				Some(TxDigest {
					tx_hash,
					content_hash: keccak256(&pair),
					from,
					to,
					primary_amount: primary,
					secondary_amount: secondary,
					clause_indexes: clauses,
					block,
				})
			})
			.collect()
	}
}

//! Attribution of a clause's receipt logs to its execution call-trace tree.
//!
//! A receipt carries flat `events` and `transfers` arrays with no link to the call that
//! produced each entry. Walking the trace tree depth-first and consuming entries in the
//! order the calls would have emitted them yields one `overall_index` per entry that is
//! stable across re-processing.

use super::events::MASTER_TOPIC;
use super::types::ReconcileError;
use crate::ledger::{BlockPointer, InternalTx};
use crate::source::{ClauseOutput, EventLog, TraceKind, TraceNode, TransferLog};
use alloy_primitives::{Address, B256};

/// `overall_index` of every event and every transfer of one clause, in array order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverallIndexes {
	pub events: Vec<u32>,
	pub transfers: Vec<u32>,
}

impl OverallIndexes {
	/// Lower-fidelity numbering used when the trace is unavailable or does not match:
	/// events first, then transfers, both in array order.
	pub fn sequential(output: &ClauseOutput) -> Self {
		let events = output.events.len() as u32;
		Self {
			events: (0..events).collect(),
			transfers: (events..events + output.transfers.len() as u32).collect(),
		}
	}
}

struct Cursor<'a> {
	events: &'a [EventLog],
	transfers: &'a [TransferLog],
	next_event: usize,
	next_transfer: usize,
	counter: u32,
	event_indexes: Vec<u32>,
	transfer_indexes: Vec<u32>,
}

impl<'a> Cursor<'a> {
	fn new(output: &'a ClauseOutput) -> Self {
		Self {
			events: &output.events,
			transfers: &output.transfers,
			next_event: 0,
			next_transfer: 0,
			counter: 0,
			event_indexes: Vec::with_capacity(output.events.len()),
			transfer_indexes: Vec::with_capacity(output.transfers.len()),
		}
	}

	fn take_index(&mut self) -> u32 {
		let index = self.counter;
		self.counter += 1;
		index
	}

	fn consume_transfer(&mut self, from: Address, to: Option<Address>) {
		let Some(transfer) = self.transfers.get(self.next_transfer) else {
			return;
		};
		if transfer.sender == from && Some(transfer.recipient) == to {
			self.next_transfer += 1;
			let index = self.take_index();
			self.transfer_indexes.push(index);
		}
	}

	fn consume_master(&mut self, contract: Option<Address>) {
		let Some(event) = self.events.get(self.next_event) else {
			return;
		};
		if Some(event.address) == contract && event.topics.first() == Some(&*MASTER_TOPIC) {
			self.next_event += 1;
			let index = self.take_index();
			self.event_indexes.push(index);
		}
	}

	fn consume_events(&mut self, address: Option<Address>) {
		while let Some(event) = self.events.get(self.next_event) {
			if Some(event.address) != address {
				break;
			}
			self.next_event += 1;
			let index = self.take_index();
			self.event_indexes.push(index);
		}
	}

	fn visit(&mut self, node: &TraceNode) -> Result<(), ReconcileError> {
		match node.kind {
			TraceKind::StaticCall => return Ok(()),
			TraceKind::Call => {
				if !node.value.is_zero() {
					self.consume_transfer(node.from, node.to);
				}
			}
			TraceKind::Create | TraceKind::Create2 => {
				if !node.value.is_zero() {
					self.consume_transfer(node.from, node.to);
				}
				self.consume_master(node.to);
			}
			TraceKind::Other(ref op) => return Err(ReconcileError::UnsupportedOp(op.clone())),
		}

		self.consume_events(node.to);
		for child in &node.calls {
			self.visit(child)?;
			self.consume_events(node.to);
		}
		Ok(())
	}
}

/// Assigns an `overall_index` to every event and transfer of `output` by walking `trace`.
///
/// Fails if the trace contains an unsupported operation or if any entry is left
/// unconsumed.
pub fn reconcile_outputs(
	trace: &TraceNode,
	output: &ClauseOutput,
) -> Result<OverallIndexes, ReconcileError> {
	let mut cursor = Cursor::new(output);
	cursor.visit(trace)?;

	if cursor.next_event != output.events.len() || cursor.next_transfer != output.transfers.len()
	{
		return Err(ReconcileError::CountMismatch {
			events: output.events.len(),
			consumed_events: cursor.next_event,
			transfers: output.transfers.len(),
			consumed_transfers: cursor.next_transfer,
		});
	}

	Ok(OverallIndexes {
		events: cursor.event_indexes,
		transfers: cursor.transfer_indexes,
	})
}

/// Flattens `trace` into one row per `CALL`/`CREATE`/`CREATE2` node, in pre-order.
///
/// Rows are named `<kind>_<clause>[_<child>...]`, where each suffix is the node's position
/// among its parent's calls. `STATICCALL` subtrees produce no rows.
pub fn flatten_internal_txs(
	trace: &TraceNode,
	tx_hash: B256,
	clause_index: u32,
	block: BlockPointer,
) -> Vec<InternalTx> {
	let mut rows = Vec::new();
	let path = clause_index.to_string();
	flatten_into(trace, &path, tx_hash, clause_index, block, &mut rows);
	rows
}

fn flatten_into(
	node: &TraceNode,
	path: &str,
	tx_hash: B256,
	clause_index: u32,
	block: BlockPointer,
	rows: &mut Vec<InternalTx>,
) {
	if !matches!(
		node.kind,
		TraceKind::Call | TraceKind::Create | TraceKind::Create2
	) {
		return;
	}

	rows.push(InternalTx {
		tx_hash,
		clause_index,
		name: format!("{}_{}", node.kind.as_str().to_ascii_lowercase(), path),
		kind: node.kind.as_str().to_string(),
		from: node.from,
		to: node.to,
		value: node.value,
		error: node.error.clone(),
		block,
	});

	for (i, child) in node.calls.iter().enumerate() {
		let child_path = format!("{}_{}", path, i);
		flatten_into(child, &child_path, tx_hash, clause_index, block, rows);
	}
}

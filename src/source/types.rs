//! Wire types of the upstream chain API (blocks, accounts, traces, read-only calls).

use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block revision accepted by every state-reading endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
	Best,
	Number(u64),
	Hash(B256),
}

impl fmt::Display for Revision {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Revision::Best => write!(f, "best"),
			Revision::Number(n) => write!(f, "{}", n),
			Revision::Hash(h) => write!(f, "{}", h),
		}
	}
}

/// Block kind. A K-block closes an epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
	KBlock,
	#[default]
	MBlock,
	SBlock,
	#[serde(other)]
	Unknown,
}

/// Committee member as announced in a block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitteeMember {
	#[serde(default)]
	pub index: u32,
	#[serde(default)]
	pub net_addr: String,
	#[serde(default)]
	pub pub_key: String,
}

/// Header fields shared by the regular and the expanded block shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
	pub number: u64,
	pub id: B256,
	#[serde(rename = "parentID")]
	pub parent_id: B256,
	pub timestamp: u64,
	#[serde(default)]
	pub gas_limit: u64,
	#[serde(default)]
	pub gas_used: u64,
	#[serde(default)]
	pub total_score: u64,
	#[serde(default)]
	pub beneficiary: Address,
	#[serde(default)]
	pub signer: Address,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub block_type: BlockType,
	#[serde(default)]
	pub epoch: u64,
	#[serde(default)]
	pub committee: Vec<CommitteeMember>,
}

/// A block as returned by the upstream API. `T` is a transaction id for regular blocks
/// and a full [`ExpandedTransaction`] for expanded ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Block<T> {
	#[serde(flatten)]
	pub header: BlockHeader,
	#[serde(default)]
	pub transactions: Vec<T>,
}

pub type RegularBlock = Block<B256>;
pub type ExpandedBlock = Block<ExpandedTransaction>;

/// One independent action inside a transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct Clause {
	pub to: Option<Address>,
	#[serde(with = "u256_wire")]
	pub value: U256,
	#[serde(default)]
	pub token: u8,
	#[serde(default)]
	pub data: Bytes,
}

/// Event emitted by a contract during clause execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
	pub address: Address,
	pub topics: Vec<B256>,
	#[serde(default)]
	pub data: Bytes,
}

/// Native value transfer performed during clause execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferLog {
	pub sender: Address,
	pub recipient: Address,
	#[serde(with = "u256_wire")]
	pub amount: U256,
	#[serde(default)]
	pub token: u8,
}

/// Receipt output of one clause.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClauseOutput {
	pub contract_address: Option<Address>,
	#[serde(default)]
	pub events: Vec<EventLog>,
	#[serde(default)]
	pub transfers: Vec<TransferLog>,
}

/// Transaction with its receipt, as embedded in an expanded block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedTransaction {
	pub id: B256,
	pub origin: Address,
	#[serde(default)]
	pub delegator: Option<Address>,
	pub clauses: Vec<Clause>,
	#[serde(default)]
	pub gas: u64,
	#[serde(default)]
	pub gas_used: u64,
	pub gas_payer: Option<Address>,
	#[serde(with = "u256_wire", default)]
	pub paid: U256,
	#[serde(with = "u256_wire", default)]
	pub reward: U256,
	#[serde(default)]
	pub reverted: bool,
	#[serde(default)]
	pub outputs: Vec<ClauseOutput>,
}

impl ExpandedTransaction {
	/// Account charged for gas: explicit payer, then delegator, then origin.
	pub fn fee_payer(&self) -> Address {
		self.gas_payer.or(self.delegator).unwrap_or(self.origin)
	}
}

/// Account state at a revision. `energy` is native token 0, `balance` native token 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
	#[serde(with = "u256_wire", default)]
	pub balance: U256,
	#[serde(with = "u256_wire", default)]
	pub energy: U256,
	#[serde(rename = "boundbalance", with = "u256_wire", default)]
	pub bound_balance: U256,
	#[serde(rename = "boundenergy", with = "u256_wire", default)]
	pub bound_energy: U256,
	#[serde(default)]
	pub has_code: bool,
}

/// Read-only call submitted to the explain endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CallClause {
	pub to: Address,
	#[serde(with = "u256_wire")]
	pub value: U256,
	pub data: Bytes,
}

impl CallClause {
	pub fn call(to: Address, data: Vec<u8>) -> Self {
		Self {
			to,
			value: U256::ZERO,
			data: data.into(),
		}
	}
}

/// Result of one explained call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
	#[serde(default)]
	pub data: Bytes,
	#[serde(default)]
	pub reverted: bool,
	#[serde(default)]
	pub vm_error: String,
}

impl CallResult {
	/// Returned data of a successful call, `None` if it reverted or returned nothing.
	pub fn output(&self) -> Option<&[u8]> {
		if self.reverted || !self.vm_error.is_empty() || self.data.is_empty() {
			None
		} else {
			Some(&self.data[..])
		}
	}
}

/// Operation type of a call-trace node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
	Call,
	Create,
	Create2,
	StaticCall,
	Other(String),
}

impl<'de> Deserialize<'de> for TraceKind {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		Ok(match raw.to_ascii_uppercase().as_str() {
			"CALL" => TraceKind::Call,
			"CREATE" => TraceKind::Create,
			"CREATE2" => TraceKind::Create2,
			"STATICCALL" => TraceKind::StaticCall,
			_ => TraceKind::Other(raw),
		})
	}
}

impl Serialize for TraceKind {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl TraceKind {
	pub fn as_str(&self) -> &str {
		match self {
			TraceKind::Call => "CALL",
			TraceKind::Create => "CREATE",
			TraceKind::Create2 => "CREATE2",
			TraceKind::StaticCall => "STATICCALL",
			TraceKind::Other(raw) => raw,
		}
	}
}

/// Node of a clause's execution call-trace tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceNode {
	#[serde(rename = "type")]
	pub kind: TraceKind,
	pub from: Address,
	#[serde(default)]
	pub to: Option<Address>,
	#[serde(with = "u256_wire", default)]
	pub value: U256,
	#[serde(default)]
	pub input: Bytes,
	#[serde(default)]
	pub output: Bytes,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub calls: Vec<TraceNode>,
}

/// Health report of an upstream node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProbe {
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub pubkey_valid: bool,
	#[serde(default)]
	pub is_committee_member: bool,
	#[serde(default)]
	pub best_block: Option<ProbeBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeBlock {
	pub number: u64,
	pub id: B256,
}

/// Error types for upstream source operations
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Upstream returned status {status} for {path}")]
	StatusError { status: u16, path: String },

	#[error("No data returned for {0}")]
	NoData(String),

	#[error("Malformed response: {0}")]
	Malformed(String),
}

/// Amounts travel as `0x`-prefixed hex or decimal strings (occasionally plain numbers).
pub mod u256_wire {
	use alloy_primitives::U256;
	use serde::{Deserialize, Deserializer, Serializer, de::Error};

	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Text(String),
		Number(u64),
	}

	pub fn parse(text: &str) -> Result<U256, String> {
		let text = text.trim();
		let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
			Some("") => Ok(U256::ZERO),
			Some(hex) => U256::from_str_radix(hex, 16),
			None if text.is_empty() => Ok(U256::ZERO),
			None => U256::from_str_radix(text, 10),
		};
		parsed.map_err(|e| format!("invalid amount {:?}: {}", text, e))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
		match Raw::deserialize(deserializer)? {
			Raw::Text(text) => parse(&text).map_err(D::Error::custom),
			Raw::Number(n) => Ok(U256::from(n)),
		}
	}

	pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("0x{:x}", value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_expanded_block() {
		let raw = r#"{
			"number": 12,
			"id": "0x0000000c00000000000000000000000000000000000000000000000000000000",
			"parentID": "0x0000000b00000000000000000000000000000000000000000000000000000000",
			"timestamp": 1700000000,
			"totalScore": 40,
			"blockType": "KBlock",
			"epoch": 3,
			"committee": [{"index": 0, "netAddr": "10.0.0.1:8670", "pubKey": "abc"}],
			"transactions": [{
				"id": "0x1100000000000000000000000000000000000000000000000000000000000000",
				"origin": "0x00000000000000000000000000000000000000aa",
				"clauses": [{"to": "0x00000000000000000000000000000000000000bb", "value": "0x64", "token": 0, "data": "0x"}],
				"gasUsed": 21000,
				"gasPayer": "0x00000000000000000000000000000000000000aa",
				"paid": "1000",
				"reward": "0x0",
				"reverted": false,
				"outputs": [{"contractAddress": null, "events": [], "transfers": [
					{"sender": "0x00000000000000000000000000000000000000aa", "recipient": "0x00000000000000000000000000000000000000bb", "amount": "0x64", "token": 0}
				]}]
			}]
		}"#;
		let block: ExpandedBlock = serde_json::from_str(raw).unwrap();
		assert_eq!(block.header.number, 12);
		assert_eq!(block.header.block_type, BlockType::KBlock);
		assert_eq!(block.header.committee.len(), 1);
		let tx = &block.transactions[0];
		assert_eq!(tx.clauses[0].value, U256::from(100));
		assert_eq!(tx.paid, U256::from(1000));
		assert_eq!(tx.outputs[0].transfers[0].amount, U256::from(100));
	}

	#[test]
	fn block_without_transactions_field_is_empty() {
		let raw = r#"{
			"number": 3,
			"id": "0x0000000000000000000000000000000000000000000000000000000000000003",
			"parentID": "0x0000000000000000000000000000000000000000000000000000000000000002",
			"timestamp": 1700000030,
			"gasLimit": 0,
			"gasUsed": 0,
			"totalScore": 6,
			"beneficiary": "0x0000000000000000000000000000000000000000",
			"signer": "0x0000000000000000000000000000000000000000",
			"size": 0,
			"blockType": "MBlock"
		}"#;
		let regular: RegularBlock = serde_json::from_str(raw).unwrap();
		assert!(regular.transactions.is_empty());
		let expanded: ExpandedBlock = serde_json::from_str(raw).unwrap();
		assert_eq!(expanded.header.number, 3);
		assert!(expanded.transactions.is_empty());
	}

	#[test]
	fn unknown_trace_kind_is_preserved() {
		let raw = r#"{"type": "DELEGATECALL", "from": "0x00000000000000000000000000000000000000aa", "value": "0x0"}"#;
		let node: TraceNode = serde_json::from_str(raw).unwrap();
		assert_eq!(node.kind, TraceKind::Other("DELEGATECALL".to_string()));
		assert!(node.calls.is_empty());
	}

	#[test]
	fn amount_parser_accepts_hex_and_decimal() {
		assert_eq!(u256_wire::parse("0x10").unwrap(), U256::from(16));
		assert_eq!(u256_wire::parse("10").unwrap(), U256::from(10));
		assert_eq!(u256_wire::parse("0x").unwrap(), U256::ZERO);
		assert!(u256_wire::parse("zz").is_err());
	}
}

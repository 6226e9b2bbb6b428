//! Typed decoding of event logs and clause payloads.
//!
//! Every log is looked up by its first topic in a fixed signature table and decoded into
//! one [`LogEvent`] variant. Logs whose signature is not in the table decode to
//! [`LogEvent::Unknown`]; logs whose signature is known but whose body does not fit the
//! shape are a [`DecodeError`], which callers log and skip.

use crate::ledger::{ClauseKind, NativeToken};
use crate::source::{Clause, EventLog};
use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_sol_types::{Panic, Revert, SolError, SolEvent};
use std::collections::HashMap;
use std::sync::LazyLock;

/// ABI shapes of the contracts the processor understands.
pub mod abi {
	use alloy_sol_types::sol;

	sol! {
		event Bound(address indexed owner, uint256 amount, uint256 token);
		event Unbound(address indexed owner, uint256 amount, uint256 token);

		event Deposit(address indexed dst, uint256 wad);
		event Withdrawal(address indexed src, uint256 wad);

		event TransferSingle(address indexed operator, address indexed from, address indexed to, uint256 id, uint256 value);
		event TransferBatch(address indexed operator, address indexed from, address indexed to, uint256[] ids, uint256[] values);

		function name() external view returns (string);
		function symbol() external view returns (string);
		function decimals() external view returns (uint8);
		function totalSupply() external view returns (uint256);
		function balanceOf(address owner) external view returns (uint256);
		function ownerOf(uint256 tokenId) external view returns (address);
		function supportsInterface(bytes4 interfaceId) external view returns (bool);
	}

	/// ERC-20 `Transfer`: the amount is not indexed (three topics).
	pub mod erc20 {
		use alloy_sol_types::sol;

		sol! {
			event Transfer(address indexed from, address indexed to, uint256 value);
		}
	}

	/// ERC-721 `Transfer`: the token id is indexed (four topics).
	pub mod erc721 {
		use alloy_sol_types::sol;

		sol! {
			event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
		}
	}

	pub mod erc1155 {
		use alloy_sol_types::sol;

		sol! {
			function balanceOf(address account, uint256 id) external view returns (uint256);
		}
	}
}

/// Topic of the `$Master(address)` event every new contract emits at creation.
pub static MASTER_TOPIC: LazyLock<B256> = LazyLock::new(|| keccak256("$Master(address)"));

/// First bytes of a clause handled by the chain's script engine instead of the EVM.
pub const SCRIPT_ENGINE_PREFIX: [u8; 8] = [0xff, 0xff, 0xff, 0xff, 0xde, 0xad, 0xbe, 0xef];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signature {
	Master,
	Bound,
	Unbound,
	Deposit,
	Withdrawal,
	Transfer,
	TransferSingle,
	TransferBatch,
}

static SIGNATURES: LazyLock<HashMap<B256, Signature>> = LazyLock::new(|| {
	HashMap::from([
		(*MASTER_TOPIC, Signature::Master),
		(abi::Bound::SIGNATURE_HASH, Signature::Bound),
		(abi::Unbound::SIGNATURE_HASH, Signature::Unbound),
		(abi::Deposit::SIGNATURE_HASH, Signature::Deposit),
		(abi::Withdrawal::SIGNATURE_HASH, Signature::Withdrawal),
		// ERC-20 and ERC-721 share this hash and differ by topic count.
		(abi::erc20::Transfer::SIGNATURE_HASH, Signature::Transfer),
		(abi::TransferSingle::SIGNATURE_HASH, Signature::TransferSingle),
		(abi::TransferBatch::SIGNATURE_HASH, Signature::TransferBatch),
	])
});

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("ABI decode failed: {0}")]
	Abi(#[from] alloy_sol_types::Error),

	#[error("{0}")]
	Malformed(String),
}

/// A decoded log. The emitting contract is the log's `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
	/// A contract was created; `master` is its initial master (creator).
	ContractCreated { master: Address },
	Bound {
		owner: Address,
		amount: U256,
		token: NativeToken,
	},
	Unbound {
		owner: Address,
		amount: U256,
		token: NativeToken,
	},
	Deposit { owner: Address, amount: U256 },
	Withdrawal { owner: Address, amount: U256 },
	FungibleTransfer {
		from: Address,
		to: Address,
		amount: U256,
	},
	NftTransfer {
		from: Address,
		to: Address,
		token_id: U256,
	},
	SingleTransfer {
		operator: Address,
		from: Address,
		to: Address,
		id: U256,
		value: U256,
	},
	BatchTransfer {
		operator: Address,
		from: Address,
		to: Address,
		ids: Vec<U256>,
		values: Vec<U256>,
	},
	Unknown,
}

fn staking_token(raw: U256) -> Result<NativeToken, DecodeError> {
	u8::try_from(raw)
		.ok()
		.and_then(NativeToken::from_wire)
		.ok_or_else(|| DecodeError::Malformed(format!("unknown staking token {}", raw)))
}

impl LogEvent {
	pub fn decode(log: &EventLog) -> Result<Self, DecodeError> {
		let Some(signature) = log.topics.first().and_then(|t| SIGNATURES.get(t)) else {
			return Ok(LogEvent::Unknown);
		};
		let topics = log.topics.iter().copied();
		let data = &log.data[..];

		let event = match signature {
			Signature::Master => {
				if data.len() < 32 {
					return Err(DecodeError::Malformed(format!(
						"$Master data of {} bytes",
						data.len()
					)));
				}
				LogEvent::ContractCreated {
					master: Address::from_slice(&data[12..32]),
				}
			}
			Signature::Bound => {
				let e = abi::Bound::decode_raw_log(topics, data, true)?;
				LogEvent::Bound {
					owner: e.owner,
					amount: e.amount,
					token: staking_token(e.token)?,
				}
			}
			Signature::Unbound => {
				let e = abi::Unbound::decode_raw_log(topics, data, true)?;
				LogEvent::Unbound {
					owner: e.owner,
					amount: e.amount,
					token: staking_token(e.token)?,
				}
			}
			Signature::Deposit => {
				let e = abi::Deposit::decode_raw_log(topics, data, true)?;
				LogEvent::Deposit {
					owner: e.dst,
					amount: e.wad,
				}
			}
			Signature::Withdrawal => {
				let e = abi::Withdrawal::decode_raw_log(topics, data, true)?;
				LogEvent::Withdrawal {
					owner: e.src,
					amount: e.wad,
				}
			}
			Signature::Transfer => match log.topics.len() {
				3 => {
					let e = abi::erc20::Transfer::decode_raw_log(topics, data, true)?;
					LogEvent::FungibleTransfer {
						from: e.from,
						to: e.to,
						amount: e.value,
					}
				}
				4 => {
					let e = abi::erc721::Transfer::decode_raw_log(topics, data, true)?;
					LogEvent::NftTransfer {
						from: e.from,
						to: e.to,
						token_id: e.tokenId,
					}
				}
				n => {
					return Err(DecodeError::Malformed(format!(
						"Transfer with {} topics",
						n
					)));
				}
			},
			Signature::TransferSingle => {
				let e = abi::TransferSingle::decode_raw_log(topics, data, true)?;
				LogEvent::SingleTransfer {
					operator: e.operator,
					from: e.from,
					to: e.to,
					id: e.id,
					value: e.value,
				}
			}
			Signature::TransferBatch => {
				let e = abi::TransferBatch::decode_raw_log(topics, data, true)?;
				if e.ids.len() != e.values.len() {
					return Err(DecodeError::Malformed(format!(
						"TransferBatch with {} ids and {} values",
						e.ids.len(),
						e.values.len()
					)));
				}
				LogEvent::BatchTransfer {
					operator: e.operator,
					from: e.from,
					to: e.to,
					ids: e.ids,
					values: e.values,
				}
			}
		};
		Ok(event)
	}
}

/// Interprets a clause payload: empty data is a plain transfer, no recipient is a
/// deployment, the script-engine prefix is a script call, anything else is an EVM call
/// with a 4-byte selector.
pub fn classify_clause(clause: &Clause) -> (ClauseKind, Option<String>) {
	let data = &clause.data[..];
	if clause.to.is_none() {
		return (ClauseKind::Create, None);
	}
	if data.is_empty() {
		return (ClauseKind::Transfer, None);
	}
	if data.starts_with(&SCRIPT_ENGINE_PREFIX) {
		return (ClauseKind::Script, None);
	}
	let selector = (data.len() >= 4).then(|| format!("0x{}", hex::encode(&data[..4])));
	(ClauseKind::Call, selector)
}

/// Revert string or panic code carried by a failed call's output.
pub fn revert_reason(output: &[u8]) -> Option<String> {
	if let Ok(revert) = Revert::abi_decode(output, true) {
		return Some(revert.reason);
	}
	Panic::abi_decode(output, true)
		.ok()
		.map(|panic| format!("panic code 0x{:x}", panic.code))
}


#[cfg(test)]
mod tests {
	use super::testing::*;
	use super::*;
	use alloy_primitives::Bytes;
	use rstest::rstest;

	fn a(n: u8) -> Address {
		Address::with_last_byte(n)
	}

	#[test]
	fn transfer_shape_is_chosen_by_topic_count() {
		let fungible = log_of(
			a(9),
			&abi::erc20::Transfer {
				from: a(1),
				to: a(2),
				value: U256::from(50),
			},
		);
		let nft = log_of(
			a(9),
			&abi::erc721::Transfer {
				from: a(1),
				to: a(2),
				tokenId: U256::from(7),
			},
		);

		assert_eq!(
			LogEvent::decode(&fungible).unwrap(),
			LogEvent::FungibleTransfer {
				from: a(1),
				to: a(2),
				amount: U256::from(50)
			}
		);
		assert_eq!(
			LogEvent::decode(&nft).unwrap(),
			LogEvent::NftTransfer {
				from: a(1),
				to: a(2),
				token_id: U256::from(7)
			}
		);
	}

	#[test]
	fn decodes_staking_and_creation_events() {
		let bound = log_of(
			a(5),
			&abi::Bound {
				owner: a(3),
				amount: U256::from(200),
				token: U256::from(1),
			},
		);
		assert_eq!(
			LogEvent::decode(&bound).unwrap(),
			LogEvent::Bound {
				owner: a(3),
				amount: U256::from(200),
				token: NativeToken::Secondary
			}
		);

		assert_eq!(
			LogEvent::decode(&master_log(a(8), a(1))).unwrap(),
			LogEvent::ContractCreated { master: a(1) }
		);
	}

	#[test]
	fn decodes_batch_transfers() {
		let log = log_of(
			a(9),
			&abi::TransferBatch {
				operator: a(1),
				from: Address::ZERO,
				to: a(2),
				ids: vec![U256::from(1), U256::from(2)],
				values: vec![U256::from(10), U256::from(20)],
			},
		);
		match LogEvent::decode(&log).unwrap() {
			LogEvent::BatchTransfer { ids, values, .. } => {
				assert_eq!(ids.len(), 2);
				assert_eq!(values[1], U256::from(20));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn unknown_signatures_are_explicit() {
		let log = EventLog {
			address: a(1),
			topics: vec![B256::repeat_byte(0x42)],
			data: Bytes::new(),
		};
		assert_eq!(LogEvent::decode(&log).unwrap(), LogEvent::Unknown);

		let anonymous = EventLog {
			address: a(1),
			topics: vec![],
			data: Bytes::new(),
		};
		assert_eq!(LogEvent::decode(&anonymous).unwrap(), LogEvent::Unknown);
	}

	#[test]
	fn malformed_known_events_are_errors() {
		let mut log = log_of(
			a(9),
			&abi::erc20::Transfer {
				from: a(1),
				to: a(2),
				value: U256::from(50),
			},
		);
		log.data = Bytes::new();
		assert!(LogEvent::decode(&log).is_err());

		let mut bad_token = log_of(
			a(5),
			&abi::Unbound {
				owner: a(3),
				amount: U256::from(1),
				token: U256::from(7),
			},
		);
		assert!(LogEvent::decode(&bad_token).is_err());
		bad_token.topics.truncate(1);
		assert!(LogEvent::decode(&bad_token).is_err());
	}

	#[rstest]
	#[case(Some(1), "", ClauseKind::Transfer, None)]
	#[case(None, "6080604052", ClauseKind::Create, None)]
	#[case(Some(1), "ffffffffdeadbeef0001", ClauseKind::Script, None)]
	#[case(Some(1), "a9059cbb0000", ClauseKind::Call, Some("0xa9059cbb"))]
	#[case(Some(1), "a905", ClauseKind::Call, None)]
	fn classifies_clause_payloads(
		#[case] to: Option<u8>,
		#[case] data: &str,
		#[case] kind: ClauseKind,
		#[case] selector: Option<&str>,
	) {
		let clause = Clause {
			to: to.map(a),
			value: U256::ZERO,
			token: 0,
			data: hex::decode(data).unwrap().into(),
		};
		assert_eq!(
			classify_clause(&clause),
			(kind, selector.map(str::to_string))
		);
	}

	#[test]
	fn revert_reason_reads_error_strings() {
		let output = hex::decode(concat!(
			"08c379a0",
			"0000000000000000000000000000000000000000000000000000000000000020",
			"0000000000000000000000000000000000000000000000000000000000000004",
			"6e6f706500000000000000000000000000000000000000000000000000000000"
		))
		.unwrap();
		assert_eq!(revert_reason(&output).as_deref(), Some("nope"));
		assert_eq!(revert_reason(&[]), None);
	}
}

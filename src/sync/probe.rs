//! Classification of newly created contracts through read-only interface calls.

use super::events::abi;
use crate::ledger::ContractKind;
use crate::source::{CallClause, CallResult, Revision, SourceClient, SourceError};
use alloy_primitives::{Address, FixedBytes, U256};
use alloy_sol_types::SolCall;
use std::sync::Arc;
use tracing::debug;

const ERC721_INTERFACE: [u8; 4] = [0x80, 0xac, 0x58, 0xcd];
const ERC1155_INTERFACE: [u8; 4] = [0xd9, 0xb6, 0x7a, 0x26];

/// Metadata discovered for one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractProbe {
	pub kind: ContractKind,
	pub name: Option<String>,
	pub symbol: Option<String>,
	pub decimals: u8,
	pub total_supply: U256,
}

pub struct ContractProber<S> {
	source: Arc<S>,
}

impl<S: SourceClient> ContractProber<S> {
	pub fn new(source: Arc<S>) -> Self {
		Self { source }
	}

	/// Probes `address` at block `number` with one batch of ERC-165, ERC-721/1155 and
	/// ERC-20 shaped calls. An address without code at that block is `Unknown` and is not
	/// called.
	pub async fn probe(&self, address: Address, number: u64) -> Result<ContractProbe, SourceError> {
		let code = self
			.source
			.get_code(address, Revision::Number(number))
			.await?;
		if code.is_empty() {
			debug!("No code at {} in block {}, skipping interface calls", address, number);
			return Ok(ContractProbe {
				kind: ContractKind::Unknown,
				name: None,
				symbol: None,
				decimals: 0,
				total_supply: U256::ZERO,
			});
		}

		let batch = [
			abi::supportsInterfaceCall {
				interfaceId: FixedBytes(ERC721_INTERFACE),
			}
			.abi_encode(),
			abi::supportsInterfaceCall {
				interfaceId: FixedBytes(ERC1155_INTERFACE),
			}
			.abi_encode(),
			abi::nameCall {}.abi_encode(),
			abi::symbolCall {}.abi_encode(),
			abi::decimalsCall {}.abi_encode(),
			abi::totalSupplyCall {}.abi_encode(),
		];
		let clauses: Vec<CallClause> = batch
			.into_iter()
			.map(|data| CallClause::call(address, data))
			.collect();
		let results = self
			.source
			.explain(&clauses, Revision::Number(number))
			.await?;
		let [is_721, is_1155, name, symbol, decimals, total_supply] = results.as_slice() else {
			return Err(SourceError::Malformed(format!(
				"explain returned {} results for {} clauses",
				results.len(),
				clauses.len()
			)));
		};

		let supports = |result: &CallResult| {
			result
				.output()
				.and_then(|out| abi::supportsInterfaceCall::abi_decode_returns(out, true).ok())
				.is_some_and(|r| r._0)
		};
		let decimals = decimals
			.output()
			.and_then(|out| abi::decimalsCall::abi_decode_returns(out, true).ok())
			.map(|r| r._0);
		let total_supply = total_supply
			.output()
			.and_then(|out| abi::totalSupplyCall::abi_decode_returns(out, true).ok())
			.map(|r| r._0);

		let kind = if supports(is_721) {
			ContractKind::Erc721
		} else if supports(is_1155) {
			ContractKind::Erc1155
		} else if decimals.is_some() && total_supply.is_some() {
			ContractKind::Erc20
		} else {
			ContractKind::Unknown
		};

		let probe = ContractProbe {
			kind,
			name: name.output().and_then(decode_text),
			symbol: symbol.output().and_then(decode_text),
			decimals: decimals.unwrap_or_default(),
			total_supply: total_supply.unwrap_or_default(),
		};
		debug!("Probed contract {} at block {}: {:?}", address, number, probe);
		Ok(probe)
	}
}

/// ABI string, or a NUL-padded `bytes32` as returned by some early tokens.
fn decode_text(out: &[u8]) -> Option<String> {
	if let Ok(decoded) = abi::nameCall::abi_decode_returns(out, true) {
		return Some(decoded._0);
	}
	if out.len() == 32 {
		let trimmed: Vec<u8> = out.iter().copied().take_while(|b| *b != 0).collect();
		return String::from_utf8(trimmed).ok().filter(|s| !s.is_empty());
	}
	None
}

//! Runtime configuration.
//!
//! `IndexerConfig` is read once at startup: an optional JSON file named by
//! `LEDGER_SYNC_CONFIG` provides the base values and individual `LEDGER_SYNC_*` environment
//! variables override them.

use crate::ledger::NativeToken;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE_VAR: &str = "LEDGER_SYNC_CONFIG";
const ENV_PREFIX: &str = "LEDGER_SYNC_";

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("IO error reading {path:?}: {source}")]
	IoError {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("Invalid config file: {0}")]
	ParseError(#[from] serde_json::Error),

	#[error("Invalid value {value:?} for {key}")]
	InvalidValue { key: String, value: String },
}

/// A system contract whose token transfers mirror a native ledger. Its `Transfer` events
/// are applied to account balances instead of token balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeAlias {
	pub address: Address,
	pub token: NativeToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
	/// Base URL of the upstream node API
	pub source_url: String,
	/// Directory holding head files and the ledger snapshot
	pub data_dir: PathBuf,
	/// Journal entries appended before the ledger snapshot is rewritten in full
	pub compact_after: usize,
	/// Name of the main pipeline's head
	pub pipeline: String,
	/// Pipeline whose head seeds ours on first run
	pub seed_from: Option<String>,
	/// Blocks per catch-up window
	pub window: u64,
	pub steady_interval_ms: u64,
	pub catch_up_interval_ms: u64,
	pub recovery_backoff_ms: u64,
	pub request_timeout_secs: u64,
	/// Blocks fetched ahead of the one being processed
	pub prefetch_depth: u64,
	/// Parallel source requests during recovery reconciliation
	pub reconcile_concurrency: usize,
	/// Fetch call traces for clauses with a payload
	pub trace_clauses: bool,
	/// Contract emitting `Bound`/`Unbound`
	pub staking_module: Option<Address>,
	pub native_aliases: Vec<NativeAlias>,
	/// Wrapped-native contracts emitting `Deposit`/`Withdrawal`
	pub wrapped_native: Vec<Address>,
	/// Preallocated accounts read from the source at genesis
	pub genesis_accounts: Vec<Address>,
}

impl Default for IndexerConfig {
	fn default() -> Self {
		Self {
			source_url: "http://127.0.0.1:8669".to_string(),
			data_dir: PathBuf::from("data"),
			compact_after: 10_000,
			pipeline: "chain".to_string(),
			seed_from: None,
			window: 100,
			steady_interval_ms: 2_000,
			catch_up_interval_ms: 100,
			recovery_backoff_ms: 5_000,
			request_timeout_secs: 30,
			prefetch_depth: 5,
			reconcile_concurrency: 8,
			trace_clauses: true,
			staking_module: None,
			native_aliases: Vec::new(),
			wrapped_native: Vec::new(),
			genesis_accounts: Vec::new(),
		}
	}
}

impl IndexerConfig {
	/// Loads the config file named by `LEDGER_SYNC_CONFIG` (if any), then applies
	/// environment overrides.
	pub fn from_env() -> Result<Self, ConfigError> {
		let mut config = match std::env::var(CONFIG_FILE_VAR) {
			Ok(path) => Self::from_file(PathBuf::from(path))?,
			Err(_) => Self::default(),
		};
		config.apply_overrides(|key| std::env::var(key).ok())?;
		Ok(config)
	}

	pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::IoError {
			path: path.clone(),
			source,
		})?;
		Ok(serde_json::from_str(&content)?)
	}

	/// Applies `LEDGER_SYNC_<FIELD>` overrides looked up through `lookup`.
	pub fn apply_overrides(
		&mut self,
		lookup: impl Fn(&str) -> Option<String>,
	) -> Result<(), ConfigError> {
		let get = |name: &str| {
			let key = format!("{}{}", ENV_PREFIX, name);
			lookup(&key).map(|value| (key, value))
		};

		if let Some((_, v)) = get("SOURCE_URL") {
			self.source_url = v;
		}
		if let Some((_, v)) = get("DATA_DIR") {
			self.data_dir = PathBuf::from(v);
		}
		if let Some((k, v)) = get("COMPACT_AFTER") {
			self.compact_after = parse(&k, &v)?;
		}
		if let Some((_, v)) = get("PIPELINE") {
			self.pipeline = v;
		}
		if let Some((_, v)) = get("SEED_FROM") {
			self.seed_from = Some(v).filter(|s| !s.is_empty());
		}
		if let Some((k, v)) = get("WINDOW") {
			self.window = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("STEADY_INTERVAL_MS") {
			self.steady_interval_ms = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("CATCH_UP_INTERVAL_MS") {
			self.catch_up_interval_ms = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("RECOVERY_BACKOFF_MS") {
			self.recovery_backoff_ms = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("REQUEST_TIMEOUT_SECS") {
			self.request_timeout_secs = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("PREFETCH_DEPTH") {
			self.prefetch_depth = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("RECONCILE_CONCURRENCY") {
			self.reconcile_concurrency = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("TRACE_CLAUSES") {
			self.trace_clauses = parse(&k, &v)?;
		}
		if let Some((k, v)) = get("STAKING_MODULE") {
			self.staking_module = Some(parse(&k, &v)?);
		}
		if let Some((k, v)) = get("NATIVE_ALIASES") {
			self.native_aliases = split(&v)
				.map(|entry| parse_alias(&k, entry))
				.collect::<Result<_, _>>()?;
		}
		if let Some((k, v)) = get("WRAPPED_NATIVE") {
			self.wrapped_native = split(&v)
				.map(|entry| parse(&k, entry))
				.collect::<Result<_, _>>()?;
		}
		if let Some((k, v)) = get("GENESIS_ACCOUNTS") {
			self.genesis_accounts = split(&v)
				.map(|entry| parse(&k, entry))
				.collect::<Result<_, _>>()?;
		}

		if self.window == 0 {
			return Err(ConfigError::InvalidValue {
				key: format!("{}WINDOW", ENV_PREFIX),
				value: "0".to_string(),
			});
		}
		Ok(())
	}

	pub fn snapshot_path(&self) -> PathBuf {
		self.data_dir.join(format!("ledger_{}.json", self.pipeline))
	}

	pub fn controller(&self) -> ControllerConfig {
		ControllerConfig {
			window: self.window,
			steady_interval: Duration::from_millis(self.steady_interval_ms),
			catch_up_interval: Duration::from_millis(self.catch_up_interval_ms),
			recovery_backoff: Duration::from_millis(self.recovery_backoff_ms),
		}
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}
}

fn split(value: &str) -> impl Iterator<Item = &str> {
	value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
	value.trim().parse().map_err(|_| ConfigError::InvalidValue {
		key: key.to_string(),
		value: value.to_string(),
	})
}

/// `<address>:<token>` where token is `0` (primary) or `1` (secondary).
fn parse_alias(key: &str, entry: &str) -> Result<NativeAlias, ConfigError> {
	let invalid = || ConfigError::InvalidValue {
		key: key.to_string(),
		value: entry.to_string(),
	};
	let (address, token) = entry.split_once(':').ok_or_else(invalid)?;
	let token = token
		.trim()
		.parse::<u8>()
		.ok()
		.and_then(NativeToken::from_wire)
		.ok_or_else(invalid)?;
	Ok(NativeAlias {
		address: parse(key, address)?,
		token,
	})
}

/// Timing of the catch-up loop.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
	/// Maximum number of blocks processed between two head advances while catching up
	pub window: u64,
	/// Sleep between iterations once within one window of the upstream best block
	pub steady_interval: Duration,
	/// Sleep between iterations while catching up
	pub catch_up_interval: Duration,
	/// Sleep after a failed iteration before recovery runs again
	pub recovery_backoff: Duration,
}

impl Default for ControllerConfig {
	fn default() -> Self {
		Self {
			window: 100,
			steady_interval: Duration::from_secs(2),
			catch_up_interval: Duration::from_millis(100),
			recovery_backoff: Duration::from_secs(5),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;
	use std::collections::HashMap;

	fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let vars: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		move |key| vars.get(key).cloned()
	}

	#[test]
	fn defaults_match_controller_defaults() {
		let controller = IndexerConfig::default().controller();
		let defaults = ControllerConfig::default();
		assert_eq!(controller.window, defaults.window);
		assert_eq!(controller.steady_interval, defaults.steady_interval);
		assert_eq!(controller.catch_up_interval, defaults.catch_up_interval);
		assert_eq!(controller.recovery_backoff, defaults.recovery_backoff);
	}

	#[test]
	fn environment_overrides_apply() {
		let mut config = IndexerConfig::default();
		config
			.apply_overrides(lookup(&[
				("LEDGER_SYNC_WINDOW", "25"),
				("LEDGER_SYNC_COMPACT_AFTER", "500"),
				("LEDGER_SYNC_TRACE_CLAUSES", "false"),
				(
					"LEDGER_SYNC_NATIVE_ALIASES",
					"0x0000000000000000000000000000000000000a01:0, 0x0000000000000000000000000000000000000a02:1",
				),
				(
					"LEDGER_SYNC_WRAPPED_NATIVE",
					"0x0000000000000000000000000000000000000b01",
				),
			]))
			.unwrap();

		assert_eq!(config.window, 25);
		assert_eq!(config.compact_after, 500);
		assert!(!config.trace_clauses);
		assert_eq!(config.native_aliases.len(), 2);
		assert_eq!(config.native_aliases[1].token, NativeToken::Secondary);
		assert_eq!(config.wrapped_native.len(), 1);
	}

	#[rstest]
	#[case("LEDGER_SYNC_WINDOW", "ten")]
	#[case("LEDGER_SYNC_WINDOW", "0")]
	#[case("LEDGER_SYNC_STAKING_MODULE", "0x1234")]
	#[case("LEDGER_SYNC_NATIVE_ALIASES", "0x0000000000000000000000000000000000000a01:7")]
	#[case("LEDGER_SYNC_NATIVE_ALIASES", "0x0000000000000000000000000000000000000a01")]
	fn invalid_overrides_are_rejected(#[case] key: &str, #[case] value: &str) {
		let mut config = IndexerConfig::default();
		assert!(matches!(
			config.apply_overrides(lookup(&[(key, value)])),
			Err(ConfigError::InvalidValue { .. })
		));
	}

	#[test]
	fn config_file_fills_missing_fields_with_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		std::fs::write(
			&path,
			r#"{"source_url": "http://node:8669", "native_aliases": [
				{"address": "0x0000000000000000000000000000000000000a01", "token": "Primary"}
			]}"#,
		)
		.unwrap();

		let config = IndexerConfig::from_file(path).unwrap();
		assert_eq!(config.source_url, "http://node:8669");
		assert_eq!(config.native_aliases[0].token, NativeToken::Primary);
		assert_eq!(config.window, 100);
	}
}

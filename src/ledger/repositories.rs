use crate::ledger::types::*;
use alloy_primitives::{Address, B256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Error types for ledger persistence
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	SerializationError(#[from] serde_json::Error),

	#[error("Invalid record: {0}")]
	InvalidRecord(String),
}

/// NFT holdings touched during one window.
#[derive(Debug, Clone, Default)]
pub struct NftChanges {
	/// Holdings created in the window, already carrying their final owner.
	pub minted: Vec<Nft>,
	/// Pre-existing holdings whose value changed, including drops to zero.
	pub updated: Vec<Nft>,
}

impl NftChanges {
	pub fn is_empty(&self) -> bool {
		self.minted.is_empty() && self.updated.is_empty()
	}
}

/// Repository for derived ledger records and balance aggregates
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
	async fn find_block(&self, number: u64) -> Result<Option<BlockRecord>, StoreError>;

	/// Writes every record of a window. Records are keyed by their unique identity, so a
	/// replayed window overwrites instead of duplicating.
	async fn save_derived(&self, records: DerivedRecords) -> Result<(), StoreError>;

	async fn find_contract(&self, address: Address) -> Result<Option<Contract>, StoreError>;

	/// A verified contract whose creation input hashes to `hash`.
	async fn find_verified_by_creation_hash(
		&self,
		hash: B256,
	) -> Result<Option<Contract>, StoreError>;

	async fn find_account(&self, address: Address) -> Result<Option<Account>, StoreError>;
	async fn save_accounts(&self, accounts: Vec<Account>) -> Result<(), StoreError>;

	async fn find_token_balance(
		&self,
		address: Address,
		token_address: Address,
	) -> Result<Option<TokenBalance>, StoreError>;
	async fn save_token_balances(&self, balances: Vec<TokenBalance>) -> Result<(), StoreError>;

	async fn find_nft(&self, key: &NftKey) -> Result<Option<Nft>, StoreError>;
	async fn save_nfts(&self, changes: NftChanges) -> Result<(), StoreError>;

	/// Accounts updated above block `number`, or flagged for reconciliation.
	async fn accounts_to_reconcile(&self, number: u64) -> Result<Vec<Account>, StoreError>;

	/// Token balances updated above block `number`, flagged, or structurally inconsistent.
	async fn token_balances_to_reconcile(
		&self,
		number: u64,
	) -> Result<Vec<TokenBalance>, StoreError>;

	/// NFT holdings updated above block `number`, or flagged for reconciliation.
	async fn nfts_to_reconcile(&self, number: u64) -> Result<Vec<Nft>, StoreError>;

	/// Deletes every derived record that belongs to a block above `number`.
	async fn truncate_above(&self, number: u64) -> Result<TruncateStats, StoreError>;

	/// Makes everything written so far durable.
	async fn persist(&self) -> Result<(), StoreError> {
		Ok(())
	}
}

/// Repository for pipeline heads
#[async_trait::async_trait]
pub trait HeadRepository: Send + Sync {
	async fn load(&self, pipeline: &str) -> Result<Option<Head>, StoreError>;
	async fn save(&self, head: &Head) -> Result<(), StoreError>;
}

/// File-based implementation of HeadRepository, one JSON file per pipeline
pub struct FileHeadRepository {
	data_dir: PathBuf,
}

impl FileHeadRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_head_filename(&self, pipeline: &str) -> PathBuf {
		self.data_dir.join(format!("head_{}.json", pipeline))
	}
}

/// Writes `content` next to `path` and renames it into place.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	let tmp = path.with_extension("tmp");
	tokio::fs::write(&tmp, content).await?;
	tokio::fs::rename(&tmp, path).await?;
	Ok(())
}

#[async_trait::async_trait]
impl HeadRepository for FileHeadRepository {
	async fn load(&self, pipeline: &str) -> Result<Option<Head>, StoreError> {
		let filename = self.get_head_filename(pipeline);

		// Check if file exists
		if !tokio::fs::try_exists(&filename).await? {
			return Ok(None);
		}

		let content = tokio::fs::read_to_string(&filename).await?;
		let metadata: serde_json::Value = serde_json::from_str(&content)?;

		let number = metadata
			.get("number")
			.and_then(|n| n.as_u64())
			.ok_or_else(|| StoreError::InvalidRecord(format!("{:?} has no number", filename)))?;
		let hash = metadata
			.get("hash")
			.and_then(|h| h.as_str())
			.and_then(|h| h.parse::<B256>().ok())
			.ok_or_else(|| StoreError::InvalidRecord(format!("{:?} has no hash", filename)))?;

		debug!("Loaded head of {} from {:?} at block {}", pipeline, filename, number);
		Ok(Some(Head::new(pipeline, number, hash)))
	}

	async fn save(&self, head: &Head) -> Result<(), StoreError> {
		let metadata = serde_json::json!({
			"pipeline": head.pipeline,
			"number": head.number,
			"hash": head.hash.to_string(),
			"updated_at": chrono::Utc::now().to_rfc3339(),
		});

		let filename = self.get_head_filename(&head.pipeline);
		write_atomic(&filename, serde_json::to_string_pretty(&metadata)?.as_bytes()).await?;

		info!(
			"Saved head of {} at block {} ({})",
			head.pipeline, head.number, head.hash
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn head_round_trips_through_file() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileHeadRepository::new(dir.path().to_path_buf());

		assert!(repo.load("chain").await.unwrap().is_none());

		let head = Head::new("chain", 42, B256::repeat_byte(7));
		repo.save(&head).await.unwrap();
		assert_eq!(repo.load("chain").await.unwrap(), Some(head));
		assert!(repo.load("nft").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn corrupt_head_file_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("head_chain.json"), r#"{"number": 3}"#)
			.await
			.unwrap();
		let repo = FileHeadRepository::new(dir.path().to_path_buf());
		assert!(matches!(
			repo.load("chain").await,
			Err(StoreError::InvalidRecord(_))
		));
	}
}

//!
//! HTTP client for the upstream chain node API.
//!
//! This module provides the `SourceClient` trait, the call contract the sync core depends on,
//! and `HttpSourceClient`, its implementation over the node's REST API. All calls are plain
//! request/response; idempotent reads are retried with exponential backoff before the error
//! is handed back to the caller.

use super::types::*;
use alloy_primitives::{Address, B256, Bytes};
use async_trait::async_trait;
use backoff::{ExponentialBackoff, future::retry};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Read contract of the upstream chain source.
#[async_trait]
pub trait SourceClient: Send + Sync {
	/// Header of the block at `revision` with transaction ids only.
	async fn get_block(&self, revision: Revision) -> Result<Option<RegularBlock>, SourceError>;

	/// Block at `number` with every transaction and its receipt outputs.
	async fn get_expanded_block(&self, number: u64) -> Result<Option<ExpandedBlock>, SourceError>;

	/// Native balances of `address` at `revision`.
	async fn get_account(
		&self,
		address: Address,
		revision: Revision,
	) -> Result<AccountState, SourceError>;

	/// Deployed code of `address` at `revision`.
	async fn get_code(&self, address: Address, revision: Revision) -> Result<Bytes, SourceError>;

	/// Batch of read-only calls evaluated against the state at `revision`.
	async fn explain(
		&self,
		clauses: &[CallClause],
		revision: Revision,
	) -> Result<Vec<CallResult>, SourceError>;

	/// Call-trace tree of one clause.
	async fn trace_clause(
		&self,
		block_hash: B256,
		tx_hash: B256,
		clause_index: usize,
	) -> Result<TraceNode, SourceError>;

	/// Health report of the node.
	async fn probe(&self) -> Result<NodeProbe, SourceError>;

	/// Number of the best block known upstream.
	async fn best_block_number(&self) -> Result<u64, SourceError> {
		self.get_block(Revision::Best)
			.await?
			.map(|block| block.header.number)
			.ok_or_else(|| SourceError::NoData("best block".to_string()))
	}
}

/// Upstream node REST client
#[derive(Clone)]
pub struct HttpSourceClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL of the node API, without trailing slash.
	base_url: String,
	/// Upper bound on the time spent retrying one read.
	max_retry: Duration,
}

impl HttpSourceClient {
	/// Create a new source client.
	///
	/// # Arguments
	/// * `base_url` - The HTTP endpoint of the node API.
	/// * `timeout` - Per-request timeout.
	pub fn new(base_url: String, timeout: Duration) -> Result<Self, SourceError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			base_url: base_url.trim_end_matches('/').to_string(),
			max_retry: Duration::from_secs(30),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	/// GET `path` and decode the JSON body. A `null` body or a 404 maps to `None`.
	async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, SourceError> {
		let backoff = ExponentialBackoff {
			max_elapsed_time: Some(self.max_retry),
			..Default::default()
		};

		let value = retry(backoff, || async {
			let response = self
				.http_client
				.get(self.url(path))
				.send()
				.await
				.map_err(|e| {
					debug!("Source request to {} failed: {}", path, e);
					backoff::Error::transient(SourceError::HttpError(e))
				})?;

			let status = response.status();
			if status == reqwest::StatusCode::NOT_FOUND {
				return Ok(serde_json::Value::Null);
			}
			if !status.is_success() {
				let err = SourceError::StatusError {
					status: status.as_u16(),
					path: path.to_string(),
				};
				return if status.is_server_error() {
					Err(backoff::Error::transient(err))
				} else {
					Err(backoff::Error::permanent(err))
				};
			}

			response
				.json::<serde_json::Value>()
				.await
				.map_err(|e| backoff::Error::transient(SourceError::HttpError(e)))
		})
		.await?;

		if value.is_null() {
			return Ok(None);
		}
		Ok(Some(serde_json::from_value(value)?))
	}

	/// POST a JSON body to `path` and decode the response. Not retried.
	async fn post_json<T: DeserializeOwned>(
		&self,
		path: &str,
		body: serde_json::Value,
	) -> Result<T, SourceError> {
		let response = self
			.http_client
			.post(self.url(path))
			.header("Content-Type", "application/json")
			.json(&body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(SourceError::StatusError {
				status: response.status().as_u16(),
				path: path.to_string(),
			});
		}

		let response_json: serde_json::Value = response.json().await?;
		if response_json.is_null() {
			return Err(SourceError::NoData(path.to_string()));
		}
		Ok(serde_json::from_value(response_json)?)
	}
}

#[async_trait]
impl SourceClient for HttpSourceClient {
	async fn get_block(&self, revision: Revision) -> Result<Option<RegularBlock>, SourceError> {
		self.get_json(&format!("/blocks/{}", revision)).await
	}

	async fn get_expanded_block(&self, number: u64) -> Result<Option<ExpandedBlock>, SourceError> {
		self.get_json(&format!("/blocks/{}?expanded=true", number))
			.await
	}

	async fn get_account(
		&self,
		address: Address,
		revision: Revision,
	) -> Result<AccountState, SourceError> {
		let path = format!("/accounts/{}?revision={}", address, revision);
		let state = self.get_json(&path).await?;
		state.ok_or(SourceError::NoData(path))
	}

	async fn get_code(&self, address: Address, revision: Revision) -> Result<Bytes, SourceError> {
		#[derive(serde::Deserialize)]
		struct Code {
			code: Bytes,
		}

		let path = format!("/accounts/{}/code?revision={}", address, revision);
		Ok(self
			.get_json::<Code>(&path)
			.await?
			.map(|c| c.code)
			.unwrap_or_default())
	}

	async fn explain(
		&self,
		clauses: &[CallClause],
		revision: Revision,
	) -> Result<Vec<CallResult>, SourceError> {
		let results: Vec<CallResult> = self
			.post_json(
				&format!("/accounts/*?revision={}", revision),
				json!({ "clauses": clauses }),
			)
			.await?;

		if results.len() != clauses.len() {
			warn!(
				"Explain returned {} results for {} clauses",
				results.len(),
				clauses.len()
			);
			return Err(SourceError::Malformed(format!(
				"expected {} call results, got {}",
				clauses.len(),
				results.len()
			)));
		}
		Ok(results)
	}

	async fn trace_clause(
		&self,
		block_hash: B256,
		tx_hash: B256,
		clause_index: usize,
	) -> Result<TraceNode, SourceError> {
		let target = format!("{}/{}/{}", block_hash, tx_hash, clause_index);
		debug!("Tracing clause {}", target);
		self.post_json(
			"/debug/tracers",
			json!({ "name": "call", "target": target }),
		)
		.await
	}

	async fn probe(&self) -> Result<NodeProbe, SourceError> {
		self.get_json("/probe")
			.await?
			.ok_or_else(|| SourceError::NoData("/probe".to_string()))
	}
}

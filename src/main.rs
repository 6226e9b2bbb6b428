mod config;
mod ledger;
mod source;
mod sync;
mod utils;

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::IndexerConfig;
use crate::ledger::{FileHeadRepository, MemoryLedgerStore};
use crate::source::{HttpSourceClient, SourceClient};
use crate::sync::{CatchUpController, ChainSyncPipeline, ShutdownHandle};

#[tokio::main]
async fn main() {
	// Initialize tracing subscriber, crate logs at debug when RUST_LOG asks for it
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::builder()
				.with_default_directive(tracing::Level::INFO.into())
				.from_env_lossy(),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting ledger sync service");

	let config = match IndexerConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Failed to load configuration: {}", e);
			std::process::exit(1);
		}
	};
	info!(
		"Pipeline {} syncing from {} into {:?}",
		config.pipeline, config.source_url, config.data_dir
	);
	if config.native_aliases.is_empty() {
		warn!("No native alias contracts configured; all token transfers go to token balances");
	}

	let source = match HttpSourceClient::new(config.source_url.clone(), config.request_timeout()) {
		Ok(client) => Arc::new(client),
		Err(e) => {
			error!("Failed to create source client: {}", e);
			std::process::exit(1);
		}
	};

	match source.probe().await {
		Ok(probe) => info!(
			"Upstream node {} (pubkey valid: {}, best block: {:?})",
			probe.name,
			probe.pubkey_valid,
			probe.best_block.map(|b| b.number)
		),
		Err(e) => warn!("Upstream node probe failed: {}", e),
	}

	let store = match MemoryLedgerStore::open(Some(config.snapshot_path())).await {
		Ok(store) => Arc::new(store.compact_after(config.compact_after)),
		Err(e) => {
			error!("Failed to open ledger snapshot: {}", e);
			std::process::exit(1);
		}
	};
	let heads = Arc::new(FileHeadRepository::new(config.data_dir.clone()));

	let pipeline = ChainSyncPipeline::new(Arc::clone(&source), store, &config);
	let shutdown = ShutdownHandle::new();
	let mut controller =
		CatchUpController::new(pipeline, heads, config.controller(), Arc::clone(&shutdown));

	let task = tokio::spawn(async move { controller.run().await });

	tokio::select! {
		result = tokio::signal::ctrl_c() => {
			if let Err(e) = result {
				error!("Failed to listen for shutdown signal: {}", e);
			}
			info!("Shutdown requested, finishing current block");
			shutdown.stop().await;
		}
		_ = shutdown.stopped() => {}
	}

	match task.await {
		Ok(Ok(())) => info!("Ledger sync service stopped"),
		Ok(Err(e)) => {
			error!("Ledger sync service failed: {}", e);
			std::process::exit(1);
		}
		Err(e) => {
			error!("Sync task panicked: {}", e);
			std::process::exit(1);
		}
	}
}


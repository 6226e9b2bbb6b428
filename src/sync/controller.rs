//! Generic catch-up state machine driving one pipeline's head towards the upstream best block.
//!
//! The controller owns a [`BlockHandler`] and a [`HeadRepository`]. It loads (or bootstraps)
//! the head, runs the handler's recovery, then repeatedly processes the window
//! `[head + 1, min(head + window, best)]`. While the upstream best block lies beyond the
//! window ceiling the controller is `CatchingUp` and flushes once per window; otherwise it
//! is `Steady` and flushes after every block. The head is saved only after the handler has
//! flushed everything below it, so a crash between the two is replayed by the next recovery.

use super::progress_tracker::SyncProgressTracker;
use super::types::SyncError;
use crate::config::ControllerConfig;
use crate::ledger::{BlockPointer, Head, HeadRepository};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of processing one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedBlock {
	pub pointer: BlockPointer,
	pub transactions: usize,
	pub movements: usize,
}

/// Per-pipeline behavior plugged into the [`CatchUpController`].
#[async_trait]
pub trait BlockHandler: Send {
	fn name(&self) -> &str;

	/// Pipeline whose head seeds this one on first run.
	fn seed_from(&self) -> Option<&str> {
		None
	}

	/// Seeds an empty store from genesis and returns the genesis pointer. Failures are
	/// [`SyncError::BootstrapError`].
	async fn bootstrap(&mut self) -> Result<BlockPointer, SyncError>;

	/// Removes everything above `head` and re-derives aggregates touched above it.
	async fn recover(&mut self, head: &Head) -> Result<(), SyncError>;

	async fn best_block_number(&mut self) -> Result<u64, SyncError>;

	/// Processes block `number` into the current window.
	async fn process_block(&mut self, number: u64, best: u64) -> Result<ProcessedBlock, SyncError>;

	/// Writes the current window to the store.
	async fn flush(&mut self) -> Result<(), SyncError>;

	/// Drops the current window without writing it.
	fn discard_window(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
	Recovering,
	CatchingUp,
	Steady,
}

impl fmt::Display for SyncMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncMode::Recovering => write!(f, "RECOVERING"),
			SyncMode::CatchingUp => write!(f, "CATCHING_UP"),
			SyncMode::Steady => write!(f, "STEADY"),
		}
	}
}

/// Blocks to process next and the mode they are processed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
	pub from: u64,
	pub to: u64,
	pub mode: SyncMode,
}

impl Window {
	/// Window after `head`, or `None` when the head already reached `best`.
	pub fn plan(head: u64, best: u64, size: u64) -> Option<Window> {
		if best <= head {
			return None;
		}
		let ceiling = head.saturating_add(size);
		let mode = if best > ceiling {
			SyncMode::CatchingUp
		} else {
			SyncMode::Steady
		};
		Some(Window {
			from: head + 1,
			to: ceiling.min(best),
			mode,
		})
	}
}

/// Cooperative shutdown signal shared between the controller and whoever stops it.
#[derive(Debug)]
pub struct ShutdownHandle {
	requested: watch::Sender<bool>,
	stopped: watch::Sender<bool>,
}

impl ShutdownHandle {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			requested: watch::Sender::new(false),
			stopped: watch::Sender::new(false),
		})
	}

	pub fn is_requested(&self) -> bool {
		*self.requested.borrow()
	}

	/// Requests shutdown and resolves once the controller has acknowledged it.
	pub async fn stop(&self) {
		self.requested.send_replace(true);
		self.stopped().await;
	}

	/// Resolves once the controller has exited, for any reason.
	pub async fn stopped(&self) {
		let mut stopped = self.stopped.subscribe();
		let _ = stopped.wait_for(|done| *done).await;
	}

	async fn requested(&self) {
		let mut requested = self.requested.subscribe();
		let _ = requested.wait_for(|flag| *flag).await;
	}

	fn acknowledge(&self) {
		self.stopped.send_replace(true);
	}
}

pub struct CatchUpController<H, R: ?Sized> {
	handler: H,
	heads: Arc<R>,
	config: ControllerConfig,
	shutdown: Arc<ShutdownHandle>,
	mode: SyncMode,
}

impl<H: BlockHandler, R: HeadRepository + ?Sized> CatchUpController<H, R> {
	pub fn new(
		handler: H,
		heads: Arc<R>,
		config: ControllerConfig,
		shutdown: Arc<ShutdownHandle>,
	) -> Self {
		Self {
			handler,
			heads,
			config,
			shutdown,
			mode: SyncMode::Recovering,
		}
	}

	pub fn mode(&self) -> SyncMode {
		self.mode
	}

	pub fn handler(&self) -> &H {
		&self.handler
	}

	/// Runs until shutdown is requested. Only a fatal error is returned.
	pub async fn run(&mut self) -> Result<(), SyncError> {
		let result = self.run_loop().await;
		if let Err(e) = &result {
			error!("[{}] Stopped on fatal error: {}", self.handler.name(), e);
		}
		self.shutdown.acknowledge();
		result
	}

	async fn run_loop(&mut self) -> Result<(), SyncError> {
		let mut head = loop {
			if self.shutdown.is_requested() {
				info!("[{}] Shutdown acknowledged before a head was loaded", self.handler.name());
				return Ok(());
			}
			match self.load_head().await {
				Ok(head) => break head,
				Err(e) if e.is_fatal() => return Err(e),
				Err(e) => {
					error!(
						"[{}] Could not load head: {}; retrying in {:?}",
						self.handler.name(),
						e,
						self.config.recovery_backoff
					);
					self.handler.discard_window();
					self.pause(self.config.recovery_backoff).await;
				}
			}
		};
		let mut progress = SyncProgressTracker::new(head.number);
		info!(
			"[{}] Starting from head {} ({})",
			self.handler.name(),
			head.number,
			head.hash
		);

		while !self.shutdown.is_requested() {
			if self.mode == SyncMode::Recovering {
				if let Err(e) = self.recover(&head).await {
					error!("[{}] Recovery failed: {}", self.handler.name(), e);
					if e.is_fatal() {
						return Err(e);
					}
					self.pause(self.config.recovery_backoff).await;
					continue;
				}
				progress.record_recovery(head.number);
				self.set_mode(SyncMode::CatchingUp);
			}

			match self.sync_window(&mut head, &mut progress).await {
				Ok(()) => {
					progress.log_progress(false);
					let interval = match self.mode {
						SyncMode::CatchingUp => self.config.catch_up_interval,
						_ => self.config.steady_interval,
					};
					self.pause(interval).await;
				}
				Err(e) if e.is_fatal() => return Err(e),
				Err(e) => {
					error!(
						"[{}] Sync failed above head {}: {}; retrying in {:?}",
						self.handler.name(),
						head.number,
						e,
						self.config.recovery_backoff
					);
					self.handler.discard_window();
					self.set_mode(SyncMode::Recovering);
					self.pause(self.config.recovery_backoff).await;
				}
			}
		}

		info!("[{}] Shutdown acknowledged at head {}", self.handler.name(), head.number);
		progress.log_progress(true);
		Ok(())
	}

	/// Persisted head, else a head seeded from another pipeline, else a bootstrapped one.
	async fn load_head(&mut self) -> Result<Head, SyncError> {
		let name = self.handler.name().to_string();
		if let Some(head) = self.heads.load(&name).await? {
			return Ok(head);
		}

		if let Some(source) = self.handler.seed_from().map(str::to_string) {
			if let Some(seed) = self.heads.load(&source).await? {
				info!("[{}] Seeding head from {} at {}", name, source, seed.number);
				let head = Head::new(name, seed.number, seed.hash);
				self.heads.save(&head).await?;
				return Ok(head);
			}
			warn!("[{}] No head for {} to seed from, bootstrapping", name, source);
		}

		info!("[{}] No head found, bootstrapping from genesis", name);
		let genesis = self.handler.bootstrap().await?;
		let head = Head::new(name, genesis.number, genesis.hash);
		self.heads.save(&head).await?;
		Ok(head)
	}

	async fn recover(&mut self, head: &Head) -> Result<(), SyncError> {
		info!("[{}] Recovering above head {}", self.handler.name(), head.number);
		self.handler.discard_window();
		self.handler.recover(head).await
	}

	/// Processes the next window. The head only moves after a successful flush.
	async fn sync_window(
		&mut self,
		head: &mut Head,
		progress: &mut SyncProgressTracker,
	) -> Result<(), SyncError> {
		let best = self.handler.best_block_number().await?;
		let Some(window) = Window::plan(head.number, best, self.config.window) else {
			self.set_mode(SyncMode::Steady);
			return Ok(());
		};
		self.set_mode(window.mode);
		debug!(
			"[{}] Window {}..={} (best {})",
			self.handler.name(),
			window.from,
			window.to,
			best
		);

		let mut unflushed: Option<BlockPointer> = None;
		for number in window.from..=window.to {
			if self.shutdown.is_requested() {
				break;
			}
			let processed = self.handler.process_block(number, best).await?;
			progress.record_block(number, processed.transactions, processed.movements);

			if window.mode == SyncMode::Steady {
				self.advance(head, processed.pointer).await?;
				progress.record_flush(head.number);
			} else {
				unflushed = Some(processed.pointer);
			}
		}

		if let Some(pointer) = unflushed {
			self.advance(head, pointer).await?;
			progress.record_flush(head.number);
			info!(
				"[{}] Flushed window {}..={}",
				self.handler.name(),
				window.from,
				head.number
			);
		}
		Ok(())
	}

	/// Flushes the handler's window, then saves the head at `pointer`.
	async fn advance(&mut self, head: &mut Head, pointer: BlockPointer) -> Result<(), SyncError> {
		if pointer.number <= head.number {
			return Err(SyncError::ConsistencyError(format!(
				"head would move back from {} to {}",
				head.number, pointer.number
			)));
		}
		self.handler.flush().await?;
		let next = Head::new(head.pipeline.clone(), pointer.number, pointer.hash);
		self.heads.save(&next).await?;
		*head = next;
		Ok(())
	}

	fn set_mode(&mut self, mode: SyncMode) {
		if self.mode != mode {
			info!("[{}] {} -> {}", self.handler.name(), self.mode, mode);
			self.mode = mode;
		}
	}

	/// Sleeps for `duration` unless shutdown is requested first.
	async fn pause(&self, duration: Duration) {
		tokio::select! {
			_ = tokio::time::sleep(duration) => {}
			_ = self.shutdown.requested() => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::{MemoryHeadRepository, StoreError};
	use alloy_primitives::B256;
	use rstest::rstest;
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[rstest]
	#[case(0, 0, 10, None)]
	#[case(5, 3, 10, None)]
	#[case(0, 25, 10, Some((1, 10, SyncMode::CatchingUp)))]
	#[case(20, 25, 10, Some((21, 25, SyncMode::Steady)))]
	#[case(20, 30, 10, Some((21, 30, SyncMode::Steady)))]
	#[case(20, 31, 10, Some((21, 30, SyncMode::CatchingUp)))]
	fn plans_windows(
		#[case] head: u64,
		#[case] best: u64,
		#[case] size: u64,
		#[case] expected: Option<(u64, u64, SyncMode)>,
	) {
		let planned = Window::plan(head, best, size).map(|w| (w.from, w.to, w.mode));
		assert_eq!(planned, expected);
	}

	/// Log of what the scripted handler was asked to do.
	#[derive(Debug, Default)]
	struct Calls {
		processed: Vec<u64>,
		/// Highest processed block at every flush
		flushes: Vec<u64>,
		recoveries: Vec<u64>,
		bootstraps: usize,
	}

	struct ScriptedHandler {
		best: u64,
		fail_once_at: Option<u64>,
		bootstrap_fails: bool,
		seed_from: Option<String>,
		calls: Arc<Mutex<Calls>>,
		shutdown_at: Option<(u64, Arc<ShutdownHandle>)>,
	}

	impl ScriptedHandler {
		fn new(best: u64) -> (Self, Arc<Mutex<Calls>>) {
			let calls = Arc::new(Mutex::new(Calls::default()));
			(
				Self {
					best,
					fail_once_at: None,
					bootstrap_fails: false,
					seed_from: None,
					calls: Arc::clone(&calls),
					shutdown_at: None,
				},
				calls,
			)
		}
	}

	fn pointer(number: u64) -> BlockPointer {
		BlockPointer::new(number, B256::with_last_byte(number as u8), number)
	}

	#[async_trait]
	impl BlockHandler for ScriptedHandler {
		fn name(&self) -> &str {
			"scripted"
		}

		fn seed_from(&self) -> Option<&str> {
			self.seed_from.as_deref()
		}

		async fn bootstrap(&mut self) -> Result<BlockPointer, SyncError> {
			if self.bootstrap_fails {
				return Err(SyncError::BootstrapError("no genesis".to_string()));
			}
			self.calls.lock().unwrap().bootstraps += 1;
			Ok(pointer(0))
		}

		async fn recover(&mut self, head: &Head) -> Result<(), SyncError> {
			self.calls.lock().unwrap().recoveries.push(head.number);
			Ok(())
		}

		async fn best_block_number(&mut self) -> Result<u64, SyncError> {
			Ok(self.best)
		}

		async fn process_block(
			&mut self,
			number: u64,
			_best: u64,
		) -> Result<ProcessedBlock, SyncError> {
			if self.fail_once_at == Some(number) {
				self.fail_once_at = None;
				return Err(SyncError::ConsistencyError("injected".to_string()));
			}
			self.calls.lock().unwrap().processed.push(number);
			if let Some((at, shutdown)) = &self.shutdown_at {
				if *at == number {
					shutdown.requested.send_replace(true);
				}
			}
			Ok(ProcessedBlock {
				pointer: pointer(number),
				transactions: 1,
				movements: 0,
			})
		}

		async fn flush(&mut self) -> Result<(), SyncError> {
			let mut calls = self.calls.lock().unwrap();
			let last = calls.processed.last().copied().unwrap_or_default();
			calls.flushes.push(last);
			Ok(())
		}

		fn discard_window(&mut self) {}
	}

	fn fast_config(window: u64) -> ControllerConfig {
		ControllerConfig {
			window,
			steady_interval: Duration::from_millis(1),
			catch_up_interval: Duration::from_millis(1),
			recovery_backoff: Duration::from_millis(1),
		}
	}

	async fn wait_for_head(heads: &MemoryHeadRepository, name: &str, number: u64) {
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if let Some(head) = heads.load(name).await.unwrap() {
					if head.number >= number {
						return;
					}
				}
				tokio::time::sleep(Duration::from_millis(1)).await;
			}
		})
		.await
		.unwrap();
	}

	async fn run_until_head(
		handler: ScriptedHandler,
		window: u64,
		heads: Arc<MemoryHeadRepository>,
		target: u64,
	) {
		let shutdown = ShutdownHandle::new();
		let mut controller =
			CatchUpController::new(handler, Arc::clone(&heads), fast_config(window), Arc::clone(&shutdown));
		let task = tokio::spawn(async move { controller.run().await });
		wait_for_head(&heads, "scripted", target).await;
		shutdown.stop().await;
		task.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn catching_up_flushes_per_window_then_per_block() {
		let (handler, calls) = ScriptedHandler::new(25);
		let heads = Arc::new(MemoryHeadRepository::new());
		run_until_head(handler, 10, Arc::clone(&heads), 25).await;

		let calls = calls.lock().unwrap();
		assert_eq!(calls.bootstraps, 1);
		assert_eq!(calls.processed, (1..=25).collect::<Vec<_>>());
		assert_eq!(calls.flushes, vec![10, 20, 21, 22, 23, 24, 25]);
		assert_eq!(calls.recoveries, vec![0]);
	}

	#[tokio::test]
	async fn failure_recovers_from_saved_head_and_replays() {
		let (mut handler, calls) = ScriptedHandler::new(8);
		handler.fail_once_at = Some(5);
		let heads = Arc::new(MemoryHeadRepository::new());
		run_until_head(handler, 100, Arc::clone(&heads), 8).await;

		let head = heads.load("scripted").await.unwrap().unwrap();
		assert_eq!(head.number, 8);
		let calls = calls.lock().unwrap();
		assert_eq!(calls.recoveries, vec![0, 4]);
		assert_eq!(calls.processed, (1..=8).collect::<Vec<_>>());
	}

	#[tokio::test]
	async fn head_is_resumed_not_bootstrapped() {
		let heads = Arc::new(MemoryHeadRepository::new());
		heads
			.save(&Head::new("scripted", 6, B256::with_last_byte(6)))
			.await
			.unwrap();
		let (handler, calls) = ScriptedHandler::new(9);
		run_until_head(handler, 100, Arc::clone(&heads), 9).await;

		let calls = calls.lock().unwrap();
		assert_eq!(calls.bootstraps, 0);
		assert_eq!(calls.recoveries, vec![6]);
		assert_eq!(calls.processed, vec![7, 8, 9]);
	}

	#[tokio::test]
	async fn head_is_seeded_from_another_pipeline() {
		let heads = Arc::new(MemoryHeadRepository::new());
		heads
			.save(&Head::new("main", 3, B256::with_last_byte(3)))
			.await
			.unwrap();
		let (mut handler, calls) = ScriptedHandler::new(4);
		handler.seed_from = Some("main".to_string());
		run_until_head(handler, 100, Arc::clone(&heads), 4).await;

		let calls = calls.lock().unwrap();
		assert_eq!(calls.bootstraps, 0);
		assert_eq!(calls.processed, vec![4]);
	}

	#[tokio::test]
	async fn bootstrap_failure_is_fatal() {
		let (mut handler, _calls) = ScriptedHandler::new(3);
		handler.bootstrap_fails = true;
		let heads = Arc::new(MemoryHeadRepository::new());
		let mut controller =
			CatchUpController::new(handler, Arc::clone(&heads), fast_config(10), ShutdownHandle::new());

		let err = controller.run().await.unwrap_err();
		assert!(err.is_fatal());
		assert!(heads.load("scripted").await.unwrap().is_none());
	}

	/// Head store whose first `failing_loads` reads fail.
	struct FlakyHeads {
		inner: MemoryHeadRepository,
		failing_loads: AtomicUsize,
	}

	#[async_trait]
	impl HeadRepository for FlakyHeads {
		async fn load(&self, pipeline: &str) -> Result<Option<Head>, StoreError> {
			if self.failing_loads.load(Ordering::SeqCst) > 0 {
				self.failing_loads.fetch_sub(1, Ordering::SeqCst);
				return Err(StoreError::InvalidRecord("unreadable head".to_string()));
			}
			self.inner.load(pipeline).await
		}

		async fn save(&self, head: &Head) -> Result<(), StoreError> {
			self.inner.save(head).await
		}
	}

	#[tokio::test]
	async fn unreadable_head_is_retried_instead_of_stopping() {
		let heads = Arc::new(FlakyHeads {
			inner: MemoryHeadRepository::new(),
			failing_loads: AtomicUsize::new(2),
		});
		let (handler, calls) = ScriptedHandler::new(3);
		let shutdown = ShutdownHandle::new();
		let mut controller =
			CatchUpController::new(handler, Arc::clone(&heads), fast_config(10), Arc::clone(&shutdown));
		let task = tokio::spawn(async move { controller.run().await });

		wait_for_head(&heads.inner, "scripted", 3).await;
		shutdown.stop().await;
		task.await.unwrap().unwrap();

		let calls = calls.lock().unwrap();
		assert_eq!(calls.bootstraps, 1);
		assert_eq!(calls.processed, vec![1, 2, 3]);
	}

	#[tokio::test]
	async fn shutdown_mid_window_flushes_what_was_processed() {
		let shutdown = ShutdownHandle::new();
		let (mut handler, calls) = ScriptedHandler::new(50);
		handler.shutdown_at = Some((4, Arc::clone(&shutdown)));
		let heads = Arc::new(MemoryHeadRepository::new());
		let mut controller =
			CatchUpController::new(handler, Arc::clone(&heads), fast_config(10), Arc::clone(&shutdown));

		controller.run().await.unwrap();
		shutdown.stop().await;

		let head = heads.load("scripted").await.unwrap().unwrap();
		assert_eq!(head.number, 4);
		assert_eq!(controller.mode(), SyncMode::CatchingUp);
		let calls = calls.lock().unwrap();
		assert_eq!(calls.processed, vec![1, 2, 3, 4]);
		assert_eq!(calls.flushes, vec![4]);
	}
}

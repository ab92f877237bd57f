//! The durable operations (spec §4.3): `step`, `loop_op`, `sleep`/`sleep_until`,
//! `rollback_checkpoint`, `queue_send`/`queue_next`, `join`, `race`, `removed`.
//!
//! `Context` is cheaply `Clone` — every field but the branch's own location
//! and cancellation token is a shared handle — the same way the teacher's
//! `WorkflowCtx` hands a cloned context down into each branch it spawns.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::db::{MessageDriver, PersistenceDriver, ReceiveRequest};
use crate::error::WorkflowError;
use crate::history::{BranchRecord, BranchStatus, Entry, EntryKind, SleepState};
use crate::location::Location;
use crate::now_ms;
use crate::queue::WorkflowQueueMessage;
use crate::storage::StorageMirror;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A step's side-effecting body. Deliberately narrower than `Context`: steps
/// are leaves, not durable-op call sites, the way the teacher keeps its
/// activity context distinct from its workflow context.
#[derive(Clone)]
pub struct StepCtx {
	pub workflow_id: Uuid,
	cancel: CancelToken,
}

impl StepCtx {
	pub fn abort_signal(&self) -> &CancelToken {
		&self.cancel
	}
}

pub type RollbackFn =
	Arc<dyn Fn(Context, serde_json::Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub type BranchFn = Box<dyn FnOnce(Context) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Forward,
	Rollback,
}

/// A pending rollback handler awaiting invocation, in commit order. Cleared
/// whenever a later `rollback_checkpoint` is crossed, so only steps
/// committed after the most recent checkpoint ever end up here (spec §4.3.1,
/// §9 invariant "rollback ordering").
pub struct RollbackAction {
	pub entry_id: Uuid,
	pub name: String,
	pub output: serde_json::Value,
	pub rollback: RollbackFn,
}

/// Per-step configuration. Built with the builder methods and handed to
/// [`Context::step_with`]; [`Context::step`] covers the common case with
/// engine defaults.
pub struct StepConfig {
	pub name: String,
	pub ephemeral: bool,
	pub max_retries: Option<u32>,
	pub retry_backoff_base: Option<Duration>,
	pub retry_backoff_max: Option<Duration>,
	pub timeout: Option<Duration>,
	pub rollback: Option<RollbackFn>,
}

impl StepConfig {
	pub fn new(name: impl Into<String>) -> Self {
		StepConfig {
			name: name.into(),
			ephemeral: false,
			max_retries: None,
			retry_backoff_base: None,
			retry_backoff_max: None,
			timeout: None,
			rollback: None,
		}
	}

	pub fn ephemeral(mut self) -> Self {
		self.ephemeral = true;
		self
	}

	pub fn max_retries(mut self, n: u32) -> Self {
		self.max_retries = Some(n);
		self
	}

	pub fn timeout(mut self, d: Duration) -> Self {
		self.timeout = Some(d);
		self
	}

	pub fn retry_backoff(mut self, base: Duration, max: Duration) -> Self {
		self.retry_backoff_base = Some(base);
		self.retry_backoff_max = Some(max);
		self
	}

	/// Registers a compensating action, invoked with this step's output if the
	/// workflow later rolls back past it. Only takes effect when a
	/// `rollback_checkpoint` precedes this step in the same branch.
	pub fn rollback<O, F, Fut>(mut self, f: F) -> Self
	where
		O: DeserializeOwned + Send + 'static,
		F: Fn(Context, O) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.rollback = Some(Arc::new(move |ctx, raw: serde_json::Value| {
			let parsed = serde_json::from_value::<O>(raw);
			let fut = async move {
				let output = parsed?;
				f(ctx, output).await
			};
			Box::pin(fut)
		}));
		self
	}
}

pub struct LoopOptions {
	pub commit_interval: u64,
	pub history_every: u64,
	pub history_keep: u64,
}

impl LoopOptions {
	pub fn from_config(config: &EngineConfig) -> Self {
		LoopOptions {
			commit_interval: config.default_loop_commit_interval,
			history_every: config.default_loop_history_every,
			history_keep: config.default_loop_history_keep,
		}
	}
}

pub enum LoopStep<S, T> {
	Continue(S),
	Break(T),
}

#[derive(Default)]
pub struct QueueNextOptions {
	pub names: Vec<String>,
	pub count: usize,
	pub timeout: Option<Duration>,
	pub completable: bool,
}

impl QueueNextOptions {
	pub fn new() -> Self {
		QueueNextOptions {
			count: 1,
			..Default::default()
		}
	}

	pub fn names(mut self, names: Vec<String>) -> Self {
		self.names = names;
		self
	}

	pub fn count(mut self, n: usize) -> Self {
		self.count = n;
		self
	}

	pub fn timeout(mut self, d: Duration) -> Self {
		self.timeout = Some(d);
		self
	}

	pub fn completable(mut self) -> Self {
		self.completable = true;
		self
	}
}

/// A received message awaiting acknowledgement. Only completable receives
/// produce one the caller is obliged to `complete`; others are inert.
pub struct CompletableMessage {
	pub message: WorkflowQueueMessage,
	ctx: Context,
	slot_location: Location,
	/// Set from the replayed history record (`wqm.is_completed()`): this
	/// message was already completed in a prior run. `complete()` on it is a
	/// no-op, not an error (spec §4.3.5: "Completable messages whose history
	/// record is marked `completed=true` expose a no-op `complete()`").
	already_completed: bool,
	/// Set once `complete()` actually runs during this call. Distinct from
	/// `already_completed` so a genuine double-call in the same process still
	/// errors while a replay of an already-settled message doesn't.
	settled: bool,
}

impl CompletableMessage {
	pub async fn complete(mut self, response: Option<serde_json::Value>) -> anyhow::Result<()> {
		if self.already_completed {
			return Ok(());
		}
		if self.settled {
			return Err(WorkflowError::AlreadyCompleted.into());
		}
		if !self.message.is_completable() {
			return Ok(());
		}

		self.ctx
			.msg_driver
			.complete_message(self.ctx.workflow_id, self.message.id, response)
			.await?;

		{
			let mut mirror = self.ctx.mirror.lock().unwrap();
			if let Some(entry) = mirror.get_entry_mut(&self.slot_location) {
				if let EntryKind::Message { data, .. } = &mut entry.kind {
					if let Ok(mut body) = serde_json::from_value::<crate::queue::CompletableBody>(data.clone()) {
						body.completed = true;
						*data = serde_json::to_value(body)?;
						entry.dirty = true;
					}
				}
			}
		}
		self.ctx.outstanding_completable.store(false, Ordering::SeqCst);
		self.ctx.flush().await?;
		self.settled = true;
		Ok(())
	}
}

#[derive(Clone)]
pub struct Context {
	workflow_id: Uuid,
	mirror: Arc<StdMutex<StorageMirror>>,
	driver: Arc<dyn PersistenceDriver>,
	msg_driver: Arc<dyn MessageDriver>,
	notifier: Option<Arc<dyn crate::db::HistoryNotifier>>,
	config: Arc<EngineConfig>,
	location: Location,
	mode: Mode,
	cancel: CancelToken,
	rollback_actions: Arc<StdMutex<Vec<RollbackAction>>>,
	rollback_checkpoint_set: Arc<AtomicBool>,
	visited_keys: Arc<StdMutex<HashSet<String>>>,
	names_used_this_scope: Arc<StdMutex<HashSet<String>>>,
	outstanding_completable: Arc<AtomicBool>,
	in_progress: Arc<AtomicBool>,
}

impl Context {
	pub fn new_root(
		workflow_id: Uuid,
		mirror: Arc<StdMutex<StorageMirror>>,
		driver: Arc<dyn PersistenceDriver>,
		msg_driver: Arc<dyn MessageDriver>,
		notifier: Option<Arc<dyn crate::db::HistoryNotifier>>,
		config: Arc<EngineConfig>,
		mode: Mode,
		cancel: CancelToken,
	) -> Self {
		Context {
			workflow_id,
			mirror,
			driver,
			msg_driver,
			notifier,
			config,
			location: Location::empty(),
			mode,
			cancel,
			rollback_actions: Arc::new(StdMutex::new(Vec::new())),
			rollback_checkpoint_set: Arc::new(AtomicBool::new(false)),
			visited_keys: Arc::new(StdMutex::new(HashSet::new())),
			names_used_this_scope: Arc::new(StdMutex::new(HashSet::new())),
			outstanding_completable: Arc::new(AtomicBool::new(false)),
			in_progress: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn workflow_id(&self) -> Uuid {
		self.workflow_id
	}

	pub fn location(&self) -> &Location {
		&self.location
	}

	pub fn mode(&self) -> Mode {
		self.mode
	}

	pub fn abort_signal(&self) -> &CancelToken {
		&self.cancel
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub(crate) fn rollback_actions(&self) -> Arc<StdMutex<Vec<RollbackAction>>> {
		self.rollback_actions.clone()
	}

	pub(crate) fn visited_keys(&self) -> Arc<StdMutex<HashSet<String>>> {
		self.visited_keys.clone()
	}

	pub(crate) fn mirror(&self) -> Arc<StdMutex<StorageMirror>> {
		self.mirror.clone()
	}

	/// A context scoped to a subtree location, with its own cancellation
	/// child, own scope-local name set, but shared everything else (spec
	/// §4.3.6/§4.3.7: branches share the run's storage mirror and rollback
	/// bookkeeping).
	fn branch_at(&self, location: Location) -> Context {
		Context {
			workflow_id: self.workflow_id,
			mirror: self.mirror.clone(),
			driver: self.driver.clone(),
			msg_driver: self.msg_driver.clone(),
			notifier: self.notifier.clone(),
			config: self.config.clone(),
			location,
			mode: self.mode,
			cancel: self.cancel.child(),
			rollback_actions: self.rollback_actions.clone(),
			rollback_checkpoint_set: self.rollback_checkpoint_set.clone(),
			visited_keys: self.visited_keys.clone(),
			names_used_this_scope: Arc::new(StdMutex::new(HashSet::new())),
			outstanding_completable: self.outstanding_completable.clone(),
			in_progress: Arc::new(AtomicBool::new(false)),
		}
	}

	fn check_stop(&self) -> anyhow::Result<()> {
		if self.cancel.is_cancelled() {
			return Err(WorkflowError::Evicted.into());
		}
		Ok(())
	}

	fn enter_op(&self) -> anyhow::Result<()> {
		if self.in_progress.swap(true, Ordering::SeqCst) {
			return Err(WorkflowError::EntryInProgress.into());
		}
		Ok(())
	}

	fn exit_op(&self) {
		self.in_progress.store(false, Ordering::SeqCst);
	}

	fn assert_name_unique(&self, name: &str) -> anyhow::Result<()> {
		let mut used = self.names_used_this_scope.lock().unwrap();
		if !used.insert(name.to_string()) {
			return Err(WorkflowError::DuplicateName(name.to_string()).into());
		}
		Ok(())
	}

	fn mark_visited(&self, location: &Location) {
		self.visited_keys.lock().unwrap().insert(location.to_key());
	}

	fn name_index(&self, name: &str) -> usize {
		self.mirror.lock().unwrap().names.index_of(name)
	}

	async fn flush(&self) -> anyhow::Result<()> {
		let diff = {
			let mut mirror = self.mirror.lock().unwrap();
			mirror.build_flush_diff()
		};
		let Some(diff) = diff else { return Ok(()) };
		self.driver.flush(self.workflow_id, diff.clone()).await?;
		{
			let mut mirror = self.mirror.lock().unwrap();
			mirror.mark_flushed(&diff);
		}
		if let Some(notifier) = &self.notifier {
			let snapshot = self.mirror.lock().unwrap().snapshot(self.workflow_id);
			notifier.notify(snapshot);
		}
		Ok(())
	}

	async fn delete_entries_with_prefix(&self, prefix: &Location) -> anyhow::Result<()> {
		let keys = {
			let mirror = self.mirror.lock().unwrap();
			mirror.collect_prefix_keys(prefix)
		};
		if keys.is_empty() {
			return Ok(());
		}
		self.driver.delete_entries(self.workflow_id, &keys).await?;
		let mut mirror = self.mirror.lock().unwrap();
		mirror.remove_keys(&keys);
		Ok(())
	}

	/// Deletes several subtrees in one driver round trip (spec §4.3.7 step 5:
	/// "delete history under every non-winner branch prefix").
	async fn delete_entries_with_prefixes(&self, prefixes: &[Location]) -> anyhow::Result<()> {
		let keys = {
			let mirror = self.mirror.lock().unwrap();
			mirror.collect_prefix_keys_multi(prefixes)
		};
		if keys.is_empty() {
			return Ok(());
		}
		self.driver.delete_entries(self.workflow_id, &keys).await?;
		let mut mirror = self.mirror.lock().unwrap();
		mirror.remove_keys(&keys);
		Ok(())
	}

	/// Spec §4.3.8: after a branch's user code returns, every entry recorded
	/// under its location must have been visited this run, or history and
	/// code have diverged (e.g. a conditional that used to run a step no
	/// longer does).
	fn validate_branch_complete(&self, prefix: &Location) -> anyhow::Result<()> {
		let mirror = self.mirror.lock().unwrap();
		let visited = self.visited_keys.lock().unwrap();
		let prefix_key = prefix.to_key();
		for key in mirror.entries.keys() {
			let under = if prefix_key.is_empty() {
				true
			} else {
				key == &prefix_key || key.starts_with(&format!("{prefix_key}/"))
			};
			if under && !visited.contains(key) {
				return Err(WorkflowError::HistoryDiverged(format!(
					"entry at `{key}` exists in history but was not visited this run"
				))
				.into());
			}
		}
		Ok(())
	}

	/// Call once the root workflow function returns successfully.
	pub(crate) fn validate_complete(&self) -> anyhow::Result<()> {
		self.validate_branch_complete(&Location::empty())
	}

	fn register_rollback(
		&self,
		entry_id: Uuid,
		name: String,
		output: serde_json::Value,
		rollback: RollbackFn,
	) -> anyhow::Result<()> {
		if !self.rollback_checkpoint_set.load(Ordering::SeqCst) {
			return Err(WorkflowError::RollbackCheckpoint.into());
		}
		let already_done = {
			let mirror = self.mirror.lock().unwrap();
			mirror
				.metadata
				.get(&entry_id)
				.map(|m| m.rollback_completed_at.is_some())
				.unwrap_or(false)
		};
		if already_done {
			return Ok(());
		}
		self.rollback_actions.lock().unwrap().push(RollbackAction {
			entry_id,
			name,
			output,
			rollback,
		});
		Ok(())
	}

	// -- step ---------------------------------------------------------------

	pub async fn step<O, F, Fut>(&mut self, name: impl Into<String>, run: F) -> anyhow::Result<O>
	where
		O: Serialize + DeserializeOwned + Send + 'static,
		F: FnOnce(StepCtx) -> Fut + Send,
		Fut: Future<Output = anyhow::Result<O>> + Send,
	{
		self.step_with(StepConfig::new(name), run).await
	}

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id, step = %config.name))]
	pub async fn step_with<O, F, Fut>(&mut self, config: StepConfig, run: F) -> anyhow::Result<O>
	where
		O: Serialize + DeserializeOwned + Send + 'static,
		F: FnOnce(StepCtx) -> Fut + Send,
		Fut: Future<Output = anyhow::Result<O>> + Send,
	{
		self.check_stop()?;
		self.enter_op()?;
		let result = self.step_inner(config, run).await;
		self.exit_op();
		result
	}

	async fn step_inner<O, F, Fut>(&mut self, config: StepConfig, run: F) -> anyhow::Result<O>
	where
		O: Serialize + DeserializeOwned + Send + 'static,
		F: FnOnce(StepCtx) -> Fut + Send,
		Fut: Future<Output = anyhow::Result<O>> + Send,
	{
		self.assert_name_unique(&config.name)?;
		let location = self.location.with_name(self.name_index(&config.name));
		self.mark_visited(&location);
		let now = now_ms();

		let existing = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&location).cloned()
		};

		let max_retries = config.max_retries.unwrap_or(self.config.default_max_retries);

		if let Some(entry) = existing {
			let EntryKind::Step { output, error } = entry.kind.clone() else {
				return Err(WorkflowError::HistoryDiverged(format!(
					"expected step at `{location}`, found {}",
					entry.kind.type_name()
				))
				.into());
			};

			if let Some(output) = output {
				tracing::debug!(workflow_id = %self.workflow_id, step = %config.name, "replaying completed step, no side effect");
				let parsed: O = serde_json::from_value(output.clone())?;
				if let Some(rollback) = config.rollback.clone() {
					self.register_rollback(entry.id, config.name.clone(), output, rollback)?;
				}
				return Ok(parsed);
			}

			let backoff_base = config.retry_backoff_base.unwrap_or(self.config.default_retry_backoff_base);
			let backoff_max = config.retry_backoff_max.unwrap_or(self.config.default_retry_backoff_max);

			let (attempts, last_attempt_at) = {
				let mirror = self.mirror.lock().unwrap();
				let meta = mirror.metadata.get(&entry.id);
				(
					meta.map(|m| m.attempts).unwrap_or(0),
					meta.and_then(|m| m.last_attempt_at),
				)
			};

			if attempts >= max_retries {
				tracing::error!(workflow_id = %self.workflow_id, step = %config.name, attempts, max_retries, "step exhausted its retry budget");
				return Err(WorkflowError::StepExhausted {
					name: config.name.clone(),
					last_error: error.unwrap_or_default(),
				}
				.into());
			}

			if let Some(last_attempt_at) = last_attempt_at {
				let retry_at = last_attempt_at + crate::backoff::backoff(attempts, backoff_base, backoff_max).as_millis() as i64;
				if now < retry_at {
					return Err(WorkflowError::Sleep {
						deadline_ts: retry_at,
						waiting_names: None,
					}
					.into());
				}
			}

			self.run_step_attempt(entry.id, &location, &config, run).await
		} else {
			if self.mode == Mode::Rollback {
				return Err(WorkflowError::RollbackStop.into());
			}
			let entry_id = Uuid::new_v4();
			{
				let mut mirror = self.mirror.lock().unwrap();
				mirror.set_entry(Entry::new(entry_id, location.clone(), EntryKind::Step { output: None, error: None }));
				mirror.get_or_create_metadata(entry_id, now);
			}
			self.run_step_attempt(entry_id, &location, &config, run).await
		}
	}

	async fn run_step_attempt<O, F, Fut>(
		&mut self,
		entry_id: Uuid,
		location: &Location,
		config: &StepConfig,
		run: F,
	) -> anyhow::Result<O>
	where
		O: Serialize + DeserializeOwned + Send + 'static,
		F: FnOnce(StepCtx) -> Fut + Send,
		Fut: Future<Output = anyhow::Result<O>> + Send,
	{
		let now = now_ms();
		{
			let mut mirror = self.mirror.lock().unwrap();
			let meta = mirror.get_or_create_metadata(entry_id, now);
			meta.mark_running(now);
		}

		let timeout = config.timeout.unwrap_or(self.config.default_step_timeout);
		let step_ctx = StepCtx {
			workflow_id: self.workflow_id,
			cancel: self.cancel.child(),
		};

		let outcome = tokio::time::timeout(timeout, run(step_ctx)).await;

		match outcome {
			Ok(Ok(output)) => {
				let output_val = serde_json::to_value(&output)?;
				{
					let mut mirror = self.mirror.lock().unwrap();
					if let Some(entry) = mirror.get_entry_mut(location) {
						entry.kind = EntryKind::Step {
							output: Some(output_val.clone()),
							error: None,
						};
						entry.dirty = true;
					}
					let meta = mirror.get_or_create_metadata(entry_id, now);
					meta.mark_completed(now);
				}
				if let Some(rollback) = config.rollback.clone() {
					self.register_rollback(entry_id, config.name.clone(), output_val, rollback)?;
				}
				if !config.ephemeral {
					self.flush().await?;
				}
				tracing::debug!(workflow_id = %self.workflow_id, step = %config.name, ephemeral = config.ephemeral, "step attempt succeeded");
				Ok(output)
			}
			Ok(Err(err)) => {
				let critical_or_rollback = WorkflowError::downcast_chain(&err)
					.map(|wf| matches!(wf, WorkflowError::Critical(_) | WorkflowError::Rollback(_)))
					.unwrap_or(false);
				let msg = err.to_string();
				{
					let mut mirror = self.mirror.lock().unwrap();
					if let Some(entry) = mirror.get_entry_mut(location) {
						entry.kind = EntryKind::Step {
							output: None,
							error: Some(msg.clone()),
						};
						entry.dirty = true;
					}
					let meta = mirror.get_or_create_metadata(entry_id, now);
					if critical_or_rollback {
						meta.mark_exhausted(msg.clone());
					} else {
						meta.mark_failed(msg.clone());
					}
				}
				self.flush().await?;
				if critical_or_rollback {
					tracing::error!(workflow_id = %self.workflow_id, step = %config.name, error = %err, "step failed critically, not retrying");
					return Err(err);
				}
				// Spec §4.3.1.7: a non-critical failure throws `StepFailed`, which
				// "the scheduler treats as the trigger for another attempt via the
				// backoff path [of §4.3.1.3]" — computed here, immediately, rather
				// than bounced through an extra replay just to rediscover the same
				// deadline. `attempts` was just incremented by `mark_running` above.
				let attempts = {
					let mirror = self.mirror.lock().unwrap();
					mirror.metadata.get(&entry_id).map(|m| m.attempts).unwrap_or(1)
				};
				let step_failed = WorkflowError::StepFailed {
					name: config.name.clone(),
					cause: err,
					attempts,
				};
				tracing::warn!(workflow_id = %self.workflow_id, step = %config.name, attempts, error = %step_failed, "step attempt failed, will retry");
				let backoff_base = config.retry_backoff_base.unwrap_or(self.config.default_retry_backoff_base);
				let backoff_max = config.retry_backoff_max.unwrap_or(self.config.default_retry_backoff_max);
				let retry_at = now + crate::backoff::backoff(attempts, backoff_base, backoff_max).as_millis() as i64;
				Err(WorkflowError::Sleep {
					deadline_ts: retry_at,
					waiting_names: None,
				}
				.into())
			}
			Err(_elapsed) => {
				let msg = format!("step `{}` timed out after {timeout:?}", config.name);
				{
					let mut mirror = self.mirror.lock().unwrap();
					if let Some(entry) = mirror.get_entry_mut(location) {
						entry.kind = EntryKind::Step {
							output: None,
							error: Some(msg.clone()),
						};
						entry.dirty = true;
					}
					let meta = mirror.get_or_create_metadata(entry_id, now);
					meta.mark_exhausted(msg.clone());
				}
				self.flush().await?;
				Err(WorkflowError::Critical(msg).into())
			}
		}
	}

	// -- rollback_checkpoint --------------------------------------------------

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id))]
	pub async fn rollback_checkpoint(&mut self, name: impl Into<String>) -> anyhow::Result<()> {
		self.check_stop()?;
		self.enter_op()?;
		let name = name.into();
		tracing::debug!(workflow_id = %self.workflow_id, checkpoint = %name, "rollback_checkpoint");
		let result = self.rollback_checkpoint_inner(name).await;
		self.exit_op();
		result
	}

	async fn rollback_checkpoint_inner(&mut self, name: String) -> anyhow::Result<()> {
		self.assert_name_unique(&name)?;
		let location = self.location.with_name(self.name_index(&name));
		self.mark_visited(&location);

		let existing = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&location).cloned()
		};
		match existing {
			Some(entry) => {
				if !matches!(entry.kind, EntryKind::RollbackCheckpoint { .. }) {
					return Err(WorkflowError::HistoryDiverged(format!(
						"expected rollback_checkpoint at `{location}`"
					))
					.into());
				}
			}
			None => {
				if self.mode == Mode::Rollback {
					return Err(WorkflowError::HistoryDiverged(format!(
						"rollback replay reached an unrecorded rollback_checkpoint at `{location}`"
					))
					.into());
				}
				let entry_id = Uuid::new_v4();
				let mut mirror = self.mirror.lock().unwrap();
				mirror.set_entry(Entry::new(
					entry_id,
					location.clone(),
					EntryKind::RollbackCheckpoint { name: name.clone() },
				));
			}
		}

		// Only steps committed after the *most recent* checkpoint roll back.
		self.rollback_actions.lock().unwrap().clear();
		self.rollback_checkpoint_set.store(true, Ordering::SeqCst);
		self.flush().await
	}

	// -- sleep ----------------------------------------------------------------

	pub async fn sleep(&mut self, name: impl Into<String>, duration: Duration) -> anyhow::Result<()> {
		let deadline = now_ms() + duration.as_millis() as i64;
		self.sleep_until(name, deadline).await
	}

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id, deadline_ts))]
	pub async fn sleep_until(&mut self, name: impl Into<String>, deadline_ts: i64) -> anyhow::Result<()> {
		self.check_stop()?;
		self.enter_op()?;
		let result = self.sleep_until_inner(name.into(), deadline_ts).await;
		self.exit_op();
		result
	}

	async fn sleep_until_inner(&mut self, name: String, deadline_ts: i64) -> anyhow::Result<()> {
		self.assert_name_unique(&name)?;
		let location = self.location.with_name(self.name_index(&name));
		self.mark_visited(&location);

		let existing = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&location).cloned()
		};

		let (deadline_ts, already_settled) = match existing {
			Some(entry) => {
				let EntryKind::Sleep { deadline_ts, state } = entry.kind else {
					return Err(WorkflowError::HistoryDiverged(format!("expected sleep at `{location}`")).into());
				};
				(deadline_ts, !matches!(state, SleepState::Pending))
			}
			None => {
				if self.mode == Mode::Rollback {
					return Err(WorkflowError::RollbackStop.into());
				}
				let entry_id = Uuid::new_v4();
				{
					let mut mirror = self.mirror.lock().unwrap();
					mirror.set_entry(Entry::new(
						entry_id,
						location.clone(),
						EntryKind::Sleep {
							deadline_ts,
							state: SleepState::Pending,
						},
					));
				}
				self.flush().await?;
				(deadline_ts, false)
			}
		};

		if already_settled {
			tracing::debug!(workflow_id = %self.workflow_id, location = %location, "replaying settled sleep");
			return Ok(());
		}

		let now = now_ms();
		let remaining = deadline_ts - now;
		if remaining <= 0 {
			self.mark_sleep_completed(&location).await?;
			return Ok(());
		}

		if remaining < self.driver.worker_poll_interval().as_millis() as i64 {
			tracing::debug!(workflow_id = %self.workflow_id, location = %location, remaining_ms = remaining, "honoring short sleep in-process");
			tokio::select! {
				_ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => {}
				_ = self.cancel.cancelled() => return Err(WorkflowError::Evicted.into()),
			}
			self.mark_sleep_completed(&location).await?;
			return Ok(());
		}

		tracing::debug!(workflow_id = %self.workflow_id, location = %location, deadline_ts, "yielding Sleep to scheduler");
		Err(WorkflowError::Sleep {
			deadline_ts,
			waiting_names: None,
		}
		.into())
	}

	async fn mark_sleep_completed(&mut self, location: &Location) -> anyhow::Result<()> {
		{
			let mut mirror = self.mirror.lock().unwrap();
			if let Some(entry) = mirror.get_entry_mut(location) {
				if let EntryKind::Sleep { state, .. } = &mut entry.kind {
					*state = SleepState::Completed;
					entry.dirty = true;
				}
			}
		}
		self.flush().await
	}

	// -- queue ------------------------------------------------------------------

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id))]
	pub async fn queue_send(&mut self, name: impl Into<String>, body: serde_json::Value) -> anyhow::Result<()> {
		self.check_stop()?;
		let msg = crate::queue::DriverMessage {
			id: Uuid::new_v4(),
			name: name.into(),
			data: body,
			sent_at: now_ms(),
		};
		tracing::debug!(workflow_id = %self.workflow_id, message_name = %msg.name, message_id = %msg.id, "queue.send");
		self.msg_driver.add_message(self.workflow_id, msg.clone()).await?;
		self.mirror.lock().unwrap().add_message(msg);
		Ok(())
	}

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id))]
	pub async fn queue_next(
		&mut self,
		name: impl Into<String>,
		opts: QueueNextOptions,
	) -> anyhow::Result<Vec<CompletableMessage>> {
		self.check_stop()?;
		self.enter_op()?;
		let result = self.queue_next_inner(name.into(), opts).await;
		self.exit_op();
		result
	}

	async fn queue_next_inner(&mut self, name: String, opts: QueueNextOptions) -> anyhow::Result<Vec<CompletableMessage>> {
		if opts.completable && self.outstanding_completable.load(Ordering::SeqCst) {
			return Err(WorkflowError::OutstandingCompletable.into());
		}
		self.assert_name_unique(&name)?;

		let count_name = format!("{name}:count");
		let count_location = self.location.with_name(self.name_index(&count_name));
		self.mark_visited(&count_location);

		let existing_count = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&count_location).cloned()
		};

		if let Some(entry) = existing_count {
			let EntryKind::Message { data, .. } = &entry.kind else {
				return Err(WorkflowError::HistoryDiverged(format!("expected count marker at `{count_location}`")).into());
			};
			let k: u64 = serde_json::from_value(data.clone())?;
			tracing::debug!(workflow_id = %self.workflow_id, queue = %name, count = k, "replaying queue.next from history");
			let mut messages = Vec::with_capacity(k as usize);
			for i in 0..k {
				let slot_name = format!("{name}:{i}");
				let slot_location = self.location.with_name(self.name_index(&slot_name));
				self.mark_visited(&slot_location);
				let slot_entry = {
					let mirror = self.mirror.lock().unwrap();
					mirror.get_entry(&slot_location).cloned()
				}
				.ok_or_else(|| WorkflowError::HistoryDiverged(format!("missing message slot at `{slot_location}`")))?;
				let EntryKind::Message { data, .. } = slot_entry.kind else {
					return Err(WorkflowError::HistoryDiverged(format!("expected message at `{slot_location}`")).into());
				};
				let wqm = WorkflowQueueMessage::from_entry_data(&data);
				let already_completed = wqm.is_completable() && wqm.is_completed();
				if wqm.is_completable() && !wqm.is_completed() {
					self.outstanding_completable.store(true, Ordering::SeqCst);
				}
				messages.push(CompletableMessage {
					message: wqm,
					ctx: self.clone(),
					slot_location,
					already_completed,
					settled: false,
				});
			}
			return Ok(messages);
		}

		if let Some(timeout) = opts.timeout {
			let deadline_location = self.location.with_name(self.name_index(&format!("{name}:deadline")));
			self.mark_visited(&deadline_location);

			let existing_deadline = {
				let mirror = self.mirror.lock().unwrap();
				mirror.get_entry(&deadline_location).cloned()
			};
			let deadline_ts = match existing_deadline {
				Some(entry) => {
					let EntryKind::Sleep { deadline_ts, .. } = entry.kind else {
						return Err(WorkflowError::HistoryDiverged(format!("expected sleep at `{deadline_location}`")).into());
					};
					deadline_ts
				}
				None => {
					if self.mode == Mode::Rollback {
						return Err(WorkflowError::RollbackStop.into());
					}
					let ts = now_ms() + timeout.as_millis() as i64;
					let entry_id = Uuid::new_v4();
					let mut mirror = self.mirror.lock().unwrap();
					mirror.set_entry(Entry::new(
						entry_id,
						deadline_location.clone(),
						EntryKind::Sleep {
							deadline_ts: ts,
							state: SleepState::Pending,
						},
					));
					ts
				}
			};

			if now_ms() >= deadline_ts {
				self.mark_sleep_completed(&deadline_location).await?;
				self.record_count(&name, &count_location, 0).await?;
				return Ok(Vec::new());
			}

			let received = self
				.msg_driver
				.receive_messages(
					self.workflow_id,
					ReceiveRequest {
						names: opts.names.clone(),
						count: opts.count,
						completable: opts.completable,
					},
				)
				.await?;

			if !received.is_empty() {
				tracing::debug!(workflow_id = %self.workflow_id, queue = %name, received = received.len(), "queue.next claimed messages before deadline");
				self.interrupt_sleep(&deadline_location);
				return self.persist_received(&name, &count_location, received, opts.completable).await;
			}

			self.flush().await?;
			tracing::debug!(workflow_id = %self.workflow_id, queue = %name, deadline_ts, "queue.next yielding Sleep, no messages yet");
			return Err(WorkflowError::Sleep {
				deadline_ts,
				waiting_names: Some(opts.names),
			}
			.into());
		}

		if self.mode == Mode::Rollback {
			return Err(WorkflowError::RollbackStop.into());
		}

		let received = self
			.msg_driver
			.receive_messages(
				self.workflow_id,
				ReceiveRequest {
					names: opts.names.clone(),
					count: opts.count,
					completable: opts.completable,
				},
			)
			.await?;

		if received.is_empty() {
			return Err(WorkflowError::MessageWait(opts.names).into());
		}

		self.persist_received(&name, &count_location, received, opts.completable).await
	}

	async fn record_count(&mut self, name: &str, count_location: &Location, k: u64) -> anyhow::Result<()> {
		let entry_id = Uuid::new_v4();
		{
			let mut mirror = self.mirror.lock().unwrap();
			mirror.set_entry(Entry::new(
				entry_id,
				count_location.clone(),
				EntryKind::Message {
					name: format!("{name}:count"),
					data: serde_json::json!(k),
				},
			));
		}
		self.flush().await
	}

	fn interrupt_sleep(&self, location: &Location) {
		let mut mirror = self.mirror.lock().unwrap();
		if let Some(entry) = mirror.get_entry_mut(location) {
			if let EntryKind::Sleep { state, .. } = &mut entry.kind {
				*state = SleepState::Interrupted;
				entry.dirty = true;
			}
		}
	}

	async fn persist_received(
		&mut self,
		name: &str,
		count_location: &Location,
		received: Vec<crate::queue::DriverMessage>,
		completable: bool,
	) -> anyhow::Result<Vec<CompletableMessage>> {
		let mut out = Vec::with_capacity(received.len());
		for (i, msg) in received.iter().enumerate() {
			let slot_name = format!("{name}:{i}");
			let slot_location = self.location.with_name(self.name_index(&slot_name));
			self.mark_visited(&slot_location);

			let wqm = if completable {
				WorkflowQueueMessage::completable(msg.id, msg.name.clone(), msg.data.clone(), msg.sent_at, false)
			} else {
				WorkflowQueueMessage::plain(msg.id, msg.name.clone(), msg.data.clone(), msg.sent_at)
			};
			let data = wqm.to_entry_data();
			let entry_id = Uuid::new_v4();
			{
				let mut mirror = self.mirror.lock().unwrap();
				mirror.set_entry(Entry::new(
					entry_id,
					slot_location.clone(),
					EntryKind::Message { name: slot_name, data },
				));
			}
			if completable {
				self.outstanding_completable.store(true, Ordering::SeqCst);
			}
			out.push(CompletableMessage {
				message: wqm,
				ctx: self.clone(),
				slot_location,
				already_completed: false,
				settled: false,
			});
		}

		self.record_count(name, count_location, received.len() as u64).await?;
		Ok(out)
	}

	// -- join / race --------------------------------------------------------

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id))]
	pub async fn join(
		&mut self,
		name: impl Into<String>,
		branches: Vec<(String, BranchFn)>,
	) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
		self.check_stop()?;
		self.enter_op()?;
		let result = self.join_inner(name.into(), branches).await;
		self.exit_op();
		result
	}

	async fn join_inner(
		&mut self,
		name: String,
		branches: Vec<(String, BranchFn)>,
	) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
		self.assert_name_unique(&name)?;
		let location = self.location.with_name(self.name_index(&name));
		self.mark_visited(&location);

		let existing = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&location).cloned()
		};

		let mut branch_records: BTreeMap<String, BranchRecord> = match &existing {
			Some(entry) => match &entry.kind {
				EntryKind::Join { branches } => branches.clone(),
				_ => return Err(WorkflowError::HistoryDiverged(format!("expected join at `{location}`")).into()),
			},
			None => {
				if self.mode == Mode::Rollback {
					return Err(WorkflowError::RollbackStop.into());
				}
				branches.iter().map(|(n, _)| (n.clone(), BranchRecord::pending())).collect()
			}
		};

		let entry_id = existing.as_ref().map(|e| e.id).unwrap_or_else(Uuid::new_v4);
		if existing.is_none() {
			{
				let mut mirror = self.mirror.lock().unwrap();
				mirror.set_entry(Entry::new(entry_id, location.clone(), EntryKind::Join { branches: branch_records.clone() }));
			}
			self.flush().await?;
		}

		let mut futs = Vec::new();
		for (branch_name, branch_fn) in branches {
			let rec = branch_records.get(&branch_name).cloned().unwrap_or_else(BranchRecord::pending);
			if !matches!(rec.status, BranchStatus::Pending | BranchStatus::Running) {
				continue;
			}
			branch_records.insert(
				branch_name.clone(),
				BranchRecord {
					status: BranchStatus::Running,
					..rec
				},
			);
			let branch_location = location.with_name(self.name_index(&branch_name));
			let branch_ctx = self.branch_at(branch_location.clone());
			futs.push(async move {
				let res = branch_fn(branch_ctx.clone()).await;
				let validated = res.and_then(|out| {
					branch_ctx.validate_branch_complete(&branch_location)?;
					Ok(out)
				});
				(branch_name, validated)
			});
		}

		let settled = futures_util::future::join_all(futs).await;

		// A branch yielding `Sleep`/`MessageWait` hasn't settled at all — it's
		// still `running` and wants this whole run to pause and resume it next
		// time, the same as a race branch (spec §4.3.7 step 3, applied here
		// because "wait for all branches to settle" does not mean "treat a
		// yield as a failure").
		let mut pending_deadline: Option<i64> = None;
		let mut pending_names: Vec<String> = Vec::new();

		for (branch_name, res) in settled {
			match res {
				Ok(output) => {
					branch_records.insert(
						branch_name,
						BranchRecord {
							status: BranchStatus::Completed,
							output: Some(output),
							error: None,
						},
					);
				}
				Err(err) => match WorkflowError::downcast_chain(&err) {
					Some(WorkflowError::Sleep { deadline_ts, waiting_names }) => {
						pending_deadline = Some(pending_deadline.map_or(*deadline_ts, |d| d.min(*deadline_ts)));
						if let Some(names) = waiting_names {
							pending_names.extend(names.iter().cloned());
						}
					}
					Some(WorkflowError::MessageWait(names)) => {
						pending_names.extend(names.iter().cloned());
					}
					Some(WorkflowError::Evicted) => {
						branch_records.insert(
							branch_name,
							BranchRecord {
								status: BranchStatus::Cancelled,
								output: None,
								error: None,
							},
						);
					}
					_ => {
						branch_records.insert(
							branch_name,
							BranchRecord {
								status: BranchStatus::Failed,
								output: None,
								error: Some(err.to_string()),
							},
						);
					}
				},
			}
		}

		{
			let mut mirror = self.mirror.lock().unwrap();
			if let Some(entry) = mirror.get_entry_mut(&location) {
				entry.kind = EntryKind::Join { branches: branch_records.clone() };
				entry.dirty = true;
			}
		}
		self.flush().await?;

		if pending_deadline.is_some() || !pending_names.is_empty() {
			return Err(WorkflowError::Sleep {
				deadline_ts: pending_deadline.unwrap_or(i64::MAX),
				waiting_names: (!pending_names.is_empty()).then_some(pending_names),
			}
			.into());
		}

		let failures: BTreeMap<String, String> = branch_records
			.iter()
			.filter_map(|(n, r)| r.error.clone().map(|e| (n.clone(), e)))
			.collect();
		if !failures.is_empty() {
			tracing::warn!(workflow_id = %self.workflow_id, join = %name, failed_branches = failures.len(), "join failed, at least one branch errored");
			return Err(WorkflowError::Join(failures).into());
		}

		Ok(branch_records
			.into_iter()
			.map(|(n, r)| (n, r.output.unwrap_or(serde_json::Value::Null)))
			.collect())
	}

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id))]
	pub async fn race(
		&mut self,
		name: impl Into<String>,
		branches: Vec<(String, BranchFn)>,
	) -> anyhow::Result<serde_json::Value> {
		self.check_stop()?;
		self.enter_op()?;
		let result = self.race_inner(name.into(), branches).await;
		self.exit_op();
		result
	}

	async fn race_inner(&mut self, name: String, branches: Vec<(String, BranchFn)>) -> anyhow::Result<serde_json::Value> {
		self.assert_name_unique(&name)?;
		let location = self.location.with_name(self.name_index(&name));
		self.mark_visited(&location);

		let existing = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&location).cloned()
		};

		let (_entry_id, mut winner, mut branch_records) = match existing {
			Some(entry) => match entry.kind {
				EntryKind::Race { winner, branches } => (entry.id, winner, branches),
				_ => return Err(WorkflowError::HistoryDiverged(format!("expected race at `{location}`")).into()),
			},
			None => {
				if self.mode == Mode::Rollback {
					return Err(WorkflowError::RollbackStop.into());
				}
				let id = Uuid::new_v4();
				let recs: BTreeMap<_, _> = branches.iter().map(|(n, _)| (n.clone(), BranchRecord::pending())).collect();
				{
					let mut mirror = self.mirror.lock().unwrap();
					mirror.set_entry(Entry::new(id, location.clone(), EntryKind::Race { winner: None, branches: recs.clone() }));
				}
				self.flush().await?;
				(id, None, recs)
			}
		};

		if let Some(w) = &winner {
			tracing::debug!(workflow_id = %self.workflow_id, race = %name, winner = %w, "replaying settled race");
			let output = branch_records.get(w).and_then(|r| r.output.clone()).unwrap_or(serde_json::Value::Null);
			return Ok(output);
		}

		let race_cancel = self.cancel.child();
		let mut futs = Vec::new();
		for (branch_name, branch_fn) in branches {
			let rec = branch_records.get(&branch_name).cloned().unwrap_or_else(BranchRecord::pending);
			if !matches!(rec.status, BranchStatus::Pending | BranchStatus::Running) {
				continue;
			}
			branch_records.insert(
				branch_name.clone(),
				BranchRecord {
					status: BranchStatus::Running,
					..rec
				},
			);
			let branch_location = location.with_name(self.name_index(&branch_name));
			let mut branch_ctx = self.branch_at(branch_location.clone());
			branch_ctx.cancel = race_cancel.child();
			futs.push(async move {
				let res = branch_fn(branch_ctx.clone()).await;
				let validated = res.and_then(|out| {
					branch_ctx.validate_branch_complete(&branch_location)?;
					Ok(out)
				});
				(branch_name, validated)
			});
		}

		let settled = futures_util::future::join_all(futs).await;

		let mut pending_deadline: Option<i64> = None;
		let mut pending_names: Vec<String> = Vec::new();

		for (branch_name, res) in settled {
			match res {
				Ok(output) => {
					let was_open = winner.is_none();
					if was_open {
						winner = Some(branch_name.clone());
						race_cancel.cancel();
					}
					branch_records.insert(
						branch_name,
						BranchRecord {
							status: BranchStatus::Completed,
							output: Some(output),
							error: None,
						},
					);
				}
				Err(err) => match WorkflowError::downcast_chain(&err) {
					Some(WorkflowError::Sleep { deadline_ts, waiting_names }) => {
						pending_deadline = Some(pending_deadline.map_or(*deadline_ts, |d| d.min(*deadline_ts)));
						if let Some(names) = waiting_names {
							pending_names.extend(names.iter().cloned());
						}
					}
					Some(WorkflowError::MessageWait(names)) => {
						pending_names.extend(names.iter().cloned());
					}
					Some(WorkflowError::Evicted) => {
						branch_records.insert(
							branch_name,
							BranchRecord {
								status: BranchStatus::Cancelled,
								output: None,
								error: None,
							},
						);
					}
					_ => {
						branch_records.insert(
							branch_name,
							BranchRecord {
								status: BranchStatus::Failed,
								output: None,
								error: Some(err.to_string()),
							},
						);
					}
				},
			}
		}

		{
			let mut mirror = self.mirror.lock().unwrap();
			if let Some(entry) = mirror.get_entry_mut(&location) {
				entry.kind = EntryKind::Race {
					winner: winner.clone(),
					branches: branch_records.clone(),
				};
				entry.dirty = true;
			}
		}
		if winner.is_none() {
			if pending_deadline.is_some() || !pending_names.is_empty() {
				self.flush().await?;
				return Err(WorkflowError::Sleep {
					deadline_ts: pending_deadline.unwrap_or(i64::MAX),
					waiting_names: (!pending_names.is_empty()).then_some(pending_names),
				}
				.into());
			}
		}

		if let Some(w) = winner.clone() {
			tracing::debug!(workflow_id = %self.workflow_id, race = %name, winner = %w, "race settled, pruning loser branches");
			let loser_prefixes: Vec<Location> = branch_records
				.keys()
				.filter(|branch_name| *branch_name != &w)
				.map(|branch_name| location.with_name(self.name_index(branch_name)))
				.collect();
			self.delete_entries_with_prefixes(&loser_prefixes).await?;
			self.flush().await?;
			let output = branch_records.get(&w).and_then(|r| r.output.clone()).unwrap_or(serde_json::Value::Null);
			return Ok(output);
		}

		self.flush().await?;
		tracing::warn!(workflow_id = %self.workflow_id, race = %name, "race failed, every branch errored");
		let errors: Vec<(String, String)> = branch_records.into_iter().filter_map(|(n, r)| r.error.map(|e| (n, e))).collect();
		Err(WorkflowError::Race(errors).into())
	}

	// -- loop -----------------------------------------------------------------

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id))]
	pub async fn loop_op<S, T, F, Fut>(
		&mut self,
		name: impl Into<String>,
		initial_state: S,
		opts: LoopOptions,
		body: F,
	) -> anyhow::Result<T>
	where
		S: Serialize + DeserializeOwned + Clone + Send + 'static,
		T: Serialize + DeserializeOwned + Send + 'static,
		F: Fn(Context, S) -> BoxFuture<'static, anyhow::Result<LoopStep<S, T>>>,
	{
		self.check_stop()?;
		self.enter_op()?;
		let result = self.loop_inner(name.into(), initial_state, opts, body).await;
		self.exit_op();
		result
	}

	async fn loop_inner<S, T, F>(&mut self, name: String, initial_state: S, opts: LoopOptions, body: F) -> anyhow::Result<T>
	where
		S: Serialize + DeserializeOwned + Clone + Send + 'static,
		T: Serialize + DeserializeOwned + Send + 'static,
		F: Fn(Context, S) -> BoxFuture<'static, anyhow::Result<LoopStep<S, T>>>,
	{
		self.assert_name_unique(&name)?;
		let loop_index = self.name_index(&name);
		let location = self.location.with_name(loop_index);
		self.mark_visited(&location);

		let existing = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&location).cloned()
		};

		let (mut iteration, mut state, output): (u64, S, Option<T>) = match existing {
			Some(entry) => {
				let EntryKind::Loop { state, iteration, output } = entry.kind else {
					return Err(WorkflowError::HistoryDiverged(format!("expected loop at `{location}`")).into());
				};
				let state: S = serde_json::from_value(state)?;
				let output: Option<T> = match output {
					Some(v) => Some(serde_json::from_value(v)?),
					None => None,
				};
				(iteration, state, output)
			}
			None => {
				if self.mode == Mode::Rollback {
					return Err(WorkflowError::RollbackStop.into());
				}
				let entry_id = Uuid::new_v4();
				let state_val = serde_json::to_value(&initial_state)?;
				{
					let mut mirror = self.mirror.lock().unwrap();
					mirror.set_entry(Entry::new(
						entry_id,
						location.clone(),
						EntryKind::Loop {
							state: state_val,
							iteration: 0,
							output: None,
						},
					));
				}
				self.flush().await?;
				(0, initial_state, None)
			}
		};

		if let Some(output) = output {
			return Ok(output);
		}

		let rollback_single_pass = self.mode == Mode::Rollback;

		loop {
			self.check_stop()?;

			let iter_location = location.with_loop_iteration(loop_index, iteration);
			let iter_ctx = self.branch_at(iter_location.clone());
			let step_result = body(iter_ctx.clone(), state.clone()).await?;
			iter_ctx.validate_branch_complete(&iter_location)?;

			match step_result {
				LoopStep::Break(value) => {
					tracing::debug!(workflow_id = %self.workflow_id, loop_name = %name, iteration, "loop broke");
					let next_iteration = iteration + 1;
					let state_val = serde_json::to_value(&state)?;
					let output_val = serde_json::to_value(&value)?;
					{
						let mut mirror = self.mirror.lock().unwrap();
						if let Some(entry) = mirror.get_entry_mut(&location) {
							entry.kind = EntryKind::Loop {
								state: state_val,
								iteration: next_iteration,
								output: Some(output_val),
							};
							entry.dirty = true;
						}
					}
					self.flush().await?;
					self.trim_loop_history(&location, loop_index, next_iteration, &opts).await?;
					return Ok(value);
				}
				LoopStep::Continue(new_state) => {
					state = new_state;
					iteration += 1;

					if rollback_single_pass {
						return Err(WorkflowError::RollbackStop.into());
					}

					if iteration % opts.commit_interval == 0 {
						let state_val = serde_json::to_value(&state)?;
						{
							let mut mirror = self.mirror.lock().unwrap();
							if let Some(entry) = mirror.get_entry_mut(&location) {
								entry.kind = EntryKind::Loop {
									state: state_val,
									iteration,
									output: None,
								};
								entry.dirty = true;
							}
						}
						self.flush().await?;

						if iteration % opts.history_every == 0 {
							self.trim_loop_history(&location, loop_index, iteration, &opts).await?;
						}
					}
				}
			}
		}
	}

	async fn trim_loop_history(
		&self,
		loop_location: &Location,
		loop_index: usize,
		current_iteration: u64,
		opts: &LoopOptions,
	) -> anyhow::Result<()> {
		if current_iteration < opts.history_keep {
			return Ok(());
		}
		let cutoff = current_iteration - opts.history_keep;
		for old_iter in 0..cutoff {
			let old_location = loop_location.with_loop_iteration(loop_index, old_iter);
			self.delete_entries_with_prefix(&old_location).await?;
		}
		Ok(())
	}

	// -- removed --------------------------------------------------------------

	#[tracing::instrument(skip_all, fields(workflow_id = %self.workflow_id))]
	pub async fn removed(&mut self, name: impl Into<String>, original_type: impl Into<String>) -> anyhow::Result<()> {
		self.check_stop()?;
		let name = name.into();
		let original_type = original_type.into();
		tracing::debug!(workflow_id = %self.workflow_id, name = %name, original_type = %original_type, "removed() placeholder");
		self.assert_name_unique(&name)?;
		let location = self.location.with_name(self.name_index(&name));
		self.mark_visited(&location);

		let existing = {
			let mirror = self.mirror.lock().unwrap();
			mirror.get_entry(&location).cloned()
		};
		match existing {
			Some(entry) => {
				let matches = match &entry.kind {
					EntryKind::Removed { original_type: ot, .. } => ot == &original_type,
					other => other.type_name() == original_type,
				};
				if !matches {
					return Err(WorkflowError::HistoryDiverged(format!(
						"`removed(\"{name}\")` does not match the existing entry kind at `{location}`"
					))
					.into());
				}
			}
			None => {
				if self.mode != Mode::Rollback {
					let entry_id = Uuid::new_v4();
					{
						let mut mirror = self.mirror.lock().unwrap();
						mirror.set_entry(Entry::new(
							entry_id,
							location.clone(),
							EntryKind::Removed {
								original_type,
								original_name: Some(name),
							},
						));
					}
					self.flush().await?;
				}
			}
		}
		Ok(())
	}
}

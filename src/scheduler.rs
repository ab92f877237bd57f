//! The run loop (spec §4.4): hydrate, dispatch to the registered workflow
//! function, and interpret whatever it returns — a completed output, a
//! yield signal, or a real failure — into the next persisted state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::context::{Context, Mode};
use crate::db::{HistoryNotifier, MessageDriver, PersistenceDriver};
use crate::error::{StructuredError, WorkflowError};
use crate::now_ms;
use crate::state::WorkflowState;
use crate::storage::StorageMirror;
use crate::workflow::{WorkflowFn, WorkflowRegistry};

#[derive(Debug, Clone)]
pub enum RunOutcome {
	Completed(serde_json::Value),
	Sleeping { resume_at: i64 },
	WaitingForMessage { names: Vec<String> },
	Evicted,
	RolledBack(StructuredError),
	Failed(StructuredError),
}

pub struct Engine {
	pub(crate) driver: Arc<dyn PersistenceDriver>,
	pub(crate) msg_driver: Arc<dyn MessageDriver>,
	notifier: Option<Arc<dyn HistoryNotifier>>,
	pub(crate) config: Arc<EngineConfig>,
	registry: Arc<WorkflowRegistry>,
	/// Cancellation tokens for in-flight `run` calls, so `Handle::evict`
	/// from another thread can reach a specific live execution. Many
	/// workflows may be running at once across the host's worker tasks, so
	/// this is guarded by its own mutex rather than sharing the per-workflow
	/// storage mirror's.
	running: StdMutex<HashMap<Uuid, CancelToken>>,
}

impl Engine {
	pub fn new(driver: Arc<dyn PersistenceDriver>, msg_driver: Arc<dyn MessageDriver>, registry: WorkflowRegistry) -> Self {
		Engine {
			driver,
			msg_driver,
			notifier: None,
			config: Arc::new(EngineConfig::default()),
			registry: Arc::new(registry),
			running: StdMutex::new(HashMap::new()),
		}
	}

	pub fn with_notifier(mut self, notifier: Arc<dyn HistoryNotifier>) -> Self {
		self.notifier = Some(notifier);
		self
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = Arc::new(config);
		self
	}

	pub(crate) fn cancel_token_for(&self, workflow_id: Uuid) -> Option<CancelToken> {
		self.running.lock().unwrap().get(&workflow_id).cloned()
	}

	#[tracing::instrument(skip_all, fields(workflow_id = %workflow_id, workflow_name))]
	pub async fn run(&self, workflow_id: Uuid, workflow_name: &str, input: serde_json::Value) -> anyhow::Result<RunOutcome> {
		let wf_fn = self
			.registry
			.get(workflow_name)
			.ok_or_else(|| anyhow::anyhow!("no workflow registered under `{workflow_name}`"))?;

		let mirror = Arc::new(StdMutex::new(
			StorageMirror::hydrate(self.driver.as_ref(), workflow_id).await?,
		));

		let initial_state = mirror.lock().unwrap().workflow_state.state;
		match initial_state {
			WorkflowState::Completed => {
				let output = mirror.lock().unwrap().workflow_state.output.clone();
				return Ok(RunOutcome::Completed(output.unwrap_or(serde_json::Value::Null)));
			}
			WorkflowState::Failed => {
				let error = mirror.lock().unwrap().workflow_state.error.clone();
				return Ok(RunOutcome::Failed(error.unwrap_or_else(unknown_failure)));
			}
			WorkflowState::Cancelled => return Ok(RunOutcome::Evicted),
			WorkflowState::RollingBack => {
				let cause = mirror.lock().unwrap().workflow_state.error.clone();
				return self.run_rollback_replay(workflow_id, mirror, input, wf_fn, cause).await;
			}
			_ => {}
		}

		let cancel = CancelToken::new();
		self.running.lock().unwrap().insert(workflow_id, cancel.clone());

		mirror.lock().unwrap().set_state(WorkflowState::Running);
		self.flush_mirror(workflow_id, &mirror).await?;

		let ctx = Context::new_root(
			workflow_id,
			mirror.clone(),
			self.driver.clone(),
			self.msg_driver.clone(),
			self.notifier.clone(),
			self.config.clone(),
			Mode::Forward,
			cancel,
		);

		let outcome = self.drive(ctx.clone(), wf_fn.clone(), input.clone()).await;

		let result = match outcome {
			Ok(output) => match ctx.validate_complete() {
				Ok(()) => {
					{
						let mut m = mirror.lock().unwrap();
						m.set_state(WorkflowState::Completed);
						m.set_output(output.clone());
					}
					self.flush_mirror(workflow_id, &mirror).await?;
					RunOutcome::Completed(output)
				}
				Err(e) => {
					self.running.lock().unwrap().remove(&workflow_id);
					return self.handle_forward_error(workflow_id, &mirror, &input, wf_fn, e).await;
				}
			},
			Err(err) => {
				self.running.lock().unwrap().remove(&workflow_id);
				return self.handle_forward_error(workflow_id, &mirror, &input, wf_fn, err).await;
			}
		};

		self.running.lock().unwrap().remove(&workflow_id);
		Ok(result)
	}

	/// Runs the workflow function on a spawned task so an unexpected panic
	/// surfaces as a `Critical` failure instead of taking the host down.
	async fn drive(&self, ctx: Context, wf_fn: WorkflowFn, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
		let task = tokio::spawn(async move { wf_fn(ctx, input).await });
		match task.await {
			Ok(res) => res,
			Err(join_err) if join_err.is_panic() => {
				Err(WorkflowError::Critical(format!("workflow function panicked: {join_err}")).into())
			}
			Err(join_err) => Err(anyhow::anyhow!("workflow task did not complete: {join_err}")),
		}
	}

	async fn handle_forward_error(
		&self,
		workflow_id: Uuid,
		mirror: &Arc<StdMutex<StorageMirror>>,
		input: &serde_json::Value,
		wf_fn: WorkflowFn,
		err: anyhow::Error,
	) -> anyhow::Result<RunOutcome> {
		match WorkflowError::downcast_chain(&err) {
			Some(WorkflowError::Sleep { deadline_ts, .. }) => {
				let deadline_ts = *deadline_ts;
				mirror.lock().unwrap().set_state(WorkflowState::Sleeping);
				self.flush_mirror(workflow_id, mirror).await?;
				Ok(RunOutcome::Sleeping { resume_at: deadline_ts })
			}
			Some(WorkflowError::MessageWait(names)) => {
				let names = names.clone();
				mirror.lock().unwrap().set_state(WorkflowState::Sleeping);
				self.flush_mirror(workflow_id, mirror).await?;
				Ok(RunOutcome::WaitingForMessage { names })
			}
			Some(WorkflowError::Evicted) => Ok(RunOutcome::Evicted),
			Some(WorkflowError::Rollback(cause)) => {
				let structured = StructuredError {
					name: "Rollback".to_string(),
					message: cause.clone(),
					stack: None,
					metadata: None,
				};
				mirror.lock().unwrap().set_state(WorkflowState::RollingBack);
				self.flush_mirror(workflow_id, mirror).await?;
				self.run_rollback_replay(workflow_id, mirror.clone(), input.clone(), wf_fn, Some(structured))
					.await
			}
			_ => {
				let structured = StructuredError::from_anyhow(&err);
				{
					let mut m = mirror.lock().unwrap();
					m.set_state(WorkflowState::Failed);
					m.set_error(structured.clone());
				}
				self.flush_mirror(workflow_id, mirror).await?;
				Ok(RunOutcome::Failed(structured))
			}
		}
	}

	/// Rebuilds the rollback-action list by replaying the workflow function
	/// in rollback mode (no new work, history only), then invokes it in
	/// reverse commit order (spec §4.3.1.8, §9 rollback ordering).
	async fn run_rollback_replay(
		&self,
		workflow_id: Uuid,
		mirror: Arc<StdMutex<StorageMirror>>,
		input: serde_json::Value,
		wf_fn: WorkflowFn,
		cause: Option<StructuredError>,
	) -> anyhow::Result<RunOutcome> {
		let cancel = CancelToken::new();
		self.running.lock().unwrap().insert(workflow_id, cancel.clone());

		let ctx = Context::new_root(
			workflow_id,
			mirror.clone(),
			self.driver.clone(),
			self.msg_driver.clone(),
			self.notifier.clone(),
			self.config.clone(),
			Mode::Rollback,
			cancel,
		);

		let replay_result = self.drive(ctx.clone(), wf_fn, input).await;
		if let Err(err) = &replay_result {
			if !matches!(WorkflowError::downcast_chain(err), Some(WorkflowError::RollbackStop)) {
				tracing::warn!(workflow_id = %workflow_id, error = %err, "rollback replay ended on an unexpected signal");
			}
		}

		let actions = {
			let mut actions = ctx.rollback_actions().lock().unwrap();
			std::mem::take(&mut *actions)
		};

		for action in actions.into_iter().rev() {
			let already_done = mirror
				.lock()
				.unwrap()
				.metadata
				.get(&action.entry_id)
				.map(|m| m.rollback_completed_at.is_some())
				.unwrap_or(false);
			if already_done {
				continue;
			}

			let res = (action.rollback)(ctx.clone(), action.output.clone()).await;
			let now = now_ms();
			{
				let mut m = mirror.lock().unwrap();
				if let Some(meta) = m.metadata.get_mut(&action.entry_id) {
					match &res {
						Ok(()) => meta.mark_rollback_completed(now),
						Err(e) => meta.mark_rollback_failed(e.to_string()),
					}
				}
			}
			if let Err(e) = &res {
				tracing::error!(workflow_id = %workflow_id, step = %action.name, error = %e, "rollback handler failed");
			}
			self.flush_mirror(workflow_id, &mirror).await?;
		}

		let structured = cause.unwrap_or_else(|| StructuredError {
			name: "Rollback".to_string(),
			message: "workflow rolled back".to_string(),
			stack: None,
			metadata: None,
		});
		{
			let mut m = mirror.lock().unwrap();
			m.set_state(WorkflowState::Failed);
			m.set_error(structured.clone());
		}
		self.flush_mirror(workflow_id, &mirror).await?;
		self.running.lock().unwrap().remove(&workflow_id);
		Ok(RunOutcome::RolledBack(structured))
	}

	async fn flush_mirror(&self, workflow_id: Uuid, mirror: &Arc<StdMutex<StorageMirror>>) -> anyhow::Result<()> {
		let diff = mirror.lock().unwrap().build_flush_diff();
		let Some(diff) = diff else { return Ok(()) };
		self.driver.flush(workflow_id, diff.clone()).await?;
		mirror.lock().unwrap().mark_flushed(&diff);
		if let Some(notifier) = &self.notifier {
			let snapshot = mirror.lock().unwrap().snapshot(workflow_id);
			notifier.notify(snapshot);
		}
		Ok(())
	}
}

fn unknown_failure() -> StructuredError {
	StructuredError {
		name: "Critical".to_string(),
		message: "workflow failed with no recorded error".to_string(),
		stack: None,
		metadata: None,
	}
}

//! The external handle to a workflow execution (spec §4.5).
//!
//! Unlike `Context`, which only exists inside a running workflow function,
//! `Handle` is the host-facing API: start/await a result, deliver a
//! message, nudge a sleeping run, recover an exhausted step, or stop it.

use std::time::Duration;

use uuid::Uuid;

use crate::error::WorkflowError;
use crate::queue::DriverMessage;
use crate::scheduler::{Engine, RunOutcome};
use crate::state::WorkflowState;
use crate::storage::{self, StorageMirror};

pub struct Handle {
	engine: std::sync::Arc<Engine>,
	workflow_id: Uuid,
	workflow_name: String,
}

impl Handle {
	pub fn new(engine: std::sync::Arc<Engine>, workflow_id: Uuid, workflow_name: impl Into<String>) -> Self {
		Handle {
			engine,
			workflow_id,
			workflow_name: workflow_name.into(),
		}
	}

	pub fn workflow_id(&self) -> Uuid {
		self.workflow_id
	}

	/// Drives the workflow to a terminal state, resuming across sleeps and
	/// message waits on its own, and returns the final output or surfaces
	/// the final error.
	pub async fn result(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
		loop {
			match self.engine.run(self.workflow_id, &self.workflow_name, input.clone()).await? {
				RunOutcome::Completed(output) => return Ok(output),
				RunOutcome::Failed(err) | RunOutcome::RolledBack(err) => {
					return Err(anyhow::anyhow!("{}: {}", err.name, err.message));
				}
				RunOutcome::Evicted => return Err(WorkflowError::Evicted.into()),
				RunOutcome::Sleeping { resume_at } => {
					let wait = (resume_at - crate::now_ms()).max(0) as u64;
					tokio::time::sleep(Duration::from_millis(wait)).await;
				}
				RunOutcome::WaitingForMessage { .. } => {
					tokio::time::sleep(self.engine.config.signal_poll_interval).await;
				}
			}
		}
	}

	/// Enqueues a message for this workflow without driving it forward.
	pub async fn message(&self, name: impl Into<String>, body: serde_json::Value) -> anyhow::Result<()> {
		let msg = DriverMessage {
			id: Uuid::new_v4(),
			name: name.into(),
			data: body,
			sent_at: crate::now_ms(),
		};
		self.engine.msg_driver.add_message(self.workflow_id, msg).await
	}

	/// Drives the workflow forward by one run, for a host that wants to
	/// control the resumption cadence itself rather than calling `result`.
	pub async fn wake(&self, input: serde_json::Value) -> anyhow::Result<RunOutcome> {
		self.engine.run(self.workflow_id, &self.workflow_name, input).await
	}

	/// Resets every exhausted step's retry budget so the next run retries it
	/// from attempt zero (spec §4.5).
	pub async fn recover(&self) -> anyhow::Result<()> {
		let mut mirror = StorageMirror::hydrate(self.engine.driver.as_ref(), self.workflow_id).await?;
		storage::recover_exhausted(&mut mirror);
		mirror.set_state(WorkflowState::Pending);
		if let Some(diff) = mirror.build_flush_diff() {
			self.engine.driver.flush(self.workflow_id, diff.clone()).await?;
			mirror.mark_flushed(&diff);
		}
		Ok(())
	}

	/// Graceful stop: cancels the in-flight execution (if any) without
	/// marking the workflow terminal, so a later `run` resumes it.
	pub fn evict(&self) {
		if let Some(cancel) = self.engine.cancel_token_for(self.workflow_id) {
			cancel.cancel();
		}
	}

	/// Full cancellation: evicts the in-flight execution and marks the
	/// workflow `cancelled`, a terminal state.
	pub async fn cancel(&self) -> anyhow::Result<()> {
		self.evict();
		let mut mirror = StorageMirror::hydrate(self.engine.driver.as_ref(), self.workflow_id).await?;
		mirror.set_state(WorkflowState::Cancelled);
		if let Some(diff) = mirror.build_flush_diff() {
			self.engine.driver.flush(self.workflow_id, diff.clone()).await?;
			mirror.mark_flushed(&diff);
		}
		Ok(())
	}

	pub async fn get_state(&self) -> anyhow::Result<WorkflowState> {
		Ok(StorageMirror::hydrate(self.engine.driver.as_ref(), self.workflow_id)
			.await?
			.workflow_state
			.state)
	}

	pub async fn get_output(&self) -> anyhow::Result<Option<serde_json::Value>> {
		Ok(StorageMirror::hydrate(self.engine.driver.as_ref(), self.workflow_id)
			.await?
			.workflow_state
			.output)
	}
}

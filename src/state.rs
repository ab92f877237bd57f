//! Workflow-level state (spec §3 "Workflow-level state", §6 "State machine values").

use serde::{Deserialize, Serialize};

use crate::error::StructuredError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowState {
	#[default]
	Pending,
	Running,
	Sleeping,
	Failed,
	Completed,
	Cancelled,
	RollingBack,
}

impl WorkflowState {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
		)
	}
}

/// In-memory workflow state plus its last-flushed mirror, so the driver only
/// ever receives diffs.
#[derive(Debug, Clone)]
pub struct WorkflowStateBox {
	pub state: WorkflowState,
	pub output: Option<serde_json::Value>,
	pub error: Option<StructuredError>,
	flushed_state: Option<WorkflowState>,
	flushed_output: bool,
	flushed_error: bool,
}

impl WorkflowStateBox {
	pub fn new(state: WorkflowState, output: Option<serde_json::Value>, error: Option<StructuredError>) -> Self {
		WorkflowStateBox {
			flushed_state: Some(state),
			flushed_output: output.is_some(),
			flushed_error: error.is_some(),
			state,
			output,
			error,
		}
	}

	pub fn is_dirty(&self) -> bool {
		self.flushed_state != Some(self.state)
			|| self.flushed_output != self.output.is_some()
			|| self.flushed_error != self.error.is_some()
	}

	pub fn mark_flushed(&mut self) {
		self.flushed_state = Some(self.state);
		self.flushed_output = self.output.is_some();
		self.flushed_error = self.error.is_some();
	}
}

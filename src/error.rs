//! Error taxonomy: control-flow signals and user-visible workflow failures.
//!
//! Both tiers live in one enum, the same way the teacher's workflow engine folds
//! "yield to scheduler" signals and real failures into one `WorkflowError` so a
//! single `anyhow::Error` chain can carry either kind out of a workflow function.
//! Call `is_recoverable` to tell which tier you're looking at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
	/// Yield to the scheduler; resume at `deadline_ts` or when a message matching
	/// `waiting_names` arrives, whichever comes first.
	#[error("workflow sleeps until {deadline_ts}")]
	Sleep {
		deadline_ts: i64,
		waiting_names: Option<Vec<String>>,
	},

	/// Yield indefinitely; resume when a message matching one of `names` arrives.
	#[error("workflow waits for message(s) {0:?}")]
	MessageWait(Vec<String>),

	/// Graceful stop requested by the host via `Handle::evict`.
	#[error("workflow evicted")]
	Evicted,

	/// Raised only during rollback replay: the checkpoint frontier was reached.
	#[error("rollback checkpoint frontier reached")]
	RollbackStop,

	/// Programmer error: a durable operation was invoked while another was
	/// already in flight on the same context.
	#[error("nested durable operation on the same context")]
	EntryInProgress,

	/// One attempt of a step failed; the caller should retry per backoff policy.
	#[error("step `{name}` failed on attempt {attempts}: {cause}")]
	StepFailed {
		name: String,
		#[source]
		cause: anyhow::Error,
		attempts: u32,
	},

	/// A step's retry budget was exhausted.
	#[error("step `{name}` exhausted its retry budget: {last_error}")]
	StepExhausted { name: String, last_error: String },

	/// Structural mismatch between the workflow function's execution and its
	/// recorded history, or a name collision within one scope.
	#[error("history diverged: {0}")]
	HistoryDiverged(String),

	/// A non-retryable failure: user-signaled, a step timeout, or a violated
	/// rollback prerequisite.
	#[error("critical failure: {0}")]
	Critical(String),

	/// The workflow function requests the rollback sequence.
	#[error("rollback requested: {0}")]
	Rollback(String),

	/// At least one `join` branch failed.
	#[error("join failed: {0:?}")]
	Join(BTreeMap<String, String>),

	/// Every `race` branch failed.
	#[error("race failed, all branches errored: {0:?}")]
	Race(Vec<(String, String)>),

	/// Two durable operations at the same enclosing location shared a name
	/// during this run.
	#[error("name `{0}` reused at this scope during this run")]
	DuplicateName(String),

	/// A step registered a rollback action before any `rollback_checkpoint`
	/// was set in this branch.
	#[error("step rollback requires a prior rollback_checkpoint in this branch")]
	RollbackCheckpoint,

	/// `queue.next` was called with a completable message from a previous call
	/// still unacknowledged.
	#[error("a completable message from a previous queue.next is still outstanding")]
	OutstandingCompletable,

	/// A completable message was completed twice.
	#[error("message already completed")]
	AlreadyCompleted,

	/// Opaque failure surfaced by a persistence or message driver.
	#[error(transparent)]
	Driver(#[from] anyhow::Error),
}

impl WorkflowError {
	/// Is this a control-flow signal (vs. a user-visible failure)?
	pub fn is_recoverable(&self) -> bool {
		matches!(
			self,
			WorkflowError::Sleep { .. }
				| WorkflowError::MessageWait(_)
				| WorkflowError::Evicted
				| WorkflowError::RollbackStop
		)
	}

	pub fn deadline_ts(&self) -> Option<i64> {
		match self {
			WorkflowError::Sleep { deadline_ts, .. } => Some(*deadline_ts),
			_ => None,
		}
	}

	pub fn waiting_names(&self) -> Option<&[String]> {
		match self {
			WorkflowError::Sleep { waiting_names, .. } => waiting_names.as_deref(),
			WorkflowError::MessageWait(names) => Some(names.as_slice()),
			_ => None,
		}
	}

	/// Downcast an opaque `anyhow::Error` chain to find a `WorkflowError`, the
	/// same lookup the scheduler uses to decide how a workflow run ended.
	pub fn downcast_chain(err: &anyhow::Error) -> Option<&WorkflowError> {
		err.chain().find_map(|cause| cause.downcast_ref::<WorkflowError>())
	}

	pub fn to_structured(&self) -> StructuredError {
		StructuredError {
			name: self.variant_name().to_string(),
			message: self.to_string(),
			stack: None,
			metadata: None,
		}
	}

	fn variant_name(&self) -> &'static str {
		match self {
			WorkflowError::Sleep { .. } => "Sleep",
			WorkflowError::MessageWait(_) => "MessageWait",
			WorkflowError::Evicted => "Evicted",
			WorkflowError::RollbackStop => "RollbackStop",
			WorkflowError::EntryInProgress => "EntryInProgress",
			WorkflowError::StepFailed { .. } => "StepFailed",
			WorkflowError::StepExhausted { .. } => "StepExhausted",
			WorkflowError::HistoryDiverged(_) => "HistoryDiverged",
			WorkflowError::Critical(_) => "Critical",
			WorkflowError::Rollback(_) => "Rollback",
			WorkflowError::Join(_) => "Join",
			WorkflowError::Race(_) => "Race",
			WorkflowError::DuplicateName(_) => "DuplicateName",
			WorkflowError::RollbackCheckpoint => "RollbackCheckpoint",
			WorkflowError::OutstandingCompletable => "OutstandingCompletable",
			WorkflowError::AlreadyCompleted => "AlreadyCompleted",
			WorkflowError::Driver(_) => "Driver",
		}
	}
}

/// Final persisted error record: `{name, message, stack?, metadata?}` per spec §6/§7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
	pub name: String,
	pub message: String,
	pub stack: Option<String>,
	pub metadata: Option<serde_json::Value>,
}

impl StructuredError {
	pub fn from_anyhow(err: &anyhow::Error) -> Self {
		if let Some(wf_err) = WorkflowError::downcast_chain(err) {
			wf_err.to_structured()
		} else {
			StructuredError {
				name: "Critical".to_string(),
				message: err.to_string(),
				stack: Some(format!("{err:?}")),
				metadata: None,
			}
		}
	}
}

//! Driver boundary (spec §1 Non-goals, §4.2, §5).
//!
//! Storage backend and message transport are explicitly out of scope: a host
//! implements `PersistenceDriver` and `MessageDriver` against whatever it
//! runs on, and optionally `HistoryNotifier` to stream snapshots to a
//! dashboard. [`memory`] ships an in-memory reference pair for tests.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StructuredError;
use crate::history::{Entry, EntryMetadata};
use crate::queue::DriverMessage;
use crate::state::WorkflowState;

/// Everything the storage mirror needs to resume a workflow: the full name
/// registry, every entry and its metadata, any buffered-but-unconsumed
/// messages, and the workflow-level state box.
#[derive(Debug, Clone, Default)]
pub struct HydratedWorkflow {
	pub names: Vec<String>,
	pub entries: Vec<Entry>,
	pub metadata: HashMap<Uuid, EntryMetadata>,
	pub messages: Vec<DriverMessage>,
	pub state: WorkflowState,
	pub output: Option<serde_json::Value>,
	pub error: Option<StructuredError>,
}

impl HydratedWorkflow {
	pub fn fresh() -> Self {
		HydratedWorkflow {
			state: WorkflowState::Pending,
			..Default::default()
		}
	}
}

/// What changed since the last flush. Built by the storage mirror, consumed
/// by a driver in one atomic write.
#[derive(Debug, Clone, Default)]
pub struct FlushDiff {
	pub appended_names: Vec<String>,
	pub upserted_entries: Vec<Entry>,
	pub upserted_metadata: Vec<(Uuid, EntryMetadata)>,
	pub added_messages: Vec<DriverMessage>,
	pub new_state: Option<WorkflowState>,
	pub new_output: Option<serde_json::Value>,
	pub new_error: Option<StructuredError>,
}

impl FlushDiff {
	pub fn is_empty(&self) -> bool {
		self.appended_names.is_empty()
			&& self.upserted_entries.is_empty()
			&& self.upserted_metadata.is_empty()
			&& self.added_messages.is_empty()
			&& self.new_state.is_none()
			&& self.new_output.is_none()
			&& self.new_error.is_none()
	}
}

#[async_trait]
pub trait PersistenceDriver: Send + Sync {
	async fn hydrate(&self, workflow_id: Uuid) -> anyhow::Result<HydratedWorkflow>;

	/// Apply `diff` atomically. Called on every commit point (spec §4.3's
	/// "commits" language): step/loop/sleep/checkpoint settlement and the
	/// scheduler's terminal resolution.
	async fn flush(&self, workflow_id: Uuid, diff: FlushDiff) -> anyhow::Result<()>;

	/// Deletes every entry/metadata row whose location key is in `keys`
	/// (race loser cleanup, loop history trimming).
	async fn delete_entries(&self, workflow_id: Uuid, keys: &[String]) -> anyhow::Result<()>;

	/// How long the scheduler should wait between polls of a sleeping or
	/// signal-waiting workflow absent a push-based wakeup.
	fn worker_poll_interval(&self) -> Duration {
		Duration::from_secs(5)
	}
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveRequest {
	/// Message names to accept; empty means any name.
	pub names: Vec<String>,
	pub count: usize,
	pub completable: bool,
}

#[async_trait]
pub trait MessageDriver: Send + Sync {
	async fn add_message(&self, workflow_id: Uuid, message: DriverMessage) -> anyhow::Result<()>;

	/// Non-blocking claim of up to `req.count` queued messages matching
	/// `req.names`. Returns an empty vec, never blocks, if none are ready.
	async fn receive_messages(
		&self,
		workflow_id: Uuid,
		req: ReceiveRequest,
	) -> anyhow::Result<Vec<DriverMessage>>;

	/// Acknowledges a completable message, recording `response` for whoever
	/// sent it. A no-op for drivers that don't support completable replies.
	async fn complete_message(
		&self,
		_workflow_id: Uuid,
		_id: Uuid,
		_response: Option<serde_json::Value>,
	) -> anyhow::Result<()> {
		Ok(())
	}

	/// Removes queued messages by id, returning the subset actually removed
	/// (already-claimed or unknown ids are silently dropped from the result).
	async fn delete_messages(&self, workflow_id: Uuid, ids: &[Uuid]) -> anyhow::Result<Vec<Uuid>>;
}

/// Optional push channel for dashboards and other observers (spec §4.2's
/// "flush" notes: "a host may additionally stream ... to any subscribed
/// observers").
pub trait HistoryNotifier: Send + Sync {
	fn notify(&self, snapshot: HistorySnapshot);
}

#[derive(Debug, Clone)]
pub struct HistorySnapshot {
	pub workflow_id: Uuid,
	pub names: Vec<String>,
	pub entries: Vec<Entry>,
	pub metadata: HashMap<Uuid, EntryMetadata>,
	pub state: WorkflowState,
}

//! In-memory reference drivers. Not meant for production use — the engine's
//! persistence and transport are host concerns — but a faithful enough
//! implementation of both traits to exercise the whole engine in tests
//! without an external backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{FlushDiff, HydratedWorkflow, MessageDriver, PersistenceDriver, ReceiveRequest};
use crate::history::{Entry, EntryMetadata};
use crate::queue::DriverMessage;

#[derive(Default)]
struct WorkflowRow {
	names: Vec<String>,
	entries: HashMap<String, Entry>,
	metadata: HashMap<Uuid, EntryMetadata>,
	messages: Vec<DriverMessage>,
	state: crate::state::WorkflowState,
	output: Option<serde_json::Value>,
	error: Option<crate::error::StructuredError>,
}

/// `PersistenceDriver` backed by a process-local map. Each flush is applied
/// under a single mutex lock, so it's trivially atomic.
pub struct MemoryDriver {
	rows: Mutex<HashMap<Uuid, WorkflowRow>>,
	poll_interval: Duration,
}

impl MemoryDriver {
	pub fn new() -> Self {
		MemoryDriver {
			rows: Mutex::new(HashMap::new()),
			poll_interval: Duration::from_millis(50),
		}
	}

	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}
}

impl Default for MemoryDriver {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl PersistenceDriver for MemoryDriver {
	async fn hydrate(&self, workflow_id: Uuid) -> anyhow::Result<HydratedWorkflow> {
		let rows = self.rows.lock().unwrap();
		match rows.get(&workflow_id) {
			Some(row) => Ok(HydratedWorkflow {
				names: row.names.clone(),
				entries: row.entries.values().cloned().collect(),
				metadata: row.metadata.clone(),
				messages: row.messages.clone(),
				state: row.state,
				output: row.output.clone(),
				error: row.error.clone(),
			}),
			None => Ok(HydratedWorkflow::fresh()),
		}
	}

	async fn flush(&self, workflow_id: Uuid, diff: FlushDiff) -> anyhow::Result<()> {
		let mut rows = self.rows.lock().unwrap();
		let row = rows.entry(workflow_id).or_default();

		row.names.extend(diff.appended_names);
		for entry in diff.upserted_entries {
			row.entries.insert(entry.location.to_key(), entry);
		}
		for (id, meta) in diff.upserted_metadata {
			row.metadata.insert(id, meta);
		}
		for msg in diff.added_messages {
			row.messages.push(msg);
		}
		if let Some(state) = diff.new_state {
			row.state = state;
		}
		if diff.new_output.is_some() {
			row.output = diff.new_output;
		}
		if diff.new_error.is_some() {
			row.error = diff.new_error;
		}
		Ok(())
	}

	async fn delete_entries(&self, workflow_id: Uuid, keys: &[String]) -> anyhow::Result<()> {
		let mut rows = self.rows.lock().unwrap();
		if let Some(row) = rows.get_mut(&workflow_id) {
			for key in keys {
				row.entries.remove(key);
			}
		}
		Ok(())
	}

	fn worker_poll_interval(&self) -> Duration {
		self.poll_interval
	}
}

/// `MessageDriver` backed by a process-local FIFO per workflow. Completable
/// responses are stashed so tests can assert on them.
pub struct MemoryMessageDriver {
	queues: Mutex<HashMap<Uuid, Vec<DriverMessage>>>,
	completions: Mutex<HashMap<Uuid, serde_json::Value>>,
}

impl MemoryMessageDriver {
	pub fn new() -> Self {
		MemoryMessageDriver {
			queues: Mutex::new(HashMap::new()),
			completions: Mutex::new(HashMap::new()),
		}
	}

	pub fn completion_of(&self, message_id: Uuid) -> Option<serde_json::Value> {
		self.completions.lock().unwrap().get(&message_id).cloned()
	}
}

impl Default for MemoryMessageDriver {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl MessageDriver for MemoryMessageDriver {
	async fn add_message(&self, workflow_id: Uuid, message: DriverMessage) -> anyhow::Result<()> {
		self.queues.lock().unwrap().entry(workflow_id).or_default().push(message);
		Ok(())
	}

	async fn receive_messages(
		&self,
		workflow_id: Uuid,
		req: ReceiveRequest,
	) -> anyhow::Result<Vec<DriverMessage>> {
		let mut queues = self.queues.lock().unwrap();
		let Some(queue) = queues.get_mut(&workflow_id) else {
			return Ok(Vec::new());
		};
		let mut taken = Vec::new();
		let mut remaining = Vec::new();
		for msg in queue.drain(..) {
			let matches = req.names.is_empty() || req.names.contains(&msg.name);
			if matches && taken.len() < req.count.max(1) {
				taken.push(msg);
			} else {
				remaining.push(msg);
			}
		}
		*queue = remaining;
		Ok(taken)
	}

	async fn complete_message(
		&self,
		_workflow_id: Uuid,
		id: Uuid,
		response: Option<serde_json::Value>,
	) -> anyhow::Result<()> {
		if let Some(response) = response {
			self.completions.lock().unwrap().insert(id, response);
		}
		Ok(())
	}

	async fn delete_messages(&self, workflow_id: Uuid, ids: &[Uuid]) -> anyhow::Result<Vec<Uuid>> {
		let mut queues = self.queues.lock().unwrap();
		let Some(queue) = queues.get_mut(&workflow_id) else {
			return Ok(Vec::new());
		};
		let mut removed = Vec::new();
		queue.retain(|msg| {
			if ids.contains(&msg.id) {
				removed.push(msg.id);
				false
			} else {
				true
			}
		});
		Ok(removed)
	}
}

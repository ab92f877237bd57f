//! The in-process mirror of a workflow's durable state (spec §4.2).
//!
//! Every durable op reads and writes this mirror; a flush diffs it against
//! what was last persisted and hands the driver only what changed.

use std::collections::HashMap;

use itertools::Itertools;
use uuid::Uuid;

use crate::db::{FlushDiff, HistorySnapshot, HydratedWorkflow, PersistenceDriver};
use crate::error::StructuredError;
use crate::history::{Entry, EntryMetadata};
use crate::location::Location;
use crate::queue::DriverMessage;
use crate::registry::NameRegistry;
use crate::state::{WorkflowState, WorkflowStateBox};

pub struct StorageMirror {
	pub names: NameRegistry,
	pub entries: HashMap<String, Entry>,
	pub metadata: HashMap<Uuid, EntryMetadata>,
	pub messages: Vec<DriverMessage>,
	pub workflow_state: WorkflowStateBox,
	added_messages: Vec<DriverMessage>,
}

impl StorageMirror {
	pub async fn hydrate(driver: &dyn PersistenceDriver, workflow_id: Uuid) -> anyhow::Result<Self> {
		let hydrated: HydratedWorkflow = driver.hydrate(workflow_id).await?;
		Ok(Self::from_hydrated(hydrated))
	}

	fn from_hydrated(hydrated: HydratedWorkflow) -> Self {
		let entries = hydrated
			.entries
			.into_iter()
			.map(|e| (e.location.to_key(), e))
			.collect();

		StorageMirror {
			names: NameRegistry::from_persisted(hydrated.names),
			entries,
			metadata: hydrated.metadata,
			messages: hydrated.messages,
			workflow_state: WorkflowStateBox::new(hydrated.state, hydrated.output, hydrated.error),
			added_messages: Vec::new(),
		}
	}

	pub fn get_entry(&self, location: &Location) -> Option<&Entry> {
		self.entries.get(&location.to_key())
	}

	pub fn get_entry_mut(&mut self, location: &Location) -> Option<&mut Entry> {
		self.entries.get_mut(&location.to_key())
	}

	pub fn set_entry(&mut self, mut entry: Entry) {
		entry.dirty = true;
		self.entries.insert(entry.location.to_key(), entry);
	}

	pub fn get_or_create_metadata(&mut self, entry_id: Uuid, now: i64) -> &mut EntryMetadata {
		self.metadata.entry(entry_id).or_insert_with(|| EntryMetadata::pending_new(now))
	}

	pub fn add_message(&mut self, message: DriverMessage) {
		self.messages.push(message.clone());
		self.added_messages.push(message);
	}

	pub fn remove_message(&mut self, id: Uuid) {
		self.messages.retain(|m| m.id != id);
	}

	/// Collects every entry/metadata key whose location is `prefix` or a
	/// descendant of it (race loser cleanup, loop history trimming).
	pub fn collect_prefix_keys(&self, prefix: &Location) -> Vec<String> {
		let prefix_key = prefix.to_key();
		self.entries
			.keys()
			.filter(|key| key_is_under(key, &prefix_key))
			.cloned()
			.collect()
	}

	/// Same as [`Self::collect_prefix_keys`] but over several prefixes at
	/// once, deduplicated — so a caller deleting many subtrees in one pass
	/// (race loser cleanup across several branches) issues a single driver
	/// call instead of one per prefix.
	pub fn collect_prefix_keys_multi(&self, prefixes: &[Location]) -> Vec<String> {
		prefixes
			.iter()
			.flat_map(|p| self.collect_prefix_keys(p))
			.unique()
			.collect()
	}

	pub fn remove_keys(&mut self, keys: &[String]) {
		for key in keys {
			self.entries.remove(key);
		}
	}

	/// Builds the diff to hand a driver, or `None` if nothing changed since
	/// the last flush.
	pub fn build_flush_diff(&mut self) -> Option<FlushDiff> {
		let appended_names = self.names.unflushed_tail().to_vec();
		let upserted_entries: Vec<Entry> = self.entries.values().filter(|e| e.dirty).cloned().collect();
		let upserted_metadata: Vec<(Uuid, EntryMetadata)> = self
			.metadata
			.iter()
			.filter(|(_, m)| m.dirty)
			.map(|(id, m)| (*id, m.clone()))
			.collect();
		let added_messages = std::mem::take(&mut self.added_messages);

		let diff = FlushDiff {
			appended_names,
			upserted_entries,
			upserted_metadata,
			added_messages,
			new_state: self.workflow_state.is_dirty().then_some(self.workflow_state.state),
			new_output: self.workflow_state.output.clone(),
			new_error: self.workflow_state.error.clone(),
		};

		if diff.is_empty() {
			None
		} else {
			Some(diff)
		}
	}

	/// Clears dirty flags for everything included in `diff`. Call only after
	/// the driver has confirmed the flush.
	pub fn mark_flushed(&mut self, diff: &FlushDiff) {
		self.names.mark_flushed();
		for entry in &diff.upserted_entries {
			if let Some(e) = self.entries.get_mut(&entry.location.to_key()) {
				e.dirty = false;
			}
		}
		for (id, _) in &diff.upserted_metadata {
			if let Some(m) = self.metadata.get_mut(id) {
				m.dirty = false;
			}
		}
		self.workflow_state.mark_flushed();
	}

	pub fn set_state(&mut self, state: WorkflowState) {
		self.workflow_state.state = state;
	}

	pub fn set_output(&mut self, output: serde_json::Value) {
		self.workflow_state.output = Some(output);
	}

	pub fn set_error(&mut self, error: StructuredError) {
		self.workflow_state.error = Some(error);
	}

	pub fn snapshot(&self, workflow_id: Uuid) -> HistorySnapshot {
		HistorySnapshot {
			workflow_id,
			names: self.names.names().to_vec(),
			entries: self.entries.values().cloned().collect(),
			metadata: self.metadata.clone(),
			state: self.workflow_state.state,
		}
	}
}

fn key_is_under(key: &str, prefix_key: &str) -> bool {
	if prefix_key.is_empty() {
		true
	} else {
		key == prefix_key || key.starts_with(&format!("{prefix_key}/"))
	}
}

/// Convenience used by `Handle::recover` (spec §4.5): resets every exhausted
/// step's metadata so the next run retries it from attempt 0.
pub fn recover_exhausted(mirror: &mut StorageMirror) {
	for meta in mirror.metadata.values_mut() {
		if meta.status == crate::history::MetaStatus::Exhausted {
			meta.recover();
		}
	}
}

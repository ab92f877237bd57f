//! History entry kinds and payloads (spec §3 "Entry"/"Kind payloads").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::location::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BranchStatus {
	Pending,
	Running,
	Completed,
	Failed,
	Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
	pub status: BranchStatus,
	pub output: Option<serde_json::Value>,
	pub error: Option<String>,
}

impl BranchRecord {
	pub fn pending() -> Self {
		BranchRecord {
			status: BranchStatus::Pending,
			output: None,
			error: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SleepState {
	Pending,
	Completed,
	Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntryKind {
	Step {
		output: Option<serde_json::Value>,
		error: Option<String>,
	},
	Loop {
		state: serde_json::Value,
		iteration: u64,
		output: Option<serde_json::Value>,
	},
	Sleep {
		deadline_ts: i64,
		state: SleepState,
	},
	/// Used both for recorded queue-receive outcomes (`data` is the message
	/// body) and for count markers (`name` ends in `:count`, `data` is an
	/// integer).
	Message {
		name: String,
		data: serde_json::Value,
	},
	RollbackCheckpoint {
		name: String,
	},
	Join {
		branches: BTreeMap<String, BranchRecord>,
	},
	Race {
		winner: Option<String>,
		branches: BTreeMap<String, BranchRecord>,
	},
	Removed {
		original_type: String,
		original_name: Option<String>,
	},
}

impl EntryKind {
	pub fn type_name(&self) -> &'static str {
		match self {
			EntryKind::Step { .. } => "step",
			EntryKind::Loop { .. } => "loop",
			EntryKind::Sleep { .. } => "sleep",
			EntryKind::Message { .. } => "message",
			EntryKind::RollbackCheckpoint { .. } => "rollback_checkpoint",
			EntryKind::Join { .. } => "join",
			EntryKind::Race { .. } => "race",
			EntryKind::Removed { .. } => "removed",
		}
	}

	pub fn is_completed(&self) -> bool {
		match self {
			EntryKind::Step { output, .. } => output.is_some(),
			EntryKind::Loop { output, .. } => output.is_some(),
			EntryKind::Sleep { state, .. } => !matches!(state, SleepState::Pending),
			_ => true,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
	pub id: Uuid,
	pub location: Location,
	pub kind: EntryKind,
	#[serde(skip)]
	pub dirty: bool,
}

impl Entry {
	pub fn new(id: Uuid, location: Location, kind: EntryKind) -> Self {
		Entry {
			id,
			location,
			kind,
			dirty: true,
		}
	}
}

//! Entry metadata (spec §3 "Entry metadata").
//!
//! Loaded lazily alongside entries. Drives retry scheduling and is
//! authoritative for "has this attempt succeeded" — history payloads remain
//! authoritative for the *result* (invariant: completed-once).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MetaStatus {
	Pending,
	Running,
	Completed,
	Failed,
	Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
	pub status: MetaStatus,
	pub error: Option<String>,
	pub attempts: u32,
	pub last_attempt_at: Option<i64>,
	pub created_at: i64,
	pub completed_at: Option<i64>,
	pub rollback_completed_at: Option<i64>,
	pub rollback_error: Option<String>,
	#[serde(skip)]
	pub dirty: bool,
}

impl EntryMetadata {
	pub fn pending_new(now: i64) -> Self {
		EntryMetadata {
			status: MetaStatus::Pending,
			error: None,
			attempts: 0,
			last_attempt_at: None,
			created_at: now,
			completed_at: None,
			rollback_completed_at: None,
			rollback_error: None,
			dirty: true,
		}
	}

	pub fn mark_running(&mut self, now: i64) {
		self.status = MetaStatus::Running;
		self.attempts += 1;
		self.last_attempt_at = Some(now);
		self.dirty = true;
	}

	pub fn mark_completed(&mut self, now: i64) {
		self.status = MetaStatus::Completed;
		self.error = None;
		self.completed_at = Some(now);
		self.dirty = true;
	}

	pub fn mark_failed(&mut self, error: String) {
		self.status = MetaStatus::Failed;
		self.error = Some(error);
		self.dirty = true;
	}

	pub fn mark_exhausted(&mut self, error: String) {
		self.status = MetaStatus::Exhausted;
		self.error = Some(error);
		self.dirty = true;
	}

	pub fn mark_rollback_completed(&mut self, now: i64) {
		self.rollback_completed_at = Some(now);
		self.rollback_error = None;
		self.dirty = true;
	}

	pub fn mark_rollback_failed(&mut self, error: String) {
		self.rollback_error = Some(error);
		self.dirty = true;
	}

	/// Used by `Handle::recover`: resets an exhausted step so it will be
	/// retried from attempt 0 again.
	pub fn recover(&mut self) {
		self.status = MetaStatus::Pending;
		self.attempts = 0;
		self.error = None;
		self.dirty = true;
	}
}

//! Message queue wire shape (spec §6 "Queue message wire shape").
//!
//! A completable queue message is persisted inside a `message` entry's `data`
//! as an object tagged with a fixed marker field. Non-completable messages
//! persist the body alone. Drivers and this crate must round-trip this shape
//! byte-for-byte to preserve replay.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker field tagging a completable message body in history, distinguishing
/// it from a plain (non-completable) body at the same `message` entry.
pub const COMPLETABLE_MARKER: &str = "__flowline_completable";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletableBody {
	#[serde(rename = "__flowline_completable")]
	pub marker: bool,
	pub id: Uuid,
	pub name: String,
	pub body: serde_json::Value,
	pub created_at: i64,
	pub completed: bool,
}

/// A message as delivered by the message driver, before it's written into
/// history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverMessage {
	pub id: Uuid,
	pub name: String,
	pub data: serde_json::Value,
	pub sent_at: i64,
}

/// A message reconstructed from history (fresh receive or replay) and handed
/// back to workflow code.
#[derive(Debug, Clone)]
pub struct WorkflowQueueMessage {
	pub id: Uuid,
	pub name: String,
	pub body: serde_json::Value,
	pub created_at: i64,
	completable: bool,
	completed: bool,
}

impl WorkflowQueueMessage {
	pub fn plain(id: Uuid, name: String, body: serde_json::Value, created_at: i64) -> Self {
		WorkflowQueueMessage {
			id,
			name,
			body,
			created_at,
			completable: false,
			completed: false,
		}
	}

	pub fn completable(
		id: Uuid,
		name: String,
		body: serde_json::Value,
		created_at: i64,
		completed: bool,
	) -> Self {
		WorkflowQueueMessage {
			id,
			name,
			body,
			created_at,
			completable: true,
			completed,
		}
	}

	pub fn is_completable(&self) -> bool {
		self.completable
	}

	pub fn is_completed(&self) -> bool {
		self.completed
	}

	/// Serializes to the history wire shape for this message's `<name>:i` entry.
	pub fn to_entry_data(&self) -> serde_json::Value {
		if self.completable {
			serde_json::to_value(CompletableBody {
				marker: true,
				id: self.id,
				name: self.name.clone(),
				body: self.body.clone(),
				created_at: self.created_at,
				completed: self.completed,
			})
			.expect("serializable")
		} else {
			self.body.clone()
		}
	}

	/// Reconstructs a message from a persisted `message` entry's `data`.
	pub fn from_entry_data(data: &serde_json::Value) -> Self {
		if let Ok(completable) = serde_json::from_value::<CompletableBody>(data.clone()) {
			if completable.marker {
				return WorkflowQueueMessage::completable(
					completable.id,
					completable.name,
					completable.body,
					completable.created_at,
					completable.completed,
				);
			}
		}

		WorkflowQueueMessage::plain(Uuid::nil(), String::new(), data.clone(), 0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn completable_body_round_trips() {
		let msg = WorkflowQueueMessage::completable(
			Uuid::new_v4(),
			"approve".to_string(),
			serde_json::json!({"amount": 5}),
			1000,
			false,
		);
		let data = msg.to_entry_data();
		let restored = WorkflowQueueMessage::from_entry_data(&data);
		assert!(restored.is_completable());
		assert!(!restored.is_completed());
		assert_eq!(restored.name, "approve");
		assert_eq!(restored.body, serde_json::json!({"amount": 5}));
	}

	#[test]
	fn plain_body_round_trips_as_bare_value() {
		let msg = WorkflowQueueMessage::plain(
			Uuid::new_v4(),
			"ping".to_string(),
			serde_json::json!("hello"),
			1000,
		);
		let data = msg.to_entry_data();
		assert_eq!(data, serde_json::json!("hello"));
	}
}

//! S7 (spec §8): `queue.next` with a timeout and no matching message yields
//! `Sleep` until the deadline, then resolves to an empty result once the
//! deadline passes — and replaying a resolved wait must not re-consult the
//! message driver.

use std::sync::Arc;
use std::time::Duration;

use flowline::db::memory::{MemoryDriver, MemoryMessageDriver};
use flowline::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn real_now_ms() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap()
		.as_millis() as i64
}

async fn advance_past(resume_at: i64) {
	let wait = (resume_at - real_now_ms()).max(0) as u64 + 5;
	tokio::time::advance(Duration::from_millis(wait)).await;
}

#[tokio::test(start_paused = true)]
async fn queue_next_times_out_to_empty_and_replay_is_stable() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());

	let mut registry = WorkflowRegistry::new();
	registry.register("waiter", |mut ctx: Context, _input: serde_json::Value| async move {
		let messages = ctx
			.queue_next("approval", QueueNextOptions::new().timeout(Duration::from_secs(60)))
			.await?;
		Ok::<usize, anyhow::Error>(messages.len())
	});

	let engine = Engine::new(driver, msg_driver, registry);
	let workflow_id = Uuid::new_v4();

	let outcome = engine.run(workflow_id, "waiter", json!(null)).await.unwrap();
	let resume_at = match outcome {
		RunOutcome::Sleeping { resume_at } => resume_at,
		other => panic!("expected Sleeping while waiting on the queue, got {other:?}"),
	};
	advance_past(resume_at).await;

	let outcome = engine.run(workflow_id, "waiter", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Completed(output) => assert_eq!(output, json!(0), "no message arrived before the deadline"),
		other => panic!("expected Completed with zero messages, got {other:?}"),
	}

	// Replay purity: a workflow that has already reached a terminal state
	// must hand back the same recorded outcome on a later `run` rather than
	// re-driving the function and re-querying the message driver.
	let outcome = engine.run(workflow_id, "waiter", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Completed(output) => assert_eq!(output, json!(0)),
		other => panic!("expected Completed again on replay, got {other:?}"),
	}
}

//! S3 (spec §8): `race` resolves to the first branch to settle, cancels and
//! deletes the history of the others, and a slower branch woken only by a
//! later run must not win once the fast branch has already completed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowline::db::memory::{MemoryDriver, MemoryMessageDriver};
use flowline::prelude::*;
use serde_json::json;
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn fast_branch_wins_and_slow_branch_history_is_deleted() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());
	let slow_calls = Arc::new(AtomicU32::new(0));

	let mut registry = WorkflowRegistry::new();
	let slow_reg = slow_calls.clone();
	registry.register("racer", move |mut ctx: Context, _input: serde_json::Value| {
		let slow_calls = slow_reg.clone();
		async move {
			let branches: Vec<(String, BranchFn)> = vec![
				(
					"fast".to_string(),
					Box::new(move |mut bctx: Context| {
						Box::pin(async move {
							let v = bctx.step("fast_step", |_| async move { Ok::<i64, anyhow::Error>(7) }).await?;
							Ok(json!(v))
						})
					}),
				),
				(
					"slow".to_string(),
					Box::new(move |mut bctx: Context| {
						let slow_calls = slow_calls.clone();
						Box::pin(async move {
							bctx.sleep("slow_nap", Duration::from_secs(3600)).await?;
							let v = bctx
								.step("slow_step", {
									let slow_calls = slow_calls.clone();
									move |_| {
										let slow_calls = slow_calls.clone();
										async move {
											slow_calls.fetch_add(1, Ordering::SeqCst);
											Ok::<i64, anyhow::Error>(99)
										}
									}
								})
								.await?;
							Ok(json!(v))
						})
					}),
				),
			];
			let winner = ctx.race("r", branches).await?;
			Ok::<serde_json::Value, anyhow::Error>(winner)
		}
	});

	let engine = Engine::new(driver.clone(), msg_driver, registry);
	let workflow_id = Uuid::new_v4();

	let outcome = engine.run(workflow_id, "racer", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Completed(output) => assert_eq!(output, json!(7)),
		other => panic!("expected the fast branch to win immediately, got {other:?}"),
	}
	assert_eq!(slow_calls.load(Ordering::SeqCst), 0, "the losing branch must never run its step");

	// The slow branch's entries (its sleep and, had it run, its step) must
	// have been deleted once a winner was recorded (spec §4.3.7 step 5) — the
	// only entries left are the race itself and the winning branch's step.
	let hydrated = driver.hydrate(workflow_id).await.unwrap();
	let has_sleep_entry = hydrated.entries.iter().any(|e| matches!(e.kind, EntryKind::Sleep { .. }));
	assert!(!has_sleep_entry, "loser branch's sleep entry must be pruned after the race settles");
}

//! S2 (spec §8): a durable `sleep` yields `Sleep` with the deadline computed
//! on first entry, and resuming after the deadline passes without re-running
//! anything before the sleep.

use std::sync::atomic::{AtomicU32, Ordering};
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
async fn sleep_yields_then_resumes_past_deadline() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());
	let before_sleep_calls = Arc::new(AtomicU32::new(0));
	let after_sleep_calls = Arc::new(AtomicU32::new(0));

	let mut registry = WorkflowRegistry::new();
	let before_reg = before_sleep_calls.clone();
	let after_reg = after_sleep_calls.clone();
	registry.register("naps", move |mut ctx: Context, _input: serde_json::Value| {
		let before = before_reg.clone();
		let after = after_reg.clone();
		async move {
			let output = ctx
				.step("before", {
					let before = before.clone();
					move |_| {
						let before = before.clone();
						async move {
							before.fetch_add(1, Ordering::SeqCst);
							Ok::<i64, anyhow::Error>(1)
						}
					}
				})
				.await?;
			ctx.sleep("nap", Duration::from_secs(3600)).await?;
			let output2 = ctx
				.step("after", {
					let after = after.clone();
					move |_| {
						let after = after.clone();
						async move {
							after.fetch_add(1, Ordering::SeqCst);
							Ok::<i64, anyhow::Error>(2)
						}
					}
				})
				.await?;
			Ok::<i64, anyhow::Error>(output + output2)
		}
	});

	let engine = Engine::new(driver, msg_driver, registry);
	let workflow_id = Uuid::new_v4();

	let started_at = real_now_ms();
	let outcome = engine.run(workflow_id, "naps", json!(null)).await.unwrap();
	let resume_at = match outcome {
		RunOutcome::Sleeping { resume_at } => resume_at,
		other => panic!("expected Sleeping, got {other:?}"),
	};
	assert!(
		resume_at >= started_at + Duration::from_secs(3600).as_millis() as i64,
		"sleep deadline must be at least now + duration"
	);
	assert_eq!(before_sleep_calls.load(Ordering::SeqCst), 1);
	assert_eq!(after_sleep_calls.load(Ordering::SeqCst), 0);

	// Resuming before the deadline must yield Sleep again without progress.
	let outcome = engine.run(workflow_id, "naps", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Sleeping { resume_at: r2 } => assert_eq!(r2, resume_at),
		other => panic!("expected Sleeping again before the deadline, got {other:?}"),
	}
	assert_eq!(before_sleep_calls.load(Ordering::SeqCst), 1, "replay must not re-run the completed step");

	advance_past(resume_at).await;

	let outcome = engine.run(workflow_id, "naps", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Completed(output) => assert_eq!(output, json!(3)),
		other => panic!("expected Completed after the deadline, got {other:?}"),
	}
	assert_eq!(before_sleep_calls.load(Ordering::SeqCst), 1, "sleep resume must not re-run the step before it");
	assert_eq!(after_sleep_calls.load(Ordering::SeqCst), 1);
}

//! S1 (spec §8): a step that fails twice then succeeds retries on the
//! engine's deterministic backoff schedule and completes with the right
//! output, invoking the user body exactly as many times as it actually ran.

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
async fn step_retries_then_completes() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());
	let calls = Arc::new(AtomicU32::new(0));

	let mut registry = WorkflowRegistry::new();
	let calls_reg = calls.clone();
	registry.register("flaky", move |mut ctx: Context, _input: serde_json::Value| {
		let calls = calls_reg.clone();
		async move {
			let calls = calls.clone();
			let output = ctx
				.step("op", move |_step_ctx| {
					let calls = calls.clone();
					async move {
						let n = calls.fetch_add(1, Ordering::SeqCst);
						if n < 2 {
							anyhow::bail!("transient failure #{n}");
						}
						Ok::<i64, anyhow::Error>(42)
					}
				})
				.await?;
			Ok::<i64, anyhow::Error>(output)
		}
	});

	let engine = Engine::new(driver, msg_driver, registry);
	let workflow_id = Uuid::new_v4();

	// Run 1: first attempt fails, engine yields Sleep for the backoff window.
	let outcome = engine.run(workflow_id, "flaky", json!(null)).await.unwrap();
	let resume_at = match outcome {
		RunOutcome::Sleeping { resume_at } => resume_at,
		other => panic!("expected Sleeping after first failure, got {other:?}"),
	};
	advance_past(resume_at).await;

	// Run 2: second attempt fails, yields Sleep again with a longer backoff.
	let outcome = engine.run(workflow_id, "flaky", json!(null)).await.unwrap();
	let resume_at = match outcome {
		RunOutcome::Sleeping { resume_at } => resume_at,
		other => panic!("expected Sleeping after second failure, got {other:?}"),
	};
	advance_past(resume_at).await;

	// Run 3: third attempt succeeds.
	let outcome = engine.run(workflow_id, "flaky", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Completed(output) => assert_eq!(output, json!(42)),
		other => panic!("expected Completed, got {other:?}"),
	}

	assert_eq!(calls.load(Ordering::SeqCst), 3, "run body should execute exactly 3 times");

	// Replay purity (invariant 1/4): re-running after completion must not
	// invoke the step body again.
	let outcome = engine.run(workflow_id, "flaky", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Completed(output) => assert_eq!(output, json!(42)),
		other => panic!("expected Completed on replay, got {other:?}"),
	}
	assert_eq!(calls.load(Ordering::SeqCst), 3, "replay must not re-invoke a completed step");
}

#[tokio::test(start_paused = true)]
async fn step_exhausts_after_max_retries() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());
	let calls = Arc::new(AtomicU32::new(0));

	let mut registry = WorkflowRegistry::new();
	let calls_reg = calls.clone();
	registry.register("always_fails", move |mut ctx: Context, _input: serde_json::Value| {
		let calls = calls_reg.clone();
		async move {
			let calls = calls.clone();
			let output: i64 = ctx
				.step_with(StepConfig::new("op").max_retries(1), move |_step_ctx| {
					let calls = calls.clone();
					async move {
						calls.fetch_add(1, Ordering::SeqCst);
						anyhow::bail!("always fails");
						#[allow(unreachable_code)]
						Ok::<i64, anyhow::Error>(0)
					}
				})
				.await?;
			Ok::<i64, anyhow::Error>(output)
		}
	});

	let engine = Engine::new(driver, msg_driver, registry);
	let workflow_id = Uuid::new_v4();

	let outcome = engine.run(workflow_id, "always_fails", json!(null)).await.unwrap();
	let resume_at = match outcome {
		RunOutcome::Sleeping { resume_at } => resume_at,
		other => panic!("expected Sleeping after first failure, got {other:?}"),
	};
	advance_past(resume_at).await;

	let outcome = engine.run(workflow_id, "always_fails", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Failed(err) => assert_eq!(err.name, "StepExhausted"),
		other => panic!("expected Failed(StepExhausted), got {other:?}"),
	}
	// maxRetries=1 means the second run finds attempts(1) >= maxRetries(1)
	// and exhausts without a second invocation (invariant 6: invocations <= N+1,
	// here the engine stops at exactly N).
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

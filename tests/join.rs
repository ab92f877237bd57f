//! S4 (spec §8): `join` waits for every branch to settle (no short-circuit on
//! failure) and reports every failing branch together; replaying after a
//! partial settle must not re-invoke a branch that already completed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use flowline::db::memory::{MemoryDriver, MemoryMessageDriver};
use flowline::prelude::*;
use serde_json::json;
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn join_reports_every_failure_and_does_not_short_circuit() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());
	let ok_calls = Arc::new(AtomicU32::new(0));

	let mut registry = WorkflowRegistry::new();
	let ok_reg = ok_calls.clone();
	registry.register("joiner", move |mut ctx: Context, _input: serde_json::Value| {
		let ok_calls = ok_reg.clone();
		async move {
			let branches: Vec<(String, BranchFn)> = vec![
				(
					"ok".to_string(),
					Box::new({
						let ok_calls = ok_calls.clone();
						move |mut bctx: Context| {
							let ok_calls = ok_calls.clone();
							Box::pin(async move {
								let v = bctx
									.step("ok_step", {
										let ok_calls = ok_calls.clone();
										move |_| {
											let ok_calls = ok_calls.clone();
											async move {
												ok_calls.fetch_add(1, Ordering::SeqCst);
												Ok::<i64, anyhow::Error>(10)
											}
										}
									})
									.await?;
								Ok(json!(v))
							})
						}
					}),
				),
				(
					"bad".to_string(),
					Box::new(move |mut bctx: Context| {
						Box::pin(async move {
							bctx.step_with(StepConfig::new("bad_step").max_retries(0), |_| async move {
								anyhow::bail!("boom");
								#[allow(unreachable_code)]
								Ok::<i64, anyhow::Error>(0)
							})
							.await?;
							Ok(json!(null))
						})
					}),
				),
			];
			let outputs = ctx.join("j", branches).await?;
			Ok::<_, anyhow::Error>(outputs)
		}
	});

	let engine = Engine::new(driver, msg_driver, registry);
	let workflow_id = Uuid::new_v4();

	// `bad_step` has zero retry budget, but its first failure is still a
	// retryable signal (`Sleep`), not an immediate exhaustion — the exhaustion
	// check only fires on the *next* attempt. Because `join` waits for every
	// branch to settle, the whole join yields `Sleep` on run 1 even though
	// `ok` already completed.
	let outcome = engine.run(workflow_id, "joiner", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Sleeping { .. } => {}
		other => panic!("expected Sleeping (bad branch retrying), got {other:?}"),
	}
	assert_eq!(ok_calls.load(Ordering::SeqCst), 1);

	// Replaying must not re-invoke the already-completed `ok` branch.
	tokio::time::advance(std::time::Duration::from_secs(3600)).await;
	let outcome = engine.run(workflow_id, "joiner", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Failed(err) => {
			assert_eq!(err.name, "Join");
			assert!(err.message.contains("bad"), "join failure message should name the failing branch");
		}
		other => panic!("expected the bad branch to exhaust its retries and fail the join, got {other:?}"),
	}
	assert_eq!(ok_calls.load(Ordering::SeqCst), 1, "replay must not re-invoke the completed `ok` branch");
}

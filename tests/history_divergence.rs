//! S6 (spec §8): a code change that stops visiting a previously-recorded
//! entry is caught as `HistoryDiverged` rather than silently producing a
//! different result, and `ctx.removed()` is the documented way to
//! acknowledge an intentionally dropped entry and let replay proceed.

use std::sync::Arc;
use std::time::Duration;

use flowline::db::memory::{MemoryDriver, MemoryMessageDriver};
use flowline::prelude::*;
use serde_json::json;
use uuid::Uuid;

const WORKFLOW_NAME: &str = "flow";

#[tokio::test(start_paused = true)]
async fn removed_step_is_flagged_then_acknowledged() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());
	let workflow_id = Uuid::new_v4();

	// Version 1: records a step and a sleep, then yields (non-terminal).
	let mut registry_v1 = WorkflowRegistry::new();
	registry_v1.register(WORKFLOW_NAME, |mut ctx: Context, _input: serde_json::Value| async move {
		ctx.step("a", |_| async move { Ok::<i64, anyhow::Error>(1) }).await?;
		ctx.sleep("nap", Duration::from_secs(3600)).await?;
		Ok::<i64, anyhow::Error>(1)
	});
	let engine_v1 = Engine::new(driver.clone(), msg_driver.clone(), registry_v1);
	let outcome = engine_v1.run(workflow_id, WORKFLOW_NAME, json!(null)).await.unwrap();
	assert!(matches!(outcome, RunOutcome::Sleeping { .. }));

	// Version 2: the step and sleep were dropped from the code, without
	// telling the engine — history still has them, so replay must diverge.
	let mut registry_v2 = WorkflowRegistry::new();
	registry_v2.register(WORKFLOW_NAME, |_ctx: Context, _input: serde_json::Value| async move {
		Ok::<i64, anyhow::Error>(0)
	});
	let engine_v2 = Engine::new(driver.clone(), msg_driver.clone(), registry_v2);
	let outcome = engine_v2.run(workflow_id, WORKFLOW_NAME, json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Failed(err) => assert_eq!(err.name, "HistoryDiverged"),
		other => panic!("expected HistoryDiverged, got {other:?}"),
	}

	// Recover from the failure (resets to `Pending`) and try again with a
	// version that explicitly acknowledges both dropped entries.
	let engine_v2 = Arc::new(engine_v2);
	let handle = Handle::new(engine_v2.clone(), workflow_id, WORKFLOW_NAME);
	handle.recover().await.unwrap();

	let mut registry_v3 = WorkflowRegistry::new();
	registry_v3.register(WORKFLOW_NAME, |mut ctx: Context, _input: serde_json::Value| async move {
		ctx.removed("a", "step").await?;
		ctx.removed("nap", "sleep").await?;
		Ok::<i64, anyhow::Error>(0)
	});
	let engine_v3 = Engine::new(driver, msg_driver, registry_v3);
	let outcome = engine_v3.run(workflow_id, WORKFLOW_NAME, json!(null)).await.unwrap();
	match outcome {
		RunOutcome::Completed(output) => assert_eq!(output, json!(0)),
		other => panic!("expected Completed after acknowledging the removed entries, got {other:?}"),
	}
}

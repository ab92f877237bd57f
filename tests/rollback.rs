//! S5 (spec §8): when a workflow requests a rollback past a
//! `rollback_checkpoint`, every step committed after that checkpoint with a
//! registered rollback handler gets it invoked exactly once, and the handler
//! sees the step's own committed output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flowline::db::memory::{MemoryDriver, MemoryMessageDriver};
use flowline::prelude::*;
use serde_json::json;
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn rollback_invokes_handler_with_committed_output() {
	let driver = Arc::new(MemoryDriver::new());
	let msg_driver = Arc::new(MemoryMessageDriver::new());
	let rolled_back = Arc::new(AtomicBool::new(false));
	let rollback_saw_output = Arc::new(AtomicBool::new(false));

	let mut registry = WorkflowRegistry::new();
	let rolled_back_reg = rolled_back.clone();
	let rollback_saw_output_reg = rollback_saw_output.clone();
	registry.register("charges", move |mut ctx: Context, _input: serde_json::Value| {
		let rolled_back = rolled_back_reg.clone();
		let rollback_saw_output = rollback_saw_output_reg.clone();
		async move {
			ctx.rollback_checkpoint("cp").await?;

			let rolled_back = rolled_back.clone();
			let rollback_saw_output = rollback_saw_output.clone();
			let config = StepConfig::new("charge").rollback(move |_ctx: Context, amount: i64| {
				let rolled_back = rolled_back.clone();
				let rollback_saw_output = rollback_saw_output.clone();
				async move {
					if amount == 500 {
						rollback_saw_output.store(true, Ordering::SeqCst);
					}
					rolled_back.store(true, Ordering::SeqCst);
					Ok(())
				}
			});
			ctx.step_with(config, |_| async move { Ok::<i64, anyhow::Error>(500) }).await?;

			Err::<i64, anyhow::Error>(WorkflowError::Rollback("customer cancelled".to_string()).into())
		}
	});

	let engine = Engine::new(driver, msg_driver, registry);
	let workflow_id = Uuid::new_v4();

	let outcome = engine.run(workflow_id, "charges", json!(null)).await.unwrap();
	match outcome {
		RunOutcome::RolledBack(err) => {
			assert_eq!(err.name, "Rollback");
			assert_eq!(err.message, "customer cancelled");
		}
		other => panic!("expected RolledBack, got {other:?}"),
	}

	assert!(rolled_back.load(Ordering::SeqCst), "rollback handler must have run");
	assert!(rollback_saw_output.load(Ordering::SeqCst), "rollback handler must see the step's committed output");
}

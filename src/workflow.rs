//! Workflow function registry.
//!
//! Workflows are registered as plain async closures keyed by name, the input
//! and output crossing the registry boundary as `serde_json::Value` so the
//! engine can store and dispatch them uniformly — the same shape the
//! teacher's macro-generated registration produces, built here by hand since
//! this crate favors a closures-based API over a proc-macro one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{BoxFuture, Context};

pub type WorkflowFn =
	Arc<dyn Fn(Context, serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct WorkflowRegistry {
	workflows: HashMap<String, WorkflowFn>,
}

impl WorkflowRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a typed workflow function under `name`. Input is
	/// deserialized from, and output serialized to, `serde_json::Value` at
	/// the registry boundary.
	pub fn register<I, O, F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
	where
		I: DeserializeOwned + Send + 'static,
		O: Serialize + Send + 'static,
		F: Fn(Context, I) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
	{
		let f = Arc::new(f);
		self.workflows.insert(
			name.into(),
			Arc::new(move |ctx, raw| {
				let f = f.clone();
				Box::pin(async move {
					let input: I = serde_json::from_value(raw)?;
					let output = f(ctx, input).await?;
					Ok(serde_json::to_value(output)?)
				})
			}),
		);
		self
	}

	pub fn get(&self, name: &str) -> Option<WorkflowFn> {
		self.workflows.get(name).cloned()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.workflows.contains_key(name)
	}
}

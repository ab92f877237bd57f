//! Engine-wide configuration (SPEC_FULL.md §12).
//!
//! Loading this from env vars or a config file is host glue and lives outside
//! this crate; the struct and its defaults — the numeric policy spec §4.3
//! names — live here, the way the teacher's config types ship as a reusable
//! dependency even though loading them is someone else's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// The short-sleep threshold spec §4.3.3 calls "a driver-provided constant" is
// sourced from `PersistenceDriver::worker_poll_interval()`, not this struct —
// the persistence driver, not engine-wide config, is the thing that actually
// knows how often a host can cheaply poll it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	pub default_step_timeout: Duration,
	pub default_max_retries: u32,
	pub default_retry_backoff_base: Duration,
	pub default_retry_backoff_max: Duration,
	pub default_loop_commit_interval: u64,
	pub default_loop_history_every: u64,
	pub default_loop_history_keep: u64,
	pub max_signal_poll_retries: u32,
	pub signal_poll_interval: Duration,
}

impl Default for EngineConfig {
	fn default() -> Self {
		EngineConfig {
			default_step_timeout: Duration::from_secs(30),
			default_max_retries: 3,
			default_retry_backoff_base: Duration::from_millis(100),
			default_retry_backoff_max: Duration::from_secs(30),
			default_loop_commit_interval: 20,
			default_loop_history_every: 20,
			default_loop_history_keep: 20,
			max_signal_poll_retries: 5,
			signal_poll_interval: Duration::from_secs(1),
		}
	}
}

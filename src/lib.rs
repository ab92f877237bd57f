//! Durable workflow execution: deterministic replay of history-backed,
//! resumable async workflows.
//!
//! See [`prelude`] for the common import set, [`context::Context`] for the
//! durable operations available inside a workflow function, and
//! [`scheduler::Engine`] / [`handle::Handle`] for driving one from the host
//! side.

pub mod backoff;
pub mod cancel;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod handle;
pub mod history;
pub mod location;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod workflow;

/// Wall-clock milliseconds since the Unix epoch, the one permitted source of
/// nondeterminism (spec §9 "Determinism discipline": timestamps are recorded
/// at the moment of commit, never recomputed on replay).
///
/// Anchored to `tokio::time::Instant` rather than read fresh from
/// `SystemTime::now()` on every call, so that a test driving the clock with
/// `tokio::time::pause()`/`advance()` sees backoff and sleep deadlines move
/// with the virtual clock instead of real wall time.
pub(crate) fn now_ms() -> i64 {
	use std::sync::OnceLock;

	static EPOCH_BASE: OnceLock<(tokio::time::Instant, i64)> = OnceLock::new();
	let (base_instant, base_epoch_ms) = EPOCH_BASE.get_or_init(|| {
		let epoch_ms = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.expect("system clock is before the Unix epoch")
			.as_millis() as i64;
		(tokio::time::Instant::now(), epoch_ms)
	});
	base_epoch_ms + tokio::time::Instant::now().saturating_duration_since(*base_instant).as_millis() as i64
}

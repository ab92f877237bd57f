//! Deterministic exponential backoff (spec §4.3.1, §9 "Determinism discipline").
//!
//! `backoff(n) = min(max, base * 2^n)`, no jitter — restarts must reproduce
//! the same schedule because the engine recomputes it from persisted
//! `attempts` rather than storing the computed deadline.

use std::time::Duration;

pub fn backoff(attempts: u32, base: Duration, max: Duration) -> Duration {
	let scaled = base.checked_mul(1u32.checked_shl(attempts).unwrap_or(u32::MAX).max(1));
	match scaled {
		Some(d) if d < max => d,
		_ => max,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn grows_exponentially_until_capped() {
		let base = Duration::from_millis(100);
		let max = Duration::from_secs(30);
		assert_eq!(backoff(0, base, max), Duration::from_millis(100));
		assert_eq!(backoff(1, base, max), Duration::from_millis(200));
		assert_eq!(backoff(2, base, max), Duration::from_millis(400));
		assert_eq!(backoff(20, base, max), max);
	}

	#[test]
	fn never_exceeds_max_even_on_overflow() {
		let base = Duration::from_millis(100);
		let max = Duration::from_secs(30);
		assert_eq!(backoff(u32::MAX, base, max), max);
	}
}

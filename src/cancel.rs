//! Cancellation token tree (spec §9 "AbortController + AbortSignal is a
//! cancellation token tree: parent cancels children; each durable op checks
//! it at its yield point").

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CancelToken(CancellationToken);

impl CancelToken {
	pub fn new() -> Self {
		CancelToken(CancellationToken::new())
	}

	/// A child token: cancelling `self` cancels the child too, but not vice versa.
	pub fn child(&self) -> Self {
		CancelToken(self.0.child_token())
	}

	pub fn cancel(&self) {
		self.0.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.is_cancelled()
	}

	pub async fn cancelled(&self) {
		self.0.cancelled().await
	}
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

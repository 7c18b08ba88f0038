use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation signal shared by every worker bound to a
/// device's lifetime. Each worker pairs its queue operations with a check
/// of this flag so that `close()` terminates the pipeline at the next
/// iteration boundary instead of blocking forever on a closed channel.
#[derive(Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
	pub fn new() -> Self {
		Self(Arc::new(AtomicBool::new(false)))
	}

	/// Signal cancellation. Idempotent.
	pub fn cancel(&self) {
		self.0.store(true, Ordering::Release);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}

	/// Install a Ctrl+C handler that cancels this token exactly once.
	pub fn bind_ctrlc(&self) -> Result<(), ctrlc::Error> {
		let this = self.clone();
		ctrlc::set_handler(move || this.cancel())
	}
}

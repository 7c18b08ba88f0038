use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::Cancel;

/// How often a blocked worker wakes up to re-check the cancellation flag.
/// There is no way to select on a `crossbeam_channel` op and a plain
/// `AtomicBool` at the same time, so responsiveness to `close()` trades off
/// against wakeup overhead; a fifth of a second is imperceptible either way.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Blocks until a value is available on `rx`, the channel is closed, or
/// `cancel` is signalled. Returns `None` in the latter two cases.
pub fn recv<T>(rx: &Receiver<T>, cancel: &Cancel) -> Option<T> {
	loop {
		if cancel.is_cancelled() {
			return None;
		}

		match rx.recv_timeout(POLL_INTERVAL) {
			Ok(v) => return Some(v),
			Err(RecvTimeoutError::Timeout) => continue,
			Err(RecvTimeoutError::Disconnected) => return None,
		}
	}
}

/// Blocks until `v` is enqueued on `tx`, the channel is closed, or `cancel`
/// is signalled. Returns `false` in the latter two cases.
pub fn send<T>(tx: &Sender<T>, mut v: T, cancel: &Cancel) -> bool {
	loop {
		if cancel.is_cancelled() {
			return false;
		}

		match tx.send_timeout(v, POLL_INTERVAL) {
			Ok(()) => return true,
			Err(SendTimeoutError::Timeout(back)) => {
				v = back;
				continue;
			}
			Err(SendTimeoutError::Disconnected(_)) => return false,
		}
	}
}

//! Watch-point lifecycle model
//!
//! One watch point per subscribed root. The OS resources live inside the
//! platform backend; what is shared across threads is the root path, the
//! lifecycle status and the failure slot. Control threads block on status
//! transitions through the condition variable; only the backend thread
//! performs transitions.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::WatchError;

/// Lifecycle of a single root subscription.
///
/// ```text
/// Uninitialized ──arm──▶ Listening ──stop──▶ NotListening ──drain──▶ Finished
///       │
///       └──OS refusal──▶ FailedToListen
/// ```
///
/// `Finished` and `FailedToListen` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPointStatus {
	/// Created, subscription not yet offered to the OS.
	Uninitialized,
	/// The OS accepted the subscription; events are flowing.
	Listening,
	/// Stop requested; in-flight OS I/O is being cancelled and drained.
	NotListening,
	/// All outstanding OS callbacks have completed and resources are
	/// released.
	Finished,
	/// The OS refused the subscription.
	FailedToListen,
}

impl WatchPointStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, WatchPointStatus::Finished | WatchPointStatus::FailedToListen)
	}
}

/// Status cell a control thread can block on while the backend drives the
/// transition. At most this one lock is held while touching it, and never
/// across an OS wait or a sink publish.
#[derive(Debug)]
pub(crate) struct StatusCell {
	status: Mutex<WatchPointStatus>,
	changed: Condvar,
}

impl StatusCell {
	fn new() -> Self {
		Self {
			status: Mutex::new(WatchPointStatus::Uninitialized),
			changed: Condvar::new(),
		}
	}

	pub(crate) fn get(&self) -> WatchPointStatus {
		*self.status.lock()
	}

	pub(crate) fn set(&self, status: WatchPointStatus) {
		let mut current = self.status.lock();
		*current = status;
		self.changed.notify_all();
	}

	/// Block until the status leaves `Uninitialized` or the deadline
	/// passes; returns the status observed last.
	pub(crate) fn await_listening_started(&self, timeout: Duration) -> WatchPointStatus {
		self.await_while(timeout, |status| status == WatchPointStatus::Uninitialized)
	}

	/// Block until the status becomes terminal or the deadline passes.
	pub(crate) fn await_finished(&self, timeout: Duration) -> WatchPointStatus {
		self.await_while(timeout, |status| !status.is_terminal())
	}

	fn await_while(
		&self,
		timeout: Duration,
		condition: impl Fn(WatchPointStatus) -> bool,
	) -> WatchPointStatus {
		let deadline = Instant::now() + timeout;
		let mut status = self.status.lock();
		while condition(*status) {
			if self
				.changed
				.wait_until(&mut status, deadline)
				.timed_out()
			{
				break;
			}
		}
		*status
	}
}

/// The cross-thread face of a watch point: root path, status, and the
/// error slot the backend fills when arming fails.
#[derive(Debug)]
pub(crate) struct WatchPointShared {
	pub(crate) root: PathBuf,
	pub(crate) status: StatusCell,
	failure: Mutex<Option<WatchError>>,
}

impl WatchPointShared {
	pub(crate) fn new(root: PathBuf) -> Self {
		Self {
			root,
			status: StatusCell::new(),
			failure: Mutex::new(None),
		}
	}

	/// Record the arming failure for the control thread to pick up, then
	/// flip the status so the waiter wakes.
	pub(crate) fn fail_to_listen(&self, error: WatchError) {
		*self.failure.lock() = Some(error);
		self.status.set(WatchPointStatus::FailedToListen);
	}

	pub(crate) fn take_failure(&self) -> Option<WatchError> {
		self.failure.lock().take()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn await_listening_observes_backend_transition() {
		let point = Arc::new(WatchPointShared::new(PathBuf::from("/tmp/w")));
		let backend = {
			let point = Arc::clone(&point);
			thread::spawn(move || {
				thread::sleep(Duration::from_millis(20));
				point.status.set(WatchPointStatus::Listening);
			})
		};

		let status = point.status.await_listening_started(Duration::from_secs(5));
		assert_eq!(status, WatchPointStatus::Listening);
		backend.join().unwrap();
	}

	#[test]
	fn await_listening_times_out_while_uninitialized() {
		let point = WatchPointShared::new(PathBuf::from("/tmp/w"));
		let status = point.status.await_listening_started(Duration::from_millis(30));
		assert_eq!(status, WatchPointStatus::Uninitialized);
	}

	#[test]
	fn await_finished_returns_on_terminal_status() {
		let point = WatchPointShared::new(PathBuf::from("/tmp/w"));
		point.status.set(WatchPointStatus::Finished);
		assert_eq!(
			point.status.await_finished(Duration::from_millis(10)),
			WatchPointStatus::Finished
		);
	}

	#[test]
	fn failure_slot_round_trips() {
		let point = WatchPointShared::new(PathBuf::from("/nope"));
		point.fail_to_listen(WatchError::InvalidPath(PathBuf::from("/nope")));
		assert_eq!(point.status.get(), WatchPointStatus::FailedToListen);
		assert!(matches!(
			point.take_failure(),
			Some(WatchError::InvalidPath(_))
		));
		assert!(point.take_failure().is_none());
	}
}

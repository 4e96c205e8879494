//! Event sink: the queue boundary between the backend and the host
//!
//! The backend thread publishes every translated event through an
//! [`EventSink`]. The sink never hands events back to the backend; the host
//! consumes from the other side. Publishing happens only on the backend
//! thread, with no lock held, so a slow consumer stalls at most the pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::warn;

use crate::event::{Event, FailureKind};

/// What [`ChannelSink`] does when the underlying queue is full.
///
/// Dropping silently is never an option: the contract requires either
/// waiting, signalling the loss as [`Event::Overflow`], or failing loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
	/// Block the backend thread until the consumer drains the queue.
	#[default]
	Block,
	/// Drop the event and signal one `Overflow { root: None }` per
	/// congestion episode.
	DropWithOverflow,
	/// Refuse the event; the publish returns an error and the server emits
	/// a final `Failure { kind: QueueFull }` before tearing down.
	Fail,
}

/// Queue abstraction the backends publish into.
///
/// `publish` must be callable from the backend thread without further
/// synchronization. Returning `false` means the sink definitively refused
/// the event; the server reacts by emitting a failure and shutting down the
/// affected pump. Implementations must not drop events silently.
pub trait EventSink: Send + Sync {
	fn publish(&self, event: Event) -> bool;
}

/// [`EventSink`] backed by a `crossbeam-channel` queue.
///
/// `bounded(capacity)` applies the given [`BackpressurePolicy`] when the
/// queue is full; `unbounded()` never exerts backpressure. The sink is
/// host-owned and the policy is fixed here, at construction, before the
/// sink is handed to [`WatchServer::start`](crate::WatchServer::start).
pub struct ChannelSink {
	tx: Sender<Event>,
	policy: BackpressurePolicy,
	/// Set while a congestion episode is ongoing so repeated drops coalesce
	/// into a single overflow signal.
	congested: AtomicBool,
}

impl ChannelSink {
	/// Create an unbounded sink. Publishing never blocks.
	pub fn unbounded() -> (Arc<Self>, Receiver<Event>) {
		let (tx, rx) = crossbeam_channel::unbounded();
		(
			Arc::new(Self {
				tx,
				policy: BackpressurePolicy::Block,
				congested: AtomicBool::new(false),
			}),
			rx,
		)
	}

	/// Create a bounded sink applying `policy` when the queue is full.
	pub fn bounded(capacity: usize, policy: BackpressurePolicy) -> (Arc<Self>, Receiver<Event>) {
		let (tx, rx) = crossbeam_channel::bounded(capacity);
		(
			Arc::new(Self {
				tx,
				policy,
				congested: AtomicBool::new(false),
			}),
			rx,
		)
	}
}

impl EventSink for ChannelSink {
	fn publish(&self, event: Event) -> bool {
		match self.tx.try_send(event) {
			Ok(()) => {
				self.congested.store(false, Ordering::Relaxed);
				true
			}
			Err(TrySendError::Disconnected(_)) => {
				// Receiver dropped: the host stopped listening. Nothing left
				// to deliver to.
				false
			}
			Err(TrySendError::Full(event)) => match self.policy {
				BackpressurePolicy::Block => self.tx.send(event).is_ok(),
				BackpressurePolicy::DropWithOverflow => {
					if !self.congested.swap(true, Ordering::Relaxed) {
						warn!("event queue full, dropping events until drained");
						// Reserve no room for the marker either; losing it
						// under sustained pressure is indistinguishable from
						// the episode continuing.
						let _ = self.tx.try_send(Event::Overflow { root: None });
					}
					true
				}
				BackpressurePolicy::Fail => false,
			},
		}
	}
}

/// Publish a failure event, ignoring a refused or disconnected sink: this is
/// the last resort path and has nowhere else to report.
pub(crate) fn publish_failure(sink: &dyn EventSink, kind: FailureKind, message: String) {
	let _ = sink.publish(Event::Failure { kind, message });
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::ChangeKind;
	use std::path::PathBuf;

	fn change(name: &str) -> Event {
		Event::change(ChangeKind::Created, PathBuf::from(name))
	}

	#[test]
	fn unbounded_sink_accepts_everything() {
		let (sink, rx) = ChannelSink::unbounded();
		for i in 0..1000 {
			assert!(sink.publish(change(&format!("file-{i}"))));
		}
		assert_eq!(rx.len(), 1000);
	}

	#[test]
	fn drop_policy_coalesces_overflow_signal() {
		let (sink, rx) = ChannelSink::bounded(2, BackpressurePolicy::DropWithOverflow);
		assert!(sink.publish(change("a")));
		assert!(sink.publish(change("b")));
		// Queue full: both drops fold into at most one overflow marker.
		assert!(sink.publish(change("c")));
		assert!(sink.publish(change("d")));

		let mut overflows = 0;
		while let Ok(event) = rx.try_recv() {
			if matches!(event, Event::Overflow { root: None }) {
				overflows += 1;
			}
		}
		assert!(overflows <= 1);
	}

	#[test]
	fn fail_policy_refuses_when_full() {
		let (sink, _rx) = ChannelSink::bounded(1, BackpressurePolicy::Fail);
		assert!(sink.publish(change("a")));
		assert!(!sink.publish(change("b")));
	}

	#[test]
	fn disconnected_receiver_refuses() {
		let (sink, rx) = ChannelSink::unbounded();
		drop(rx);
		assert!(!sink.publish(change("a")));
	}
}

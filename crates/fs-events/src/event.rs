//! Event types emitted by the watcher backends
//!
//! Backends translate raw OS notification records into these normalized
//! variants before publishing them to the sink. The set is deliberately a
//! sum type rather than a handler hierarchy: consumers match on it.

use std::fmt;
use std::path::PathBuf;

/// Semantic classification of a single observed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
	/// A new entry appeared under a watched root (includes the target side
	/// of a rename).
	Created,
	/// Contents, attributes or size of an entry changed.
	Modified,
	/// An entry disappeared from under a watched root (includes the source
	/// side of a rename).
	Removed,
	/// The watched root itself can no longer be observed: it was deleted,
	/// moved, unmounted, or the OS reported a history gap for it.
	Invalidated,
}

impl fmt::Display for ChangeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ChangeKind::Created => "created",
			ChangeKind::Modified => "modified",
			ChangeKind::Removed => "removed",
			ChangeKind::Invalidated => "invalidated",
		})
	}
}

/// Coarse classification carried by [`Event::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
	/// An OS call on an established subscription returned an unexpected
	/// error code.
	BackendFault,
	/// The event queue refused an event and the configured policy is to
	/// fail rather than block or drop.
	QueueFull,
	/// An internal invariant was violated; the backend emits this once and
	/// exits its pump.
	Internal,
}

impl fmt::Display for FailureKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			FailureKind::BackendFault => "backend fault",
			FailureKind::QueueFull => "queue full",
			FailureKind::Internal => "internal error",
		})
	}
}

/// A single notification delivered to the event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	/// A classified change at an absolute path under a watched root.
	Change { kind: ChangeKind, path: PathBuf },
	/// The OS ring buffer or the user-space queue lost events under `root`,
	/// or globally when `root` is `None`. Consumers should rescan.
	Overflow { root: Option<PathBuf> },
	/// An OS record the backend could not classify.
	Unknown { path: Option<PathBuf> },
	/// A structured error detected asynchronously by the backend.
	Failure { kind: FailureKind, message: String },
}

impl Event {
	pub fn change(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
		Event::Change {
			kind,
			path: path.into(),
		}
	}

	pub fn overflow(root: Option<PathBuf>) -> Self {
		Event::Overflow { root }
	}

	pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
		Event::Failure {
			kind,
			message: message.into(),
		}
	}

	/// The path this event pertains to, when it carries one.
	pub fn path(&self) -> Option<&PathBuf> {
		match self {
			Event::Change { path, .. } => Some(path),
			Event::Overflow { root } => root.as_ref(),
			Event::Unknown { path } => path.as_ref(),
			Event::Failure { .. } => None,
		}
	}
}

//! Error types for watcher operations

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors returned synchronously by control-plane operations.
///
/// Asynchronous backend errors are delivered as [`Event::Failure`] on the
/// sink instead; see the crate documentation for the split.
///
/// [`Event::Failure`]: crate::Event::Failure
#[derive(Debug, Error)]
pub enum WatchError {
	/// The path cannot be made absolute or does not name a directory.
	#[error("invalid path: {0}")]
	InvalidPath(PathBuf),

	/// The root is already present in the server's watch set.
	#[error("already watching: {0}")]
	AlreadyWatching(PathBuf),

	/// The root is not present in the server's watch set.
	#[error("not watching: {0}")]
	NotWatching(PathBuf),

	/// The OS refused the subscription: descriptor limit, watch limit, or
	/// out of memory for the event buffer.
	#[error("resource exhausted while watching {path}: {source}")]
	ResourceExhausted { path: PathBuf, source: io::Error },

	/// The OS denied access to the directory.
	#[error("permission denied for {path}: {source}")]
	PermissionDenied { path: PathBuf, source: io::Error },

	/// The server has been closed; no further operations are accepted.
	#[error("watcher is closed")]
	Closed,

	/// An unexpected OS error on an established subscription.
	#[error("backend fault: {0}")]
	BackendFault(String),

	/// A control-plane wait exceeded its deadline. The underlying backend
	/// work is not cancelled; the transition continues without the caller.
	#[error("timed out waiting for {0}")]
	Timeout(&'static str),

	/// IO error at an OS seam not covered by a more specific variant.
	#[error("io error: {0}")]
	Io(#[from] io::Error),
}

impl WatchError {
	/// Classify an OS error from a subscription attempt on `path`.
	pub(crate) fn from_subscribe_error(path: PathBuf, err: io::Error) -> Self {
		match err.raw_os_error() {
			#[cfg(unix)]
			Some(code)
				if code == libc::ENOSPC
					|| code == libc::EMFILE
					|| code == libc::ENFILE
					|| code == libc::ENOMEM =>
			{
				WatchError::ResourceExhausted { path, source: err }
			}
			#[cfg(unix)]
			Some(libc::ENOTDIR) => WatchError::InvalidPath(path),
			_ => match err.kind() {
				io::ErrorKind::NotFound => WatchError::InvalidPath(path),
				io::ErrorKind::PermissionDenied => WatchError::PermissionDenied { path, source: err },
				io::ErrorKind::OutOfMemory => WatchError::ResourceExhausted { path, source: err },
				_ => WatchError::Io(err),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subscribe_error_classification() {
		let path = PathBuf::from("/does/not/exist");
		let err = WatchError::from_subscribe_error(
			path.clone(),
			io::Error::new(io::ErrorKind::NotFound, "no such file or directory"),
		);
		assert!(matches!(err, WatchError::InvalidPath(p) if p == path));

		let err = WatchError::from_subscribe_error(
			path.clone(),
			io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
		);
		assert!(matches!(err, WatchError::PermissionDenied { .. }));
	}

	#[cfg(unix)]
	#[test]
	fn watch_limit_maps_to_resource_exhausted() {
		let err = WatchError::from_subscribe_error(
			PathBuf::from("/tmp"),
			io::Error::from_raw_os_error(libc::ENOSPC),
		);
		assert!(matches!(err, WatchError::ResourceExhausted { .. }));
	}
}

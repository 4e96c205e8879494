//! Watcher configuration

use std::time::Duration;

/// Default `ReadDirectoryChangesW` buffer size per watched directory.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 16 * 1024;
/// Smallest accepted event buffer.
pub const MIN_EVENT_BUFFER_SIZE: usize = 4 * 1024;
/// Largest accepted event buffer.
pub const MAX_EVENT_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for a [`WatchServer`](crate::WatchServer).
///
/// All knobs have platform-appropriate defaults; construct with
/// [`WatcherConfig::default`] and override with the `with_*` builders.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
	/// Per-directory event buffer size in bytes. Only consulted by the
	/// Windows backend; larger buffers reduce overflow probability during
	/// bursts. Clamped to `[4 KiB, 64 MiB]`.
	pub event_buffer_size: usize,
	/// Delivery latency for the macOS backend. Zero requests immediate
	/// delivery.
	pub latency: Duration,
	/// Subscribe to every subdirectory of a root on Linux, where the OS
	/// primitive is non-recursive. Off by default; Windows and macOS report
	/// subtree events natively.
	pub watch_subtrees: bool,
	/// How long `start_watching` waits for the OS to accept a subscription.
	pub start_timeout: Duration,
	/// How long `stop_watching` waits for the terminal OS callback. Expiry
	/// releases the caller without cancelling the transition.
	pub stop_timeout: Duration,
}

impl Default for WatcherConfig {
	fn default() -> Self {
		Self {
			event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
			latency: Duration::ZERO,
			watch_subtrees: false,
			start_timeout: Duration::from_secs(5),
			stop_timeout: Duration::from_secs(5),
		}
	}
}

impl WatcherConfig {
	pub fn with_event_buffer_size(mut self, bytes: usize) -> Self {
		self.event_buffer_size = bytes.clamp(MIN_EVENT_BUFFER_SIZE, MAX_EVENT_BUFFER_SIZE);
		self
	}

	pub fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = latency;
		self
	}

	pub fn with_subtree_watching(mut self, enabled: bool) -> Self {
		self.watch_subtrees = enabled;
		self
	}

	pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
		self.start_timeout = timeout;
		self
	}

	pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
		self.stop_timeout = timeout;
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn buffer_size_is_clamped() {
		let config = WatcherConfig::default().with_event_buffer_size(1);
		assert_eq!(config.event_buffer_size, MIN_EVENT_BUFFER_SIZE);

		let config = WatcherConfig::default().with_event_buffer_size(usize::MAX);
		assert_eq!(config.event_buffer_size, MAX_EVENT_BUFFER_SIZE);

		let config = WatcherConfig::default().with_event_buffer_size(32 * 1024);
		assert_eq!(config.event_buffer_size, 32 * 1024);
	}
}

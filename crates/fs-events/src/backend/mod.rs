//! Platform backends
//!
//! Each backend owns the single I/O thread of a server and all OS resources
//! inside its watch points. Control threads never touch OS handles; they
//! enqueue a [`ControlRequest`] and nudge the pump with the platform wake
//! primitive (APC on Windows, eventfd on Linux, run-loop stop on macOS),
//! then block on the watch point's status cell.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::WatcherConfig;
use crate::sink::EventSink;
use crate::watch_point::WatchPointShared;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub(crate) use linux::LinuxBackend as PlatformBackend;
#[cfg(target_os = "macos")]
pub(crate) use macos::MacOsBackend as PlatformBackend;
#[cfg(windows)]
pub(crate) use windows::WindowsBackend as PlatformBackend;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
compile_error!("fs-events supports Linux, macOS and Windows targets only");

/// Control-plane operation marshalled to the backend thread.
pub(crate) enum ControlRequest {
	/// Subscribe a new root. The caller blocks on the point's status cell.
	Add { point: Arc<WatchPointShared> },
	/// Unsubscribe a root. The caller blocks until the point finishes.
	Remove { root: PathBuf },
	/// Cancel every watch point and exit the pump.
	Terminate,
}

/// Root → watch point map. Written only by the backend thread; read by
/// control threads for membership pre-checks.
pub(crate) type Registry = Arc<Mutex<HashMap<PathBuf, Arc<WatchPointShared>>>>;

/// FIFO request queue between control threads and the pump.
#[derive(Default)]
pub(crate) struct ControlQueue {
	requests: Mutex<VecDeque<ControlRequest>>,
}

impl ControlQueue {
	pub(crate) fn push(&self, request: ControlRequest) {
		self.requests.lock().push_back(request);
	}

	pub(crate) fn drain(&self) -> Vec<ControlRequest> {
		self.requests.lock().drain(..).collect()
	}
}

/// Everything a pump needs, cloned into the backend thread at spawn.
#[derive(Clone)]
pub(crate) struct BackendShared {
	pub(crate) queue: Arc<ControlQueue>,
	pub(crate) registry: Registry,
	pub(crate) sink: Arc<dyn EventSink>,
	pub(crate) config: WatcherConfig,
}

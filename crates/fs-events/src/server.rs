//! Platform-neutral watcher server
//!
//! The server owns the root → watch point registry and the single backend
//! thread. Control operations may be invoked from any thread: they enqueue
//! a request, wake the pump with the platform primitive, and block on the
//! watch point's status cell until the backend acknowledges. The registry
//! is written only by the backend; control threads read it for membership
//! pre-checks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{BackendShared, ControlQueue, ControlRequest, PlatformBackend, Registry};
use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::path::{normalize_root, validate_directory};
use crate::sink::EventSink;
use crate::watch_point::{WatchPointShared, WatchPointStatus};

/// A running notification engine over one backend thread.
///
/// Dropping the server closes it: the pump is terminated and joined, after
/// which no further event reaches the sink.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use fs_events::{ChannelSink, Event, WatcherConfig, WatchServer};
///
/// # fn main() -> fs_events::Result<()> {
/// let (sink, events) = ChannelSink::unbounded();
/// let server = WatchServer::start(sink, WatcherConfig::default())?;
/// server.start_watching("/tmp/project")?;
///
/// while let Ok(event) = events.recv() {
/// 	match event {
/// 		Event::Change { kind, path } => println!("{kind}: {}", path.display()),
/// 		other => println!("{other:?}"),
/// 	}
/// }
/// # Ok(())
/// # }
/// ```
pub struct WatchServer {
	config: WatcherConfig,
	registry: Registry,
	backend: Mutex<Option<PlatformBackend>>,
	closed: AtomicBool,
}

impl WatchServer {
	/// Spawn the backend thread and block until its pump is running.
	pub fn start(sink: Arc<dyn EventSink>, config: WatcherConfig) -> Result<Self> {
		let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
		let queue = Arc::new(ControlQueue::default());
		let backend = PlatformBackend::spawn(BackendShared {
			queue,
			registry: Arc::clone(&registry),
			sink,
			config: config.clone(),
		})?;
		debug!("watch server started");

		Ok(Self {
			config,
			registry,
			backend: Mutex::new(Some(backend)),
			closed: AtomicBool::new(false),
		})
	}

	/// Subscribe a root directory. Blocks until the OS accepts or refuses
	/// the subscription, or the configured start timeout passes.
	pub fn start_watching(&self, root: impl AsRef<Path>) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(WatchError::Closed);
		}
		let root = normalize_root(root.as_ref())?;
		validate_directory(&root)?;
		if self.registry.lock().contains_key(&root) {
			return Err(WatchError::AlreadyWatching(root));
		}

		let point = Arc::new(WatchPointShared::new(root));
		self.post(ControlRequest::Add {
			point: Arc::clone(&point),
		})?;

		match point.status.await_listening_started(self.config.start_timeout) {
			WatchPointStatus::Listening => Ok(()),
			WatchPointStatus::FailedToListen => Err(point.take_failure().unwrap_or_else(|| {
				WatchError::BackendFault("subscription failed without a cause".into())
			})),
			WatchPointStatus::Uninitialized => Err(WatchError::Timeout("watch registration")),
			other => Err(WatchError::BackendFault(format!(
				"unexpected watch point status {other:?} during registration"
			))),
		}
	}

	/// Subscribe a collection of roots. Each root is attempted
	/// independently; the first error is returned after all of them have
	/// been tried, and earlier successes stand.
	pub fn start_watching_all<I, P>(&self, roots: I) -> Result<()>
	where
		I: IntoIterator<Item = P>,
		P: AsRef<Path>,
	{
		let mut first_error = None;
		for root in roots {
			if let Err(err) = self.start_watching(root) {
				first_error.get_or_insert(err);
			}
		}
		match first_error {
			None => Ok(()),
			Some(err) => Err(err),
		}
	}

	/// Unsubscribe a root. Blocks until its watch point finishes or the
	/// configured stop timeout passes; a timeout releases the caller
	/// without cancelling the shutdown, which continues in the backend.
	///
	/// Events already extracted from the OS may still surface after this
	/// returns; none will surface after [`close`](Self::close).
	pub fn stop_watching(&self, root: impl AsRef<Path>) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(WatchError::Closed);
		}
		let root = normalize_root(root.as_ref())?;
		let Some(point) = self.registry.lock().get(&root).cloned() else {
			return Err(WatchError::NotWatching(root));
		};

		self.post(ControlRequest::Remove { root })?;

		match point.status.await_finished(self.config.stop_timeout) {
			status if status.is_terminal() => Ok(()),
			_ => Err(WatchError::Timeout("watch shutdown")),
		}
	}

	/// Unsubscribe a collection of roots with the same independence rule as
	/// [`start_watching_all`](Self::start_watching_all).
	pub fn stop_watching_all<I, P>(&self, roots: I) -> Result<()>
	where
		I: IntoIterator<Item = P>,
		P: AsRef<Path>,
	{
		let mut first_error = None;
		for root in roots {
			if let Err(err) = self.stop_watching(root) {
				first_error.get_or_insert(err);
			}
		}
		match first_error {
			None => Ok(()),
			Some(err) => Err(err),
		}
	}

	/// Roots currently in the listening state.
	pub fn watched_roots(&self) -> Vec<PathBuf> {
		self.registry
			.lock()
			.iter()
			.filter(|(_, point)| point.status.get() == WatchPointStatus::Listening)
			.map(|(root, _)| root.clone())
			.collect()
	}

	/// Cancel every subscription, stop the backend thread and wait for it
	/// to exit. Idempotent. After this returns no event is enqueued and
	/// every other operation fails with [`WatchError::Closed`].
	pub fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		if let Some(mut backend) = self.backend.lock().take() {
			backend.post(ControlRequest::Terminate);
			backend.join();
		}
		debug!("watch server closed");
		Ok(())
	}

	fn post(&self, request: ControlRequest) -> Result<()> {
		let backend = self.backend.lock();
		match backend.as_ref() {
			Some(backend) => {
				backend.post(request);
				Ok(())
			}
			None => Err(WatchError::Closed),
		}
	}
}

impl Drop for WatchServer {
	fn drop(&mut self) {
		let _ = self.close();
	}
}

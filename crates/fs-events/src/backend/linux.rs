//! Linux backend: inotify multiplexed with an eventfd wake
//!
//! One inotify instance per server, one watch descriptor per directory. The
//! pump thread blocks in `poll` on the inotify fd and an eventfd; control
//! threads push a request and bump the eventfd counter. All descriptor
//! mutation happens on the pump thread.
//!
//! inotify is non-recursive: with subtree watching enabled the pump walks
//! the root at arm time and adds descriptors for new subdirectories as
//! their create events are observed. Rename cookies are not correlated;
//! the two halves of a move surface as independent remove/create events.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use tracing::{debug, error, trace, warn};

use super::{BackendShared, ControlQueue, ControlRequest};
use crate::error::{Result, WatchError};
use crate::event::{ChangeKind, Event, FailureKind};
use crate::sink::publish_failure;
use crate::watch_point::{WatchPointShared, WatchPointStatus};

fn subscription_mask() -> WatchMask {
	WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::MODIFY
		| WatchMask::ATTRIB
		| WatchMask::CLOSE_WRITE
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::DELETE_SELF
		| WatchMask::MOVE_SELF
		| WatchMask::ONLYDIR
}

/// Poll timeout while draining terminal callbacks during shutdown; watch
/// descriptors whose `IN_IGNORED` never surfaces are force-retired after
/// this.
const DRAIN_TIMEOUT_MS: libc::c_int = 500;

pub(crate) struct LinuxBackend {
	queue: Arc<ControlQueue>,
	wake_fd: RawFd,
	thread: Option<JoinHandle<()>>,
}

impl LinuxBackend {
	/// Spawn the pump thread and block until it owns a live inotify
	/// instance and has entered its poll loop.
	pub(crate) fn spawn(shared: BackendShared) -> Result<Self> {
		let queue = Arc::clone(&shared.queue);
		let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
		if wake_fd < 0 {
			return Err(WatchError::Io(std::io::Error::last_os_error()));
		}

		let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
		let thread = std::thread::Builder::new()
			.name("fs-events-pump".into())
			.spawn(move || match Inotify::init() {
				Ok(inotify) => {
					let mut pump = Pump::new(inotify, wake_fd, shared);
					let _ = ready_tx.send(Ok(()));
					pump.run();
				}
				Err(err) => {
					let _ = ready_tx.send(Err(WatchError::from_subscribe_error(
						PathBuf::new(),
						err,
					)));
				}
			})
			.map_err(WatchError::Io)?;

		match ready_rx.recv() {
			Ok(Ok(())) => Ok(Self {
				queue,
				wake_fd,
				thread: Some(thread),
			}),
			Ok(Err(err)) => {
				let _ = thread.join();
				unsafe { libc::close(wake_fd) };
				Err(err)
			}
			Err(_) => {
				let _ = thread.join();
				unsafe { libc::close(wake_fd) };
				Err(WatchError::BackendFault("pump thread died during startup".into()))
			}
		}
	}

	pub(crate) fn post(&self, request: ControlRequest) {
		self.queue.push(request);
		self.wake();
	}

	fn wake(&self) {
		let one: u64 = 1;
		let written = unsafe {
			libc::write(
				self.wake_fd,
				std::ptr::addr_of!(one).cast(),
				std::mem::size_of::<u64>(),
			)
		};
		if written < 0 {
			// EAGAIN means the counter is saturated, which still wakes the
			// pump; anything else is logged and the pending request will be
			// picked up on the next wake.
			let err = std::io::Error::last_os_error();
			if err.raw_os_error() != Some(libc::EAGAIN) {
				warn!("failed to signal watcher pump: {err}");
			}
		}
	}

	pub(crate) fn join(&mut self) {
		if let Some(thread) = self.thread.take() {
			if thread.join().is_err() {
				error!("watcher pump thread panicked");
			}
		}
	}
}

impl Drop for LinuxBackend {
	fn drop(&mut self) {
		self.join();
		unsafe { libc::close(self.wake_fd) };
	}
}

/// Per-root bookkeeping on the pump thread.
struct PointState {
	shared: Arc<WatchPointShared>,
	/// Live descriptors for this root (1 + subdirectories in subtree mode).
	live_wds: usize,
	/// Stop or terminate requested; finishing removes the point from the
	/// registry. Asynchronously invalidated points stay for reaping.
	stopping: bool,
	invalidated: bool,
}

struct WdEntry {
	root: PathBuf,
	dir: PathBuf,
}

/// An inotify record detached from the read buffer.
struct RawEvent {
	wd: WatchDescriptor,
	mask: EventMask,
	name: Option<OsString>,
}

struct Pump {
	inotify: Inotify,
	wake_fd: RawFd,
	shared: BackendShared,
	points: HashMap<PathBuf, PointState>,
	by_wd: HashMap<WatchDescriptor, WdEntry>,
	terminating: bool,
}

impl Pump {
	fn new(inotify: Inotify, wake_fd: RawFd, shared: BackendShared) -> Self {
		Self {
			inotify,
			wake_fd,
			shared,
			points: HashMap::new(),
			by_wd: HashMap::new(),
			terminating: false,
		}
	}

	fn run(&mut self) {
		debug!("watcher pump entering poll loop");
		loop {
			if self.terminating && self.by_wd.is_empty() {
				break;
			}

			let mut fds = [
				libc::pollfd {
					fd: self.inotify.as_raw_fd(),
					events: libc::POLLIN,
					revents: 0,
				},
				libc::pollfd {
					fd: self.wake_fd,
					events: libc::POLLIN,
					revents: 0,
				},
			];
			let timeout = if self.terminating { DRAIN_TIMEOUT_MS } else { -1 };
			let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
			if ready < 0 {
				let err = std::io::Error::last_os_error();
				if err.raw_os_error() == Some(libc::EINTR) {
					continue;
				}
				error!("poll failed in watcher pump: {err}");
				publish_failure(
					&*self.shared.sink,
					FailureKind::BackendFault,
					format!("poll failed: {err}"),
				);
				self.begin_terminate();
				break;
			}
			if ready == 0 {
				// Drain deadline during shutdown: whatever has not reported
				// its terminal record by now is retired by force.
				self.force_retire_all();
				continue;
			}

			if fds[0].revents & libc::POLLIN != 0 {
				self.drain_inotify();
			}
			if fds[1].revents & libc::POLLIN != 0 {
				self.drain_wake();
				self.process_control();
			}
		}

		self.finish_remaining();
		debug!("watcher pump exited");
	}

	// ---- control plane ----------------------------------------------------

	fn drain_wake(&self) {
		let mut counter: u64 = 0;
		loop {
			let read = unsafe {
				libc::read(
					self.wake_fd,
					std::ptr::addr_of_mut!(counter).cast(),
					std::mem::size_of::<u64>(),
				)
			};
			if read <= 0 {
				break;
			}
		}
	}

	fn process_control(&mut self) {
		for request in self.shared.queue.drain() {
			match request {
				ControlRequest::Add { point } => self.handle_add(point),
				ControlRequest::Remove { root } => self.handle_remove(&root),
				ControlRequest::Terminate => self.begin_terminate(),
			}
		}
	}

	fn handle_add(&mut self, point: Arc<WatchPointShared>) {
		if self.terminating {
			point.fail_to_listen(WatchError::Closed);
			return;
		}
		let root = point.root.clone();
		if self.points.contains_key(&root) {
			point.fail_to_listen(WatchError::AlreadyWatching(root));
			return;
		}

		let wd = match self.inotify.watches().add(&root, subscription_mask()) {
			Ok(wd) => wd,
			Err(err) => {
				warn!("unable to watch {}: {err}", root.display());
				point.fail_to_listen(WatchError::from_subscribe_error(root, err));
				return;
			}
		};
		self.by_wd.insert(
			wd,
			WdEntry {
				root: root.clone(),
				dir: root.clone(),
			},
		);

		let mut live_wds = 1;
		if self.shared.config.watch_subtrees {
			live_wds += self.add_subtree_watches(&root, &root);
		}

		self.points.insert(
			root.clone(),
			PointState {
				shared: Arc::clone(&point),
				live_wds,
				stopping: false,
				invalidated: false,
			},
		);
		self.shared
			.registry
			.lock()
			.insert(root.clone(), Arc::clone(&point));
		point.status.set(WatchPointStatus::Listening);
		debug!("now watching {}", root.display());
	}

	/// Add descriptors for every subdirectory below `dir`. Failures on
	/// individual entries are logged and skipped; the subscription as a
	/// whole stands.
	fn add_subtree_watches(&mut self, root: &Path, dir: &Path) -> usize {
		let entries = match std::fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(err) => {
				debug!("cannot enumerate {}: {err}", dir.display());
				return 0;
			}
		};

		let mut added = 0;
		for entry in entries.flatten() {
			let path = entry.path();
			if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
				continue;
			}
			match self.inotify.watches().add(&path, subscription_mask()) {
				Ok(wd) => {
					self.by_wd.insert(
						wd,
						WdEntry {
							root: root.to_path_buf(),
							dir: path.clone(),
						},
					);
					added += 1;
					added += self.add_subtree_watches(root, &path);
				}
				Err(err) => {
					// The directory may have vanished between readdir and
					// the add; nothing to do but note it.
					debug!("cannot watch subdirectory {}: {err}", path.display());
				}
			}
		}
		added
	}

	fn handle_remove(&mut self, root: &Path) {
		let Some(state) = self.points.get_mut(root) else {
			// Reaped by an earlier stop; the caller observes the terminal
			// status on the shared cell.
			return;
		};

		if state.shared.status.get().is_terminal() {
			// Invalidated earlier; this stop reaps it.
			self.points.remove(root);
			self.shared.registry.lock().remove(root);
			return;
		}

		state.stopping = true;
		state.shared.status.set(WatchPointStatus::NotListening);
		self.remove_descriptors_for(root);
		debug!("stop watching {}", root.display());
	}

	fn begin_terminate(&mut self) {
		if self.terminating {
			return;
		}
		self.terminating = true;
		let roots: Vec<PathBuf> = self.points.keys().cloned().collect();
		for root in roots {
			let Some(state) = self.points.get_mut(&root) else {
				continue;
			};
			state.stopping = true;
			if state.shared.status.get() == WatchPointStatus::Listening {
				state.shared.status.set(WatchPointStatus::NotListening);
				self.remove_descriptors_for(&root);
			}
		}
	}

	/// Remove every descriptor belonging to `root`. The kernel queues an
	/// `IN_IGNORED` per removal, which retires the descriptor when it is
	/// read back; descriptors the kernel already dropped are retired here.
	fn remove_descriptors_for(&mut self, root: &Path) {
		let wds: Vec<WatchDescriptor> = self
			.by_wd
			.iter()
			.filter(|(_, entry)| entry.root == root)
			.map(|(wd, _)| wd.clone())
			.collect();
		for wd in wds {
			if let Err(err) = self.inotify.watches().remove(wd.clone()) {
				trace!("descriptor already gone for {}: {err}", root.display());
				self.retire_wd(&wd);
			}
		}
	}

	// ---- event plane ------------------------------------------------------

	fn drain_inotify(&mut self) {
		let mut buffer = [0u8; 4096];
		loop {
			let raw: Vec<RawEvent> = match self.inotify.read_events(&mut buffer) {
				Ok(events) => events
					.map(|event| RawEvent {
						wd: event.wd,
						mask: event.mask,
						name: event.name.map(OsString::from),
					})
					.collect(),
				Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
				Err(err) => {
					error!("inotify read failed: {err}");
					publish_failure(
						&*self.shared.sink,
						FailureKind::BackendFault,
						format!("inotify read failed: {err}"),
					);
					self.begin_terminate();
					break;
				}
			};
			for event in raw {
				self.handle_raw_event(event);
			}
		}
	}

	fn handle_raw_event(&mut self, event: RawEvent) {
		if event.mask.contains(EventMask::Q_OVERFLOW) {
			warn!("inotify queue overflowed, events were lost");
			self.publish(Event::Overflow { root: None });
			return;
		}

		let Some(entry) = self.by_wd.get(&event.wd) else {
			// Records queued behind a removal; the descriptor is gone.
			return;
		};
		let root = entry.root.clone();
		let dir = entry.dir.clone();

		if event.mask.contains(EventMask::IGNORED) {
			self.retire_wd(&event.wd);
			return;
		}

		if event
			.mask
			.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF | EventMask::UNMOUNT)
		{
			if dir == root {
				self.invalidate_root(&root);
				if event.mask.intersects(EventMask::MOVE_SELF) {
					// A moved root keeps its descriptors alive; retire them
					// explicitly so the point can finish.
					self.remove_descriptors_for(&root);
				}
			} else if event.mask.intersects(EventMask::MOVE_SELF) {
				let wd = event.wd.clone();
				if self.inotify.watches().remove(wd.clone()).is_err() {
					self.retire_wd(&wd);
				}
			}
			// DELETE_SELF and UNMOUNT are followed by IN_IGNORED, which
			// retires the descriptor.
			return;
		}

		let path = match &event.name {
			Some(name) => dir.join(name),
			None => dir.clone(),
		};

		if event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
			if event.mask.contains(EventMask::ISDIR)
				&& self.shared.config.watch_subtrees
				&& !self.terminating
			{
				self.extend_subtree(&root, &path);
			}
			self.publish(Event::change(ChangeKind::Created, path));
		} else if event
			.mask
			.intersects(EventMask::DELETE | EventMask::MOVED_FROM)
		{
			self.publish(Event::change(ChangeKind::Removed, path));
		} else if event
			.mask
			.intersects(EventMask::MODIFY | EventMask::ATTRIB | EventMask::CLOSE_WRITE)
		{
			self.publish(Event::change(ChangeKind::Modified, path));
		} else {
			trace!("unclassified inotify mask {:?} at {}", event.mask, path.display());
			self.publish(Event::Unknown { path: Some(path) });
		}
	}

	/// Watch a subdirectory that appeared under a live root, including
	/// anything created inside it before the descriptor took effect.
	fn extend_subtree(&mut self, root: &Path, dir: &Path) {
		let root = root.to_path_buf();
		match self.inotify.watches().add(dir, subscription_mask()) {
			Ok(wd) => {
				self.by_wd.insert(
					wd,
					WdEntry {
						root: root.clone(),
						dir: dir.to_path_buf(),
					},
				);
				let added = 1 + self.add_subtree_watches(&root, dir);
				if let Some(state) = self.points.get_mut(&root) {
					state.live_wds += added;
				}
			}
			Err(err) => {
				debug!("cannot watch new subdirectory {}: {err}", dir.display());
			}
		}
	}

	fn invalidate_root(&mut self, root: &Path) {
		let Some(state) = self.points.get_mut(root) else {
			return;
		};
		if !state.invalidated {
			state.invalidated = true;
			debug!("watched root became unobservable: {}", root.display());
			self.publish(Event::change(ChangeKind::Invalidated, root.to_path_buf()));
		}
	}

	/// Retire one descriptor; the owning point finishes when its last
	/// descriptor goes.
	fn retire_wd(&mut self, wd: &WatchDescriptor) {
		let Some(entry) = self.by_wd.remove(wd) else {
			return;
		};
		let root_retired = entry.dir == entry.root;
		let Some(state) = self.points.get_mut(&entry.root) else {
			return;
		};
		state.live_wds = state.live_wds.saturating_sub(1);

		if root_retired && !state.stopping && !state.invalidated {
			// The kernel dropped the root's descriptor without a stop
			// request: the root is gone for us.
			let root = entry.root.clone();
			self.invalidate_root(&root);
			self.remove_descriptors_for(&root);
		}

		if let Some(state) = self.points.get(&entry.root) {
			if state.live_wds == 0 {
				self.finish_point(&entry.root);
			}
		}
	}

	fn finish_point(&mut self, root: &Path) {
		let Some(state) = self.points.get(root) else {
			return;
		};
		state.shared.status.set(WatchPointStatus::Finished);
		if state.stopping {
			self.points.remove(root);
			self.shared.registry.lock().remove(root);
		}
		// Not stopping: the point was invalidated asynchronously and stays
		// in the registry until stop_watching or close reaps it.
	}

	fn force_retire_all(&mut self) {
		let wds: Vec<WatchDescriptor> = self.by_wd.keys().cloned().collect();
		for wd in wds {
			warn!("terminal record never arrived, force-retiring descriptor");
			self.retire_wd(&wd);
		}
	}

	/// Terminal cleanup once the poll loop exits: every remaining point is
	/// finished and the registry emptied.
	fn finish_remaining(&mut self) {
		for state in self.points.values() {
			if !state.shared.status.get().is_terminal() {
				state.shared.status.set(WatchPointStatus::Finished);
			}
		}
		self.points.clear();
		self.shared.registry.lock().clear();
	}

	fn publish(&mut self, event: Event) {
		if !self.shared.sink.publish(event) && !self.terminating {
			publish_failure(
				&*self.shared.sink,
				FailureKind::QueueFull,
				"event queue refused an event".into(),
			);
			self.begin_terminate();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// Mask translation is exercised end-to-end in tests/watcher_integration.rs;
	// these cover the corners that are awkward to provoke through the OS.

	#[test]
	fn subscription_mask_covers_required_bits() {
		for bit in [
			WatchMask::CREATE,
			WatchMask::DELETE,
			WatchMask::MODIFY,
			WatchMask::ATTRIB,
			WatchMask::CLOSE_WRITE,
			WatchMask::MOVED_FROM,
			WatchMask::MOVED_TO,
			WatchMask::DELETE_SELF,
			WatchMask::MOVE_SELF,
			WatchMask::ONLYDIR,
		] {
			assert!(subscription_mask().contains(bit));
		}
	}
}

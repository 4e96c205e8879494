//! macOS backend: FSEventStream on a dedicated run loop
//!
//! FSEvents carries one stream per server over the whole root array and
//! does not support editing the root set of a live stream. The pump thread
//! therefore runs cycles: build a stream over the current roots, run the
//! loop, tear the stream down, apply control changes, rebuild. The last
//! delivered event id is threaded through rebuilds so no events fall into
//! the gap. Control threads wake the pump by stopping its run loop.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::{BackendShared, ControlRequest};
use crate::error::{Result, WatchError};
use crate::event::{ChangeKind, Event, FailureKind};
use crate::path::validate_directory;
use crate::sink::publish_failure;
use crate::watch_point::{WatchPointShared, WatchPointStatus};

bitflags::bitflags! {
	/// Event flags delivered by the stream callback.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct StreamFlags: u32 {
		const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
		const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
		const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
		const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
		const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
		const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
		const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
		const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
		const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
		const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
		const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
		const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
		const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
		const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
	}
}

extern "C" {
	/// Whether the run loop is asleep waiting for an event source.
	fn CFRunLoopIsWaiting(run_loop: cf::CFRunLoopRef) -> cf::Boolean;
}

/// Moves a CFRunLoopRef across the spawn boundary. Apple documents CF
/// reference types as safe to use from any thread.
struct SendWrapper(cf::CFRunLoopRef);
unsafe impl Send for SendWrapper {}

impl SendWrapper {
	fn raw(&self) -> cf::CFRunLoopRef {
		self.0
	}
}

/// Control-side state: the request flag the pump sleeps on while it has no
/// stream, and the run loop to stop while it has one.
struct MacControl {
	pending: Mutex<bool>,
	requested: Condvar,
	runloop: Mutex<Option<SendWrapper>>,
}

impl MacControl {
	fn new() -> Self {
		Self {
			pending: Mutex::new(false),
			requested: Condvar::new(),
			runloop: Mutex::new(None),
		}
	}

	/// Nudge the pump: stop its run loop if it is inside one, otherwise
	/// wake it from the idle wait.
	fn wake(&self) {
		*self.pending.lock() = true;
		loop {
			let Some(run_loop) = self.runloop.lock().as_ref().map(SendWrapper::raw) else {
				self.requested.notify_one();
				return;
			};
			// Stopping before the loop sleeps would be lost; spin until it
			// is actually waiting. The slot is cleared when the pump leaves
			// the loop, which bounds the spin.
			if unsafe { CFRunLoopIsWaiting(run_loop) } != 0 {
				unsafe { cf::CFRunLoopStop(run_loop) };
				return;
			}
			std::thread::yield_now();
		}
	}

	fn wait_for_request(&self) {
		let mut pending = self.pending.lock();
		while !*pending {
			self.requested.wait(&mut pending);
		}
		*pending = false;
	}

	fn enter_run_loop(&self, run_loop: cf::CFRunLoopRef) {
		*self.runloop.lock() = Some(SendWrapper(run_loop));
	}

	fn leave_run_loop(&self) {
		*self.runloop.lock() = None;
	}
}

pub(crate) struct MacOsBackend {
	shared: BackendShared,
	control: Arc<MacControl>,
	thread: Option<JoinHandle<()>>,
}

impl MacOsBackend {
	pub(crate) fn spawn(shared: BackendShared) -> Result<Self> {
		let control = Arc::new(MacControl::new());
		let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

		let thread = {
			let shared = shared.clone();
			let control = Arc::clone(&control);
			std::thread::Builder::new()
				.name("fs-events-pump".into())
				.spawn(move || {
					let mut pump = Pump::new(shared, control);
					let _ = ready_tx.send(Ok(()));
					pump.run();
				})
				.map_err(WatchError::Io)?
		};

		match ready_rx.recv() {
			Ok(Ok(())) => Ok(Self {
				shared,
				control,
				thread: Some(thread),
			}),
			Ok(Err(err)) => {
				let _ = thread.join();
				Err(err)
			}
			Err(_) => {
				let _ = thread.join();
				Err(WatchError::BackendFault("pump thread died during startup".into()))
			}
		}
	}

	pub(crate) fn post(&self, request: ControlRequest) {
		self.shared.queue.push(request);
		self.control.wake();
	}

	pub(crate) fn join(&mut self) {
		if let Some(thread) = self.thread.take() {
			if thread.join().is_err() {
				error!("watcher pump thread panicked");
			}
		}
	}
}

impl Drop for MacOsBackend {
	fn drop(&mut self) {
		self.join();
	}
}

struct MacPointState {
	shared: Arc<WatchPointShared>,
	invalidated: bool,
}

struct Pump {
	shared: BackendShared,
	control: Arc<MacControl>,
	points: HashMap<PathBuf, MacPointState>,
	since_when: fs::FSEventStreamEventId,
	terminating: bool,
}

impl Pump {
	fn new(shared: BackendShared, control: Arc<MacControl>) -> Self {
		Self {
			shared,
			control,
			points: HashMap::new(),
			since_when: fs::kFSEventStreamEventIdSinceNow,
			terminating: false,
		}
	}

	fn run(&mut self) {
		debug!("watcher pump entering stream loop");
		loop {
			self.process_control();
			if self.terminating {
				break;
			}

			let roots = self.active_roots();
			if roots.is_empty() {
				self.control.wait_for_request();
				continue;
			}

			self.run_stream_cycle(&roots);
		}

		self.finish_remaining();
		debug!("watcher pump exited");
	}

	// ---- control plane ----------------------------------------------------

	fn process_control(&mut self) {
		for request in self.shared.queue.drain() {
			match request {
				ControlRequest::Add { point } => self.handle_add(point),
				ControlRequest::Remove { root } => self.handle_remove(&root),
				ControlRequest::Terminate => self.terminating = true,
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
		if let Err(err) = validate_directory(&root) {
			point.fail_to_listen(err);
			return;
		}
		if root.to_str().is_none() {
			// CFString paths require UTF-8.
			point.fail_to_listen(WatchError::InvalidPath(root));
			return;
		}

		self.points.insert(
			root.clone(),
			MacPointState {
				shared: Arc::clone(&point),
				invalidated: false,
			},
		);
		self.shared.registry.lock().insert(root.clone(), point);
		debug!("now watching {}", root.display());
	}

	fn handle_remove(&mut self, root: &Path) {
		let Some(state) = self.points.get(root) else {
			return;
		};
		// No stream is live while control runs, so there is no in-flight
		// callback to drain; the transition completes synchronously.
		if !state.shared.status.get().is_terminal() {
			state.shared.status.set(WatchPointStatus::NotListening);
			state.shared.status.set(WatchPointStatus::Finished);
		}
		self.points.remove(root);
		self.shared.registry.lock().remove(root);
		debug!("stopped watching {}", root.display());
	}

	/// Roots that should be part of the next stream: everything not yet
	/// terminal.
	fn active_roots(&self) -> Vec<PathBuf> {
		self.points
			.iter()
			.filter(|(_, state)| !state.shared.status.get().is_terminal())
			.map(|(root, _)| root.clone())
			.collect()
	}

	// ---- stream lifecycle -------------------------------------------------

	fn run_stream_cycle(&mut self, roots: &[PathBuf]) {
		let paths = unsafe {
			cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks)
		};
		let mut appended = 0;
		for root in roots {
			let Some(root_str) = root.to_str() else {
				continue;
			};
			unsafe {
				let mut err: cf::CFErrorRef = std::ptr::null_mut();
				let cf_path = cf::str_path_to_cfstring_ref(root_str, &mut err);
				if cf_path.is_null() {
					cf::CFRelease(err as cf::CFRef);
					continue;
				}
				cf::CFArrayAppendValue(paths, cf_path as cf::CFRef);
				cf::CFRelease(cf_path as cf::CFRef);
				appended += 1;
			}
		}
		if appended == 0 {
			// A stream over an empty path array is undefined; treat the
			// whole cycle as refused.
			unsafe { cf::CFRelease(paths as cf::CFRef) };
			self.fail_stream("no watchable roots for the event stream");
			return;
		}

		let mut context = fs::FSEventStreamContext {
			version: 0,
			info: (self as *mut Pump).cast::<c_void>(),
			retain: None,
			release: None,
			copy_description: None,
		};
		let stream = unsafe {
			fs::FSEventStreamCreate(
				cf::kCFAllocatorDefault,
				stream_callback,
				&mut context,
				paths,
				self.since_when,
				self.shared.config.latency.as_secs_f64(),
				fs::kFSEventStreamCreateFlagNoDefer
					| fs::kFSEventStreamCreateFlagFileEvents
					| fs::kFSEventStreamCreateFlagWatchRoot,
			)
		};
		unsafe { cf::CFRelease(paths as cf::CFRef) };
		if stream.is_null() {
			self.fail_stream("FSEventStreamCreate returned null");
			return;
		}

		let run_loop = unsafe { cf::CFRunLoopGetCurrent() };
		unsafe {
			fs::FSEventStreamScheduleWithRunLoop(stream, run_loop, cf::kCFRunLoopDefaultMode);
			if fs::FSEventStreamStart(stream) == 0 {
				fs::FSEventStreamInvalidate(stream);
				fs::FSEventStreamRelease(stream);
				self.fail_stream("FSEventStreamStart refused the stream");
				return;
			}
		}

		// The OS accepted the whole root set; pending points are live now.
		for state in self.points.values() {
			if state.shared.status.get() == WatchPointStatus::Uninitialized {
				state.shared.status.set(WatchPointStatus::Listening);
			}
		}

		self.control.enter_run_loop(run_loop);
		unsafe { cf::CFRunLoopRun() };
		self.control.leave_run_loop();

		unsafe {
			fs::FSEventStreamStop(stream);
			fs::FSEventStreamInvalidate(stream);
			fs::FSEventStreamRelease(stream);
		}
		// Rebuilds resume from the last id the stream delivered.
		self.since_when = unsafe { fs::FSEventsGetCurrentEventId() };
	}

	/// The stream as a whole could not be established: fail pending points
	/// and finish live ones with a failure event.
	fn fail_stream(&mut self, message: &str) {
		error!("{message}");
		for state in self.points.values_mut() {
			match state.shared.status.get() {
				WatchPointStatus::Uninitialized => {
					state
						.shared
						.fail_to_listen(WatchError::BackendFault(message.into()));
				}
				WatchPointStatus::Listening => {
					state.invalidated = true;
					state.shared.status.set(WatchPointStatus::Finished);
				}
				_ => {}
			}
		}
		let mut registry = self.shared.registry.lock();
		self.points.retain(|root, state| {
			if state.shared.status.get() == WatchPointStatus::FailedToListen {
				registry.remove(root);
				false
			} else {
				true
			}
		});
		drop(registry);
		publish_failure(&*self.shared.sink, FailureKind::BackendFault, message.into());
	}

	// ---- event plane ------------------------------------------------------

	fn handle_stream_event(&mut self, path: PathBuf, flags: StreamFlags) {
		trace!("stream event {:?} at {}", flags, path.display());

		if flags.contains(StreamFlags::HISTORY_DONE) {
			// Sentinel closing the historical replay; the gap itself is
			// reported through the dropped flags below.
			if flags.intersects(StreamFlags::USER_DROPPED | StreamFlags::KERNEL_DROPPED) {
				if let Some(root) = self.owning_root(&path) {
					self.invalidate_root(&root);
				}
			}
			return;
		}

		if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
			warn!("event stream dropped records under {}", path.display());
			self.publish(Event::Overflow { root: Some(path) });
			return;
		}

		if flags.intersects(StreamFlags::ROOT_CHANGED | StreamFlags::UNMOUNT) {
			if let Some(root) = self.owning_root(&path) {
				self.invalidate_root(&root);
				// The root set changed; rebuild the stream without it.
				unsafe { cf::CFRunLoopStop(cf::CFRunLoopGetCurrent()) };
			}
			return;
		}

		let kind = if flags.contains(StreamFlags::ITEM_RENAMED) {
			// FSEvents does not pair the two halves of a rename; whether
			// this path is the source or the target is decided by looking
			// at the file system now. A racing change can flip the answer,
			// in which case the path is reported as modified.
			match std::fs::symlink_metadata(&path) {
				Ok(_) => ChangeKind::Created,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => ChangeKind::Removed,
				Err(_) => ChangeKind::Modified,
			}
		} else if flags.contains(StreamFlags::ITEM_CREATED) {
			ChangeKind::Created
		} else if flags.contains(StreamFlags::ITEM_REMOVED) {
			ChangeKind::Removed
		} else if flags.intersects(
			StreamFlags::ITEM_MODIFIED
				| StreamFlags::INODE_META_MOD
				| StreamFlags::FINDER_INFO_MOD
				| StreamFlags::ITEM_CHANGE_OWNER
				| StreamFlags::ITEM_XATTR_MOD,
		) {
			ChangeKind::Modified
		} else {
			trace!("unclassified stream flags {:?} at {}", flags, path.display());
			self.publish(Event::Unknown { path: Some(path) });
			return;
		};

		self.publish(Event::change(kind, path));
	}

	fn owning_root(&self, path: &Path) -> Option<PathBuf> {
		if self.points.contains_key(path) {
			return Some(path.to_path_buf());
		}
		self.points
			.keys()
			.find(|root| path.starts_with(root))
			.cloned()
	}

	fn invalidate_root(&mut self, root: &Path) {
		let Some(state) = self.points.get_mut(root) else {
			return;
		};
		if state.invalidated {
			return;
		}
		state.invalidated = true;
		debug!("watched root became unobservable: {}", root.display());
		// Stays in the registry for stop_watching to reap.
		state.shared.status.set(WatchPointStatus::Finished);
		self.publish(Event::change(ChangeKind::Invalidated, root.to_path_buf()));
	}

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
			self.terminating = true;
			unsafe { cf::CFRunLoopStop(cf::CFRunLoopGetCurrent()) };
		}
	}
}

extern "C" fn stream_callback(
	_stream: fs::FSEventStreamRef,
	info: *mut c_void,
	num_events: usize,
	event_paths: *mut c_void,
	event_flags: *const fs::FSEventStreamEventFlags,
	_event_ids: *const fs::FSEventStreamEventId,
) {
	// The pump sits inside CFRunLoopRun on this same thread for the whole
	// callback; the pointer cannot dangle and nothing else aliases it.
	let pump = unsafe { &mut *info.cast::<Pump>() };
	let paths = event_paths.cast::<*const libc::c_char>();

	for index in 0..num_events {
		let (raw_path, raw_flags) = unsafe { (*paths.add(index), *event_flags.add(index)) };
		if raw_path.is_null() {
			continue;
		}
		let bytes = unsafe { CStr::from_ptr(raw_path) }.to_bytes();
		let path = PathBuf::from(std::ffi::OsStr::from_bytes(bytes));
		let flags = StreamFlags::from_bits_truncate(raw_flags);
		pump.handle_stream_event(path, flags);
	}
}

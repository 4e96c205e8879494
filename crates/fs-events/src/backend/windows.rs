//! Windows backend: `ReadDirectoryChangesW` with completion routines
//!
//! One directory handle per root, opened overlapped; each read is issued
//! with a completion routine that fires on the pump thread while it sits in
//! an alertable `SleepEx`. Control threads queue a request and wake the
//! pump with `QueueUserAPC`, so every handle and buffer is touched by
//! exactly one thread. Shutdown cancels outstanding I/O with `CancelIoEx`
//! and drains until every completion has reported.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{c_void, OsString};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, trace, warn};
use windows_sys::Win32::Foundation::{
	CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, ERROR_ACCESS_DENIED, ERROR_IO_PENDING,
	ERROR_NOTIFY_ENUM_DIR, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
	CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
	FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
	FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
	FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
	FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
	FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
	GetCurrentProcess, GetCurrentThread, QueueUserAPC, SleepEx, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};

use super::{BackendShared, ControlRequest};
use crate::config::{MAX_EVENT_BUFFER_SIZE, MIN_EVENT_BUFFER_SIZE};
use crate::error::{Result, WatchError};
use crate::event::{ChangeKind, Event, FailureKind};
use crate::path::to_extended_length;
use crate::sink::publish_failure;
use crate::watch_point::{WatchPointShared, WatchPointStatus};

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
	| FILE_NOTIFY_CHANGE_DIR_NAME
	| FILE_NOTIFY_CHANGE_ATTRIBUTES
	| FILE_NOTIFY_CHANGE_SIZE
	| FILE_NOTIFY_CHANGE_LAST_WRITE;

/// Alertable-wait timeout while draining cancelled I/O during shutdown;
/// completions that never report by then are force-finished.
const DRAIN_TIMEOUT_MS: u32 = 500;

thread_local! {
	/// The pump owning this thread. Completion routines and APCs run on the
	/// pump thread only and reach their state through here.
	static PUMP: Cell<*mut Pump> = Cell::new(std::ptr::null_mut());
}

pub(crate) struct WindowsBackend {
	shared: BackendShared,
	/// Duplicated real handle of the pump thread, target of `QueueUserAPC`.
	thread_handle: HANDLE,
	thread: Option<JoinHandle<()>>,
}

// HANDLE is a plain integer; posting APCs to it from any thread is the
// documented use.
unsafe impl Send for WindowsBackend {}
unsafe impl Sync for WindowsBackend {}

impl WindowsBackend {
	pub(crate) fn spawn(shared: BackendShared) -> Result<Self> {
		let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<HANDLE>>(1);

		let thread = {
			let shared = shared.clone();
			std::thread::Builder::new()
				.name("fs-events-pump".into())
				.spawn(move || {
					let mut handle: HANDLE = 0;
					let duplicated = unsafe {
						DuplicateHandle(
							GetCurrentProcess(),
							GetCurrentThread(),
							GetCurrentProcess(),
							&mut handle,
							0,
							0,
							DUPLICATE_SAME_ACCESS,
						)
					};
					if duplicated == 0 {
						let err = std::io::Error::last_os_error();
						let _ = ready_tx.send(Err(WatchError::BackendFault(format!(
							"cannot duplicate pump thread handle: {err}"
						))));
						return;
					}

					let mut pump = Box::new(Pump::new(shared));
					PUMP.with(|cell| cell.set(&mut *pump));
					let _ = ready_tx.send(Ok(handle));
					pump.run();
					PUMP.with(|cell| cell.set(std::ptr::null_mut()));
				})
				.map_err(WatchError::Io)?
		};

		match ready_rx.recv() {
			Ok(Ok(thread_handle)) => Ok(Self {
				shared,
				thread_handle,
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
		let queued = unsafe { QueueUserAPC(Some(control_apc), self.thread_handle, 0) };
		if queued == 0 {
			warn!(
				"failed to wake watcher pump: {}",
				std::io::Error::last_os_error()
			);
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

impl Drop for WindowsBackend {
	fn drop(&mut self) {
		self.join();
		unsafe { CloseHandle(self.thread_handle) };
	}
}

/// Per-root state on the pump thread. The overlapped block sits first so a
/// completion routine can recover the watch point from its pointer.
#[repr(C)]
struct WinWatchPoint {
	overlapped: OVERLAPPED,
	handle: HANDLE,
	/// Event buffer for `ReadDirectoryChangesW`, u64-backed to satisfy the
	/// DWORD alignment the API requires.
	buffer: Vec<u64>,
	buffer_bytes: u32,
	shared: Arc<WatchPointShared>,
	in_flight: bool,
	stopping: bool,
	invalidated: bool,
}

struct Pump {
	shared: BackendShared,
	points: HashMap<PathBuf, Box<WinWatchPoint>>,
	terminating: bool,
}

impl Pump {
	fn new(shared: BackendShared) -> Self {
		Self {
			shared,
			points: HashMap::new(),
			terminating: false,
		}
	}

	fn run(&mut self) {
		debug!("watcher pump entering alertable wait");
		loop {
			if self.terminating && self.points.is_empty() {
				break;
			}
			let timeout = if self.terminating { DRAIN_TIMEOUT_MS } else { INFINITE };
			let woke = unsafe { SleepEx(timeout, 1) };
			if woke == 0 && self.terminating {
				// Cancelled I/O that never completed within the drain
				// deadline is abandoned.
				self.force_finish_all();
			}
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

		let wide: Vec<u16> = to_extended_length(&root)
			.as_os_str()
			.encode_wide()
			.chain(std::iter::once(0))
			.collect();
		let handle = unsafe {
			CreateFileW(
				wide.as_ptr(),
				FILE_LIST_DIRECTORY,
				FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
				std::ptr::null(),
				OPEN_EXISTING,
				FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
				0,
			)
		};
		if handle == INVALID_HANDLE_VALUE {
			let err = std::io::Error::last_os_error();
			warn!("unable to open {}: {err}", root.display());
			point.fail_to_listen(WatchError::from_subscribe_error(root, err));
			return;
		}

		let buffer_bytes = self
			.shared
			.config
			.event_buffer_size
			.clamp(MIN_EVENT_BUFFER_SIZE, MAX_EVENT_BUFFER_SIZE) as u32;
		let mut watch_point = Box::new(WinWatchPoint {
			overlapped: unsafe { std::mem::zeroed() },
			handle,
			buffer: vec![0u64; (buffer_bytes as usize).div_ceil(8)],
			buffer_bytes,
			shared: Arc::clone(&point),
			in_flight: false,
			stopping: false,
			invalidated: false,
		});

		if let Err(err) = issue_read(&mut watch_point) {
			unsafe { CloseHandle(handle) };
			point.fail_to_listen(WatchError::from_subscribe_error(root, err));
			return;
		}

		self.points.insert(root.clone(), watch_point);
		self.shared
			.registry
			.lock()
			.insert(root.clone(), Arc::clone(&point));
		point.status.set(WatchPointStatus::Listening);
		debug!("now watching {}", root.display());
	}

	fn handle_remove(&mut self, root: &Path) {
		let Some(point) = self.points.get_mut(root) else {
			return;
		};
		if point.shared.status.get().is_terminal() {
			// Invalidated earlier; this stop reaps it.
			self.remove_point(root);
			return;
		}

		point.stopping = true;
		point.shared.status.set(WatchPointStatus::NotListening);
		debug!("stop watching {}", root.display());
		if point.in_flight {
			// The aborted completion finishes the point.
			unsafe { CancelIoEx(point.handle, std::ptr::null()) };
		} else {
			self.finish_point(root);
		}
	}

	fn begin_terminate(&mut self) {
		if self.terminating {
			return;
		}
		self.terminating = true;
		let roots: Vec<PathBuf> = self.points.keys().cloned().collect();
		for root in roots {
			self.handle_remove(&root);
		}
	}

	// ---- completion plane -------------------------------------------------

	fn handle_completion(&mut self, root: &Path, error_code: u32, bytes: u32) {
		let Some(point) = self.points.get(root) else {
			return;
		};

		if error_code == ERROR_OPERATION_ABORTED {
			self.finish_point(root);
			return;
		}
		if point.shared.status.get() != WatchPointStatus::Listening {
			// Stop raced the completion; nothing more to deliver.
			self.finish_point(root);
			return;
		}
		if error_code == ERROR_ACCESS_DENIED {
			// The root was deleted or became unreachable under us.
			self.invalidate_point(root);
			return;
		}
		if error_code == ERROR_NOTIFY_ENUM_DIR || (error_code == 0 && bytes == 0) {
			// The notify buffer overflowed; signal the gap and keep going.
			warn!("event buffer overflowed for {}", root.display());
			self.publish(Event::Overflow {
				root: Some(root.to_path_buf()),
			});
			self.rearm(root);
			return;
		}
		if error_code != 0 {
			let err = std::io::Error::from_raw_os_error(error_code as i32);
			error!("read failed for {}: {err}", root.display());
			self.publish(Event::Failure {
				kind: FailureKind::BackendFault,
				message: format!("directory read failed for {}: {err}", root.display()),
			});
			self.finish_fault(root);
			return;
		}

		let events = {
			let point = match self.points.get(root) {
				Some(point) => point,
				None => return,
			};
			parse_notify_records(&point.buffer, bytes as usize, &point.shared.root)
		};
		for event in events {
			self.publish(event);
		}
		self.rearm(root);
	}

	fn rearm(&mut self, root: &Path) {
		let Some(point) = self.points.get_mut(root) else {
			return;
		};
		if point.shared.status.get() != WatchPointStatus::Listening {
			self.finish_point(root);
			return;
		}
		if let Err(err) = issue_read(point) {
			if err.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
				self.invalidate_point(root);
			} else {
				error!("unable to re-arm {}: {err}", root.display());
				self.publish(Event::Failure {
					kind: FailureKind::BackendFault,
					message: format!("unable to re-arm {}: {err}", root.display()),
				});
				self.finish_fault(root);
			}
		}
	}

	/// The root itself became unobservable: report it once, then finish.
	/// The point stays in the registry for `stop_watching` to reap.
	fn invalidate_point(&mut self, root: &Path) {
		let first = match self.points.get_mut(root) {
			Some(point) if !point.invalidated => {
				point.invalidated = true;
				true
			}
			_ => false,
		};
		if first {
			debug!("watched root became unobservable: {}", root.display());
			self.publish(Event::change(ChangeKind::Invalidated, root.to_path_buf()));
		}
		self.close_point_handle(root);
		if let Some(point) = self.points.get(root) {
			point.shared.status.set(WatchPointStatus::Finished);
		}
	}

	/// A backend fault terminated this subscription; same reaping rule as
	/// invalidation, without the change event (a failure was published).
	fn finish_fault(&mut self, root: &Path) {
		self.close_point_handle(root);
		if let Some(point) = self.points.get(root) {
			point.shared.status.set(WatchPointStatus::Finished);
		}
	}

	/// Orderly finish after a stop, a cancel, or a terminate: release the
	/// handle, flip the status, and drop the point from the maps.
	fn finish_point(&mut self, root: &Path) {
		self.close_point_handle(root);
		let Some(point) = self.points.get(root) else {
			return;
		};
		point.shared.status.set(WatchPointStatus::Finished);
		if point.stopping {
			self.remove_point(root);
		}
	}

	fn close_point_handle(&mut self, root: &Path) {
		if let Some(point) = self.points.get_mut(root) {
			if point.handle != INVALID_HANDLE_VALUE {
				unsafe { CloseHandle(point.handle) };
				point.handle = INVALID_HANDLE_VALUE;
			}
			point.in_flight = false;
		}
	}

	fn remove_point(&mut self, root: &Path) {
		self.points.remove(root);
		self.shared.registry.lock().remove(root);
	}

	fn force_finish_all(&mut self) {
		let roots: Vec<PathBuf> = self.points.keys().cloned().collect();
		for root in roots {
			warn!("completion never arrived for {}, force-finishing", root.display());
			self.finish_point(&root);
		}
	}

	fn finish_remaining(&mut self) {
		let roots: Vec<PathBuf> = self.points.keys().cloned().collect();
		for root in roots {
			self.close_point_handle(&root);
			if let Some(point) = self.points.get(&root) {
				if !point.shared.status.get().is_terminal() {
					point.shared.status.set(WatchPointStatus::Finished);
				}
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

/// Issue the next overlapped read on a watch point. The buffer and the
/// overlapped block live in the boxed point, stable for the I/O lifetime.
fn issue_read(point: &mut WinWatchPoint) -> std::io::Result<()> {
	point.overlapped = unsafe { std::mem::zeroed() };
	let accepted = unsafe {
		ReadDirectoryChangesW(
			point.handle,
			point.buffer.as_mut_ptr().cast::<c_void>(),
			point.buffer_bytes,
			1,
			NOTIFY_FILTER,
			std::ptr::null_mut(),
			&mut point.overlapped,
			Some(read_completion),
		)
	};
	if accepted == 0 {
		let err = std::io::Error::last_os_error();
		if err.raw_os_error() != Some(ERROR_IO_PENDING as i32) {
			return Err(err);
		}
	}
	point.in_flight = true;
	Ok(())
}

/// Translate the records of one completed read, in delivery order.
fn parse_notify_records(buffer: &[u64], bytes: usize, root: &Path) -> Vec<Event> {
	let mut events = Vec::new();
	let base = buffer.as_ptr().cast::<u8>();
	let mut offset = 0usize;

	loop {
		if offset + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() > bytes {
			break;
		}
		// The buffer is DWORD-aligned and offsets are produced by the OS.
		let info = unsafe { &*base.add(offset).cast::<FILE_NOTIFY_INFORMATION>() };
		let name_units = (info.FileNameLength / 2) as usize;
		let name =
			unsafe { std::slice::from_raw_parts(info.FileName.as_ptr(), name_units) };
		let path = root.join(OsString::from_wide(name));

		match info.Action {
			FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => {
				events.push(Event::change(ChangeKind::Created, path));
			}
			FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => {
				events.push(Event::change(ChangeKind::Removed, path));
			}
			FILE_ACTION_MODIFIED => {
				events.push(Event::change(ChangeKind::Modified, path));
			}
			other => {
				trace!("unclassified notify action {other} at {}", path.display());
				events.push(Event::Unknown { path: Some(path) });
			}
		}

		if info.NextEntryOffset == 0 {
			break;
		}
		offset += info.NextEntryOffset as usize;
	}
	events
}

/// APC posted by control threads; runs on the pump thread between waits.
unsafe extern "system" fn control_apc(_context: usize) {
	PUMP.with(|cell| {
		let pump = cell.get();
		if !pump.is_null() {
			unsafe { (*pump).process_control() };
		}
	});
}

/// Completion routine for `ReadDirectoryChangesW`; runs on the pump thread.
unsafe extern "system" fn read_completion(
	error_code: u32,
	bytes_transferred: u32,
	overlapped: *mut OVERLAPPED,
) {
	// The overlapped block is the first field of the watch point.
	let point = overlapped.cast::<WinWatchPoint>();
	if point.is_null() {
		return;
	}
	let root = unsafe { (*point).shared.root.clone() };
	unsafe { (*point).in_flight = false };

	PUMP.with(|cell| {
		let pump = cell.get();
		if !pump.is_null() {
			unsafe { (*pump).handle_completion(&root, error_code, bytes_transferred) };
		}
	});
}

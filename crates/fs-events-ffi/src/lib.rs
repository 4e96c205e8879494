//! C ABI surface for the `fs-events` engine
//!
//! The host creates a server with a callback, then drives it with start,
//! watch and close calls. Paths cross the boundary as UTF-16 units in the
//! host's convention; event paths are delivered back as UTF-16 on Windows
//! and UTF-8 bytes elsewhere. Every function is safe to call from any
//! thread; event callbacks fire on the engine's backend thread and must
//! return promptly.
//!
//! Lifecycle: `fse_server_create` → (optional `fse_server_set_*`) →
//! `fse_server_start` (implied by the first watch) → watch/unwatch →
//! `fse_server_close` → `fse_server_destroy`.

#![warn(unsafe_op_in_unsafe_fn)]

use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fs_events::{
	ChangeKind, Event, EventSink, WatchError, WatchServer, WatcherConfig,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, reload, Registry};

/// Status code returned by every fallible entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FseStatus {
	Ok = 0,
	InvalidArgument = 1,
	InvalidPath = 2,
	AlreadyWatching = 3,
	NotWatching = 4,
	ResourceExhausted = 5,
	PermissionDenied = 6,
	Closed = 7,
	BackendFault = 8,
	Timeout = 9,
}

impl From<WatchError> for FseStatus {
	fn from(err: WatchError) -> Self {
		match err {
			WatchError::InvalidPath(_) => FseStatus::InvalidPath,
			WatchError::AlreadyWatching(_) => FseStatus::AlreadyWatching,
			WatchError::NotWatching(_) => FseStatus::NotWatching,
			WatchError::ResourceExhausted { .. } => FseStatus::ResourceExhausted,
			WatchError::PermissionDenied { .. } => FseStatus::PermissionDenied,
			WatchError::Closed => FseStatus::Closed,
			WatchError::Timeout(_) => FseStatus::Timeout,
			WatchError::BackendFault(_) | WatchError::Io(_) => FseStatus::BackendFault,
		}
	}
}

/// Discriminant of a delivered event record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FseEventType {
	Change = 0,
	Overflow = 1,
	Unknown = 2,
	Failure = 3,
}

/// Change classification inside a `Change` record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FseChangeKind {
	Created = 0,
	Modified = 1,
	Removed = 2,
	Invalidated = 3,
	/// Filler for records that carry no change kind.
	None = 4,
}

impl From<ChangeKind> for FseChangeKind {
	fn from(kind: ChangeKind) -> Self {
		match kind {
			ChangeKind::Created => FseChangeKind::Created,
			ChangeKind::Modified => FseChangeKind::Modified,
			ChangeKind::Removed => FseChangeKind::Removed,
			ChangeKind::Invalidated => FseChangeKind::Invalidated,
		}
	}
}

/// Native path unit of the host convention.
#[cfg(windows)]
pub type FsePathChar = u16;
#[cfg(not(windows))]
pub type FsePathChar = u8;

/// One event record. The pointers are valid only for the duration of the
/// callback; hosts must copy what they keep.
#[repr(C)]
pub struct FseEvent {
	pub event_type: FseEventType,
	pub change_kind: FseChangeKind,
	pub path: *const FsePathChar,
	pub path_len: usize,
	pub message: *const u8,
	pub message_len: usize,
}

/// Host callback receiving event records on the backend thread.
pub type FseCallback = extern "C" fn(user_data: *mut c_void, event: *const FseEvent);

/// The host's opaque pointer travels to the backend thread; the host
/// guarantees it stays valid until `fse_server_destroy` returns.
struct UserData(*mut c_void);
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// Adapts the C callback to the engine's sink contract. The host queue is
/// the real sink; handing the record over is treated as infallible.
struct CallbackSink {
	callback: FseCallback,
	user_data: UserData,
}

impl CallbackSink {
	fn deliver(&self, event: FseEvent) {
		(self.callback)(self.user_data.0, &event);
	}
}

impl EventSink for CallbackSink {
	fn publish(&self, event: Event) -> bool {
		let (event_type, change_kind, path, message) = match event {
			Event::Change { kind, path } => {
				(FseEventType::Change, kind.into(), Some(path), None)
			}
			Event::Overflow { root } => (FseEventType::Overflow, FseChangeKind::None, root, None),
			Event::Unknown { path } => (FseEventType::Unknown, FseChangeKind::None, path, None),
			Event::Failure { kind, message } => (
				FseEventType::Failure,
				FseChangeKind::None,
				None,
				Some(format!("{kind}: {message}")),
			),
		};

		let path_units = path.as_deref().map(path_to_units);
		let message_bytes = message.as_deref().map(str::as_bytes);
		self.deliver(FseEvent {
			event_type,
			change_kind,
			path: path_units
				.as_ref()
				.map_or(std::ptr::null(), |units| units.as_ptr()),
			path_len: path_units.as_ref().map_or(0, |units| units.len()),
			message: message_bytes.map_or(std::ptr::null(), <[u8]>::as_ptr),
			message_len: message_bytes.map_or(0, <[u8]>::len),
		});
		true
	}
}

#[cfg(windows)]
fn path_to_units(path: &std::path::Path) -> Vec<u16> {
	use std::os::windows::ffi::OsStrExt;
	path.as_os_str().encode_wide().collect()
}

#[cfg(not(windows))]
fn path_to_units(path: &std::path::Path) -> Vec<u8> {
	use std::os::unix::ffi::OsStrExt;
	path.as_os_str().as_bytes().to_vec()
}

enum ServerState {
	/// Created but not yet started; configuration is still mutable.
	Configured {
		callback: FseCallback,
		user_data: UserData,
		config: WatcherConfig,
	},
	Running(WatchServer),
	Closed,
}

/// Opaque server handle handed across the boundary.
pub struct FseServer {
	state: Mutex<ServerState>,
}

impl FseServer {
	/// Start the engine if it has not been started yet, then run `operation`
	/// against it.
	fn with_running<T>(
		&self,
		operation: impl FnOnce(&WatchServer) -> Result<T, WatchError>,
	) -> Result<T, WatchError> {
		let mut state = self.state.lock();
		if let ServerState::Configured { .. } = &*state {
			let ServerState::Configured {
				callback,
				user_data,
				config,
			} = std::mem::replace(&mut *state, ServerState::Closed)
			else {
				unreachable!()
			};
			let sink = Arc::new(CallbackSink {
				callback,
				user_data,
			});
			match WatchServer::start(sink, config) {
				Ok(server) => *state = ServerState::Running(server),
				Err(err) => return Err(err),
			}
		}
		match &*state {
			ServerState::Running(server) => operation(server),
			ServerState::Closed => Err(WatchError::Closed),
			ServerState::Configured { .. } => unreachable!(),
		}
	}

	fn with_config(
		&self,
		mutate: impl FnOnce(WatcherConfig) -> WatcherConfig,
	) -> FseStatus {
		let mut state = self.state.lock();
		match &mut *state {
			ServerState::Configured { config, .. } => {
				*config = mutate(config.clone());
				FseStatus::Ok
			}
			// Configuration is sealed once the engine runs.
			ServerState::Running(_) => FseStatus::BackendFault,
			ServerState::Closed => FseStatus::Closed,
		}
	}
}

fn decode_path(path: *const u16, len: usize) -> Result<PathBuf, FseStatus> {
	if path.is_null() {
		return Err(FseStatus::InvalidArgument);
	}
	let units = unsafe { std::slice::from_raw_parts(path, len) };
	match String::from_utf16(units) {
		Ok(path) => Ok(PathBuf::from(path)),
		Err(_) => Err(FseStatus::InvalidArgument),
	}
}

/// Create a server delivering events to `callback` with `user_data`.
/// Writes the handle to `out_server` and returns `Ok`.
///
/// # Safety
///
/// `out_server` must be a valid pointer; `user_data` must stay valid until
/// `fse_server_destroy` returns.
#[no_mangle]
pub unsafe extern "C" fn fse_server_create(
	callback: Option<FseCallback>,
	user_data: *mut c_void,
	out_server: *mut *mut FseServer,
) -> FseStatus {
	let Some(callback) = callback else {
		return FseStatus::InvalidArgument;
	};
	if out_server.is_null() {
		return FseStatus::InvalidArgument;
	}

	let server = Box::new(FseServer {
		state: Mutex::new(ServerState::Configured {
			callback,
			user_data: UserData(user_data),
			config: WatcherConfig::default(),
		}),
	});
	unsafe { out_server.write(Box::into_raw(server)) };
	FseStatus::Ok
}

/// Start the backend thread now instead of on the first watch call.
///
/// # Safety
///
/// `server` must be a live handle from [`fse_server_create`].
#[no_mangle]
pub unsafe extern "C" fn fse_server_start(server: *mut FseServer) -> FseStatus {
	let Some(server) = (unsafe { server.as_ref() }) else {
		return FseStatus::InvalidArgument;
	};
	match server.with_running(|_| Ok(())) {
		Ok(()) => FseStatus::Ok,
		Err(err) => err.into(),
	}
}

/// Subscribe a root directory given as UTF-16 units.
///
/// # Safety
///
/// `server` must be a live handle; `path` must point at `len` readable
/// UTF-16 units.
#[no_mangle]
pub unsafe extern "C" fn fse_server_start_watching(
	server: *mut FseServer,
	path: *const u16,
	len: usize,
) -> FseStatus {
	let Some(server) = (unsafe { server.as_ref() }) else {
		return FseStatus::InvalidArgument;
	};
	let root = match decode_path(path, len) {
		Ok(root) => root,
		Err(status) => return status,
	};
	match server.with_running(|engine| engine.start_watching(&root)) {
		Ok(()) => FseStatus::Ok,
		Err(err) => err.into(),
	}
}

/// Unsubscribe a root previously passed to [`fse_server_start_watching`].
///
/// # Safety
///
/// Same contract as [`fse_server_start_watching`].
#[no_mangle]
pub unsafe extern "C" fn fse_server_stop_watching(
	server: *mut FseServer,
	path: *const u16,
	len: usize,
) -> FseStatus {
	let Some(server) = (unsafe { server.as_ref() }) else {
		return FseStatus::InvalidArgument;
	};
	let root = match decode_path(path, len) {
		Ok(root) => root,
		Err(status) => return status,
	};
	match server.with_running(|engine| engine.stop_watching(&root)) {
		Ok(()) => FseStatus::Ok,
		Err(err) => err.into(),
	}
}

/// Stop every subscription and the backend thread. After this returns the
/// callback will never be invoked again.
///
/// # Safety
///
/// `server` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn fse_server_close(server: *mut FseServer) -> FseStatus {
	let Some(server) = (unsafe { server.as_ref() }) else {
		return FseStatus::InvalidArgument;
	};
	let mut state = server.state.lock();
	match std::mem::replace(&mut *state, ServerState::Closed) {
		ServerState::Running(engine) => match engine.close() {
			Ok(()) => FseStatus::Ok,
			Err(err) => err.into(),
		},
		ServerState::Configured { .. } | ServerState::Closed => FseStatus::Ok,
	}
}

/// Close the server if needed and free the handle.
///
/// # Safety
///
/// `server` must be a handle from [`fse_server_create`] that has not been
/// destroyed; it is invalid after this returns.
#[no_mangle]
pub unsafe extern "C" fn fse_server_destroy(server: *mut FseServer) {
	if server.is_null() {
		return;
	}
	let server = unsafe { Box::from_raw(server) };
	let state = std::mem::replace(&mut *server.state.lock(), ServerState::Closed);
	if let ServerState::Running(engine) = state {
		let _ = engine.close();
	}
}

/// Set the per-directory event buffer size in bytes, clamped to
/// `[4 KiB, 64 MiB]`. Only consulted by the Windows backend, and only
/// before the engine starts.
///
/// # Safety
///
/// `server` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn fse_server_set_buffer_size(
	server: *mut FseServer,
	bytes: usize,
) -> FseStatus {
	let Some(server) = (unsafe { server.as_ref() }) else {
		return FseStatus::InvalidArgument;
	};
	server.with_config(|config| config.with_event_buffer_size(bytes))
}

/// Set the delivery latency in microseconds. Only consulted by the macOS
/// backend, and only before the engine starts.
///
/// # Safety
///
/// `server` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn fse_server_set_latency(
	server: *mut FseServer,
	micros: u64,
) -> FseStatus {
	let Some(server) = (unsafe { server.as_ref() }) else {
		return FseStatus::InvalidArgument;
	};
	server.with_config(|config| config.with_latency(Duration::from_micros(micros)))
}

static LOG_RELOAD: Lazy<Mutex<Option<reload::Handle<LevelFilter, Registry>>>> =
	Lazy::new(|| Mutex::new(None));

fn level_from_code(level: i32) -> LevelFilter {
	match level {
		0 => LevelFilter::OFF,
		1 => LevelFilter::ERROR,
		2 => LevelFilter::WARN,
		3 => LevelFilter::INFO,
		4 => LevelFilter::DEBUG,
		_ => LevelFilter::TRACE,
	}
}

/// Adjust diagnostic verbosity: 0 off, 1 error, 2 warn, 3 info, 4 debug,
/// 5 trace. Affects only the detail of internal logging and failure
/// messages. Installs the diagnostic subscriber on first use.
#[no_mangle]
pub extern "C" fn fse_set_log_level(level: i32) {
	let mut handle = LOG_RELOAD.lock();
	match handle.as_ref() {
		Some(reload) => {
			let _ = reload.reload(level_from_code(level));
		}
		None => {
			let (filter, reload) = reload::Layer::new(level_from_code(level));
			let subscriber = tracing_subscriber::registry()
				.with(filter)
				.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
			// Another subscriber may already be installed by the host
			// process; keep the handle only when ours won.
			if tracing::subscriber::set_global_default(subscriber).is_ok() {
				*handle = Some(reload);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use std::time::{Duration, Instant};

	#[derive(Default)]
	struct Collected {
		events: Mutex<Vec<(FseEventType, FseChangeKind, PathBuf)>>,
	}

	extern "C" fn collect(user_data: *mut c_void, event: *const FseEvent) {
		let collected = unsafe { &*(user_data as *const Collected) };
		let event = unsafe { &*event };
		let path = if event.path.is_null() {
			PathBuf::new()
		} else {
			let units = unsafe { std::slice::from_raw_parts(event.path, event.path_len) };
			#[cfg(windows)]
			{
				PathBuf::from(String::from_utf16_lossy(units))
			}
			#[cfg(not(windows))]
			{
				use std::os::unix::ffi::OsStrExt;
				PathBuf::from(std::ffi::OsStr::from_bytes(units))
			}
		};
		collected
			.events
			.lock()
			.push((event.event_type, event.change_kind, path));
	}

	fn utf16(path: &std::path::Path) -> Vec<u16> {
		path.to_string_lossy().encode_utf16().collect()
	}

	#[test]
	fn full_lifecycle_through_the_c_surface() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().canonicalize().unwrap();
		let collected = Box::new(Collected::default());
		let collected_ptr = &*collected as *const Collected as *mut c_void;

		let mut server: *mut FseServer = std::ptr::null_mut();
		let status = unsafe { fse_server_create(Some(collect), collected_ptr, &mut server) };
		assert_eq!(status, FseStatus::Ok);
		assert!(!server.is_null());

		let wide = utf16(&root);
		let status = unsafe { fse_server_start_watching(server, wide.as_ptr(), wide.len()) };
		assert_eq!(status, FseStatus::Ok);

		// Duplicate watch surfaces the membership error.
		let status = unsafe { fse_server_start_watching(server, wide.as_ptr(), wide.len()) };
		assert_eq!(status, FseStatus::AlreadyWatching);

		let file = root.join("via-ffi.txt");
		fs::write(&file, b"x").unwrap();

		let deadline = Instant::now() + Duration::from_secs(10);
		loop {
			{
				let events = collected.events.lock();
				if events.iter().any(|(event_type, kind, path)| {
					*event_type == FseEventType::Change
						&& *kind == FseChangeKind::Created
						&& path == &file
				}) {
					break;
				}
			}
			assert!(Instant::now() < deadline, "created event never delivered");
			std::thread::sleep(Duration::from_millis(20));
		}

		let status = unsafe { fse_server_stop_watching(server, wide.as_ptr(), wide.len()) };
		assert_eq!(status, FseStatus::Ok);

		assert_eq!(unsafe { fse_server_close(server) }, FseStatus::Ok);
		// Operations after close fail closed.
		let status = unsafe { fse_server_start_watching(server, wide.as_ptr(), wide.len()) };
		assert_eq!(status, FseStatus::Closed);

		unsafe { fse_server_destroy(server) };
	}

	#[test]
	fn create_rejects_null_arguments() {
		let mut server: *mut FseServer = std::ptr::null_mut();
		assert_eq!(
			unsafe { fse_server_create(None, std::ptr::null_mut(), &mut server) },
			FseStatus::InvalidArgument
		);
		assert_eq!(
			unsafe { fse_server_create(Some(collect), std::ptr::null_mut(), std::ptr::null_mut()) },
			FseStatus::InvalidArgument
		);
	}

	#[test]
	fn configuration_is_sealed_after_start() {
		let collected = Box::new(Collected::default());
		let collected_ptr = &*collected as *const Collected as *mut c_void;

		let mut server: *mut FseServer = std::ptr::null_mut();
		assert_eq!(
			unsafe { fse_server_create(Some(collect), collected_ptr, &mut server) },
			FseStatus::Ok
		);
		assert_eq!(
			unsafe { fse_server_set_buffer_size(server, 64 * 1024) },
			FseStatus::Ok
		);
		assert_eq!(unsafe { fse_server_set_latency(server, 500) }, FseStatus::Ok);

		assert_eq!(unsafe { fse_server_start(server) }, FseStatus::Ok);
		assert_ne!(
			unsafe { fse_server_set_buffer_size(server, 64 * 1024) },
			FseStatus::Ok
		);

		assert_eq!(unsafe { fse_server_close(server) }, FseStatus::Ok);
		unsafe { fse_server_destroy(server) };
	}

	#[test]
	fn invalid_utf16_is_rejected() {
		let collected = Box::new(Collected::default());
		let collected_ptr = &*collected as *const Collected as *mut c_void;

		let mut server: *mut FseServer = std::ptr::null_mut();
		assert_eq!(
			unsafe { fse_server_create(Some(collect), collected_ptr, &mut server) },
			FseStatus::Ok
		);

		// A lone surrogate cannot decode.
		let bad = [0xD800u16];
		assert_eq!(
			unsafe { fse_server_start_watching(server, bad.as_ptr(), bad.len()) },
			FseStatus::InvalidArgument
		);

		unsafe { fse_server_destroy(server) };
	}
}

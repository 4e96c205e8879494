//! Cross-platform file-system change notification engine
//!
//! `fs-events` observes directory hierarchies and streams semantic change
//! events (create, modify, delete, overflow, failure) to a consumer through
//! a blocking event queue. Three OS notification primitives hide behind one
//! thread-safe contract:
//!
//! - **Windows**: a `ReadDirectoryChangesW` completion-routine pump on an
//!   alertable thread
//! - **Linux**: an inotify descriptor multiplexed with an eventfd in `poll`
//! - **macOS**: an `FSEventStream` on a dedicated `CFRunLoop`
//!
//! # Architecture
//!
//! - **[`WatchServer`]**: the platform-neutral interface; owns the root →
//!   watch point map and the single backend thread
//! - **Backend**: the per-platform event pump; all OS resources are touched
//!   only on its thread
//! - **[`EventSink`]/[`ChannelSink`]**: the queue boundary events are
//!   published into
//! - **[`Event`]**: normalized change/overflow/unknown/failure variants
//!
//! Control operations (`start_watching`, `stop_watching`, `close`) may be
//! called from any thread; they marshal work to the backend and block until
//! it acknowledges. Events for one root preserve OS delivery order; events
//! across roots are unordered. After `close` returns, nothing more reaches
//! the sink.
//!
//! Renames are reported as the OS exposes them: a remove of the old name
//! followed by a create of the new one, never a correlated pair. Only
//! directories can be watched; file-level filtering is the consumer's
//! concern.

mod backend;
mod config;
mod error;
mod event;
mod path;
mod server;
mod sink;
mod watch_point;

pub use config::{
	WatcherConfig, DEFAULT_EVENT_BUFFER_SIZE, MAX_EVENT_BUFFER_SIZE, MIN_EVENT_BUFFER_SIZE,
};
pub use error::{Result, WatchError};
pub use event::{ChangeKind, Event, FailureKind};
pub use server::WatchServer;
pub use sink::{BackpressurePolicy, ChannelSink, EventSink};
pub use watch_point::WatchPointStatus;

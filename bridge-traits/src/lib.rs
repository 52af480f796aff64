//! # Host Bridge Traits
//!
//! Capability contracts the sync core needs from its host.
//!
//! ## Overview
//!
//! The sync core never touches the file system or the wall clock directly.
//! Each host provides implementations of the traits below; the desktop build
//! uses `bridge-desktop`.
//!
//! ## Traits
//!
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Local file existence probe
//! - [`Clock`](time::Clock) - Time source for cache expiry and queue timestamps
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors into it and keep the failing path or
//! operation in the message.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared as
//! `Arc<dyn Trait>` across Tokio tasks.

pub mod error;
pub mod storage;
pub mod time;

pub use error::BridgeError;

pub use storage::FileSystemAccess;
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};

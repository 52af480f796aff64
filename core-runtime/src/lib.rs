//! # Core Runtime Module
//!
//! Provides the runtime infrastructure shared by the track sync crates:
//! - Logging and tracing infrastructure
//! - Configuration of the sync core (`SyncConfig`)
//! - Event bus carrying queue, transfer, worker and invalidation events
//!
//! ## Overview
//!
//! Every other core crate depends on this one. It fixes the logging
//! conventions, the configuration surface handed to the service facade, and
//! the broadcast channel that views subscribe to for refresh signals.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};

//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `FileSystemAccess` using `tokio::fs`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::TokioFileSystem;
//! use bridge_traits::FileSystemAccess;
//!
//! #[tokio::main]
//! async fn main() {
//!     let fs = TokioFileSystem::new();
//!     let present = fs.exists(Path::new("/music/track.flac")).await.unwrap_or(false);
//! }
//! ```

mod filesystem;

pub use filesystem::TokioFileSystem;

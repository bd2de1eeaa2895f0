//! # turbotape
//!
//! A library for uploading files to NodeMCU / ESP8266 boards over a serial
//! link, fast.
//!
//! A small companion receiver program on the device accepts the file as raw
//! fixed-width chunks instead of line-by-line Lua commands. This crate
//! implements the host side:
//!
//! - Command/response exchange with echo suppression
//! - Chunked payload transfer paced by a per-chunk delay
//! - SHA-1 content verification
//! - Retry with exponential backoff and a bounded attempt count
//! - Optional remote execution of the uploaded file
//! - Serial port discovery
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use turbotape::{NativePort, UploadConfig, UploadEvent, UploadSession};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let mut session = UploadSession::from_file(port, "init.lua", UploadConfig::default())?;
//!
//!     session.upload(|event| {
//!         if let UploadEvent::ChunkSent { sent, total } = event {
//!             println!("{sent}/{total}");
//!         }
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod host;
pub mod port;
pub mod protocol;
pub mod uploader;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker polled while waiting on the device.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    device::{DetectedPort, DeviceKind},
    error::{Error, ErrorKind, Result},
    host::{auto_detect_port, discover_ports},
    port::{Port, SerialConfig},
    protocol::{CHUNK_WIDTH, Chunk, content_hash},
    uploader::{UploadConfig, UploadEvent, UploadReport, UploadSession, UploadState},
};

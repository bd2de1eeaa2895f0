//! turbotape wire protocol.
//!
//! Plain text over the serial link, spoken with the companion receiver
//! program running on the device:
//!
//! ```text
//! host                                   device
//!  | turbotape("init.lua", 1234)\n  -->   |
//!  |                               <--   | turbotape("init.lua", 1234)   (echo)
//!  |                               <--   | READY
//!  | <40 raw bytes> ... <40 raw bytes> -> |   (no framing, no ack)
//!  | EOF\n                          -->   |
//!  |                               <--   | EOF                           (echo)
//!  |                               <--   | > <sha1 hex of payload + "\n">
//!  | dofile("init.lua")\n           -->   |   (optional)
//! ```

pub mod exchange;
pub mod execute;
pub mod transfer;
pub mod verify;

use crate::error::{Error, Result};

// Re-export common types
pub use exchange::{Command, CommandExchange, ExchangeState, ResponseClassification, classify};
pub use transfer::{Chunk, chunk_count, chunks};
pub use verify::content_hash;

/// Receiver buffer capacity; every chunk is exactly this wide.
pub const CHUNK_WIDTH: usize = 40;

/// Filler used to pad the final chunk to [`CHUNK_WIDTH`].
pub const PAD_BYTE: u8 = b' ';

/// Handshake acknowledgment.
pub const READY: &str = "READY";

/// End-of-transfer sentinel command.
pub const EOF: &str = "EOF";

/// Prefix of the hash acknowledgment line.
pub const HASH_PREFIX: &str = "> ";

/// Terminator appended to commands and to the hashed payload.
pub const LINE_TERMINATOR: &[u8] = b"\n";

/// Build the handshake command, optionally declaring the unpadded length.
pub fn handshake_command(basename: &str, byte_length: Option<usize>) -> String {
    match byte_length {
        Some(len) => format!("turbotape(\"{basename}\", {len})"),
        None => format!("turbotape(\"{basename}\")"),
    }
}

/// Build the remote execution command.
pub fn run_command(basename: &str) -> String {
    format!("dofile(\"{basename}\")")
}

/// Expected acknowledgment for a content hash.
pub fn hash_ack(hex: &str) -> String {
    format!("{HASH_PREFIX}{hex}")
}

/// Check that a file name can be quoted inside a receiver command.
pub fn validate_basename(basename: &str) -> Result<()> {
    if basename.is_empty() {
        return Err(Error::InvalidFileName("empty file name".into()));
    }
    if let Some(c) = basename
        .chars()
        .find(|c| matches!(c, '"' | '\\') || c.is_control())
    {
        return Err(Error::InvalidFileName(format!(
            "{basename:?} contains unsupported character {c:?}"
        )));
    }
    Ok(())
}

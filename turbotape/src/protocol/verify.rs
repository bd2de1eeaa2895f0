//! Content hash verification.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::exchange::{Command, CommandExchange};
use crate::protocol::{EOF, LINE_TERMINATOR, hash_ack};
use log::debug;
use sha1::{Digest, Sha1};
use std::time::Duration;

/// Lowercase hex SHA-1 of `payload` followed by one line terminator.
pub fn content_hash(payload: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(payload);
    hasher.update(LINE_TERMINATOR);
    hex::encode(hasher.finalize())
}

/// Send the end-of-transfer sentinel and check the receiver's hash.
///
/// Returns the verified hash. A wrong acknowledgment is reported as
/// [`Error::Integrity`], not as a protocol mismatch.
pub fn verify<P: Port>(
    exchange: &mut CommandExchange<'_, P>,
    payload: &[u8],
    timeout: Duration,
) -> Result<String> {
    let hash = content_hash(payload);
    debug!("Expecting SHA1 {hash}");

    match exchange.send(&Command::expect(EOF, hash_ack(&hash), timeout)) {
        Ok(()) => Ok(hash),
        Err(Error::Mismatch { expected, actual }) => Err(Error::Integrity { expected, actual }),
        Err(e) => Err(e),
    }
}

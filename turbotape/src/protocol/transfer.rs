//! Chunked payload transfer.
//!
//! The payload is cut into fixed-width chunks matching the receiver's buffer.
//! The last chunk is padded with [`PAD_BYTE`](super::PAD_BYTE); the receiver
//! learns the real length from the handshake and drops the padding.
//!
//! ```text
//! payload (L bytes):  |<---- W ---->|<---- W ---->|<- L mod W ->|
//! chunks:             |   chunk 0   |   chunk 1   | chunk 2 pad |
//! ```

use crate::error::Result;
use crate::port::Port;
use crate::protocol::PAD_BYTE;
use crate::protocol::exchange::CommandExchange;
use log::debug;
use std::ops::Range;
use std::time::Duration;

/// Number of chunks needed for `len` bytes at `width` bytes per chunk.
pub fn chunk_count(len: usize, width: usize) -> usize {
    len.div_ceil(width)
}

/// One fixed-width slice of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the transfer order, starting at 0.
    pub index: usize,
    /// Byte range of the payload covered by this chunk.
    pub range: Range<usize>,
    /// Bytes on the wire, always exactly the chunk width.
    pub bytes: Vec<u8>,
}

impl Chunk {
    /// Payload bytes without padding.
    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.range.len()]
    }

    /// Whether filler bytes were appended.
    pub fn is_padded(&self) -> bool {
        self.range.len() < self.bytes.len()
    }
}

/// Split `payload` into chunks of exactly `width` bytes.
///
/// `width` must be non-zero.
pub fn chunks(payload: &[u8], width: usize) -> impl Iterator<Item = Chunk> + '_ {
    payload
        .chunks(width)
        .enumerate()
        .map(move |(index, data)| {
            let start = index * width;
            let mut bytes = Vec::with_capacity(width);
            bytes.extend_from_slice(data);
            bytes.resize(width, PAD_BYTE);
            Chunk {
                index,
                range: start..start + data.len(),
                bytes,
            }
        })
}

/// Send `payload` chunk by chunk, pausing `delay` after each drained write.
///
/// `progress` receives `(chunks_sent, total_chunks)`. The first failing write
/// aborts the transfer and its error is returned unchanged.
pub fn transfer<P, F>(
    exchange: &mut CommandExchange<'_, P>,
    payload: &[u8],
    width: usize,
    delay: Duration,
    mut progress: F,
) -> Result<usize>
where
    P: Port,
    F: FnMut(usize, usize),
{
    let total = chunk_count(payload.len(), width);
    debug!(
        "Sending {} bytes in {total} chunks of {width} (delay {} ms)",
        payload.len(),
        delay.as_millis()
    );

    for chunk in chunks(payload, width) {
        exchange.send_raw(&chunk.bytes, delay)?;
        progress(chunk.index + 1, total);
    }

    Ok(total)
}

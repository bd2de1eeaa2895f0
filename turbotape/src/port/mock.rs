//! In-memory port and simulated companion receiver for tests.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::{CHUNK_WIDTH, chunk_count, content_hash, hash_ack};
use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

thread_local! {
    static INTERRUPTED: Cell<bool> = const { Cell::new(false) };
}

/// Request (or withdraw) interruption for the calling test thread only.
pub(crate) fn interrupt_current_thread(on: bool) {
    crate::set_interrupt_checker(|| INTERRUPTED.with(Cell::get));
    INTERRUPTED.with(|flag| flag.set(on));
}

/// How the simulated receiver consumed a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    /// Text command line.
    Command,
    /// Raw chunk bytes.
    Chunk,
}

enum Backend {
    Responder(Responder),
    Receiver(Receiver),
}

/// Port whose inbound data is produced by a responder reacting to each write.
pub(crate) struct MockPort {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    kinds: Vec<WriteKind>,
    backend: Backend,
    timeout: Duration,
    closed: bool,
    clears: usize,
}

impl MockPort {
    fn with_backend(backend: Backend) -> Self {
        Self {
            inbound: VecDeque::new(),
            writes: Vec::new(),
            kinds: Vec::new(),
            backend,
            timeout: Duration::from_millis(10),
            closed: false,
            clears: 0,
        }
    }

    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self::with_backend(Backend::Responder(Box::new(responder)))
    }

    /// Port that never answers.
    pub(crate) fn silent() -> Self {
        Self::with_responder(|_| Vec::new())
    }

    /// Port backed by a simulated receiver.
    pub(crate) fn receiver(receiver: Receiver) -> Self {
        Self::with_backend(Backend::Receiver(receiver))
    }

    /// Every write call, in order.
    pub(crate) fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    fn writes_of(&self, kind: WriteKind) -> impl Iterator<Item = &[u8]> {
        self.writes
            .iter()
            .zip(&self.kinds)
            .filter(move |(_, k)| **k == kind)
            .map(|(w, _)| w.as_slice())
    }

    /// Writes the receiver stored as chunk data.
    pub(crate) fn chunk_writes(&self) -> Vec<&[u8]> {
        self.writes_of(WriteKind::Chunk).collect()
    }

    /// Writes the receiver parsed as commands, terminator stripped.
    pub(crate) fn command_writes(&self) -> Vec<String> {
        self.writes_of(WriteKind::Command)
            .map(|w| String::from_utf8_lossy(w.strip_suffix(b"\n").unwrap_or(w)).into_owned())
            .collect()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn clears(&self) -> usize {
        self.clears
    }
}

fn closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed")
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(closed());
        }
        if self.inbound.is_empty() {
            thread::sleep(Duration::from_millis(1).min(self.timeout));
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data",
            ));
        }
        let n = buf.len().min(self.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(closed());
        }
        self.writes.push(buf.to_vec());
        let reply = match &mut self.backend {
            Backend::Responder(responder) => responder(buf),
            Backend::Receiver(receiver) => {
                let (kind, reply) = receiver.feed(buf);
                self.kinds.push(kind);
                reply
            },
        };
        self.inbound.extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.closed { Err(closed()) } else { Ok(()) }
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.inbound.clear();
        self.clears += 1;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.inbound.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Simulated companion receiver running on the device.
///
/// Echoes every command line, answers the handshake with `READY` and the
/// `EOF` sentinel with the hash of what it stored.
#[derive(Debug, Default)]
pub(crate) struct Receiver {
    /// Whether the receiver program is installed at all.
    pub(crate) missing: bool,
    /// Handshakes to swallow without any answer.
    pub(crate) silent_handshakes: usize,
    /// `EOF` commands to swallow without any answer.
    pub(crate) silent_eofs: usize,
    /// Flip the first stored byte before hashing.
    pub(crate) corrupt: bool,
    /// Line sent after the echo of `dofile(..)`, if any.
    pub(crate) run_reply: Option<String>,
    /// Unsolicited line printed after every chunk, if any.
    pub(crate) chatter: Option<String>,
    /// Partial command line received so far.
    pub(crate) line: Vec<u8>,
    /// Chunk bytes still expected for the current file.
    pub(crate) raw_remaining: usize,
    /// Length announced by the last handshake.
    pub(crate) declared: usize,
    /// Chunk bytes received for the current file.
    pub(crate) stored: Vec<u8>,
}

impl Receiver {
    fn feed(&mut self, bytes: &[u8]) -> (WriteKind, Vec<u8>) {
        if self.raw_remaining > 0 {
            let take = bytes.len().min(self.raw_remaining);
            self.stored.extend_from_slice(&bytes[..take]);
            self.raw_remaining -= take;

            let mut out = Vec::new();
            if let Some(text) = &self.chatter {
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            return (WriteKind::Chunk, out);
        }

        let mut out = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                self.handle_line(&line, &mut out);
            } else {
                self.line.push(b);
            }
        }
        (WriteKind::Command, out)
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<u8>) {
        let mut reply = |text: &str| {
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"\r\n");
        };
        reply(line);

        if line.starts_with("turbotape(") {
            if self.missing {
                reply("stdin:1: attempt to call global 'turbotape' (a nil value)");
                return;
            }
            if self.silent_handshakes > 0 {
                self.silent_handshakes -= 1;
                return;
            }
            self.declared = line
                .rsplit_once(", ")
                .and_then(|(_, rest)| rest.trim_end_matches(')').parse().ok())
                .unwrap_or(0);
            self.raw_remaining = chunk_count(self.declared, CHUNK_WIDTH) * CHUNK_WIDTH;
            self.stored.clear();
            reply("READY");
        } else if line == "EOF" {
            if self.silent_eofs > 0 {
                self.silent_eofs -= 1;
                return;
            }
            let mut data = self.stored[..self.declared.min(self.stored.len())].to_vec();
            if self.corrupt {
                if let Some(first) = data.first_mut() {
                    *first ^= 0xFF;
                }
            }
            reply(&hash_ack(&content_hash(&data)));
        } else if line.starts_with("dofile(") {
            if let Some(text) = self.run_reply.clone() {
                reply(&text);
            }
        }
    }
}

//! Command/response exchange with echo suppression.
//!
//! The receiver echoes every command line verbatim before its real answer.
//! Each command is driven through a small state machine:
//!
//! ```text
//! AwaitingEcho --echo--> AwaitingResponse --match/mismatch--> Resolved
//!      |                        |
//!      +------match/mismatch----+-------------> Resolved
//!      +------------deadline--------------------> TimedOut
//! ```
//!
//! Only one echo is filtered per command; a second echo-looking line is
//! judged as the response. The exchange is the sole reader of the port and
//! returns only once the command is resolved, so nothing keeps listening
//! after a timeout. Anything received while no command was pending, read or
//! not, is dropped before the next command goes out.

use crate::error::{Error, Result};
use crate::port::Port;
use log::{debug, trace};
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for a single blocking read while waiting for a response.
pub const READ_POLL: Duration = Duration::from_millis(50);

/// Default response window for commands that expect an answer.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A single command sent to the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command text, sent followed by a line terminator.
    pub text: String,
    /// Expected response prefix; `None` makes the command fire-and-forget.
    pub expect: Option<String>,
    /// Response window, measured from drain completion.
    pub timeout: Duration,
    /// Pause after drain for fire-and-forget commands.
    pub settle: Duration,
}

impl Command {
    /// Command that waits for a response starting with `expect`.
    pub fn expect(text: impl Into<String>, expect: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            expect: Some(expect.into()),
            timeout,
            settle: Duration::ZERO,
        }
    }

    /// Command that is considered done `settle` after it drained.
    pub fn fire_and_forget(text: impl Into<String>, settle: Duration) -> Self {
        Self {
            text: text.into(),
            expect: None,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            settle,
        }
    }
}

/// Classification of one inbound line relative to a pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClassification {
    /// Verbatim echo of the command.
    Echo,
    /// The expected response.
    Match,
    /// Anything else.
    Mismatch,
}

/// Progress of the command currently (or last) in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeState {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// Sent; the echo has not been seen.
    AwaitingEcho,
    /// Echo consumed; the next line decides.
    AwaitingResponse,
    /// Resolved by a matching or mismatching line.
    Resolved,
    /// No line arrived before the deadline.
    TimedOut,
}

/// Classify `line` for a command in `state`.
pub fn classify(
    state: ExchangeState,
    command: &str,
    expected: &str,
    line: &str,
) -> ResponseClassification {
    if state == ExchangeState::AwaitingEcho && line.starts_with(command) {
        ResponseClassification::Echo
    } else if line.starts_with(expected) {
        ResponseClassification::Match
    } else {
        ResponseClassification::Mismatch
    }
}

/// Splits the inbound byte stream into lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete, non-empty line with `\r\n` / `\n` stripped.
    fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }

    /// Drop everything buffered, returning the number of complete lines.
    fn discard(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(line) = self.next_line() {
            trace!("Discarding unsolicited line: {line:?}");
            dropped += 1;
        }
        self.pending.clear();
        dropped
    }
}

/// Sends commands over a port and resolves their responses.
pub struct CommandExchange<'a, P: Port> {
    port: &'a mut P,
    lines: LineBuffer,
    state: ExchangeState,
}

impl<'a, P: Port> CommandExchange<'a, P> {
    /// Wrap a port, capping its read timeout so deadlines stay responsive.
    pub fn new(port: &'a mut P) -> Result<Self> {
        if port.timeout() > READ_POLL {
            port.set_timeout(READ_POLL)?;
        }
        Ok(Self {
            port,
            lines: LineBuffer::default(),
            state: ExchangeState::Idle,
        })
    }

    /// State of the most recent command.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Send one command and wait for it to resolve.
    pub fn send(&mut self, command: &Command) -> Result<()> {
        // Data that arrived with no command listening is not a response
        self.port.discard_input()?;
        self.lines.discard();

        debug!("TX {:?}", command.text);
        let mut wire = Vec::with_capacity(command.text.len() + 1);
        wire.extend_from_slice(command.text.as_bytes());
        wire.extend_from_slice(super::LINE_TERMINATOR);
        self.port.write_all_bytes(&wire)?;

        match command.expect.as_deref() {
            None => {
                self.state = ExchangeState::Resolved;
                settle(command.settle)
            },
            Some(expected) => self.await_response(command, expected),
        }
    }

    /// Write raw bytes without framing, then pause for `settle`.
    pub fn send_raw(&mut self, bytes: &[u8], settle_for: Duration) -> Result<()> {
        trace!("TX {} raw bytes", bytes.len());
        self.port.write_all_bytes(bytes)?;
        self.state = ExchangeState::Resolved;
        settle(settle_for)
    }

    fn await_response(&mut self, command: &Command, expected: &str) -> Result<()> {
        let deadline = Instant::now() + command.timeout;
        self.state = ExchangeState::AwaitingEcho;

        loop {
            let Some(line) = self.next_line(deadline)? else {
                self.state = ExchangeState::TimedOut;
                return Err(Error::Timeout(format!(
                    "no response to {:?} within {} ms",
                    command.text,
                    command.timeout.as_millis()
                )));
            };
            trace!("RX {line:?}");

            match classify(self.state, &command.text, expected, &line) {
                ResponseClassification::Echo => {
                    self.state = ExchangeState::AwaitingResponse;
                },
                ResponseClassification::Match => {
                    self.state = ExchangeState::Resolved;
                    return Ok(());
                },
                ResponseClassification::Mismatch => {
                    self.state = ExchangeState::Resolved;
                    return Err(Error::Mismatch {
                        expected: expected.to_string(),
                        actual: line,
                    });
                },
            }
        }
    }

    fn next_line(&mut self, deadline: Instant) -> Result<Option<String>> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            match self.port.read(&mut buf) {
                Ok(0) => {},
                Ok(n) => self.lines.push(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

fn settle(duration: Duration) -> Result<()> {
    if crate::is_interrupted_requested() {
        return Err(Error::Interrupted);
    }
    if !duration.is_zero() {
        thread::sleep(duration);
    }
    Ok(())
}

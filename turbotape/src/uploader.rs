//! Upload session and retry controller.
//!
//! One attempt is handshake, transfer, verify and an optional run. Failed
//! attempts are classified here and nowhere else:
//!
//! ```text
//! Idle -> Handshaking -> Transferring -> Verifying -> [Executing] -> Done
//!              ^                |             |            |
//!              |     Timeout / Mismatch (retryable)        |
//!              +------------ Retrying <--------------------+
//!
//! handshake Mismatch -> ReceiverAbsent -> Failed (no chunk sent)
//! Integrity / I/O / interrupt / attempts exhausted -> Failed
//! ```
//!
//! Every retry doubles the per-chunk delay, so attempt `n + 1` runs with
//! `initial_delay * 2^n`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use turbotape::{NativePort, UploadConfig, UploadSession};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let config = UploadConfig::default().with_run(true);
//!     let mut session = UploadSession::from_file(port, "init.lua", config)?;
//!     let report = session.upload(|event| println!("{event:?}"))?;
//!     println!("uploaded in {} attempt(s)", report.attempts);
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::exchange::{Command, CommandExchange, DEFAULT_RESPONSE_TIMEOUT};
use crate::protocol::{self, CHUNK_WIDTH, READY, execute, transfer, verify};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Per-chunk delay of the first attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(4);

/// Attempts made before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Upload tuning options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Per-chunk delay of the first attempt.
    pub initial_delay: Duration,
    /// Maximum number of attempts, at least 1.
    pub max_attempts: u32,
    /// Response window for handshake, verification and acknowledged runs.
    pub response_timeout: Duration,
    /// Chunk width; must match the receiver buffer.
    pub chunk_width: usize,
    /// Run the file after a verified upload.
    pub run: bool,
    /// Response expected after the run command; `None` does not wait.
    pub run_ack: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            chunk_width: CHUNK_WIDTH,
            run: false,
            run_ack: None,
        }
    }
}

impl UploadConfig {
    /// Set the first attempt's per-chunk delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the attempt bound.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the response window.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the chunk width.
    #[must_use]
    pub fn with_chunk_width(mut self, width: usize) -> Self {
        self.chunk_width = width;
        self
    }

    /// Run the file after upload.
    #[must_use]
    pub fn with_run(mut self, run: bool) -> Self {
        self.run = run;
        self
    }

    /// Wait for this response after the run command.
    #[must_use]
    pub fn with_run_ack(mut self, ack: impl Into<String>) -> Self {
        self.run_ack = Some(ack.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.chunk_width == 0 {
            return Err(Error::Config("chunk_width must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where the session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    /// Not started.
    #[default]
    Idle,
    /// Waiting for `READY`.
    Handshaking,
    /// Sending chunks.
    Transferring,
    /// Waiting for the hash acknowledgment.
    Verifying,
    /// Running the uploaded file.
    Executing,
    /// Backing off before the next attempt.
    Retrying,
    /// Uploaded (and run, if requested).
    Done,
    /// Stopped with an error.
    Failed,
}

/// Progress notification emitted during [`UploadSession::upload`].
#[derive(Debug)]
pub enum UploadEvent<'a> {
    /// A new attempt begins.
    AttemptStarted {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Per-chunk delay used by this attempt.
        delay: Duration,
    },
    /// Receiver answered `READY`.
    Handshaked {
        /// Number of chunks about to be sent.
        chunks: usize,
    },
    /// One chunk drained.
    ChunkSent {
        /// Chunks sent so far.
        sent: usize,
        /// Chunks in this transfer.
        total: usize,
    },
    /// All chunks sent; hash check starts.
    Verifying,
    /// Receiver confirmed the hash.
    Verified {
        /// Hex SHA-1 that was confirmed.
        hash: &'a str,
    },
    /// Run command about to be sent.
    Running {
        /// File being run.
        basename: &'a str,
    },
    /// Attempt failed with a retryable error.
    Retrying {
        /// Attempt that failed.
        attempt: u32,
        /// Delay for the next attempt.
        next_delay: Duration,
        /// Why it failed.
        error: &'a Error,
    },
}

/// Summary of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadReport {
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Chunks sent by the successful attempt.
    pub chunks_sent: usize,
    /// Per-chunk delay of the successful attempt.
    pub final_delay: Duration,
    /// Verified hex SHA-1.
    pub hash: String,
}

/// A single upload of one file over one port.
pub struct UploadSession<P: Port> {
    port: P,
    basename: String,
    payload: Vec<u8>,
    config: UploadConfig,
    delay: Duration,
    attempts: u32,
    chunks_sent: usize,
    state: UploadState,
}

impl<P: Port> UploadSession<P> {
    /// Create a session for `payload`, stored on the device as `basename`.
    pub fn new(
        port: P,
        basename: impl Into<String>,
        payload: Vec<u8>,
        config: UploadConfig,
    ) -> Result<Self> {
        let basename = basename.into();
        protocol::validate_basename(&basename)?;
        config.validate()?;

        Ok(Self {
            port,
            basename,
            payload,
            delay: config.initial_delay,
            config,
            attempts: 0,
            chunks_sent: 0,
            state: UploadState::Idle,
        })
    }

    /// Create a session from a file on disk, keeping only its file name.
    pub fn from_file(port: P, path: impl AsRef<Path>, config: UploadConfig) -> Result<Self> {
        let path = path.as_ref();
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidFileName(path.display().to_string()))?
            .to_string();
        let payload = fs::read(path)?;
        Self::new(port, basename, payload, config)
    }

    /// Name the file gets on the device.
    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Bytes being uploaded.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Current per-chunk delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Chunks sent by the current or last attempt.
    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent
    }

    /// Current state.
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Upload, retrying as needed, then close the port.
    ///
    /// The port is closed whether the upload succeeds or fails.
    pub fn upload<F>(&mut self, mut on_event: F) -> Result<UploadReport>
    where
        F: FnMut(&UploadEvent<'_>),
    {
        let result = self.run_attempts(&mut on_event);

        self.state = match result {
            Ok(_) => UploadState::Done,
            Err(_) => UploadState::Failed,
        };
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }

        result
    }

    fn run_attempts<F>(&mut self, on_event: &mut F) -> Result<UploadReport>
    where
        F: FnMut(&UploadEvent<'_>),
    {
        self.delay = self.config.initial_delay;

        for attempt in 1..=self.config.max_attempts {
            self.attempts = attempt;
            self.chunks_sent = 0;
            debug!(
                "Attempt {attempt}/{} with {} ms delay",
                self.config.max_attempts,
                self.delay.as_millis()
            );
            on_event(&UploadEvent::AttemptStarted {
                attempt,
                delay: self.delay,
            });

            let err = match self.attempt(on_event) {
                Ok(report) => {
                    info!(
                        "{} uploaded ({} bytes, attempt {attempt})",
                        self.basename,
                        self.payload.len()
                    );
                    return Ok(report);
                },
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt == self.config.max_attempts {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            self.state = UploadState::Retrying;
            self.delay = self.delay.saturating_mul(2);
            warn!(
                "Attempt {attempt} failed ({err}), trying again with delay {} ms",
                self.delay.as_millis()
            );
            on_event(&UploadEvent::Retrying {
                attempt,
                next_delay: self.delay,
                error: &err,
            });
        }

        // max_attempts >= 1 is checked at construction
        Err(Error::Config("max_attempts must be at least 1".into()))
    }

    fn attempt<F>(&mut self, on_event: &mut F) -> Result<UploadReport>
    where
        F: FnMut(&UploadEvent<'_>),
    {
        self.port.clear_buffers()?;

        let timeout = self.config.response_timeout;
        let width = self.config.chunk_width;
        let delay = self.delay;
        let mut exchange = CommandExchange::new(&mut self.port)?;

        self.state = UploadState::Handshaking;
        handshake(&mut exchange, &self.basename, self.payload.len(), timeout)?;
        on_event(&UploadEvent::Handshaked {
            chunks: transfer::chunk_count(self.payload.len(), width),
        });

        self.state = UploadState::Transferring;
        let chunks_sent = &mut self.chunks_sent;
        transfer::transfer(&mut exchange, &self.payload, width, delay, |sent, total| {
            *chunks_sent = sent;
            on_event(&UploadEvent::ChunkSent { sent, total });
        })?;

        self.state = UploadState::Verifying;
        on_event(&UploadEvent::Verifying);
        let hash = verify::verify(&mut exchange, &self.payload, timeout)?;
        on_event(&UploadEvent::Verified { hash: &hash });

        if self.config.run {
            self.state = UploadState::Executing;
            on_event(&UploadEvent::Running {
                basename: &self.basename,
            });
            execute::run(
                &mut exchange,
                &self.basename,
                self.config.run_ack.as_deref(),
                timeout,
            )?;
        }

        Ok(UploadReport {
            attempts: self.attempts,
            chunks_sent: self.chunks_sent,
            final_delay: delay,
            hash,
        })
    }
}

/// Announce the file and its true length; anything but `READY` after the
/// echo means the receiver program is not installed.
fn handshake<P: Port>(
    exchange: &mut CommandExchange<'_, P>,
    basename: &str,
    byte_length: usize,
    timeout: Duration,
) -> Result<()> {
    let command = Command::expect(
        protocol::handshake_command(basename, Some(byte_length)),
        READY,
        timeout,
    );
    match exchange.send(&command) {
        Err(Error::Mismatch { actual, .. }) => Err(Error::ReceiverAbsent { response: actual }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::port::mock::{MockPort, Receiver};

    fn fast_config() -> UploadConfig {
        UploadConfig::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_response_timeout(Duration::from_millis(40))
    }

    fn session(receiver: Receiver, payload: &[u8], config: UploadConfig) -> UploadSession<MockPort> {
        let _ = env_logger::builder().is_test(true).try_init();
        UploadSession::new(MockPort::receiver(receiver), "f.lua", payload.to_vec(), config).unwrap()
    }

    #[test]
    fn test_upload_small_file_single_padded_chunk() {
        let mut s = session(Receiver::default(), b"abc", fast_config());
        let report = s.upload(|_| {}).unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.chunks_sent, 1);
        assert_eq!(report.hash, "03cfd743661f07975fa2f1220c5194cbaff48451");
        assert_eq!(s.state(), UploadState::Done);

        let port = s.port();
        assert_eq!(
            port.command_writes(),
            vec!["turbotape(\"f.lua\", 3)".to_string(), "EOF".to_string()]
        );
        let chunks = port.chunk_writes();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 40);
        assert_eq!(&chunks[0][..3], b"abc");
        assert!(chunks[0][3..].iter().all(|&b| b == protocol::PAD_BYTE));
        assert!(port.is_closed());
    }

    #[test]
    fn test_upload_multi_chunk_with_run() {
        let payload: Vec<u8> = "print('hello from turbotape!')\n"
            .repeat(5)
            .into_bytes();
        let config = fast_config().with_run(true);
        let mut s = session(Receiver::default(), &payload, config);

        let mut progress = Vec::new();
        let mut ran = None;
        let report = s
            .upload(|event| match event {
                UploadEvent::ChunkSent { sent, total } => progress.push((*sent, *total)),
                UploadEvent::Running { basename } => ran = Some(basename.to_string()),
                _ => {},
            })
            .unwrap();

        let total = transfer::chunk_count(payload.len(), CHUNK_WIDTH);
        assert_eq!(report.chunks_sent, total);
        assert_eq!(progress.len(), total);
        assert_eq!(progress.last(), Some(&(total, total)));
        assert_eq!(ran.as_deref(), Some("f.lua"));
        assert_eq!(
            s.port().command_writes().last().map(String::as_str),
            Some("dofile(\"f.lua\")")
        );
    }

    #[test]
    fn test_upload_empty_file_sends_no_chunks() {
        let mut s = session(Receiver::default(), b"", fast_config());
        let report = s.upload(|_| {}).unwrap();
        assert_eq!(report.chunks_sent, 0);
        assert_eq!(report.hash, "adc83b19e793491b1c6ea0fd8b46cd9f32e592fc");
        assert!(s.port().chunk_writes().is_empty());
        assert_eq!(
            s.port().command_writes()[0],
            "turbotape(\"f.lua\", 0)"
        );
    }

    #[test]
    fn test_missing_receiver_is_fatal_without_chunks() {
        let receiver = Receiver {
            missing: true,
            ..Receiver::default()
        };
        let mut s = session(receiver, b"abc", fast_config());
        let mut attempts = 0;
        let err = s
            .upload(|event| {
                if matches!(event, UploadEvent::AttemptStarted { .. }) {
                    attempts += 1;
                }
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ReceiverAbsent);
        assert!(matches!(
            &err,
            Error::ReceiverAbsent { response } if response.contains("nil value")
        ));
        assert_eq!(attempts, 1);
        assert!(s.port().chunk_writes().is_empty());
        assert_eq!(s.port().command_writes().len(), 1);
        assert_eq!(s.state(), UploadState::Failed);
        assert!(s.port().is_closed());
    }

    #[test]
    fn test_backoff_doubles_delay_per_retry() {
        let receiver = Receiver {
            silent_eofs: 3,
            ..Receiver::default()
        };
        let mut s = session(receiver, b"abc", fast_config());
        let mut delays = Vec::new();
        let mut retries = 0;
        let report = s
            .upload(|event| match event {
                UploadEvent::AttemptStarted { delay, .. } => delays.push(*delay),
                UploadEvent::Retrying { error, .. } => {
                    assert!(error.is_retryable());
                    retries += 1;
                },
                _ => {},
            })
            .unwrap();

        let initial = Duration::from_millis(1);
        assert_eq!(
            delays,
            (0..4).map(|n| initial * 2u32.pow(n)).collect::<Vec<_>>()
        );
        assert_eq!(retries, 3);
        assert_eq!(report.attempts, 4);
        assert_eq!(report.final_delay, initial * 8);
        assert_eq!(s.delay(), initial * 8);
        // every attempt restarts from the handshake
        let handshakes = s
            .port()
            .command_writes()
            .iter()
            .filter(|c| c.starts_with("turbotape("))
            .count();
        assert_eq!(handshakes, 4);
        assert_eq!(s.port().clears(), 4);
    }

    #[test]
    fn test_handshake_timeout_is_retried() {
        let receiver = Receiver {
            silent_handshakes: 1,
            ..Receiver::default()
        };
        let mut s = session(receiver, b"abc", fast_config());
        let report = s.upload(|_| {}).unwrap();
        assert_eq!(report.attempts, 2);
        // the timed-out attempt sent nothing after the handshake
        assert_eq!(s.port().chunk_writes().len(), 1);
    }

    #[test]
    fn test_retries_are_bounded() {
        let receiver = Receiver {
            silent_eofs: usize::MAX,
            ..Receiver::default()
        };
        let config = fast_config().with_max_attempts(3);
        let mut s = session(receiver, b"abc", config);
        let err = s.upload(|_| {}).unwrap_err();

        match &err {
            Error::RetriesExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, Error::Timeout(_)));
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(s.attempts(), 3);
        assert_eq!(s.delay(), Duration::from_millis(4));
        assert_eq!(s.state(), UploadState::Failed);
    }

    #[test]
    fn test_integrity_error_stops_without_retry() {
        let receiver = Receiver {
            corrupt: true,
            ..Receiver::default()
        };
        let mut s = session(receiver, b"abc", fast_config());
        let err = s.upload(|_| {}).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(s.attempts(), 1);
        assert_eq!(s.delay(), Duration::from_millis(1));
    }

    #[test]
    fn test_run_ack_mismatch_is_retried() {
        let receiver = Receiver {
            run_reply: Some("f.lua:1: unexpected symbol".into()),
            ..Receiver::default()
        };
        let config = fast_config()
            .with_run(true)
            .with_run_ack("ok")
            .with_max_attempts(2);
        let mut s = session(receiver, b"abc", config);
        let err = s.upload(|_| {}).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Mismatch);
        assert_eq!(s.attempts(), 2);
        assert_eq!(
            err.diagnostic(),
            Some(("ok", "f.lua:1: unexpected symbol"))
        );
    }

    #[test]
    fn test_run_ack_match() {
        let receiver = Receiver {
            run_reply: Some("ok".into()),
            ..Receiver::default()
        };
        let config = fast_config().with_run(true).with_run_ack("ok");
        let mut s = session(receiver, b"abc", config);
        assert!(s.upload(|_| {}).is_ok());
    }

    #[test]
    fn test_chunk_time_chatter_does_not_fail_verification() {
        let receiver = Receiver {
            chatter: Some("status: buffer flushed".into()),
            ..Receiver::default()
        };
        let payload = b"x".repeat(100);
        let mut s = session(receiver, &payload, fast_config());
        let report = s.upload(|_| {}).unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.hash, protocol::content_hash(&payload));
    }

    #[test]
    fn test_chunk_ending_in_newline_is_stored_as_data() {
        let mut payload = b"-".repeat(CHUNK_WIDTH - 1);
        payload.push(b'\n');
        payload.extend_from_slice(b"print(1)\n");
        let mut s = session(Receiver::default(), &payload, fast_config());
        let report = s.upload(|_| {}).unwrap();

        let port = s.port();
        assert_eq!(report.chunks_sent, 2);
        assert_eq!(port.chunk_writes().len(), 2);
        assert_eq!(port.chunk_writes()[0], &payload[..CHUNK_WIDTH]);
        assert_eq!(
            port.command_writes(),
            vec![format!("turbotape(\"f.lua\", {})", payload.len()), "EOF".to_string()]
        );
    }

    #[test]
    fn test_interrupt_stops_upload_after_first_attempt() {
        crate::port::mock::interrupt_current_thread(true);
        let receiver = Receiver {
            silent_handshakes: 1,
            ..Receiver::default()
        };
        let mut s = session(receiver, b"abc", fast_config());
        let result = s.upload(|_| {});
        crate::port::mock::interrupt_current_thread(false);

        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(s.attempts(), 1);
        assert_eq!(s.chunks_sent(), 0);
        assert_eq!(s.state(), UploadState::Failed);
        assert!(s.port().is_closed());
    }

    #[test]
    fn test_closed_port_is_not_retried() {
        let mut port = MockPort::receiver(Receiver::default());
        port.close().unwrap();
        let mut s = UploadSession::new(port, "f.lua", b"abc".to_vec(), fast_config()).unwrap();
        let err = s.upload(|_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transmission);
        assert_eq!(s.attempts(), 1);
    }

    #[test]
    fn test_new_rejects_bad_input() {
        let bad_name = UploadSession::new(MockPort::silent(), "a\"b", Vec::new(), fast_config());
        assert!(matches!(bad_name, Err(Error::InvalidFileName(_))));

        let no_attempts = UploadSession::new(
            MockPort::silent(),
            "f.lua",
            Vec::new(),
            fast_config().with_max_attempts(0),
        );
        assert!(matches!(no_attempts, Err(Error::Config(_))));

        let no_width = UploadSession::new(
            MockPort::silent(),
            "f.lua",
            Vec::new(),
            fast_config().with_chunk_width(0),
        );
        assert!(matches!(no_width, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file_uses_basename_and_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blink.lua");
        fs::write(&path, [0xFFu8, b'\n', 0x00]).unwrap();

        let s = UploadSession::from_file(MockPort::silent(), &path, fast_config()).unwrap();
        assert_eq!(s.basename(), "blink.lua");
        assert_eq!(s.payload(), &[0xFF, b'\n', 0x00]);
        assert_eq!(s.state(), UploadState::Idle);
    }
}

//! Error types for turbotape.
//!
//! Every failure carries an [`ErrorKind`] discriminator so that the retry
//! controller can decide exhaustively between retry, stop and fatal abort.

use std::io;
use thiserror::Error;

/// Result type for turbotape operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for turbotape operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No inbound line arrived before the command deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The receiver answered, but not with what the protocol expects.
    #[error("Unexpected response: expected {expected:?}, got {actual:?}")]
    Mismatch {
        /// Expected response prefix.
        expected: String,
        /// Line actually received.
        actual: String,
    },

    /// The receiver's content hash does not match the local one.
    #[error("SHA1 mismatch: expected {expected:?}, got {actual:?}")]
    Integrity {
        /// Expected acknowledgment line.
        expected: String,
        /// Line actually received.
        actual: String,
    },

    /// The companion receiver program is not installed on the device.
    #[error("turbotape receiver not installed on device (got {response:?})")]
    ReceiverAbsent {
        /// Response received to the handshake.
        response: String,
    },

    /// Every allowed attempt failed with a retryable error.
    #[error("Upload failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<Error>,
    },

    /// The embedding application requested interruption.
    #[error("Interrupted")]
    Interrupted,

    /// No serial port available.
    #[error("No serial port found")]
    DeviceNotFound,

    /// File name cannot be expressed in a receiver command.
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse failure category used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Low-level write/read failure on the transport.
    Transmission,
    /// No response within the command window.
    Timeout,
    /// Response broke protocol expectations.
    Mismatch,
    /// Content hash mismatch.
    Integrity,
    /// Receiver program missing on the device.
    ReceiverAbsent,
    /// Stopped on request.
    Interrupted,
    /// Bad input or setup (file name, config, missing port).
    Usage,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Transmission,
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorKind::Transmission,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Mismatch { .. } => ErrorKind::Mismatch,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::ReceiverAbsent { .. } => ErrorKind::ReceiverAbsent,
            Self::RetriesExhausted { last, .. } => last.kind(),
            Self::Interrupted => ErrorKind::Interrupted,
            Self::DeviceNotFound | Self::InvalidFileName(_) | Self::Config(_) => ErrorKind::Usage,
        }
    }

    /// Whether a whole new upload attempt may fix this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Mismatch { .. })
    }

    /// Expected and actual response text, when the error carries them.
    pub fn diagnostic(&self) -> Option<(&str, &str)> {
        match self {
            Self::Mismatch { expected, actual } | Self::Integrity { expected, actual } => {
                Some((expected, actual))
            },
            Self::RetriesExhausted { last, .. } => last.diagnostic(),
            _ => None,
        }
    }
}

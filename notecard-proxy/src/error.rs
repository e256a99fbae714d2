//! Common error types for notecard-proxy.
//!
//! Startup failures ([`ConfigError`], [`DeviceError`] while opening) are fatal
//! and end the process before the listener binds. Failures during a live
//! transaction are [`DeviceError`]s too, but the HTTP layer turns them into a
//! status code and a short message instead of letting them escape.

use std::{num::ParseIntError, path::PathBuf, time::Duration};
use thiserror::Error;

/// Invalid configuration detected while resolving the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The transport selector named neither `serial` nor `i2c`.
    #[error("unsupported transport protocol: {0:?}")]
    UnsupportedTransport(String),

    #[error("invalid serial baud rate {value:?}: {source}")]
    InvalidBaudRate {
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("invalid I2C address {0:?}, expected a 7-bit address such as 0x17")]
    InvalidAddress(String),

    #[error("invalid value {value:?} for {var}, expected true or false")]
    InvalidFlag { var: &'static str, value: String },

    #[error("invalid timeout {0:?}, expected 1 to 3600 seconds")]
    InvalidTimeout(String),
}

/// Failure talking to the Notecard.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The serial port or I2C bus could not be opened.
    #[error("error opening Notecard on {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The channel opened but the device did not answer the status check.
    #[error("Notecard did not pass its status check: {0}")]
    Verify(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No complete reply arrived within the transaction timeout.
    #[error("timed out after {0:?} waiting for the Notecard")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("reply exceeded {0} bytes without a line terminator")]
    ResponseTooLong(usize),

    /// The channel was closed at shutdown.
    #[error("channel is closed")]
    Closed,
}

/// Main error type for notecard-proxy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

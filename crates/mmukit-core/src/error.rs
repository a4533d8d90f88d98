//! Error handling for MMUKit
//!
//! Provides error types for the two layers of the driver:
//! - Connection errors (serial link related)
//! - Protocol errors (device response related)
//!
//! All error types use `thiserror` for ergonomic error handling. Note that
//! the public call surface of the device controller deliberately does not
//! propagate these across the driver boundary: link failures are reported
//! through the listener and reflected in return values instead.

use thiserror::Error;

/// Connection error type
///
/// Represents errors related to the serial link between host and device.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// Write to the device failed
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason the write failed.
        reason: String,
    },

    /// The link is not open
    #[error("Not connected")]
    NotConnected,
}

/// Protocol error type
///
/// Represents errors in the device's line protocol.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Received bytes that do not decode to a text line
    #[error("Undecodable data on the wire: {reason}")]
    Undecodable {
        /// Why the data could not be decoded.
        reason: String,
    },

    /// A JSON configuration payload failed to parse
    #[error("Bad JSON payload for category '{category}': {reason}")]
    BadJsonPayload {
        /// The configuration category being parsed.
        category: String,
        /// The parse failure.
        reason: String,
    },

    /// The firmware identity banner could not be parsed
    #[error("Unparseable firmware banner: {banner}")]
    BadFirmwareBanner {
        /// The raw banner line.
        banner: String,
    },

    /// The device reported an error for the in-flight command
    #[error("Device error: {message}")]
    DeviceError {
        /// The device's error text.
        message: String,
    },
}

/// Main error type for MMUKit
///
/// A unified error type that can represent any error from both layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::ConnectionTimeout { .. })
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

//! Transport layer for the device link
//!
//! Defines the reader/writer seam the controller drives, the connection
//! parameters, and the serial implementation. The reader and writer are
//! separate objects so the background reader can block on the line poll
//! while callers write commands concurrently.

pub mod serial;

use mmukit_core::{ConnectionError, Result};
use std::time::Duration;

pub use serial::{list_ports, open_serial_link, SerialLinkOpener, SerialPortInfo};

/// Parameters for opening a device link
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConnectionParams {
    /// Port name (e.g. "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Poll interval for the reader's bounded line read
    pub read_timeout: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Receiving half of a device link
///
/// `read_line` blocks for at most the link's poll interval and returns
/// `Ok(None)` when no complete line arrived in that window, so the reader
/// loop can check its stop flag with bounded latency.
pub trait LinkReader: Send {
    /// Read one newline-terminated line, without the terminator.
    fn read_line(&mut self) -> Result<Option<String>>;
}

/// Sending half of a device link
pub trait LinkWriter: Send {
    /// Write one line, appending the newline terminator.
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Discard any pending input and output.
    fn clear(&mut self) -> Result<()>;
}

/// Factory for device links
///
/// The controller holds an opener rather than a link so that reconnecting
/// can produce a fresh reader/writer pair after the old handle died.
pub trait LinkOpener: Send + Sync {
    /// Open the link described by `params`.
    fn open(&self, params: &ConnectionParams) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)>;
}

/// Link halves that are never connected to anything.
///
/// The reader reports the link as lost on every read and the writer
/// rejects every line. Useful as a placeholder and in tests.
#[derive(Debug, Default)]
pub struct NoOpLink;

impl LinkReader for NoOpLink {
    fn read_line(&mut self) -> Result<Option<String>> {
        Err(ConnectionError::NotConnected.into())
    }
}

impl LinkWriter for NoOpLink {
    fn write_line(&mut self, _line: &str) -> Result<()> {
        Err(ConnectionError::NotConnected.into())
    }

    fn clear(&mut self) -> Result<()> {
        Ok(())
    }
}

//! Serial port communication implementation
//!
//! Provides low-level serial port operations for direct hardware connection
//! to the filament changer via USB or RS-232.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Baud rate configuration
//! - Bounded-latency line reads (short read timeout as the poll interval)
//! - Reader/writer splitting so the background reader and command writers
//!   share one port without serializing on a single handle

use crate::communication::{ConnectionParams, LinkOpener, LinkReader, LinkWriter};
use mmukit_core::{ConnectionError, Result};
use std::io::{Read, Write};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
        }
    }
}

/// List available serial ports on the system
///
/// Returns candidate ports for a device connection:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*, /dev/serial/by-id/*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => {
            let port_infos: Vec<SerialPortInfo> = ports
                .iter()
                .filter(|port| is_valid_device_port(&port.port_name))
                .map(|port| {
                    let mut info = SerialPortInfo::new(&port.port_name, get_port_description(port));
                    if let serialport::SerialPortType::UsbPort(usb_info) = &port.port_type {
                        info.manufacturer = usb_info.manufacturer.clone();
                        info.serial_number = usb_info.serial_number.clone();
                    }
                    info
                })
                .collect();

            Ok(port_infos)
        }
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(ConnectionError::SerialError {
                reason: format!("Failed to enumerate ports: {}", e),
            }
            .into())
        }
    }
}

/// Check if a port name matches device connection patterns
fn is_valid_device_port(port_name: &str) -> bool {
    // Windows COM ports
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // Linux USB, ACM and by-id devices
    if port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/serial/by-id/")
    {
        return true;
    }

    // macOS serial and modem devices
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }

    false
}

/// Get a user-friendly description for a port
fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Open a serial link and split it into reader and writer halves.
///
/// The reader half carries the short read timeout from `params` so the
/// background reader polls with bounded latency; the writer half shares
/// the same underlying port via `try_clone`.
pub fn open_serial_link(
    params: &ConnectionParams,
) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
    tracing::info!("Opening serial port '{}'", params.port);

    let port = serialport::new(&params.port, params.baud_rate)
        .timeout(params.read_timeout)
        .open()
        .map_err(|e| ConnectionError::FailedToOpen {
            port: params.port.clone(),
            reason: e.to_string(),
        })?;

    let writer_port = port.try_clone().map_err(|e| ConnectionError::FailedToOpen {
        port: params.port.clone(),
        reason: format!("try_clone failed: {}", e),
    })?;

    tracing::info!("Serial port '{}' opened", params.port);

    Ok((
        Box::new(SerialLineReader {
            port,
            pending: Vec::new(),
        }),
        Box::new(SerialLineWriter { port: writer_port }),
    ))
}

/// Opener producing real serial links.
#[derive(Debug, Default)]
pub struct SerialLinkOpener;

impl LinkOpener for SerialLinkOpener {
    fn open(&self, params: &ConnectionParams) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
        open_serial_link(params)
    }
}

/// Receiving half of a serial link, accumulating bytes into lines.
struct SerialLineReader {
    port: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl SerialLineReader {
    /// Split one complete line off the pending buffer, if present.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut raw: Vec<u8> = self.pending.drain(..=pos).collect();
        raw.pop(); // '\n'
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        match String::from_utf8(raw) {
            Ok(line) => Some(line),
            Err(e) => {
                // Garbage on the wire is dropped, the stream continues
                tracing::warn!("Dropping undecodable line: {}", e);
                None
            }
        }
    }
}

impl LinkReader for SerialLineReader {
    fn read_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(self.take_line())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(ConnectionError::ConnectionLost {
                reason: e.to_string(),
            }
            .into()),
        }
    }
}

/// Sending half of a serial link.
struct SerialLineWriter {
    port: Box<dyn serialport::SerialPort>,
}

fn write_failed(e: std::io::Error) -> mmukit_core::Error {
    ConnectionError::WriteFailed {
        reason: e.to_string(),
    }
    .into()
}

impl LinkWriter for SerialLineWriter {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.port.write_all(&data).map_err(write_failed)?;
        self.port.flush().map_err(write_failed)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| {
                ConnectionError::SerialError {
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_device_ports() {
        assert!(is_valid_device_port("COM3"));
        assert!(is_valid_device_port("/dev/ttyACM0"));
        assert!(is_valid_device_port("/dev/ttyUSB1"));
        assert!(is_valid_device_port("/dev/serial/by-id/usb-1a86_USB_Serial"));
        assert!(is_valid_device_port("/dev/cu.usbmodem14101"));
        assert!(!is_valid_device_port("/dev/ttyS0"));
        assert!(!is_valid_device_port("COMX"));
    }
}

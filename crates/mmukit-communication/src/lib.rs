//! # MMUKit Communication
//!
//! Serial protocol driver for MMU-class filament changers.
//! Owns the physical link, classifies the device's line protocol into
//! typed frames, and exposes a small synchronous command interface with
//! timeout-bounded waits, automatic reconnection, and a device state
//! snapshot updated from periodic broadcasts.

pub mod communication;
pub mod firmware;

pub use communication::{
    list_ports, open_serial_link, ConnectionParams, LinkOpener, LinkReader, LinkWriter, NoOpLink,
    SerialLinkOpener, SerialPortInfo,
};

pub use firmware::{
    parse_tool_number, ActionRequest, ConfigCategory, ControllerConfig, DeviceResponse,
    MmuController, StateReport, SyncStage, ToolChangeStats,
};

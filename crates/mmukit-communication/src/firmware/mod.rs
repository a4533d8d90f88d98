//! Firmware protocol implementation for the filament changer
//!
//! The device speaks a line-oriented GCode dialect: bare command tokens
//! out, prefixed frames in (`echo:`, `error:`, `//action:`, JSON category
//! markers, an `ok` terminator). These modules keep the pure protocol
//! pieces (command vocabulary, frame classification, broadcast parsing)
//! separate from the stateful ones (configuration sync, telemetry, the
//! controller).

pub mod commands;
pub mod config_sync;
pub mod controller;
pub mod response_parser;
pub mod status_parser;
pub mod telemetry;

pub use config_sync::{ConfigSync, SyncStage};
pub use controller::{ControllerConfig, MmuController};
pub use response_parser::{
    parse_firmware_banner, parse_tool_number, ActionRequest, ConfigCategory, DeviceResponse,
};
pub use status_parser::StateReport;
pub use telemetry::ToolChangeStats;

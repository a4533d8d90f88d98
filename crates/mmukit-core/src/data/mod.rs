//! Data models for device state, firmware identity, and configuration
//!
//! This module provides:
//! - The device state snapshot updated from periodic broadcasts
//! - Filament load state with bitmask derivation
//! - Firmware identity fields
//! - Configuration sets (materials, tool swaps, servo mappings, feed states)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tool index used when no tool is selected.
pub const NO_TOOL: i32 = -1;

/// Filament load state of the currently selected tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadState {
    /// No tool is selected
    #[default]
    NoTool,
    /// Tool selected but filament not loaded
    NotLoaded,
    /// Filament loaded up to the selector (or splitter, if fitted)
    ToSelector,
    /// Filament loaded all the way to the nozzle
    ToNozzle,
    /// Filament loaded into the direct drive extruder
    ToDde,
}

impl LoadState {
    /// Derive the load state from the raw SPL bitmask reported by the
    /// device. When no tool is selected the bitmask is meaningless and the
    /// state is forced to [`LoadState::NoTool`].
    pub fn from_bitmask(mask: u8, tool: i32) -> Self {
        if tool == NO_TOOL {
            return LoadState::NoTool;
        }
        match mask {
            0x00 => LoadState::NotLoaded,
            0x01 | 0x10 => LoadState::ToSelector,
            0x02 | 0x20 => LoadState::ToNozzle,
            0x40 => LoadState::ToDde,
            other => {
                tracing::warn!("Unknown load state bitmask: {:#04x}", other);
                LoadState::NotLoaded
            }
        }
    }

    /// Human readable description, taking the splitter option into account.
    pub fn describe(&self, has_splitter: bool) -> &'static str {
        match self {
            LoadState::NoTool => "NO TOOL",
            LoadState::NotLoaded => "NO",
            LoadState::ToSelector => {
                if has_splitter {
                    "TO SPLITTER"
                } else {
                    "TO SELECTOR"
                }
            }
            LoadState::ToNozzle => "YES",
            LoadState::ToDde => "TO DDE",
        }
    }
}

/// Which side the filament path relay is switched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelaySide {
    /// Internal feeder path
    Internal,
    /// External (DDE) feeder path
    External,
}

impl RelaySide {
    /// Parse the single letter token used in state broadcasts.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "I" => Some(RelaySide::Internal),
            "E" => Some(RelaySide::External),
            _ => None,
        }
    }
}

impl fmt::Display for RelaySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelaySide::Internal => write!(f, "INTERN"),
            RelaySide::External => write!(f, "EXTERN"),
        }
    }
}

/// Firmware identity as reported by the device's identity banner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// The raw banner line
    pub raw: String,
    /// Firmware name
    pub name: Option<String>,
    /// Firmware version (e.g. "V3.10D")
    pub version: Option<String>,
    /// Controller board (e.g. "SKR E3-DIP V1.1")
    pub board: Option<String>,
    /// Firmware mode (e.g. "SMUFF" or "PMMU2")
    pub mode: Option<String>,
    /// Compiled-in options, pipe separated
    pub options: Option<String>,
}

impl FirmwareInfo {
    /// True once an identity banner has been received.
    pub fn is_known(&self) -> bool {
        !self.raw.is_empty()
    }
}

/// One material slot as configured on the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// Material name (e.g. "PLA")
    pub name: String,
    /// Display color
    pub color: String,
    /// Purge factor in percent
    pub purge_factor: i32,
}

/// Snapshot of device-reported state
///
/// Updated exclusively by the reader's frame dispatch; read by callers at
/// any time. Reset to defaults on each new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Device name from the basic configuration
    pub device_name: String,
    /// Number of tools on the device
    pub tool_count: usize,
    /// Currently selected tool, `-1` when none
    pub current_tool: i32,
    /// Previously selected tool
    pub previous_tool: i32,
    /// Tool of a pending (device requested) tool change
    pub pending_tool: i32,
    /// Selector endstop triggered
    pub selector: bool,
    /// Revolver endstop triggered
    pub revolver: bool,
    /// Feeder endstop triggered
    pub feeder: bool,
    /// Second (DDE) feeder endstop triggered
    pub feeder2: bool,
    /// Lid is closed
    pub lid_closed: bool,
    /// SD card has been removed
    pub sd_removed: bool,
    /// Device is idle
    pub idle: bool,
    /// Device configuration has changed
    pub config_changed: bool,
    /// Feeder is jammed
    pub jammed: bool,
    /// Filament path relay side, if reported
    pub relay: Option<RelaySide>,
    /// Load state of the current tool
    pub load_state: LoadState,
    /// TMC stepper drivers fitted
    pub tmc_present: bool,
    /// TMC drivers report a warning
    pub tmc_warning: bool,
    /// Device is configured for a direct drive extruder
    pub is_dde: bool,
    /// Splitter option fitted
    pub has_splitter: bool,
    /// Filament cutter fitted
    pub has_cutter: bool,
    /// Nozzle wiper fitted
    pub has_wiper: bool,
    /// Firmware identity
    pub firmware: FirmwareInfo,
    /// Materials, one entry per tool
    pub materials: Vec<Material>,
    /// Tool swap routing, one target tray per tool
    pub tool_swaps: Vec<i32>,
    /// Lid servo closed angle per tool
    pub servo_closed: Vec<i32>,
    /// Feed (load) state per tool
    pub feed_states: Vec<i32>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            tool_count: 0,
            current_tool: NO_TOOL,
            previous_tool: NO_TOOL,
            pending_tool: NO_TOOL,
            selector: false,
            revolver: false,
            feeder: false,
            feeder2: false,
            lid_closed: false,
            sd_removed: false,
            idle: false,
            config_changed: false,
            jammed: false,
            relay: None,
            load_state: LoadState::NoTool,
            tmc_present: false,
            tmc_warning: false,
            is_dde: false,
            has_splitter: false,
            has_cutter: false,
            has_wiper: false,
            firmware: FirmwareInfo::default(),
            materials: Vec::new(),
            tool_swaps: Vec::new(),
            servo_closed: Vec::new(),
            feed_states: Vec::new(),
        }
    }
}

impl DeviceState {
    /// Record a completed tool change: the pending tool becomes current.
    pub fn commit_tool_change(&mut self) {
        self.previous_tool = self.current_tool;
        self.current_tool = self.pending_tool;
    }

    /// True when a tool is selected.
    pub fn has_tool(&self) -> bool {
        self.current_tool != NO_TOOL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_state_bitmask() {
        assert_eq!(LoadState::from_bitmask(0x00, 2), LoadState::NotLoaded);
        assert_eq!(LoadState::from_bitmask(0x01, 2), LoadState::ToSelector);
        assert_eq!(LoadState::from_bitmask(0x10, 2), LoadState::ToSelector);
        assert_eq!(LoadState::from_bitmask(0x02, 2), LoadState::ToNozzle);
        assert_eq!(LoadState::from_bitmask(0x20, 2), LoadState::ToNozzle);
        assert_eq!(LoadState::from_bitmask(0x40, 2), LoadState::ToDde);
    }

    #[test]
    fn test_load_state_forced_without_tool() {
        // A stale bitmask must not report filament when no tool is selected
        assert_eq!(LoadState::from_bitmask(0x02, NO_TOOL), LoadState::NoTool);
        assert_eq!(LoadState::from_bitmask(0x00, NO_TOOL), LoadState::NoTool);
    }

    #[test]
    fn test_load_state_unknown_mask() {
        assert_eq!(LoadState::from_bitmask(0x08, 0), LoadState::NotLoaded);
    }

    #[test]
    fn test_relay_side_token() {
        assert_eq!(RelaySide::from_token("E"), Some(RelaySide::External));
        assert_eq!(RelaySide::from_token("I"), Some(RelaySide::Internal));
        assert_eq!(RelaySide::from_token("X"), None);
    }

    #[test]
    fn test_commit_tool_change() {
        let mut state = DeviceState::default();
        state.pending_tool = 3;
        state.commit_tool_change();
        assert_eq!(state.current_tool, 3);
        assert_eq!(state.previous_tool, NO_TOOL);

        state.pending_tool = 1;
        state.commit_tool_change();
        assert_eq!(state.current_tool, 1);
        assert_eq!(state.previous_tool, 3);
    }

    #[test]
    fn test_default_state_has_no_tool() {
        let state = DeviceState::default();
        assert!(!state.has_tool());
        assert_eq!(state.load_state, LoadState::NoTool);
        assert!(!state.firmware.is_known());
    }
}

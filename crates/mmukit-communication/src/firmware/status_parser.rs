//! State broadcast parsing
//!
//! The device periodically reports every endstop and feature flag in a
//! single line of `KEY: value` tokens:
//!
//! ```text
//! T: T4  S: off  R: off  F: off  F2: off  TMC: -off  SD: off  SC: off  LID: off  I: off  SPL: 0
//! ```
//!
//! Each recognized key is extracted independently; unrecognized keys are
//! ignored rather than treated as an error. A parsed report is applied to
//! the device state snapshot in one step so all fields from one broadcast
//! take effect together.

use crate::firmware::response_parser::parse_tool_number;
use mmukit_core::{DeviceState, LoadState, RelaySide};
use serde::{Deserialize, Serialize};

/// One parsed state broadcast
///
/// Every field is optional: a report only carries the keys the device
/// actually sent, and `apply` leaves missing fields untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    /// Currently selected tool (`T:`)
    pub tool: Option<i32>,
    /// Selector endstop (`S:`)
    pub selector: Option<bool>,
    /// Revolver endstop (`R:`)
    pub revolver: Option<bool>,
    /// Feeder endstop (`F:`)
    pub feeder: Option<bool>,
    /// Second feeder endstop (`F2:`)
    pub feeder2: Option<bool>,
    /// SD card removed (`SD:`)
    pub sd_removed: Option<bool>,
    /// Configuration changed (`SC:`)
    pub config_changed: Option<bool>,
    /// Lid closed (`LID:`)
    pub lid_closed: Option<bool>,
    /// Device idle (`I:`)
    pub idle: Option<bool>,
    /// TMC drivers fitted and warning flag (`TMC:`)
    pub tmc: Option<(bool, bool)>,
    /// Raw filament load bitmask (`SPL:`)
    pub load_mask: Option<u8>,
    /// Filament path relay side (`RLY:`)
    pub relay: Option<RelaySide>,
    /// Feeder jammed (`JAM:`)
    pub jammed: Option<bool>,
}

impl StateReport {
    /// Parse the token payload of one state broadcast.
    pub fn parse(payload: &str) -> Self {
        let mut report = StateReport::default();

        let tokens: Vec<&str> = payload.split_whitespace().collect();
        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];
            let Some(key) = token.strip_suffix(':') else {
                i += 1;
                continue;
            };
            let Some(value) = tokens.get(i + 1).copied() else {
                break;
            };

            match key {
                "T" => report.tool = Some(parse_tool_number(value)),
                "S" => report.selector = Some(is_on(value)),
                "R" => report.revolver = Some(is_on(value)),
                "F" => report.feeder = Some(is_on(value)),
                "F2" => report.feeder2 = Some(is_on(value)),
                "SD" => report.sd_removed = Some(is_on(value)),
                "SC" => report.config_changed = Some(is_on(value)),
                "LID" => report.lid_closed = Some(is_on(value)),
                "I" => report.idle = Some(is_on(value)),
                "TMC" => {
                    let present = value.starts_with('+');
                    let flag = value.trim_start_matches(['+', '-']);
                    report.tmc = Some((present, is_on(flag)));
                }
                "SPL" => report.load_mask = value.parse::<u8>().ok(),
                "RLY" => report.relay = RelaySide::from_token(value),
                "JAM" => report.jammed = Some(is_on(value)),
                _ => {} // unrecognized keys are ignored
            }
            i += 2;
        }

        report
    }

    /// Apply this report to a device state snapshot.
    ///
    /// The caller holds the snapshot's write lock, so all fields from one
    /// broadcast become visible together. The load state is derived from
    /// the raw bitmask after the tool field has been applied: with no tool
    /// selected the bitmask is ignored.
    pub fn apply(&self, state: &mut DeviceState) {
        if let Some(tool) = self.tool {
            state.current_tool = tool;
        }
        if let Some(v) = self.selector {
            state.selector = v;
        }
        if let Some(v) = self.revolver {
            state.revolver = v;
        }
        if let Some(v) = self.feeder {
            state.feeder = v;
        }
        if let Some(v) = self.feeder2 {
            state.feeder2 = v;
        }
        if let Some(v) = self.sd_removed {
            state.sd_removed = v;
        }
        if let Some(v) = self.config_changed {
            state.config_changed = v;
        }
        if let Some(v) = self.lid_closed {
            state.lid_closed = v;
        }
        if let Some(v) = self.idle {
            state.idle = v;
        }
        if let Some((present, warning)) = self.tmc {
            state.tmc_present = present;
            state.tmc_warning = warning;
        }
        if let Some(mask) = self.load_mask {
            state.load_state = LoadState::from_bitmask(mask, state.current_tool);
        }
        if let Some(relay) = self.relay {
            state.relay = Some(relay);
        }
        if let Some(v) = self.jammed {
            state.jammed = v;
        }
    }
}

fn is_on(value: &str) -> bool {
    value == "on"
}

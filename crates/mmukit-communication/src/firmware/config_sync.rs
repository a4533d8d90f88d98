//! Post-connect configuration sync
//!
//! After a connection is established the driver pulls the device's
//! configuration in fixed stages, one request per stage: basic config,
//! materials, firmware identity, tool swap routing, and servo mapping.
//! The machine is driven from state broadcasts (the request for the
//! current stage is issued whenever no host command is in flight) and
//! advances when the matching JSON category or firmware banner arrives.
//!
//! A payload that fails to parse is logged and the machine still advances
//! past that stage, so a single bad category can never stall the rest.

use crate::firmware::commands;
use crate::firmware::response_parser::ConfigCategory;
use mmukit_core::{DeviceState, Material, ProtocolError};
use serde_json::Value;

/// Stages of the post-connect configuration sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Not running
    Idle,
    /// Requesting the basic configuration
    Basic,
    /// Requesting the material assignments
    Materials,
    /// Requesting the firmware identity banner
    FirmwareInfo,
    /// Requesting the tool swap routing
    ToolSwaps,
    /// Requesting the lid servo mapping
    ServoMapping,
    /// All stages finished
    Done,
}

/// The staged configuration sync machine
#[derive(Debug)]
pub struct ConfigSync {
    stage: SyncStage,
}

impl ConfigSync {
    /// Create an idle machine.
    pub fn new() -> Self {
        Self {
            stage: SyncStage::Idle,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    /// True while stages remain to be requested.
    pub fn is_active(&self) -> bool {
        !matches!(self.stage, SyncStage::Idle | SyncStage::Done)
    }

    /// Start (or restart) the sequence at the first stage.
    pub fn arm(&mut self) {
        self.stage = SyncStage::Basic;
    }

    /// Stop without completing; used on disconnect.
    pub fn cancel(&mut self) {
        self.stage = SyncStage::Idle;
    }

    /// The request for the current stage, if one is pending.
    pub fn pending_request(&self) -> Option<String> {
        match self.stage {
            SyncStage::Basic => Some(commands::get_config(ConfigCategory::Basic)),
            SyncStage::Materials => Some(commands::get_config(ConfigCategory::Materials)),
            SyncStage::FirmwareInfo => Some(commands::FIRMWARE_INFO.to_string()),
            SyncStage::ToolSwaps => Some(commands::get_config(ConfigCategory::ToolSwaps)),
            SyncStage::ServoMapping => Some(commands::get_config(ConfigCategory::ServoMapping)),
            SyncStage::Idle | SyncStage::Done => None,
        }
    }

    /// A firmware identity banner arrived.
    pub fn on_firmware_banner(&mut self) {
        if self.stage == SyncStage::FirmwareInfo {
            self.advance();
        }
    }

    /// A JSON payload for `category` arrived. The matching configuration
    /// set is replaced wholesale; a parse failure keeps the previous set
    /// but still advances the matching stage.
    pub fn on_category(&mut self, category: &ConfigCategory, payload: &str, state: &mut DeviceState) {
        match apply_category(category, payload, state) {
            Ok(()) => {
                tracing::debug!("Applied configuration category '{}'", category);
            }
            Err(e) => {
                tracing::error!("Parsing category '{}' failed: {}", category, e);
            }
        }

        let advances = matches!(
            (self.stage, category),
            (SyncStage::Basic, ConfigCategory::Basic)
                | (SyncStage::Materials, ConfigCategory::Materials)
                | (SyncStage::ToolSwaps, ConfigCategory::ToolSwaps)
                | (SyncStage::ServoMapping, ConfigCategory::ServoMapping)
        );
        if advances {
            self.advance();
        }
    }

    fn advance(&mut self) {
        self.stage = match self.stage {
            SyncStage::Idle => SyncStage::Idle,
            SyncStage::Basic => SyncStage::Materials,
            SyncStage::Materials => SyncStage::FirmwareInfo,
            SyncStage::FirmwareInfo => SyncStage::ToolSwaps,
            SyncStage::ToolSwaps => SyncStage::ServoMapping,
            SyncStage::ServoMapping => {
                tracing::info!("Configuration sync done");
                SyncStage::Done
            }
            SyncStage::Done => SyncStage::Done,
        };
    }
}

impl Default for ConfigSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one JSON configuration payload to the device state.
fn apply_category(
    category: &ConfigCategory,
    payload: &str,
    state: &mut DeviceState,
) -> Result<(), ProtocolError> {
    let bad = |reason: String| ProtocolError::BadJsonPayload {
        category: category.to_string(),
        reason,
    };

    let json: Value = serde_json::from_str(payload).map_err(|e| bad(e.to_string()))?;

    match category {
        ConfigCategory::Basic => {
            if let Some(name) = json.get("Device").and_then(Value::as_str) {
                state.device_name = name.to_string();
            }
            if let Some(tools) = json.get("Tools").and_then(Value::as_u64) {
                state.tool_count = tools as usize;
            }
            if let Some(v) = json.get("UseCutter").and_then(Value::as_bool) {
                state.has_cutter = v;
            }
            if let Some(v) = json.get("UseWiper").and_then(Value::as_bool) {
                state.has_wiper = v;
            }
            if let Some(v) = json.get("UseSplitter").and_then(Value::as_bool) {
                state.has_splitter = v;
            }
            if let Some(v) = json.get("UseDDE").and_then(Value::as_bool) {
                state.is_dde = v;
            }
            Ok(())
        }
        ConfigCategory::Materials => {
            let materials = per_tool(&json, state.tool_count, |entry| {
                Some(Material {
                    name: entry.get("Material")?.as_str()?.to_string(),
                    color: entry.get("Color")?.as_str()?.to_string(),
                    purge_factor: entry.get("PFactor")?.as_i64()? as i32,
                })
            })
            .map_err(bad)?;
            state.materials = materials;
            Ok(())
        }
        ConfigCategory::ToolSwaps => {
            let swaps = per_tool(&json, state.tool_count, |entry| {
                entry.as_i64().map(|v| v as i32)
            })
            .map_err(bad)?;
            state.tool_swaps = swaps;
            Ok(())
        }
        ConfigCategory::ServoMapping => {
            let angles = per_tool(&json, state.tool_count, |entry| {
                entry.get("Close")?.as_i64().map(|v| v as i32)
            })
            .map_err(bad)?;
            state.servo_closed = angles;
            Ok(())
        }
        ConfigCategory::FeedState => {
            let feed = per_tool(&json, state.tool_count, |entry| {
                entry.as_i64().map(|v| v as i32)
            })
            .map_err(bad)?;
            state.feed_states = feed;
            Ok(())
        }
        // Reserved categories: consumed without effect
        ConfigCategory::Steppers | ConfigCategory::TmcDriver => Ok(()),
        ConfigCategory::Unknown(name) => {
            tracing::warn!("Ignoring unknown configuration category '{}'", name);
            Ok(())
        }
    }
}

/// Collect one value per tool from keys "T0".."T{n-1}".
///
/// Fails if any tool entry is missing or malformed, so a configuration set
/// is only ever replaced as a whole.
fn per_tool<T>(
    json: &Value,
    tool_count: usize,
    extract: impl Fn(&Value) -> Option<T>,
) -> Result<Vec<T>, String> {
    let mut out = Vec::with_capacity(tool_count);
    for i in 0..tool_count {
        let key = format!("T{}", i);
        let entry = json
            .get(&key)
            .ok_or_else(|| format!("missing entry for {}", key))?;
        let value = extract(entry).ok_or_else(|| format!("malformed entry for {}", key))?;
        out.push(value);
    }
    Ok(out)
}

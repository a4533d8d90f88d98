//! Device response parser
//!
//! Classifies one received line into exactly one frame kind. This is pure
//! classification: no I/O, no shared state. Classification is by line
//! prefix, case sensitive, and order sensitive — the device error prefix
//! is checked before generic prefixes, and the `ok` terminator is tried
//! before falling through to "response fragment".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration categories the device reports as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigCategory {
    /// Basic device configuration (name, tool count, options)
    Basic,
    /// Stepper configuration (reserved, consumed without effect)
    Steppers,
    /// TMC driver configuration (reserved, consumed without effect)
    TmcDriver,
    /// Material assignments per tool
    Materials,
    /// Tool swap routing per tool
    ToolSwaps,
    /// Lid servo mapping per tool
    ServoMapping,
    /// Feed (load) state per tool
    FeedState,
    /// A category this driver does not know
    Unknown(String),
}

impl ConfigCategory {
    /// Parse the category name from a `/* category */` marker line.
    pub fn from_name(name: &str) -> Self {
        match name {
            "basic" => ConfigCategory::Basic,
            "steppers" => ConfigCategory::Steppers,
            "tmc driver" => ConfigCategory::TmcDriver,
            "materials" => ConfigCategory::Materials,
            "tool swaps" => ConfigCategory::ToolSwaps,
            "servo mapping" => ConfigCategory::ServoMapping,
            "feed state" => ConfigCategory::FeedState,
            other => ConfigCategory::Unknown(other.to_string()),
        }
    }

    /// The `M503 S{n}W` index used to request this category.
    pub fn query_index(&self) -> u8 {
        match self {
            ConfigCategory::Basic => 1,
            ConfigCategory::Steppers => 2,
            ConfigCategory::TmcDriver => 3,
            ConfigCategory::ServoMapping => 4,
            ConfigCategory::Materials => 5,
            ConfigCategory::ToolSwaps => 6,
            ConfigCategory::FeedState => 8,
            ConfigCategory::Unknown(_) => 0,
        }
    }
}

impl fmt::Display for ConfigCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigCategory::Basic => write!(f, "basic"),
            ConfigCategory::Steppers => write!(f, "steppers"),
            ConfigCategory::TmcDriver => write!(f, "tmc driver"),
            ConfigCategory::Materials => write!(f, "materials"),
            ConfigCategory::ToolSwaps => write!(f, "tool swaps"),
            ConfigCategory::ServoMapping => write!(f, "servo mapping"),
            ConfigCategory::FeedState => write!(f, "feed state"),
            ConfigCategory::Unknown(name) => write!(f, "{}", name),
        }
    }
}

/// Device-initiated action requests (`//action:` frames)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionRequest {
    /// The device asks the host to carry out a tool change
    ToolChange(i32),
    /// The device asks the host to wait (jam or similar)
    Wait,
    /// The device signals the wait/abort condition has cleared
    Continue,
    /// The device aborts the current operation
    Abort,
    /// Reply to a host ping
    Pong,
    /// An action this driver does not know
    Unknown(String),
}

/// Device response frame kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceResponse {
    /// Device reset/boot banner
    Start,
    /// Acknowledgment of the periodic state broadcast setting
    PeriodicStateAck,
    /// Debug text, suppressed from callers
    Debug(String),
    /// Periodic state broadcast; payload is the `KEY: value` token list
    StateBroadcast(String),
    /// Device still processing, not a timeout failure
    Busy,
    /// Command failed
    Error {
        /// The device's error text
        message: String,
        /// The device received garbage and wants its buffers flushed
        unknown_command: bool,
    },
    /// Device-initiated action request
    Action(ActionRequest),
    /// Marks the JSON category of the next line
    JsonCategory(ConfigCategory),
    /// JSON configuration payload for the previously marked category
    JsonBody(String),
    /// Firmware identity banner
    FirmwareBanner(String),
    /// Terminates the current command's response accumulation
    Ok,
    /// Anything else, accumulated for the in-flight command
    Fragment(String),
}

/// Parsed firmware identity banner fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirmwareBannerFields {
    /// FIRMWARE_NAME value
    pub name: Option<String>,
    /// FIRMWARE_VERSION value
    pub version: Option<String>,
    /// ELECTRONICS value
    pub board: Option<String>,
    /// MODE value
    pub mode: Option<String>,
    /// OPTIONS value
    pub options: Option<String>,
}

/// Classify one received line.
///
/// Returns `None` for blank lines, which carry no frame.
pub fn parse(line: &str) -> Option<DeviceResponse> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.trim().is_empty() {
        return None;
    }

    if line == "start" {
        return Some(DeviceResponse::Start);
    }

    if line.starts_with("M155") {
        return Some(DeviceResponse::PeriodicStateAck);
    }

    if let Some(rest) = line.strip_prefix("echo:") {
        let rest = rest.trim_start();
        if let Some(text) = rest.strip_prefix("dbg:") {
            return Some(DeviceResponse::Debug(text.trim().to_string()));
        }
        if let Some(states) = rest.strip_prefix("states:") {
            return Some(DeviceResponse::StateBroadcast(states.trim().to_string()));
        }
        if rest.starts_with("busy") {
            return Some(DeviceResponse::Busy);
        }
        // other echo lines are diagnostics
        return Some(DeviceResponse::Debug(rest.to_string()));
    }

    if let Some(rest) = line.strip_prefix("error:") {
        let message = rest.trim().to_string();
        let unknown_command = message.starts_with("Unknown command:");
        return Some(DeviceResponse::Error {
            message,
            unknown_command,
        });
    }

    if let Some(rest) = line.strip_prefix("//action:") {
        let rest = rest.trim_start();
        let action = if rest.starts_with('T') {
            ActionRequest::ToolChange(parse_tool_number(rest))
        } else if rest.starts_with("WAIT") {
            ActionRequest::Wait
        } else if rest.starts_with("CONTINUE") {
            ActionRequest::Continue
        } else if rest.starts_with("ABORT") {
            ActionRequest::Abort
        } else if rest.starts_with("PONG") {
            ActionRequest::Pong
        } else {
            ActionRequest::Unknown(rest.to_string())
        };
        return Some(DeviceResponse::Action(action));
    }

    if let Some(rest) = line.strip_prefix("/*") {
        let name = rest.trim_end_matches("*/").trim().to_lowercase();
        return Some(DeviceResponse::JsonCategory(ConfigCategory::from_name(
            &name,
        )));
    }

    if line.starts_with('{') {
        return Some(DeviceResponse::JsonBody(line.to_string()));
    }

    if line.starts_with("FIRMWARE_") {
        return Some(DeviceResponse::FirmwareBanner(line.to_string()));
    }

    if line.trim() == "ok" {
        return Some(DeviceResponse::Ok);
    }

    Some(DeviceResponse::Fragment(line.to_string()))
}

/// Extract the identity fields from a firmware banner line.
///
/// The banner packs all fields into one line:
/// `FIRMWARE_NAME: ... FIRMWARE_VERSION: ... ELECTRONICS: ... DATE: ...
/// MODE: ... OPTIONS: ...`. Each value runs until the next marker that is
/// actually present, so missing markers degrade gracefully.
pub fn parse_firmware_banner(banner: &str) -> FirmwareBannerFields {
    const MARKERS: [&str; 6] = [
        "FIRMWARE_NAME:",
        "FIRMWARE_VERSION:",
        "ELECTRONICS:",
        "DATE:",
        "MODE:",
        "OPTIONS:",
    ];

    let positions: Vec<(usize, &str)> = MARKERS
        .iter()
        .filter_map(|m| banner.find(m).map(|p| (p, *m)))
        .collect();

    let mut fields = FirmwareBannerFields::default();
    for (i, (pos, marker)) in positions.iter().enumerate() {
        let value_start = pos + marker.len();
        let value_end = positions
            .get(i + 1)
            .map(|(next, _)| *next)
            .unwrap_or(banner.len());
        let value = banner[value_start..value_end].trim().to_string();
        match *marker {
            "FIRMWARE_NAME:" => fields.name = Some(value),
            "FIRMWARE_VERSION:" => fields.version = Some(value),
            "ELECTRONICS:" => fields.board = Some(value),
            "MODE:" => fields.mode = Some(value),
            "OPTIONS:" => fields.options = Some(value),
            _ => {} // DATE is not tracked
        }
    }
    fields
}

/// Convert a tool token like "T12" into a tool number.
///
/// Returns `-1` when no number can be extracted.
pub fn parse_tool_number(tool: &str) -> i32 {
    let start = match tool.find(|c: char| c.is_ascii_digit() || c == '-') {
        Some(pos) => pos,
        None => return -1,
    };
    let digits: String = tool[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse::<i32>().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_and_ok() {
        assert_eq!(parse("start"), Some(DeviceResponse::Start));
        assert_eq!(parse("ok"), Some(DeviceResponse::Ok));
        assert_eq!(parse("ok\r"), Some(DeviceResponse::Ok));
    }

    #[test]
    fn test_parse_blank() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("\n"), None);
        assert_eq!(parse("   "), None);
    }

    #[test]
    fn test_parse_echo_variants() {
        assert_eq!(
            parse("echo: dbg: selector homed"),
            Some(DeviceResponse::Debug("selector homed".to_string()))
        );
        assert!(matches!(
            parse("echo: states: T: T4  S: off"),
            Some(DeviceResponse::StateBroadcast(s)) if s.starts_with("T: T4")
        ));
        assert_eq!(parse("echo: busy processing"), Some(DeviceResponse::Busy));
    }

    #[test]
    fn test_parse_error() {
        assert_eq!(
            parse("error: jammed"),
            Some(DeviceResponse::Error {
                message: "jammed".to_string(),
                unknown_command: false,
            })
        );
        assert_eq!(
            parse("error: Unknown command: X99"),
            Some(DeviceResponse::Error {
                message: "Unknown command: X99".to_string(),
                unknown_command: true,
            })
        );
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            parse("//action: T3"),
            Some(DeviceResponse::Action(ActionRequest::ToolChange(3)))
        );
        assert_eq!(
            parse("//action: WAIT"),
            Some(DeviceResponse::Action(ActionRequest::Wait))
        );
        assert_eq!(
            parse("//action: CONTINUE"),
            Some(DeviceResponse::Action(ActionRequest::Continue))
        );
        assert_eq!(
            parse("//action: ABORT"),
            Some(DeviceResponse::Action(ActionRequest::Abort))
        );
        assert_eq!(
            parse("//action: PONG"),
            Some(DeviceResponse::Action(ActionRequest::Pong))
        );
    }

    #[test]
    fn test_parse_json_frames() {
        assert_eq!(
            parse("/* materials */"),
            Some(DeviceResponse::JsonCategory(ConfigCategory::Materials))
        );
        assert_eq!(
            parse("/* tmc driver */"),
            Some(DeviceResponse::JsonCategory(ConfigCategory::TmcDriver))
        );
        assert!(matches!(
            parse("{\"Device\": \"MMU\"}"),
            Some(DeviceResponse::JsonBody(_))
        ));
    }

    #[test]
    fn test_parse_fragment_fallthrough() {
        assert_eq!(
            parse("T3"),
            Some(DeviceResponse::Fragment("T3".to_string()))
        );
        // "ok" must be matched before this fallthrough
        assert_ne!(
            parse("ok"),
            Some(DeviceResponse::Fragment("ok".to_string()))
        );
    }

    #[test]
    fn test_parse_periodic_ack() {
        assert_eq!(parse("M155 S1"), Some(DeviceResponse::PeriodicStateAck));
    }

    #[test]
    fn test_parse_firmware_banner() {
        let banner = "FIRMWARE_NAME: Multi.Filament.Feeder FIRMWARE_VERSION: V3.10D \
                      ELECTRONICS: SKR E3-DIP V1.1 DATE: 2022-06-22 MODE: SMUFF \
                      OPTIONS: TMC|NEOPIXELS|DDE";
        assert!(matches!(parse(banner), Some(DeviceResponse::FirmwareBanner(_))));

        let fields = parse_firmware_banner(banner);
        assert_eq!(fields.name.as_deref(), Some("Multi.Filament.Feeder"));
        assert_eq!(fields.version.as_deref(), Some("V3.10D"));
        assert_eq!(fields.board.as_deref(), Some("SKR E3-DIP V1.1"));
        assert_eq!(fields.mode.as_deref(), Some("SMUFF"));
        assert_eq!(fields.options.as_deref(), Some("TMC|NEOPIXELS|DDE"));
    }

    #[test]
    fn test_parse_firmware_banner_missing_fields() {
        let fields = parse_firmware_banner("FIRMWARE_NAME: X FIRMWARE_VERSION: V1");
        assert_eq!(fields.name.as_deref(), Some("X"));
        assert_eq!(fields.version.as_deref(), Some("V1"));
        assert_eq!(fields.board, None);
        assert_eq!(fields.mode, None);
    }

    #[test]
    fn test_parse_tool_number() {
        assert_eq!(parse_tool_number("T12"), 12);
        assert_eq!(parse_tool_number("T0"), 0);
        assert_eq!(parse_tool_number(""), -1);
        assert_eq!(parse_tool_number("T-1"), -1);
        assert_eq!(parse_tool_number("no digits"), -1);
        assert_eq!(parse_tool_number("T: OK"), -1);
    }
}

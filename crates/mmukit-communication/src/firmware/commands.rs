//! Device command vocabulary
//!
//! Builders for the GCode commands the filament changer understands. The
//! controller sends these as bare newline-terminated tokens; everything
//! here is pure string construction.

use crate::firmware::response_parser::ConfigCategory;

/// Query the firmware identity banner
pub const FIRMWARE_INFO: &str = "M115";
/// Prefix acknowledging the periodic state broadcast setting
pub const PERIODIC_STATES: &str = "M155";
/// Tool selection prefix ("T0", "T1", ...)
pub const TOOL_PREFIX: &str = "T";
/// Home the selector (and revolver, if configured)
pub const HOME: &str = "G28";
/// Wipe the nozzle
pub const WIPE: &str = "G12";
/// Cut the filament
pub const CUT: &str = "G12 C";
/// Load filament on the active tool
pub const LOAD_FILAMENT: &str = "M700";
/// Unload filament from the active tool
pub const UNLOAD_FILAMENT: &str = "M701";
/// Turn the stepper motors off
pub const MOTORS_OFF: &str = "M18";
/// Reset the feeder-jammed flag
pub const CLEAR_JAM: &str = "M562";
/// Reset the device
pub const RESET: &str = "M999";
/// Turn the housing fan on at full speed
pub const FAN_ON: &str = "M106 S100";
/// Turn the housing fan off
pub const FAN_OFF: &str = "M107";
/// Open the lid servo
pub const LID_OPEN: &str = "M280 R0";
/// Close the lid servo
pub const LID_CLOSE: &str = "M280 R1";

/// Enable or disable the periodic state broadcast.
pub fn periodic_states(enable: bool) -> String {
    format!("{} S{}", PERIODIC_STATES, if enable { 1 } else { 0 })
}

/// Select a tool.
pub fn select_tool(tool: i32) -> String {
    format!("{}{}", TOOL_PREFIX, tool)
}

/// Query one configuration category as JSON.
pub fn get_config(category: ConfigCategory) -> String {
    format!("M503 S{}W", category.query_index())
}

/// Set a named configuration parameter.
pub fn set_parameter(name: &str, value: &str) -> String {
    format!("M205 P\"{}\"S{}", name, value)
}

/// Position a servo to an angle in degrees.
pub fn set_servo(servo: u8, angle: u8) -> String {
    format!("M280 P{} S{}", servo, angle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builders() {
        assert_eq!(periodic_states(true), "M155 S1");
        assert_eq!(periodic_states(false), "M155 S0");
        assert_eq!(select_tool(4), "T4");
        assert_eq!(get_config(ConfigCategory::Basic), "M503 S1W");
        assert_eq!(get_config(ConfigCategory::Materials), "M503 S5W");
        assert_eq!(get_config(ConfigCategory::ToolSwaps), "M503 S6W");
        assert_eq!(get_config(ConfigCategory::ServoMapping), "M503 S4W");
        assert_eq!(set_parameter("BowdenLen", "620"), "M205 P\"BowdenLen\"S620");
        assert_eq!(set_servo(1, 95), "M280 P1 S95");
    }
}

//! Protocol level tests: frame classification precedence and broadcast
//! parsing, including the idempotence property over generated lines.

use mmukit_communication::firmware::response_parser::{self, DeviceResponse};
use mmukit_communication::firmware::status_parser::StateReport;
use mmukit_core::DeviceState;
use proptest::prelude::*;

#[test]
fn classification_precedence_over_fragments() {
    // the terminator and error prefixes must win before the fragment
    // fallthrough accumulates them
    assert_eq!(response_parser::parse("ok"), Some(DeviceResponse::Ok));
    assert!(matches!(
        response_parser::parse("error: boom"),
        Some(DeviceResponse::Error { .. })
    ));
    assert!(matches!(
        response_parser::parse("okay then"),
        Some(DeviceResponse::Fragment(_))
    ));
}

#[test]
fn every_frame_kind_classifies() {
    let lines = [
        ("start", "Start"),
        ("M155 S1", "PeriodicStateAck"),
        ("echo: dbg: x", "Debug"),
        ("echo: states: T: T0", "StateBroadcast"),
        ("echo: busy", "Busy"),
        ("error: e", "Error"),
        ("//action: PONG", "Action"),
        ("/* basic */", "JsonCategory"),
        ("{\"a\":1}", "JsonBody"),
        ("FIRMWARE_NAME: x", "FirmwareBanner"),
        ("ok", "Ok"),
        ("whatever", "Fragment"),
    ];
    for (line, expected) in lines {
        let frame = response_parser::parse(line).unwrap();
        let name = format!("{:?}", frame);
        assert!(
            name.starts_with(expected),
            "line {:?} classified as {} (expected {})",
            line,
            name,
            expected
        );
    }
}

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

proptest! {
    /// Parsing a well-formed broadcast is idempotent: the same line applied
    /// any number of times yields the same snapshot.
    #[test]
    fn broadcast_parsing_is_idempotent(
        tool in -1..12i32,
        selector in any::<bool>(),
        revolver in any::<bool>(),
        feeder in any::<bool>(),
        feeder2 in any::<bool>(),
        sd in any::<bool>(),
        sc in any::<bool>(),
        lid in any::<bool>(),
        idle in any::<bool>(),
        tmc_present in any::<bool>(),
        tmc_warn in any::<bool>(),
        mask in prop::sample::select(vec![0u8, 0x01, 0x02, 0x10, 0x20, 0x40]),
        relay in prop::sample::select(vec!["E", "I"]),
        jam in any::<bool>(),
    ) {
        let line = format!(
            "T: T{}  S: {}  R: {}  F: {}  F2: {}  TMC: {}{}  SD: {}  SC: {}  LID: {}  I: {}  SPL: {}  RLY: {}  JAM: {}",
            tool,
            on_off(selector),
            on_off(revolver),
            on_off(feeder),
            on_off(feeder2),
            if tmc_present { "+" } else { "-" },
            on_off(tmc_warn),
            on_off(sd),
            on_off(sc),
            on_off(lid),
            on_off(idle),
            mask,
            relay,
            on_off(jam),
        );

        let first = StateReport::parse(&line);
        let second = StateReport::parse(&line);
        prop_assert_eq!(&first, &second);

        let mut once = DeviceState::default();
        first.apply(&mut once);

        let mut twice = DeviceState::default();
        second.apply(&mut twice);
        second.apply(&mut twice);

        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once.current_tool, tool);
        prop_assert_eq!(once.jammed, jam);
    }
}

proptest! {
    /// The tool number parser never panics, and input without any digit
    /// maps to -1.
    #[test]
    fn tool_number_parse_is_total(input in ".*") {
        let parsed = response_parser::parse_tool_number(&input);
        if !input.contains(|c: char| c.is_ascii_digit() || c == '-') {
            prop_assert_eq!(parsed, -1);
        }
    }
}

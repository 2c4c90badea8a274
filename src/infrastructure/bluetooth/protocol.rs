//! Racetrix line protocol.
//!
//! The device streams newline-terminated ASCII lines and accepts short ASCII
//! commands. This module holds the GATT/SPP identifiers, the typed command
//! builders, and the dispatcher that classifies one complete inbound frame
//! into a [`DeviceEvent`].

use uuid::Uuid;

use crate::domain::models::{
    ConfigItem, DeviceEvent, RunState, SystemStatus, Telemetry, TrackMode,
};
use crate::domain::track::TrackConfig;

/// Nordic UART Service exposed by the device firmware.
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Host writes commands here (write without response).
pub const NUS_WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Device notifies telemetry/status lines here.
pub const NUS_NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Well-known Serial Port Profile identifier used by the classic transport.
pub const SPP_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// MTU the LE transport asks the platform stack to negotiate. ESP32 NimBLE
/// firmware grants up to 247.
pub const REQUEST_MTU: u16 = 247;

/// ATT write header overhead subtracted from the MTU to get the payload bound.
pub const ATT_HEADER_LEN: usize = 3;

/// Settle time between connecting and the bootstrap commands, and between
/// the two bootstrap commands themselves.
pub const BOOTSTRAP_DELAY_MS: u64 = 100;

/// Commands understood by the device, rendered without the trailing newline.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Request a full configuration echo (`VOL:`, `SWAP:`, ... replies).
    Sync,
    /// Request a hardware status report (`SYS:` reply).
    Report,
    /// Persist the current configuration to device flash.
    Save,
    /// Start a run (recording).
    RunStart,
    /// Stop the current run.
    RunStop,
    /// Write one configuration value.
    Set(ConfigItem),
    /// Upload a track definition.
    TrackSetup(TrackConfig),
    /// Clear the track definition.
    TrackReset,
}

impl Command {
    /// The ASCII line for this command, without the newline terminator.
    pub fn line(&self) -> String {
        match self {
            Self::Sync => "CMD:SYNC".into(),
            Self::Report => "CMD:REPORT".into(),
            Self::Save => "CMD:SAVE".into(),
            Self::RunStart => "RM:START".into(),
            Self::RunStop => "RM:STOP".into(),
            Self::Set(item) => format!("SET:{}={}", item.key(), item.wire_value()),
            Self::TrackSetup(track) => track.setup_command(),
            Self::TrackReset => "TRACK:RESET".into(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line())
    }
}

/// Classify one complete frame and decode it into a typed event.
///
/// Match order is significant: it encodes the precedence the firmware
/// documentation assigns to the prefixes, not just readability.
pub fn dispatch(raw: &str) -> DeviceEvent {
    let line = raw.trim();

    if let Some(rest) = line.strip_prefix("TLM:") {
        return DeviceEvent::Telemetry(parse_telemetry(rest));
    }
    if let Some(rest) = line.strip_prefix("VOL:") {
        return DeviceEvent::Config(ConfigItem::Volume(rest.trim().parse().unwrap_or(0)));
    }
    if let Some(rest) = line.strip_prefix("SWAP:") {
        return DeviceEvent::Config(ConfigItem::SwapAxes(parse_flag(rest)));
    }
    if let Some(rest) = line.strip_prefix("INV_X:") {
        return DeviceEvent::Config(ConfigItem::InvertX(parse_flag(rest)));
    }
    if let Some(rest) = line.strip_prefix("INV_Y:") {
        return DeviceEvent::Config(ConfigItem::InvertY(parse_flag(rest)));
    }
    if let Some(rest) = line.strip_prefix("GPS10:") {
        return DeviceEvent::Config(ConfigItem::Gps10Hz(parse_flag(rest)));
    }
    if let Some(rest) = line.strip_prefix("SYS:") {
        return DeviceEvent::System(parse_system(rest));
    }
    if let Some(rest) = line.strip_prefix("OK:") {
        return DeviceEvent::Ack {
            message: rest.to_string(),
            is_error: false,
        };
    }

    DeviceEvent::Unrecognized {
        raw: raw.to_string(),
    }
}

/// Integer boolean: `1` is true, anything else (including garbage) is false.
fn parse_flag(field: &str) -> bool {
    field.trim().parse::<i32>().unwrap_or(0) == 1
}

/// Decode the comma-separated fields after `TLM:`.
///
/// Missing or unparsable numeric fields fall back to 0 rather than failing
/// the frame; the live-state cache guards against the (0, 0) no-fix position.
fn parse_telemetry(rest: &str) -> Telemetry {
    let mut fields = rest.split(',').map(str::trim);

    let speed = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
    let satellites = fields.next().unwrap_or("0").to_string();
    let run_state = match fields.next() {
        Some("1") => RunState::Recording,
        _ => RunState::Standby,
    };
    let track_mode = TrackMode::from_wire(fields.next().unwrap_or(""));
    let elapsed_ms = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    let latitude = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);
    let longitude = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0.0);

    Telemetry {
        speed,
        satellites,
        run_state,
        track_mode,
        elapsed_ms,
        latitude,
        longitude,
    }
}

/// Decode the `key=value` pairs after `SYS:`. Missing or unparsable fields
/// become the -1 sentinel, never an error.
fn parse_system(rest: &str) -> SystemStatus {
    let mut status = SystemStatus {
        sd_state: SystemStatus::UNKNOWN,
        battery_voltage: -1.0,
    };

    for pair in rest.split(',') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix("SD=") {
            status.sd_state = value.trim().parse().unwrap_or(SystemStatus::UNKNOWN);
        } else if let Some(value) = pair.strip_prefix("BAT=") {
            status.battery_voltage = value.trim().parse().unwrap_or(-1.0);
        }
    }

    status
}

/// Format elapsed milliseconds as `MM:SS.hh`, by integer division (no
/// rounding), matching the device's own lap-timer display.
pub fn format_elapsed(ms: u64) -> String {
    let minutes = (ms / 1000) / 60;
    let seconds = (ms / 1000) % 60;
    let hundredths = (ms % 1000) / 10;
    format!("{minutes:02}:{seconds:02}.{hundredths:02}")
}

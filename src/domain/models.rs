//! Core data types shared between the protocol layer and consumers.

/// Run/record state reported in a telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Recording,
    Standby,
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Recording => "RECORDING",
            Self::Standby => "STAND BY",
        }
    }
}

/// Track mode as reported by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
    Circuit,
    Sprint,
    Roaming,
    Unknown,
}

impl TrackMode {
    /// Decode the mode field of a telemetry frame.
    pub fn from_wire(field: &str) -> Self {
        match field {
            "0" => Self::Circuit,
            "1" => Self::Sprint,
            "-1" => Self::Roaming,
            _ => Self::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Circuit => "CIRCUIT",
            Self::Sprint => "SPRINT",
            Self::Roaming => "ROAMING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One decoded `TLM:` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Ground speed in km/h.
    pub speed: f64,
    /// Satellite count, passed through as reported.
    pub satellites: String,
    pub run_state: RunState,
    pub track_mode: TrackMode,
    /// Elapsed lap time in milliseconds.
    pub elapsed_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
}

impl Telemetry {
    /// Exactly (0, 0) is the firmware's "no GPS fix" sentinel.
    pub fn has_fix(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }
}

/// A configuration value echoed by the device (`VOL:`, `SWAP:`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigItem {
    Volume(i32),
    SwapAxes(bool),
    InvertX(bool),
    InvertY(bool),
    Gps10Hz(bool),
}

impl ConfigItem {
    /// The key used on the wire, both in echoes and `SET:` commands.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Volume(_) => "VOL",
            Self::SwapAxes(_) => "SWAP",
            Self::InvertX(_) => "INV_X",
            Self::InvertY(_) => "INV_Y",
            Self::Gps10Hz(_) => "GPS10",
        }
    }

    /// The value rendered the way the firmware expects it (booleans as 0/1).
    pub fn wire_value(&self) -> String {
        match self {
            Self::Volume(v) => v.to_string(),
            Self::SwapAxes(v) | Self::InvertX(v) | Self::InvertY(v) | Self::Gps10Hz(v) => {
                if *v { "1".into() } else { "0".into() }
            }
        }
    }
}

/// One decoded `SYS:` report. A field of -1 means "unknown this cycle"
/// and must not overwrite last-known-good state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemStatus {
    /// 1 = SD card ready, 0 = no card, -1 = unknown.
    pub sd_state: i32,
    /// Battery voltage in volts, -1.0 = unknown.
    pub battery_voltage: f32,
}

impl SystemStatus {
    pub const UNKNOWN: i32 = -1;

    pub fn sd_known(&self) -> bool {
        self.sd_state != Self::UNKNOWN
    }

    pub fn battery_known(&self) -> bool {
        self.battery_voltage > 0.0
    }
}

/// A typed protocol event produced from exactly one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Telemetry(Telemetry),
    Config(ConfigItem),
    System(SystemStatus),
    Ack { message: String, is_error: bool },
    Unrecognized { raw: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// A device seen during discovery.
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub signal_strength: Option<i16>,
    /// True when this is the peer the session last connected to, so list
    /// presentation can pin and highlight it.
    pub last_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// Events surfaced to the application consumer.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Device(DeviceEvent),
    Connection(ConnectionStatus),
    /// The last chunk of a command was accepted by the transport.
    /// Carries the command text exactly as submitted, not the wire form.
    CommandSent(String),
    DeviceFound(ScannedDevice),
    Status(StatusMessage),
}

/// Last-known-good values extracted from the event stream.
///
/// Telemetry arrives as a continuous stream where a single malformed or
/// partial sample must not make visible state revert to "unknown", so
/// sentinel values never overwrite a previously valid reading.
#[derive(Debug, Clone)]
pub struct LiveState {
    /// Last position with a valid fix; (0, 0) until the first fix.
    pub latitude: f64,
    pub longitude: f64,
    pub sd_state: i32,
    pub battery_voltage: f32,
    pub recording: bool,
}

impl Default for LiveState {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            sd_state: SystemStatus::UNKNOWN,
            battery_voltage: 0.0,
            recording: false,
        }
    }
}

impl LiveState {
    pub fn apply(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Telemetry(tlm) => {
                if tlm.has_fix() {
                    self.latitude = tlm.latitude;
                    self.longitude = tlm.longitude;
                }
                self.recording = tlm.run_state == RunState::Recording;
            }
            DeviceEvent::System(sys) => {
                if sys.sd_known() {
                    self.sd_state = sys.sd_state;
                }
                if sys.battery_known() {
                    self.battery_voltage = sys.battery_voltage;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(lat: f64, lon: f64) -> DeviceEvent {
        DeviceEvent::Telemetry(Telemetry {
            speed: 0.0,
            satellites: "0".into(),
            run_state: RunState::Standby,
            track_mode: TrackMode::Roaming,
            elapsed_ms: 0,
            latitude: lat,
            longitude: lon,
        })
    }

    #[test]
    fn zero_fix_does_not_overwrite_position() {
        let mut live = LiveState::default();
        live.apply(&telemetry(51.5, -0.12));
        assert_eq!((live.latitude, live.longitude), (51.5, -0.12));

        live.apply(&telemetry(0.0, 0.0));
        assert_eq!((live.latitude, live.longitude), (51.5, -0.12));
    }

    #[test]
    fn sentinel_system_fields_keep_last_known_good() {
        let mut live = LiveState::default();
        live.apply(&DeviceEvent::System(SystemStatus {
            sd_state: 1,
            battery_voltage: 3.7,
        }));
        live.apply(&DeviceEvent::System(SystemStatus {
            sd_state: SystemStatus::UNKNOWN,
            battery_voltage: -1.0,
        }));
        assert_eq!(live.sd_state, 1);
        assert_eq!(live.battery_voltage, 3.7);
    }

    #[test]
    fn recording_flag_tracks_run_state() {
        let mut live = LiveState::default();
        let mut tlm = Telemetry {
            speed: 10.0,
            satellites: "7".into(),
            run_state: RunState::Recording,
            track_mode: TrackMode::Circuit,
            elapsed_ms: 1000,
            latitude: 1.0,
            longitude: 1.0,
        };
        live.apply(&DeviceEvent::Telemetry(tlm.clone()));
        assert!(live.recording);

        tlm.run_state = RunState::Standby;
        live.apply(&DeviceEvent::Telemetry(tlm));
        assert!(!live.recording);
    }
}

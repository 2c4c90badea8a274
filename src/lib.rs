//! Racetrix: companion protocol engine for a Bluetooth GPS lap-timer.
//!
//! The device streams newline-terminated telemetry over either BLE (Nordic
//! UART Service) or classic RFCOMM, and accepts short ASCII commands. This
//! crate provides discovery, both transports, outbound chunking with flow
//! control, inbound frame reassembly, a typed protocol decoder, and a
//! session that orchestrates the lot. Consumers drive a [`Session`] and
//! receive [`AppEvent`]s.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{AppEvent, ConnectionStatus, DeviceEvent, LiveState};
pub use domain::settings::SettingsService;
pub use infrastructure::bluetooth::{Command, Scanner, Session, TransportError, TransportKind};

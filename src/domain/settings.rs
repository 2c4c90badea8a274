//! Persistent application settings.
//!
//! Stored as JSON under the platform config directory. Device-side options
//! (volume, axis flags, GPS rate) are mirrors of what the firmware reports;
//! they are updated from configuration echoes so the file always reflects
//! the device's own state rather than what we last asked for.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::models::ConfigItem;

fn default_volume() -> i32 {
    15
}

fn default_request_mtu() -> u16 {
    247
}

fn default_classic_channel() -> u8 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_to_file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_to_file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Beeper volume, 0-30.
    #[serde(default = "default_volume")]
    pub volume: i32,
    #[serde(default)]
    pub swap_axes: bool,
    #[serde(default)]
    pub invert_x: bool,
    #[serde(default)]
    pub invert_y: bool,
    /// 10 Hz GPS sampling instead of the default rate.
    #[serde(default)]
    pub gps_10hz: bool,
    /// Address of the peer we last connected to, highlighted in scan results
    /// and used for automatic reconnection.
    #[serde(default)]
    pub last_connected_device: Option<String>,
    #[serde(default = "default_request_mtu")]
    pub ble_request_mtu: u16,
    #[serde(default = "default_classic_channel")]
    pub classic_channel: u8,
    /// Scan without the service filter.
    #[serde(default)]
    pub debug_show_all_devices: bool,
    #[serde(default)]
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            swap_axes: false,
            invert_x: false,
            invert_y: false,
            gps_10hz: false,
            last_connected_device: None,
            ble_request_mtu: default_request_mtu(),
            classic_channel: default_classic_channel(),
            debug_show_all_devices: false,
            log: LogSettings::default(),
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    path: PathBuf,
}

impl SettingsService {
    pub fn new() -> Self {
        Self::with_path(Self::default_path())
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn with_path(path: PathBuf) -> Self {
        let settings = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("settings file is malformed, using defaults: {e}");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        };
        Self { settings, path }
    }

    fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Racetrix")
            .join("settings.json")
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// Fold a configuration echo from the device into the stored settings.
    pub fn apply_config_item(&mut self, item: &ConfigItem) {
        match *item {
            ConfigItem::Volume(v) => self.settings.volume = v,
            ConfigItem::SwapAxes(v) => self.settings.swap_axes = v,
            ConfigItem::InvertX(v) => self.settings.invert_x = v,
            ConfigItem::InvertY(v) => self.settings.invert_y = v,
            ConfigItem::Gps10Hz(v) => self.settings.gps_10hz = v,
        }
        info!(key = item.key(), value = %item.wire_value(), "device config echoed");
    }

    pub fn set_last_connected(&mut self, address: &str) {
        self.settings.last_connected_device = Some(address.to_string());
    }
}

impl Default for SettingsService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("racetrix-settings-{tag}-{}", std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn missing_file_yields_defaults() {
        let service = SettingsService::with_path(temp_path("missing"));
        assert_eq!(service.get().volume, 15);
        assert_eq!(service.get().ble_request_mtu, 247);
        assert_eq!(service.get().classic_channel, 1);
        assert!(service.get().last_connected_device.is_none());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let path = temp_path("roundtrip");
        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().volume = 22;
        service.set_last_connected("AA:BB:CC:DD:EE:FF");
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().volume, 22);
        assert_eq!(
            reloaded.get().last_connected_device.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
    }

    #[test]
    fn config_echo_updates_the_matching_field() {
        let mut service = SettingsService::with_path(temp_path("echo"));
        service.apply_config_item(&ConfigItem::SwapAxes(true));
        service.apply_config_item(&ConfigItem::Volume(5));
        assert!(service.get().swap_axes);
        assert_eq!(service.get().volume, 5);
        assert!(!service.get().invert_x);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let path = temp_path("malformed");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        let service = SettingsService::with_path(path);
        assert_eq!(service.get().volume, 15);
    }
}

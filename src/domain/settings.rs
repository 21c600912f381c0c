use crate::domain::advertising::AdvertiseConfig;
use crate::domain::models::InboundWritePolicy;
use crate::domain::session_log::DEFAULT_LOG_CAPACITY;
use crate::domain::protocol::DEFAULT_DEVICE_NAME;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "door_alarm_peripheral".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_true")]
    pub include_device_name: bool,
    #[serde(default)]
    pub advertise: AdvertiseConfig,

    // Session Settings
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default)]
    pub inbound_write_policy: InboundWritePolicy,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            include_device_name: default_true(),
            advertise: AdvertiseConfig::default(),
            log_capacity: default_log_capacity(),
            inbound_write_policy: InboundWritePolicy::default(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}
fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path; a missing or broken file yields defaults
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("DoorAlarmPeripheral");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    /// Writes the loaded settings on first run; returns whether a file was written
    pub fn save_if_missing(&self) -> anyhow::Result<bool> {
        if self.settings_path.exists() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::advertising::{AdvertiseMode, TxPowerLevel};

    fn temp_settings_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("door_alarm_settings_{}_{}", name, std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"device_name": "PORCH"}"#).unwrap();
        assert_eq!(settings.device_name, "PORCH");
        assert_eq!(settings.advertise, AdvertiseConfig::default());
        assert_eq!(settings.log_capacity, DEFAULT_LOG_CAPACITY);
        assert_eq!(settings.inbound_write_policy, InboundWritePolicy::Log);
    }

    #[test]
    fn test_enum_fields_are_snake_case() {
        let settings: Settings = serde_json::from_str(
            r#"{"advertise": {"mode": "low_power", "tx_power": "medium", "timeout_ms": 3000},
                "inbound_write_policy": "reject"}"#,
        )
        .unwrap();
        assert_eq!(settings.advertise.mode, AdvertiseMode::LowPower);
        assert_eq!(settings.advertise.tx_power, TxPowerLevel::Medium);
        assert!(settings.advertise.connectable);
        assert_eq!(settings.inbound_write_policy, InboundWritePolicy::Reject);
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_settings_path("roundtrip");
        let mut service = SettingsService::load(path.clone());
        assert_eq!(service.get().device_name, DEFAULT_DEVICE_NAME);

        service.get_mut().device_name = "GARAGE".to_string();
        service.save().unwrap();

        let reloaded = SettingsService::load(path.clone());
        assert_eq!(reloaded.get().device_name, "GARAGE");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_first_run_file_keeps_defaults_not_overrides() {
        let path = temp_settings_path("first_run");
        let mut service = SettingsService::load(path.clone());
        assert!(service.save_if_missing().unwrap());

        service.get_mut().device_name = "ONE_OFF".to_string();
        assert!(!service.save_if_missing().unwrap());

        let reloaded = SettingsService::load(path.clone());
        assert_eq!(reloaded.get().device_name, DEFAULT_DEVICE_NAME);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let path = temp_settings_path("broken");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::load(path.clone());
        assert_eq!(service.get().device_name, DEFAULT_DEVICE_NAME);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}

// src/settings.rs
//
// Persisted configuration snapshot, loaded once per process. Replaces the
// original firmware's NVRAM `Preferences` store (original_source/src/
// config.h EEPROMSettings) with a TOML file under the `ESP32RET` namespace,
// following the teacher's use of `serde` + `toml` for settings persistence.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::can::{BusConfig, NUM_BUSES};
use crate::error::IoError;

pub const SETTINGS_NAMESPACE: &str = "ESP32RET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    Generic,
    Evtv,
    Macchina5Can,
}

impl SystemType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SystemType::Evtv,
            2 => SystemType::Macchina5Can,
            _ => SystemType::Generic,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SystemType::Generic => 0,
            SystemType::Evtv => 1,
            SystemType::Macchina5Can => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    Off,
    Station,
    AccessPoint,
}

impl WifiMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WifiMode::Station,
            2 => WifiMode::AccessPoint,
            _ => WifiMode::Off,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WifiMode::Off => 0,
            WifiMode::Station => 1,
            WifiMode::AccessPoint => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Settings as loaded/persisted. Mutated only by GvretCodec's
/// SETUP_CANBUS/SET_SYSTYPE handlers and the 0xE7 binary-mode byte, and by
/// load-at-boot — never elsewhere, per spec's "Shared resources" rule.
#[derive(Debug, Clone)]
pub struct Settings {
    pub buses: [BusConfig; NUM_BUSES],
    pub use_binary_serial_comm: bool,
    pub system_type: SystemType,
    pub enable_bt: bool,
    pub bt_name: String,
    pub wifi_mode: WifiMode,
    pub ssid: String,
    pub psk: String,
    pub log_level: LogLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            buses: [BusConfig::default(); NUM_BUSES],
            use_binary_serial_comm: true,
            system_type: SystemType::Generic,
            enable_bt: false,
            bt_name: "CANDUE".to_string(),
            wifi_mode: WifiMode::Off,
            ssid: String::new(),
            psk: String::new(),
            log_level: LogLevel::Info,
        }
    }
}

/// On-disk shape. Kept separate from `Settings` so the in-memory type can
/// use richer enums while the file stays a flat, forward-compatible TOML
/// table under the `ESP32RET` namespace.
#[derive(Debug, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(rename = "ESP32RET")]
    esp32ret: SettingsBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsBody {
    buses: Vec<BusConfigBody>,
    use_binary_serial_comm: bool,
    system_type: u8,
    enable_bt: bool,
    bt_name: String,
    wifi_mode: u8,
    ssid: String,
    psk: String,
    log_level: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BusConfigBody {
    enabled: bool,
    listen_only: bool,
    fd_mode: bool,
    nom_speed: u32,
    fd_speed: u32,
}

impl From<BusConfig> for BusConfigBody {
    fn from(b: BusConfig) -> Self {
        BusConfigBody {
            enabled: b.enabled,
            listen_only: b.listen_only,
            fd_mode: b.fd_mode,
            nom_speed: b.nom_speed,
            fd_speed: b.fd_speed,
        }
    }
}

impl From<BusConfigBody> for BusConfig {
    fn from(b: BusConfigBody) -> Self {
        BusConfig {
            enabled: b.enabled,
            listen_only: b.listen_only,
            fd_mode: b.fd_mode,
            nom_speed: b.nom_speed,
            fd_speed: b.fd_speed,
        }
    }
}

fn log_level_to_str(l: LogLevel) -> &'static str {
    match l {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn log_level_from_str(s: &str) -> LogLevel {
    match s {
        "debug" => LogLevel::Debug,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, IoError> {
        if !path.exists() {
            let defaults = Settings::default();
            defaults.save(path)?;
            return Ok(defaults);
        }
        let raw = std::fs::read_to_string(path)?;
        let file: SettingsFile = toml::from_str(&raw)
            .map_err(|e| IoError::Config(format!("parsing {}: {}", path.display(), e)))?;
        let body = file.esp32ret;
        let mut buses = [BusConfig::default(); NUM_BUSES];
        for (slot, bus) in buses.iter_mut().zip(body.buses.into_iter()) {
            *slot = bus.into();
        }
        Ok(Settings {
            buses,
            use_binary_serial_comm: body.use_binary_serial_comm,
            system_type: SystemType::from_u8(body.system_type),
            enable_bt: body.enable_bt,
            bt_name: body.bt_name,
            wifi_mode: WifiMode::from_u8(body.wifi_mode),
            ssid: body.ssid,
            psk: body.psk,
            log_level: log_level_from_str(&body.log_level),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), IoError> {
        let file = SettingsFile {
            esp32ret: SettingsBody {
                buses: self.buses.iter().copied().map(BusConfigBody::from).collect(),
                use_binary_serial_comm: self.use_binary_serial_comm,
                system_type: self.system_type.as_u8(),
                enable_bt: self.enable_bt,
                bt_name: self.bt_name.clone(),
                wifi_mode: self.wifi_mode.as_u8(),
                ssid: self.ssid.clone(),
                psk: self.psk.clone(),
                log_level: log_level_to_str(self.log_level).to_string(),
            },
        };
        let rendered = toml::to_string_pretty(&file)
            .map_err(|e| IoError::Config(format!("serializing settings: {}", e)))?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

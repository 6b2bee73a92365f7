//! Configuration file support for ezload.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (EZLOAD_*, DEVICE)
//! 3. Local config file (./ezload.toml)
//! 4. Global config file (~/.config/ezload/config.toml)
//!
//! ```toml
//! [device]
//! vid_pid = "04b4:8613"
//! type = "fx2lp"
//!
//! [load]
//! loader = "/usr/share/usb/a3load.hex"
//!
//! [[known_device]]
//! vid = 0x1209
//! pid = 0x0001
//! type = "fx2"
//! name = "My FX2 board"
//! ```

use {
    crate::{CliError, parse_vid_pid},
    directories::ProjectDirs,
    ezload::{ChipFamily, KnownDevice, KnownDeviceTable},
    log::{debug, warn},
    serde::Deserialize,
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "ezload.toml";

/// Default device selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Device to use, as "vid:pid" in hex.
    pub vid_pid: Option<String>,
    /// Microcontroller type (an21, fx, fx2, fx2lp).
    #[serde(rename = "type")]
    pub chip_type: Option<String>,
}

/// Load defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadConfig {
    /// Default second-stage loader.
    pub loader: Option<PathBuf>,
}

/// Extra entry for the known device table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KnownDeviceEntry {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Microcontroller type.
    #[serde(rename = "type")]
    pub chip_type: String,
    /// Display name.
    pub name: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Device selection.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Load defaults.
    #[serde(default)]
    pub load: LoadConfig,
    /// Additional known devices.
    #[serde(default, rename = "known_device")]
    pub known_devices: Vec<KnownDeviceEntry>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ezload").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.device.vid_pid.is_some() {
            self.device.vid_pid = other.device.vid_pid;
        }
        if other.device.chip_type.is_some() {
            self.device.chip_type = other.device.chip_type;
        }
        if other.load.loader.is_some() {
            self.load.loader = other.load.loader;
        }
        self.known_devices.extend(other.known_devices);
    }

    /// Configured default family, if any.
    pub fn family(&self) -> Result<Option<ChipFamily>, CliError> {
        self.device
            .chip_type
            .as_deref()
            .map(|name| {
                ChipFamily::from_name(name).ok_or_else(|| {
                    CliError::Config(format!("unknown microcontroller type in config: {name}"))
                })
            })
            .transpose()
    }

    /// Configured default VID:PID, if any.
    pub fn vid_pid(&self) -> Result<Option<(u16, u16)>, CliError> {
        self.device
            .vid_pid
            .as_deref()
            .map(|s| parse_vid_pid(s).map_err(|e| CliError::Config(format!("device.vid_pid: {e}"))))
            .transpose()
    }

    /// Built-in device table extended with the configured entries.
    pub fn known_device_table(&self) -> Result<KnownDeviceTable, CliError> {
        let mut table = KnownDeviceTable::builtin();
        for entry in &self.known_devices {
            let family = ChipFamily::from_name(&entry.chip_type).ok_or_else(|| {
                CliError::Config(format!(
                    "unknown type '{}' for known device {:04x}:{:04x}",
                    entry.chip_type, entry.vid, entry.pid
                ))
            })?;
            let name = entry
                .name
                .clone()
                .unwrap_or_else(|| format!("{family} device"));
            table.add(KnownDevice::new(entry.vid, entry.pid, family, name));
        }
        Ok(table)
    }
}

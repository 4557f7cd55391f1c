//! Configuration file support for sspflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SSPFLASH_*)
//! 3. Local config file (./sspflash.toml, ./sspflash_ports.toml)
//! 4. Global config file (~/.config/sspflash/config.toml, ports.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sspflash::UpdateConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
const LOCAL_CONFIG: &str = "sspflash.toml";

/// Local file that remembered USB devices are written to.
const LOCAL_PORTS: &str = "sspflash_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// SSP address of the validator, decimal or `0x` hex.
    pub address: Option<String>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Update timing overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// Seconds to wait for the device to come back after the main stage.
    /// `0` waits forever.
    pub resync_timeout_secs: Option<u64>,
    /// Delay before reopening the port for the main stage.
    pub reopen_delay_ms: Option<u64>,
    /// How long to wait for each handshake acknowledgement.
    pub ack_timeout_ms: Option<u64>,
}

impl UpdateSettings {
    /// Apply these overrides on top of the library defaults.
    pub fn to_update_config(&self) -> UpdateConfig {
        let mut config = UpdateConfig::default();

        if let Some(secs) = self.resync_timeout_secs {
            config = config.with_resync_timeout(resync_limit(secs));
        }
        if let Some(ms) = self.reopen_delay_ms {
            config = config.with_reopen_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.ack_timeout_ms {
            config = config.with_ack_timeout(Duration::from_millis(ms));
        }

        config
    }
}

/// `0` means no limit.
pub fn resync_limit(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Update timing.
    #[serde(default)]
    pub update: UpdateSettings,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        // Remembered devices
        if let Some(ports) = Self::load_ports_config() {
            config.merge_ports(ports);
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

    /// Load remembered ports, local file first.
    fn load_ports_config() -> Option<PortConfig> {
        let candidates = [
            Some(PathBuf::from(LOCAL_PORTS)),
            Self::global_config_dir().map(|dir| dir.join("ports.toml")),
        ];

        for path in candidates.into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            match fs::read_to_string(&path).map(|content| toml::from_str::<PortConfig>(&content)) {
                Ok(Ok(ports)) => {
                    debug!("Loaded ports config from {}", path.display());
                    return Some(ports);
                },
                Ok(Err(e)) => warn!("Failed to parse ports file {}: {e}", path.display()),
                Err(e) => warn!("Failed to read ports file {}: {e}", path.display()),
            }
        }

        None
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "sspflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        self.merge_ports(other.port);

        if other.update.resync_timeout_secs.is_some() {
            self.update.resync_timeout_secs = other.update.resync_timeout_secs;
        }
        if other.update.reopen_delay_ms.is_some() {
            self.update.reopen_delay_ms = other.update.reopen_delay_ms;
        }
        if other.update.ack_timeout_ms.is_some() {
            self.update.ack_timeout_ms = other.update.ack_timeout_ms;
        }
    }

    fn merge_ports(&mut self, other: PortConfig) {
        if other.connection.serial.is_some() {
            self.port.connection.serial = other.connection.serial;
        }
        if other.connection.address.is_some() {
            self.port.connection.address = other.connection.address;
        }
        for device in other.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        // Don't add duplicates
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        // Project-local when the project has its own config, global otherwise
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port.usb_device.push(device);

        let remembered = PortConfig {
            connection: ConnectionConfig::default(),
            usb_device: self.port.usb_device.clone(),
        };
        let content = toml::to_string_pretty(&remembered)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

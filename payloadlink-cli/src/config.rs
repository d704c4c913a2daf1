//! Configuration file support for payloadlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PAYLOADLINK_*)
//! 3. Local config file (./payloadlink.toml)
//! 4. Global config file (~/.config/payloadlink/config.toml)

use crate::CliError;
use directories::ProjectDirs;
use log::{debug, info, warn};
use payloadlink::{PointCloudReaderConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCAL_CONFIG: &str = "payloadlink.toml";

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

/// Link settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Point-cloud TCP endpoint.
    pub tcp: Option<String>,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Per-file retry settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per file.
    pub attempts: Option<u32>,
    /// First back-off delay in milliseconds.
    pub initial_delay_ms: Option<u64>,
    /// Back-off cap in milliseconds.
    pub max_delay_ms: Option<u64>,
}

impl RetryConfig {
    /// Build a retry policy, `attempts` overriding the configured count.
    pub fn policy(&self, attempts: Option<u32>) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(n) = attempts.or(self.attempts) {
            policy = policy.with_max_attempts(n);
        }
        if let Some(ms) = self.initial_delay_ms {
            policy = policy.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_delay_ms {
            policy = policy.with_max_delay(Duration::from_millis(ms));
        }
        policy
    }
}

/// Download settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Default destination root.
    pub out_dir: Option<PathBuf>,
    /// Bytes per transfer slice.
    pub slice_size: Option<usize>,
    /// Mount position name.
    pub mount: Option<String>,
}

/// Point-cloud settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointCloudConfig {
    /// Channel id sent when opening the stream.
    pub channel_id: Option<u16>,
    /// Reconnect attempts per outage.
    pub reconnect_attempts: Option<u32>,
    /// Delay between reconnect attempts in milliseconds.
    pub reconnect_delay_ms: Option<u64>,
    /// Receive buffer size in bytes.
    pub buffer_size: Option<usize>,
}

impl PointCloudConfig {
    /// Reader configuration with these overrides applied.
    pub fn reader_config(&self) -> PointCloudReaderConfig {
        let mut config = PointCloudReaderConfig::default();
        if self.reconnect_attempts.is_some() || self.reconnect_delay_ms.is_some() {
            let defaults = &config.reconnect;
            let delay = self
                .reconnect_delay_ms
                .map_or(defaults.initial_delay, Duration::from_millis);
            let attempts = self
                .reconnect_attempts
                .unwrap_or(defaults.max_attempts);
            config = config.with_reconnect(RetryPolicy::fixed(delay, attempts));
        }
        if let Some(bytes) = self.buffer_size {
            config = config.with_buffer_size(bytes);
        }
        config
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Link configuration.
    #[serde(default)]
    pub link: LinkConfig,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Download configuration.
    #[serde(default)]
    pub download: DownloadConfig,
    /// Point-cloud configuration.
    #[serde(default)]
    pub pointcloud: PointCloudConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// A missing file is an error; a malformed one is reported and ignored.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            return Err(CliError::Config(format!("Config file not found: {}", path.display())).into());
        }
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            warn!("Could not load config from {}, using defaults", path.display());
            Ok(Self::default())
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
        ProjectDirs::from("", "", "payloadlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let Self {
            link,
            retry,
            download,
            pointcloud,
        } = other;

        if link.serial.is_some() {
            self.link.serial = link.serial;
        }
        if link.baud.is_some() {
            self.link.baud = link.baud;
        }
        if link.tcp.is_some() {
            self.link.tcp = link.tcp;
        }
        for device in link.usb_device {
            if !self.link.usb_device.contains(&device) {
                self.link.usb_device.push(device);
            }
        }

        self.retry.attempts = retry.attempts.or(self.retry.attempts);
        self.retry.initial_delay_ms = retry.initial_delay_ms.or(self.retry.initial_delay_ms);
        self.retry.max_delay_ms = retry.max_delay_ms.or(self.retry.max_delay_ms);

        if download.out_dir.is_some() {
            self.download.out_dir = download.out_dir;
        }
        self.download.slice_size = download.slice_size.or(self.download.slice_size);
        if download.mount.is_some() {
            self.download.mount = download.mount;
        }

        self.pointcloud.channel_id = pointcloud.channel_id.or(self.pointcloud.channel_id);
        self.pointcloud.reconnect_attempts = pointcloud
            .reconnect_attempts
            .or(self.pointcloud.reconnect_attempts);
        self.pointcloud.reconnect_delay_ms = pointcloud
            .reconnect_delay_ms
            .or(self.pointcloud.reconnect_delay_ms);
        self.pointcloud.buffer_size = pointcloud.buffer_size.or(self.pointcloud.buffer_size);
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        if self.link.usb_device.contains(&device) {
            return Ok(());
        }

        // Prefer the local file when one exists, else the global one
        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        // Re-read the target so unrelated settings from other layers are not
        // written into it.
        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.link.usb_device.push(device.clone());
        self.link.usb_device.push(device);

        let content = toml::to_string_pretty(&on_disk)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.link.serial.is_none());
        assert!(config.link.baud.is_none());
        assert!(config.link.usb_device.is_empty());
        assert!(config.retry.attempts.is_none());
        assert!(config.download.out_dir.is_none());
        assert!(config.pointcloud.channel_id.is_none());
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x1A86,
            pid: 0x7523,
        };
        assert!(device.matches(0x1A86, 0x7523));
        assert!(!device.matches(0x1A86, 0x7522));
        assert!(!device.matches(0x10C4, 0x7523));
    }

    #[test]
    fn test_config_merge_overrides_and_keeps() {
        let mut base = Config::default();
        base.link.serial = Some("/dev/ttyUSB0".to_string());
        base.retry.attempts = Some(2);
        base.link.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let mut other = Config::default();
        other.link.baud = Some(115200);
        other.retry.attempts = Some(7);
        other.link.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });
        other.link.usb_device.push(UsbDevice { vid: 0x10C4, pid: 0xEA60 });

        base.merge(other);

        assert_eq!(base.link.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.link.baud, Some(115200));
        assert_eq!(base.retry.attempts, Some(7));
        assert_eq!(base.link.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[link]
serial = "/dev/ttyUSB0"
baud = 921600
tcp = "192.168.1.10:9000"

[[link.usb_device]]
vid = 6790
pid = 29987

[retry]
attempts = 4
initial_delay_ms = 100

[download]
out_dir = "downloads"
slice_size = 8192
mount = "payload2"

[pointcloud]
channel_id = 49152
reconnect_attempts = 3
reconnect_delay_ms = 250
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.link.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.link.baud, Some(921600));
        assert_eq!(config.link.tcp.as_deref(), Some("192.168.1.10:9000"));
        assert_eq!(config.link.usb_device[0].vid, 6790);
        assert_eq!(config.retry.attempts, Some(4));
        assert_eq!(config.download.slice_size, Some(8192));
        assert_eq!(config.download.mount.as_deref(), Some("payload2"));
        assert_eq!(config.pointcloud.channel_id, Some(49152));

        let policy = config.retry.policy(None);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(config.retry.policy(Some(1)).max_attempts, 1);

        let reader = config.pointcloud.reader_config();
        assert_eq!(reader.reconnect.max_attempts, 3);
        assert_eq!(reader.reconnect.initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.link.serial.is_none());
        let reader = config.pointcloud.reader_config();
        assert_eq!(reader.reconnect.max_attempts, 10);
        assert_eq!(reader.reconnect.initial_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[link]\nserial = \"/dev/ttyUSB1\"\n").unwrap();
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.link.serial.as_deref(), Some("/dev/ttyUSB1"));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "not [[[ toml").unwrap();
        let config = Config::load_from_path(&broken).unwrap();
        assert!(config.link.serial.is_none());
    }

    #[test]
    fn test_load_from_missing_path_is_config_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Config(_))));
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("payloadlink"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}

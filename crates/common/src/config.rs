//! Host configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error (or a full `EnvFilter` directive)
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
    /// Print the module path of each event
    #[serde(default)]
    pub show_targets: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            show_targets: false,
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID allow-list ("0x1234:0x5678", "0x1234:*"); empty allows all
    #[serde(default)]
    pub filters: Vec<String>,
    /// Drop devices whose descriptor reports bcdUSB == 0
    #[serde(default = "UsbSettings::default_skip_invalid")]
    pub skip_invalid_descriptors: bool,
    /// Open each device during enumeration to read its strings
    #[serde(default)]
    pub read_strings: bool,
    /// Native library log level (0 = none .. 4 = debug)
    #[serde(default)]
    pub native_log_level: u8,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            skip_invalid_descriptors: Self::default_skip_invalid(),
            read_strings: false,
            native_log_level: 0,
        }
    }
}

impl UsbSettings {
    fn default_skip_invalid() -> bool {
        true
    }
}

/// How synchronous transfers reach the native layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Submit an asynchronous transfer and block on its completion
    #[default]
    Bridge,
    /// Use the native blocking primitives
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub mode: TransferMode,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout_ms(),
            mode: TransferMode::default(),
        }
    }
}

impl TransferSettings {
    fn default_timeout_ms() -> u64 {
        5000
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/usb-host/host.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-host/host.toml")
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.transfers.default_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            validate_filter(filter)?;
        }

        if self.usb.native_log_level > 4 {
            return Err(anyhow!(
                "Invalid native_log_level {}, must be 0-4",
                self.usb.native_log_level
            ));
        }

        if self.transfers.default_timeout_ms == 0 {
            return Err(anyhow!("default_timeout_ms must be greater than 0"));
        }

        Ok(())
    }
}

/// Validate a USB device filter pattern (VID:PID)
pub fn validate_filter(filter: &str) -> Result<()> {
    let (vid, pid) = filter.split_once(':').ok_or_else(|| {
        anyhow!(
            "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
            filter
        )
    })?;
    if pid.contains(':') {
        return Err(anyhow!("Invalid filter format '{}', too many ':'", filter));
    }

    if vid != "*" {
        validate_hex_id(vid, "VID")?;
    }
    if pid != "*" {
        validate_hex_id(pid, "PID")?;
    }

    Ok(())
}

fn validate_hex_id(id: &str, name: &str) -> Result<()> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x'", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

    Ok(())
}

/// Check if a VID/PID pair is allowed by the filters
///
/// An empty filter list allows everything. Malformed entries never match.
pub fn filter_allows(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    let matches = |pattern: &str, value: u16| {
        pattern == "*"
            || u16::from_str_radix(pattern.trim_start_matches("0x").trim_start_matches("0X"), 16)
                .map(|v| v == value)
                .unwrap_or(false)
    };

    filters.iter().any(|filter| match filter.split_once(':') {
        Some((f_vid, f_pid)) => matches(f_vid, vid) && matches(f_pid, pid),
        None => false,
    })
}

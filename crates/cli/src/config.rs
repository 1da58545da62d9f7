//! CLI configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use usbwatch::{DeviceConfig, DeviceIdentity, EndpointPair};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub monitor: MonitorSettings,
    /// Endpoint selection for `--probe`
    #[serde(default)]
    pub probe: ProbeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub log_level: String,
    /// Enumeration cadence in milliseconds when hotplug events are
    /// unavailable
    pub poll_interval_ms: u64,
    /// Identities to watch, as `VID:PID` strings
    #[serde(default)]
    pub watch: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Bulk IN endpoint address, e.g. "0x81"
    pub read_endpoint: String,
    /// Bulk OUT endpoint address, e.g. "0x02"
    pub write_endpoint: String,
    pub configuration: u8,
    pub interface: u8,
    pub alternate: u8,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            read_endpoint: "0x81".to_string(),
            write_endpoint: "0x02".to_string(),
            configuration: 1,
            interface: 0,
            alternate: 0,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorSettings {
                log_level: "info".to_string(),
                poll_interval_ms: 250,
                watch: Vec::new(),
            },
            probe: ProbeSettings::default(),
        }
    }
}

impl WatchConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbwatch/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: WatchConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("usbwatch").join("config.toml")
        } else {
            PathBuf::from(".config/usbwatch/config.toml")
        }
    }

    /// Parsed watch-list identities
    pub fn watch_identities(&self) -> Result<Vec<DeviceIdentity>> {
        self.monitor
            .watch
            .iter()
            .map(|s| s.parse::<DeviceIdentity>().map_err(|e| anyhow!(e)))
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.poll_interval_ms)
    }

    pub fn probe_device_config(&self) -> DeviceConfig {
        DeviceConfig {
            interface: self.probe.interface,
            alternate: self.probe.alternate,
            configuration: self.probe.configuration,
        }
    }

    pub fn probe_endpoints(&self) -> Result<EndpointPair> {
        Ok(EndpointPair::new(
            parse_endpoint(&self.probe.read_endpoint)?,
            parse_endpoint(&self.probe.write_endpoint)?,
        ))
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }

        self.watch_identities()?;
        self.probe_endpoints()?;

        Ok(())
    }
}

/// Parse an endpoint address string like "0x81" or "129"
pub fn parse_endpoint(s: &str) -> Result<u8> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| anyhow!("Invalid endpoint address '{}', expected e.g. '0x81'", s))
}

/// Parse a hex byte string like "f180" into bytes
pub fn parse_hex_payload(s: &str) -> Result<Vec<u8>> {
    let s = s.trim().trim_start_matches("0x");
    if s.is_empty() || s.len() % 2 != 0 {
        return Err(anyhow!(
            "Invalid payload '{}', expected an even number of hex digits",
            s
        ));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| anyhow!("Invalid hex byte '{}'", &s[i..i + 2]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WatchConfig::default();
        assert_eq!(config.monitor.log_level, "info");
        assert_eq!(config.monitor.poll_interval_ms, 250);
        assert!(config.monitor.watch.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = WatchConfig::default();
        config.monitor.watch.push("0x0483:0x3748".to_string());
        config.save(&path).unwrap();

        let loaded = WatchConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.monitor.watch, vec!["0x0483:0x3748"]);
        assert_eq!(
            loaded.watch_identities().unwrap(),
            vec![DeviceIdentity::new(0x0483, 0x3748)]
        );
    }

    #[test]
    fn test_validate_rejects_bad_watch_entry() {
        let mut config = WatchConfig::default();
        config.monitor.watch.push("not-an-identity".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = WatchConfig::default();
        config.monitor.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("0x81").unwrap(), 0x81);
        assert_eq!(parse_endpoint("0x02").unwrap(), 0x02);
        assert_eq!(parse_endpoint("129").unwrap(), 129);
        assert!(parse_endpoint("0x").is_err());
        assert!(parse_endpoint("endpoint").is_err());
    }

    #[test]
    fn test_parse_hex_payload() {
        assert_eq!(parse_hex_payload("f180").unwrap(), vec![0xf1, 0x80]);
        assert_eq!(parse_hex_payload("0xF180").unwrap(), vec![0xf1, 0x80]);
        assert!(parse_hex_payload("f").is_err());
        assert!(parse_hex_payload("").is_err());
        assert!(parse_hex_payload("zz").is_err());
    }
}

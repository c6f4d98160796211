//! Configuration of the monitor client.
//!
//! Stored as JSON; every field is optional in the file and falls back to its default.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolVariant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Firmware variant assumed when a session starts
    pub variant: ProtocolVariant,

    /// Switch to the other variant when frames keep failing to decode
    pub auto_detect_variant: bool,

    /// Consecutive rejected frames before switching variant
    pub auto_detect_threshold: u32,

    /// Period of the keep-alive start command while connected
    #[serde(with = "millis")]
    pub keep_alive_interval: Duration,

    /// Delay between arming notifications and the first start command (notify-first firmware)
    #[serde(with = "millis")]
    pub command_delay: Duration,

    /// Bound on a connection attempt, from connect until ready
    #[serde(with = "millis")]
    pub connect_timeout: Duration,

    /// Scan duration used when the caller does not give one
    #[serde(with = "millis")]
    pub scan_timeout: Duration,

    /// Report every newly seen peer, not only candidates
    pub report_unmatched_peers: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::Modern,
            auto_detect_variant: true,
            auto_detect_threshold: 3,
            keep_alive_interval: Duration::from_secs(5),
            command_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(15),
            scan_timeout: Duration::from_secs(10),
            report_unmatched_peers: true,
        }
    }
}

impl MonitorConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: MonitorConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Load config from a JSON file, or defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert!(config.auto_detect_variant);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{ "variant": "legacy", "keep_alive_interval": 2500 }"#).unwrap();
        assert_eq!(config.variant, ProtocolVariant::Legacy);
        assert_eq!(config.keep_alive_interval, Duration::from_millis(2500));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("battmon-config-{}", std::process::id()));
        let path = dir.join("config.json");

        let config = MonitorConfig {
            auto_detect_variant: false,
            scan_timeout: Duration::from_secs(30),
            ..MonitorConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(MonitorConfig::load(&path).unwrap(), config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_file_gives_default() {
        let path = std::env::temp_dir().join("battmon-does-not-exist/config.json");
        assert_eq!(
            MonitorConfig::load_or_default(&path).unwrap(),
            MonitorConfig::default()
        );
        assert!(MonitorConfig::load(&path).is_err());
    }
}

// Configuration management for the bhs CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blehandshake/config.json
// - Linux: ~/.config/blehandshake/config.json
// - Windows: %APPDATA%\blehandshake\config.json

use anyhow::{Context, Result};
use blehandshake_core::{parse_uuid, HandshakeSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local name the peripheral advertises
    pub local_name: String,

    /// Handshake service id (16-bit, 32-bit or full UUID)
    pub service_id: String,

    /// Writable characteristic id (16-bit, 32-bit or full UUID)
    pub characteristic_id: String,

    /// Payload the central writes when none is given
    pub payload: String,

    /// Session tunables shared by both roles
    pub settings: HandshakeSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: "Ticket".to_string(),
            service_id: "1234".to_string(),
            characteristic_id: "ABCD".to_string(),
            payload: "HELLO".to_string(),
            settings: HandshakeSettings::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blehandshake");

        // Create directory if it doesn't exist
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_name.is_empty() {
            anyhow::bail!("local_name cannot be empty");
        }
        self.service_uuid()?;
        self.characteristic_uuid()?;
        self.settings.validate().context("Invalid session settings")?;
        Ok(())
    }

    pub fn service_uuid(&self) -> Result<Uuid> {
        parse_uuid(&self.service_id).context("Invalid service_id")
    }

    pub fn characteristic_uuid(&self) -> Result<Uuid> {
        parse_uuid(&self.characteristic_id).context("Invalid characteristic_id")
    }

    /// Set a config value without persisting it
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "local_name" => self.local_name = value.to_string(),
            "service_id" => {
                parse_uuid(value).context("Invalid service id")?;
                self.service_id = value.to_string();
            }
            "characteristic_id" => {
                parse_uuid(value).context("Invalid characteristic id")?;
                self.characteristic_id = value.to_string();
            }
            "payload" => self.payload = value.to_string(),
            "settle_delay_ms" => {
                self.settings.settle_delay_ms = value.parse().context("Invalid number")?;
            }
            "default_scan_duration_ms" => {
                self.settings.default_scan_duration_ms = value.parse().context("Invalid number")?;
            }
            "max_manufacturer_data_len" => {
                self.settings.max_manufacturer_data_len =
                    value.parse().context("Invalid number")?;
            }
            "max_write_len" => {
                self.settings.max_write_len = value.parse().context("Invalid number")?;
            }
            "scan_service_ids" => {
                self.settings.scan_service_ids = value
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(|id| parse_uuid(id).with_context(|| format!("Invalid service id {}", id)))
                    .collect::<Result<Vec<_>>>()?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.validate()
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "local_name" => Some(self.local_name.clone()),
            "service_id" => Some(self.service_id.clone()),
            "characteristic_id" => Some(self.characteristic_id.clone()),
            "payload" => Some(self.payload.clone()),
            "settle_delay_ms" => Some(self.settings.settle_delay_ms.to_string()),
            "default_scan_duration_ms" => Some(self.settings.default_scan_duration_ms.to_string()),
            "max_manufacturer_data_len" => {
                Some(self.settings.max_manufacturer_data_len.to_string())
            }
            "max_write_len" => Some(self.settings.max_write_len.to_string()),
            "scan_service_ids" => Some(
                self.settings
                    .scan_service_ids
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("local_name".to_string(), self.local_name.clone()),
            ("service_id".to_string(), self.service_id.clone()),
            ("characteristic_id".to_string(), self.characteristic_id.clone()),
            ("payload".to_string(), self.payload.clone()),
            ("settle_delay_ms".to_string(), format!("{}ms", self.settings.settle_delay_ms)),
            (
                "default_scan_duration_ms".to_string(),
                match self.settings.default_scan_duration_ms {
                    0 => "(unbounded)".to_string(),
                    ms => format!("{}ms", ms),
                },
            ),
            (
                "max_manufacturer_data_len".to_string(),
                self.settings.max_manufacturer_data_len.to_string(),
            ),
            ("max_write_len".to_string(), self.settings.max_write_len.to_string()),
            (
                "scan_service_ids".to_string(),
                if self.settings.scan_service_ids.is_empty() {
                    "(any)".to_string()
                } else {
                    self.get("scan_service_ids").unwrap_or_default()
                },
            ),
        ]
    }
}

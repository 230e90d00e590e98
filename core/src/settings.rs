//! Handshake session settings
//!
//! Tunables shared by both roles, serialized to/from JSON.

use crate::advertising::DEFAULT_MAX_MANUFACTURER_DATA_LEN;
use crate::error::ConfigError;
use crate::gatt::MAX_CHARACTERISTIC_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Default pause between service registration and advertising
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 250;

/// Default scan window
pub const DEFAULT_SCAN_DURATION_MS: u64 = 5_000;

const MAX_SETTLE_DELAY_MS: u64 = 10_000;

/// Largest manufacturer data an extended advertisement can carry
const MAX_EXTENDED_MANUFACTURER_DATA_LEN: usize = 244;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSettings {
    /// Delay between service-add success and the advertise request
    pub settle_delay_ms: u64,

    /// Scan window used when a scan is started without a duration (0 = unbounded)
    pub default_scan_duration_ms: u64,

    /// Manufacturer data limit imposed by the adapter
    pub max_manufacturer_data_len: usize,

    /// Largest inbound write the default payload handler accepts
    pub max_write_len: usize,

    /// Service ids passed to the adapter to narrow scans
    pub scan_service_ids: Vec<Uuid>,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            default_scan_duration_ms: DEFAULT_SCAN_DURATION_MS,
            max_manufacturer_data_len: DEFAULT_MAX_MANUFACTURER_DATA_LEN,
            max_write_len: MAX_CHARACTERISTIC_SIZE,
            scan_service_ids: Vec::new(),
        }
    }
}

impl HandshakeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settle_delay_ms > MAX_SETTLE_DELAY_MS {
            return Err(ConfigError::Invalid(format!(
                "settle_delay_ms cannot exceed {}",
                MAX_SETTLE_DELAY_MS
            )));
        }

        if self.max_manufacturer_data_len > MAX_EXTENDED_MANUFACTURER_DATA_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_manufacturer_data_len cannot exceed {}",
                MAX_EXTENDED_MANUFACTURER_DATA_LEN
            )));
        }

        if self.max_write_len == 0 || self.max_write_len > MAX_CHARACTERISTIC_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_write_len must be within 1..={}",
                MAX_CHARACTERISTIC_SIZE
            )));
        }

        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// `None` when scans are unbounded by default
    pub fn default_scan_duration(&self) -> Option<Duration> {
        (self.default_scan_duration_ms > 0)
            .then(|| Duration::from_millis(self.default_scan_duration_ms))
    }

    /// Scan narrowing passed to the adapter, if any
    pub fn scan_filter_ids(&self) -> Option<Vec<Uuid>> {
        (!self.scan_service_ids.is_empty()).then(|| self.scan_service_ids.clone())
    }

    /// Load settings from JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Save settings to JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = self.to_json_string()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: HandshakeSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::DEFAULT_SERVICE_ID;

    #[test]
    fn test_defaults_are_valid() {
        let settings = HandshakeSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.settle_delay(), Duration::from_millis(250));
        assert_eq!(
            settings.default_scan_duration(),
            Some(Duration::from_secs(5))
        );
        assert!(settings.scan_filter_ids().is_none());
    }

    #[test]
    fn test_zero_scan_duration_is_unbounded() {
        let settings = HandshakeSettings {
            default_scan_duration_ms: 0,
            ..Default::default()
        };
        assert!(settings.default_scan_duration().is_none());
    }

    #[test]
    fn test_validation_limits() {
        let too_slow = HandshakeSettings {
            settle_delay_ms: 60_000,
            ..Default::default()
        };
        assert!(too_slow.validate().is_err());

        let no_writes = HandshakeSettings {
            max_write_len: 0,
            ..Default::default()
        };
        assert!(no_writes.validate().is_err());

        let huge_manufacturer = HandshakeSettings {
            max_manufacturer_data_len: 1_000,
            ..Default::default()
        };
        assert!(huge_manufacturer.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings =
            HandshakeSettings::from_json_str(r#"{ "settle_delay_ms": 50 }"#).expect("parse");
        assert_eq!(settings.settle_delay_ms, 50);
        assert_eq!(settings.default_scan_duration_ms, DEFAULT_SCAN_DURATION_MS);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            HandshakeSettings::from_json_str("not json"),
            Err(ConfigError::Json(_))
        ));
        assert!(HandshakeSettings::from_json_str(r#"{ "max_write_len": 4096 }"#).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");

        let settings = HandshakeSettings {
            settle_delay_ms: 100,
            scan_service_ids: vec![DEFAULT_SERVICE_ID],
            ..Default::default()
        };
        settings.save(&path).expect("save");

        let loaded = HandshakeSettings::load(&path).expect("load");
        assert_eq!(loaded, settings);
        assert_eq!(loaded.scan_filter_ids(), Some(vec![DEFAULT_SERVICE_ID]));
    }
}

//! Advertising configuration for the peripheral role

use crate::error::ConfigError;
use crate::gatt::DEFAULT_SERVICE_ID;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Manufacturer data limit for a legacy 31-byte advertisement
pub const DEFAULT_MAX_MANUFACTURER_DATA_LEN: usize = 27;

/// What the peripheral advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingConfig {
    /// Local name carried in the advertisement (e.g., "Ticket")
    pub local_name: String,
    /// Advertised service ids, in order
    pub service_ids: Vec<Uuid>,
    /// Raw manufacturer-specific data; text encoding is the caller's business
    pub manufacturer_data: Option<Vec<u8>>,
}

impl AdvertisingConfig {
    /// Create a validated configuration
    pub fn new(local_name: impl Into<String>, service_ids: Vec<Uuid>) -> Result<Self, ConfigError> {
        let config = Self {
            local_name: local_name.into(),
            service_ids,
            manufacturer_data: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Attach manufacturer data
    pub fn with_manufacturer_data(mut self, data: Vec<u8>) -> Self {
        self.manufacturer_data = Some(data);
        self
    }

    /// Structural validation: non-empty name, at least one service id
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_name.trim().is_empty() {
            return Err(ConfigError::EmptyLocalName);
        }
        if self.service_ids.is_empty() {
            return Err(ConfigError::NoServiceIds);
        }
        Ok(())
    }

    /// Validation including the adapter-imposed manufacturer data limit
    pub fn validate_with_limit(&self, max_manufacturer_data_len: usize) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(data) = &self.manufacturer_data {
            if data.len() > max_manufacturer_data_len {
                return Err(ConfigError::ManufacturerDataTooLong {
                    len: data.len(),
                    max: max_manufacturer_data_len,
                });
            }
        }
        Ok(())
    }

    /// The service id the session registers its characteristic under
    pub fn primary_service_id(&self) -> Uuid {
        self.service_ids.first().copied().unwrap_or(DEFAULT_SERVICE_ID)
    }
}

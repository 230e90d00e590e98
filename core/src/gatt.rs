/// GATT service definitions for the handshake peripheral
///
/// This module provides the 128-bit identifier helpers, characteristic and service
/// descriptors handed to the adapter, and the payload handling contract invoked on
/// every inbound characteristic write.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Bluetooth base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// Default handshake service (short form 0x1234)
pub const DEFAULT_SERVICE_ID: Uuid = Uuid::from_u128(0x0000_1234_0000_1000_8000_00805F9B34FB);

/// Default writable characteristic (short form 0xABCD)
pub const DEFAULT_CHARACTERISTIC_ID: Uuid =
    Uuid::from_u128(0x0000_ABCD_0000_1000_8000_00805F9B34FB);

/// Maximum GATT characteristic write size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID
pub fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit assigned number onto the Bluetooth base UUID
pub fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parse a 16-bit, 32-bit or full 128-bit UUID string
///
/// Short forms are hex digits only ("1234", "0000ABCD") and are expanded onto
/// the Bluetooth base UUID. Anything else must be a full UUID.
pub fn parse_uuid(s: &str) -> Result<Uuid, ConfigError> {
    let trimmed = s.trim();
    let is_hex = !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_hexdigit());

    match trimmed.len() {
        4 if is_hex => u16::from_str_radix(trimmed, 16)
            .map(uuid_from_u16)
            .map_err(|_| ConfigError::InvalidIdentifier(s.to_string())),
        8 if is_hex => u32::from_str_radix(trimmed, 16)
            .map(uuid_from_u32)
            .map_err(|_| ConfigError::InvalidIdentifier(s.to_string())),
        _ => Uuid::parse_str(trimmed).map_err(|_| ConfigError::InvalidIdentifier(s.to_string())),
    }
}

/// Characteristic property flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    pub fn read_write_notify() -> Self {
        Self {
            read: true,
            write: true,
            notify: true,
        }
    }
}

/// Characteristic permission flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicPermissions {
    pub readable: bool,
    pub writeable: bool,
}

impl CharacteristicPermissions {
    pub fn read_write() -> Self {
        Self {
            readable: true,
            writeable: true,
        }
    }
}

/// Response computed for an inbound write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Whether the write was accepted
    pub accepted: bool,
    /// Bytes returned to the writer
    pub response: Vec<u8>,
}

impl WriteOutcome {
    /// Accept the write and echo `response` back
    pub fn accept(response: Vec<u8>) -> Self {
        Self {
            accepted: true,
            response,
        }
    }

    /// Reject the write with an empty response
    pub fn reject() -> Self {
        Self {
            accepted: false,
            response: Vec::new(),
        }
    }
}

/// Errors raised while handling an inbound payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload of {len} bytes exceeds limit of {max}")]
    TooLong { len: usize, max: usize },
    #[error("Write offset {offset} beyond payload length {len}")]
    InvalidOffset { offset: usize, len: usize },
    #[error("Payload rejected: {0}")]
    Rejected(String),
}

/// Handles the payload of an inbound characteristic write
///
/// Implementations must not block and must tolerate being invoked more than
/// once with the same value when the adapter retries.
pub trait PayloadHandler: Send + Sync {
    fn handle(&self, value: &[u8], offset: usize) -> Result<WriteOutcome, PayloadError>;
}

/// Default handler: accept and echo the value back
#[derive(Debug, Clone)]
pub struct EchoHandler {
    max_len: usize,
}

impl EchoHandler {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.min(MAX_CHARACTERISTIC_SIZE),
        }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(MAX_CHARACTERISTIC_SIZE)
    }
}

impl PayloadHandler for EchoHandler {
    fn handle(&self, value: &[u8], offset: usize) -> Result<WriteOutcome, PayloadError> {
        if value.len() > self.max_len {
            return Err(PayloadError::TooLong {
                len: value.len(),
                max: self.max_len,
            });
        }
        if offset > value.len() {
            return Err(PayloadError::InvalidOffset {
                offset,
                len: value.len(),
            });
        }
        Ok(WriteOutcome::accept(value.to_vec()))
    }
}

/// Callback the adapter invokes on every inbound write: `(value, offset)`
pub type WriteCallback = Arc<dyn Fn(&[u8], usize) -> WriteOutcome + Send + Sync>;

/// A characteristic registered with the adapter
#[derive(Clone)]
pub struct CharacteristicDescriptor {
    pub id: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: CharacteristicPermissions,
    on_write: WriteCallback,
}

impl CharacteristicDescriptor {
    pub fn new(
        id: Uuid,
        properties: CharacteristicProperties,
        permissions: CharacteristicPermissions,
        on_write: WriteCallback,
    ) -> Self {
        Self {
            id,
            properties,
            permissions,
            on_write,
        }
    }

    /// Whether remote centrals may write this characteristic
    pub fn is_writable(&self) -> bool {
        self.properties.write && self.permissions.writeable
    }

    /// Deliver an inbound write to the registered callback
    pub fn dispatch_write(&self, value: &[u8], offset: usize) -> WriteOutcome {
        if !self.is_writable() {
            return WriteOutcome::reject();
        }
        (self.on_write)(value, offset)
    }
}

impl fmt::Debug for CharacteristicDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicDescriptor")
            .field("id", &self.id)
            .field("properties", &self.properties)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

/// A GATT service with its ordered characteristics
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub id: Uuid,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(id: Uuid, characteristics: Vec<CharacteristicDescriptor>) -> Self {
        Self {
            id,
            characteristics,
        }
    }

    /// Look up a characteristic by id
    pub fn characteristic(&self, id: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| &c.id == id)
    }
}

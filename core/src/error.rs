//! Error types shared by both handshake roles
//!
//! Sessions never return these across their public operations. Adapter and
//! payload failures are folded into an [`ErrorInfo`] stored as the session's
//! `last_error` and published through its change notification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors reported by an [`AdapterFacade`](crate::adapter::AdapterFacade) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Adapter rejected request: {0}")]
    Rejected(String),
    #[error("Adapter unavailable")]
    Unavailable,
    #[error("Adapter did not respond in time")]
    Timeout,
    #[error("Device not connected")]
    NotConnected,
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Validation errors for advertising configuration and settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Local name cannot be empty")]
    EmptyLocalName,
    #[error("At least one service id is required")]
    NoServiceIds,
    #[error("Manufacturer data is {len} bytes, limit is {max}")]
    ManufacturerDataTooLong { len: usize, max: usize },
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Configuration error: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session-facing failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Radio off, unauthorized or unsupported when a start was requested
    AdapterNotReady,
    /// Radio left the powered-on state while the session was active
    AdapterUnavailable,
    /// Advertising configuration failed validation
    InvalidConfig,
    /// Adapter rejected the GATT service
    ServiceRegistrationFailed,
    /// Adapter rejected the advertisement
    AdvertisingFailed,
    /// Adapter-level scan fault
    ScanFailed,
    /// Best-effort stop was not acknowledged
    StopFailed,
    /// Inbound write could not be handled
    PayloadRejected,
    /// Central could not connect to a discovered device
    ConnectFailed,
    /// Central write to a remote characteristic failed
    WriteFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::AdapterNotReady => write!(f, "AdapterNotReady"),
            ErrorKind::AdapterUnavailable => write!(f, "AdapterUnavailable"),
            ErrorKind::InvalidConfig => write!(f, "InvalidConfig"),
            ErrorKind::ServiceRegistrationFailed => write!(f, "ServiceRegistrationFailed"),
            ErrorKind::AdvertisingFailed => write!(f, "AdvertisingFailed"),
            ErrorKind::ScanFailed => write!(f, "ScanFailed"),
            ErrorKind::StopFailed => write!(f, "StopFailed"),
            ErrorKind::PayloadRejected => write!(f, "PayloadRejected"),
            ErrorKind::ConnectFailed => write!(f, "ConnectFailed"),
            ErrorKind::WriteFailed => write!(f, "WriteFailed"),
        }
    }
}

/// A recorded session failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Unix time in milliseconds when the failure was recorded
    pub at_ms: u64,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl fmt::Display) -> Self {
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            kind,
            message: message.to_string(),
            at_ms,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

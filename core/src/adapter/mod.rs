//! Adapter facade: the capability surface both sessions need from a BLE stack
//!
//! Platform bindings (CoreBluetooth, BlueZ, Android) implement
//! [`AdapterFacade`]. The sessions orchestrate the adapter; they never own it
//! and must tolerate callbacks for operations they did not start.
//!
//! - **loopback**: in-process radio used by tests and the CLI harness

pub mod loopback;

use crate::advertising::AdvertisingConfig;
use crate::device::DiscoveredDevice;
use crate::error::AdapterError;
use crate::gatt::{ServiceDescriptor, WriteOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub use loopback::{LoopbackAdapter, LoopbackRadio, Op};

/// Radio power state as reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterPowerState {
    Unknown,
    PoweredOff,
    PoweredOn,
    Unauthorized,
    Unsupported,
}

impl AdapterPowerState {
    /// Only a powered-on radio accepts scan or advertise requests
    pub fn is_ready(&self) -> bool {
        matches!(self, AdapterPowerState::PoweredOn)
    }
}

impl fmt::Display for AdapterPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterPowerState::Unknown => write!(f, "Unknown"),
            AdapterPowerState::PoweredOff => write!(f, "PoweredOff"),
            AdapterPowerState::PoweredOn => write!(f, "PoweredOn"),
            AdapterPowerState::Unauthorized => write!(f, "Unauthorized"),
            AdapterPowerState::Unsupported => write!(f, "Unsupported"),
        }
    }
}

/// Handler invoked on every power-state change
pub type PowerStateHandler = Arc<dyn Fn(AdapterPowerState) + Send + Sync>;

/// Callbacks a scan delivers sightings and faults through
#[derive(Clone)]
pub struct ScanCallbacks {
    pub on_device: Arc<dyn Fn(DiscoveredDevice) + Send + Sync>,
    pub on_error: Arc<dyn Fn(AdapterError) + Send + Sync>,
}

impl fmt::Debug for ScanCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCallbacks").finish_non_exhaustive()
    }
}

/// Keeps a power-state handler registered; dropping it unsubscribes
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Platform BLE capability contract
///
/// Async operations complete when the adapter reports the outcome. Callback
/// registrations (`subscribe_power_state`, `start_scan`) deliver events in the
/// order the adapter raises them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdapterFacade: Send + Sync {
    /// Register for power-state changes
    fn subscribe_power_state(&self, handler: PowerStateHandler) -> Subscription;

    /// Current power state
    async fn query_power_state(&self) -> AdapterPowerState;

    /// Register a GATT service (peripheral role)
    async fn add_service(&self, service: &ServiceDescriptor) -> Result<(), AdapterError>;

    /// Start advertising (peripheral role)
    async fn start_advertising(&self, config: &AdvertisingConfig) -> Result<(), AdapterError>;

    /// Stop advertising; best-effort
    async fn stop_advertising(&self) -> Result<(), AdapterError>;

    /// Answer the write request currently being handled
    fn send_write_response(&self, accepted: bool, echo: &[u8]);

    /// Start scanning (central role); `service_ids` narrows the scan at the radio
    fn start_scan(&self, service_ids: Option<Vec<Uuid>>, callbacks: ScanCallbacks);

    /// Stop scanning
    fn stop_scan(&self);

    /// Connect to a discovered device (central role)
    async fn connect(&self, device_id: &str) -> Result<(), AdapterError>;

    /// Write a remote characteristic on a connected device (central role)
    async fn write_characteristic(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: &[u8],
    ) -> Result<WriteOutcome, AdapterError>;

    /// Release a connection; best-effort
    async fn disconnect(&self, device_id: &str) -> Result<(), AdapterError>;
}

// BLE Handshake Core
//
// One side advertises a named service with a single writable characteristic,
// the other side scans for it, connects and writes a payload that is echoed
// back. Both roles run against an `AdapterFacade` supplied by the platform.

pub mod adapter;
pub mod advertising;
pub mod device;
pub mod error;
pub mod gatt;
pub mod peripheral;
pub mod scanner;
pub mod settings;

pub use adapter::{
    AdapterFacade, AdapterPowerState, LoopbackAdapter, LoopbackRadio, PowerStateHandler,
    ScanCallbacks, Subscription,
};
pub use advertising::AdvertisingConfig;
pub use device::{DeviceFilter, DiscoveredDevice};
pub use error::{AdapterError, ConfigError, ErrorInfo, ErrorKind};
pub use gatt::{
    parse_uuid, uuid_from_u16, CharacteristicDescriptor, EchoHandler, PayloadError,
    PayloadHandler, ServiceDescriptor, WriteOutcome, DEFAULT_CHARACTERISTIC_ID,
    DEFAULT_SERVICE_ID,
};
pub use peripheral::{PeripheralSession, PeripheralSnapshot, PeripheralState};
pub use scanner::{Delivery, ScannerSession, ScannerSnapshot, ScannerState};
pub use settings::HandshakeSettings;

/// Install a `tracing` subscriber for library consumers
///
/// `RUST_LOG` takes precedence over `default_filter`. Safe to call more than
/// once; only the first call installs anything.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}

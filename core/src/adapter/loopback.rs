/// In-process loopback radio
///
/// Every [`LoopbackAdapter`] created from the same [`LoopbackRadio`] shares one
/// simulated medium: advertisements published by one adapter are sighted by the
/// others while they scan, and central writes are routed to the advertising
/// adapter's registered characteristic. Operations complete immediately.
///
/// Failure injection and call counters make it usable as a test double for
/// both session roles.

use super::{AdapterFacade, AdapterPowerState, PowerStateHandler, ScanCallbacks, Subscription};
use crate::advertising::{AdvertisingConfig, DEFAULT_MAX_MANUFACTURER_DATA_LEN};
use crate::device::DiscoveredDevice;
use crate::error::AdapterError;
use crate::gatt::{CharacteristicDescriptor, ServiceDescriptor, WriteOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

/// Default RSSI reported for loopback sightings
pub const DEFAULT_LOOPBACK_RSSI: i16 = -55;

/// Adapter operations, for counters and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    QueryPowerState,
    AddService,
    StartAdvertising,
    StopAdvertising,
    SendWriteResponse,
    StartScan,
    StopScan,
    Connect,
    Write,
    Disconnect,
}

struct ActiveScan {
    service_ids: Option<Vec<Uuid>>,
    callbacks: ScanCallbacks,
}

struct Node {
    power_handlers: Vec<(u64, PowerStateHandler)>,
    services: Vec<ServiceDescriptor>,
    advertisement: Option<AdvertisingConfig>,
    rssi: i16,
    scan: Option<ActiveScan>,
    connections: HashSet<String>,
    failures: HashMap<Op, VecDeque<AdapterError>>,
    calls: HashMap<Op, usize>,
    write_responses: Vec<(bool, Vec<u8>)>,
}

impl Node {
    fn new() -> Self {
        Self {
            power_handlers: Vec::new(),
            services: Vec::new(),
            advertisement: None,
            rssi: DEFAULT_LOOPBACK_RSSI,
            scan: None,
            connections: HashSet::new(),
            failures: HashMap::new(),
            calls: HashMap::new(),
            write_responses: Vec::new(),
        }
    }

    fn record(&mut self, op: Op) -> Option<AdapterError> {
        *self.calls.entry(op).or_insert(0) += 1;
        self.failures.get_mut(&op).and_then(|queue| queue.pop_front())
    }

    fn sighting(&self, device_id: &str) -> Option<DiscoveredDevice> {
        let advertisement = self.advertisement.as_ref()?;
        let mut device = DiscoveredDevice::new(device_id)
            .with_name(advertisement.local_name.clone())
            .with_rssi(self.rssi)
            .with_service_ids(advertisement.service_ids.clone());
        device.manufacturer_data = advertisement.manufacturer_data.clone();
        Some(device)
    }
}

fn scan_accepts(scan: &ActiveScan, device: &DiscoveredDevice) -> bool {
    match &scan.service_ids {
        Some(ids) if !ids.is_empty() => ids.iter().any(|id| device.service_ids.contains(id)),
        _ => true,
    }
}

struct RadioState {
    power: AdapterPowerState,
    next_node: u64,
    next_handler: u64,
    max_manufacturer_data_len: usize,
    nodes: BTreeMap<String, Node>,
}

/// Shared simulated radio medium
#[derive(Clone)]
pub struct LoopbackRadio {
    state: Arc<Mutex<RadioState>>,
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRadio {
    /// Create a radio that starts powered off
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                power: AdapterPowerState::PoweredOff,
                next_node: 1,
                next_handler: 1,
                max_manufacturer_data_len: DEFAULT_MAX_MANUFACTURER_DATA_LEN,
                nodes: BTreeMap::new(),
            })),
        }
    }

    /// Override the manufacturer data limit enforced on advertise
    pub fn with_manufacturer_data_limit(self, max: usize) -> Self {
        self.state.lock().max_manufacturer_data_len = max;
        self
    }

    /// Attach a new adapter to the medium
    pub fn adapter(&self) -> LoopbackAdapter {
        let mut state = self.state.lock();
        let n = state.next_node;
        state.next_node += 1;
        let id = n
            .to_be_bytes()
            .iter()
            .skip(2)
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        state.nodes.insert(id.clone(), Node::new());
        debug!("Loopback adapter attached: {}", id);

        LoopbackAdapter {
            id,
            state: self.state.clone(),
        }
    }

    pub fn power(&self) -> AdapterPowerState {
        self.state.lock().power
    }

    /// Change the radio power state and notify every subscriber
    ///
    /// Powering off also withdraws advertisements, ends scans and drops
    /// connections, as a real stack does.
    pub fn set_power(&self, power: AdapterPowerState) {
        let handlers: Vec<PowerStateHandler> = {
            let mut state = self.state.lock();
            if state.power == power {
                return;
            }
            state.power = power;
            if !power.is_ready() {
                for node in state.nodes.values_mut() {
                    node.advertisement = None;
                    node.scan = None;
                    node.connections.clear();
                }
            }
            state
                .nodes
                .values()
                .flat_map(|node| node.power_handlers.iter().map(|(_, h)| h.clone()))
                .collect()
        };

        debug!("Loopback radio power -> {} ({} subscribers)", power, handlers.len());
        for handler in handlers {
            handler(power);
        }
    }
}

/// One adapter attached to a [`LoopbackRadio`]
#[derive(Clone)]
pub struct LoopbackAdapter {
    id: String,
    state: Arc<Mutex<RadioState>>,
}

impl LoopbackAdapter {
    /// Device id other adapters see this one under
    pub fn id(&self) -> &str {
        &self.id
    }

    fn with_node<R>(&self, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let mut state = self.state.lock();
        state.nodes.get_mut(&self.id).map(f)
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: Op, error: AdapterError) {
        self.with_node(|node| node.failures.entry(op).or_default().push_back(error));
    }

    /// Number of times `op` was invoked on this adapter
    pub fn calls(&self, op: Op) -> usize {
        self.with_node(|node| node.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Write responses sent by this adapter, oldest first
    pub fn write_responses(&self) -> Vec<(bool, Vec<u8>)> {
        self.with_node(|node| node.write_responses.clone())
            .unwrap_or_default()
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.with_node(|node| node.rssi = rssi);
    }

    pub fn is_advertising(&self) -> bool {
        self.with_node(|node| node.advertisement.is_some())
            .unwrap_or(false)
    }

    pub fn is_scanning(&self) -> bool {
        self.with_node(|node| node.scan.is_some()).unwrap_or(false)
    }

    pub fn registered_services(&self) -> Vec<Uuid> {
        self.with_node(|node| node.services.iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    /// Deliver a sighting to this adapter's active scan
    pub fn inject_device(&self, device: DiscoveredDevice) -> bool {
        let callbacks = self.with_node(|node| {
            node.scan
                .as_ref()
                .filter(|scan| scan_accepts(scan, &device))
                .map(|scan| scan.callbacks.clone())
        });
        match callbacks.flatten() {
            Some(callbacks) => {
                (callbacks.on_device)(device);
                true
            }
            None => false,
        }
    }

    /// Raise a scan fault on this adapter's active scan
    pub fn inject_scan_error(&self, error: AdapterError) -> bool {
        let callbacks = self.with_node(|node| node.scan.take().map(|scan| scan.callbacks));
        match callbacks.flatten() {
            Some(callbacks) => {
                (callbacks.on_error)(error);
                true
            }
            None => false,
        }
    }

    /// Simulate a remote central writing one of this adapter's characteristics
    pub fn simulate_write(
        &self,
        characteristic_id: Uuid,
        value: &[u8],
        offset: usize,
    ) -> Option<WriteOutcome> {
        let characteristic = self
            .with_node(|node| find_characteristic(&node.services, None, characteristic_id))
            .flatten()?;
        Some(characteristic.dispatch_write(value, offset))
    }

    fn remove_power_handler(state: &Weak<Mutex<RadioState>>, id: &str, handler_id: u64) {
        if let Some(state) = state.upgrade() {
            if let Some(node) = state.lock().nodes.get_mut(id) {
                node.power_handlers.retain(|(h, _)| *h != handler_id);
            }
        }
    }
}

fn find_characteristic(
    services: &[ServiceDescriptor],
    service_id: Option<Uuid>,
    characteristic_id: Uuid,
) -> Option<CharacteristicDescriptor> {
    services
        .iter()
        .filter(|s| service_id.map_or(true, |id| s.id == id))
        .find_map(|s| s.characteristic(&characteristic_id).cloned())
}

#[async_trait]
impl AdapterFacade for LoopbackAdapter {
    fn subscribe_power_state(&self, handler: PowerStateHandler) -> Subscription {
        let handler_id = {
            let mut state = self.state.lock();
            let handler_id = state.next_handler;
            state.next_handler += 1;
            if let Some(node) = state.nodes.get_mut(&self.id) {
                node.power_handlers.push((handler_id, handler));
            }
            handler_id
        };

        let weak = Arc::downgrade(&self.state);
        let id = self.id.clone();
        Subscription::new(move || Self::remove_power_handler(&weak, &id, handler_id))
    }

    async fn query_power_state(&self) -> AdapterPowerState {
        self.with_node(|node| node.record(Op::QueryPowerState));
        self.state.lock().power
    }

    async fn add_service(&self, service: &ServiceDescriptor) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let power = state.power;
        let node = state
            .nodes
            .get_mut(&self.id)
            .ok_or(AdapterError::Unavailable)?;

        if let Some(error) = node.record(Op::AddService) {
            return Err(error);
        }
        if !power.is_ready() {
            return Err(AdapterError::Unavailable);
        }
        if node.services.iter().any(|s| s.id == service.id) {
            // Re-registration replaces the previous descriptor
            node.services.retain(|s| s.id != service.id);
        }
        node.services.push(service.clone());
        Ok(())
    }

    async fn start_advertising(&self, config: &AdvertisingConfig) -> Result<(), AdapterError> {
        let deliveries: Vec<(ScanCallbacks, DiscoveredDevice)> = {
            let mut state = self.state.lock();
            let power = state.power;
            let limit = state.max_manufacturer_data_len;
            let node = state
                .nodes
                .get_mut(&self.id)
                .ok_or(AdapterError::Unavailable)?;

            if let Some(error) = node.record(Op::StartAdvertising) {
                return Err(error);
            }
            if !power.is_ready() {
                return Err(AdapterError::Unavailable);
            }
            if let Err(e) = config.validate_with_limit(limit) {
                return Err(AdapterError::Rejected(e.to_string()));
            }
            node.advertisement = Some(config.clone());

            let sighting = node.sighting(&self.id);
            match sighting {
                Some(device) => state
                    .nodes
                    .iter()
                    .filter(|(id, _)| **id != self.id)
                    .filter_map(|(_, other)| other.scan.as_ref())
                    .filter(|scan| scan_accepts(scan, &device))
                    .map(|scan| (scan.callbacks.clone(), device.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        for (callbacks, device) in deliveries {
            (callbacks.on_device)(device);
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(&self.id)
            .ok_or(AdapterError::Unavailable)?;

        if let Some(error) = node.record(Op::StopAdvertising) {
            return Err(error);
        }
        node.advertisement = None;
        Ok(())
    }

    fn send_write_response(&self, accepted: bool, echo: &[u8]) {
        self.with_node(|node| {
            node.record(Op::SendWriteResponse);
            node.write_responses.push((accepted, echo.to_vec()));
        });
    }

    fn start_scan(&self, service_ids: Option<Vec<Uuid>>, callbacks: ScanCallbacks) {
        let scan = ActiveScan {
            service_ids,
            callbacks: callbacks.clone(),
        };

        let outcome: Result<Vec<DiscoveredDevice>, AdapterError> = {
            let mut state = self.state.lock();
            let power = state.power;
            let sightings: Vec<DiscoveredDevice> = state
                .nodes
                .iter()
                .filter(|(id, _)| **id != self.id)
                .filter_map(|(id, other)| other.sighting(id))
                .filter(|device| scan_accepts(&scan, device))
                .collect();

            match state.nodes.get_mut(&self.id) {
                Some(node) => match node.record(Op::StartScan) {
                    Some(error) => Err(error),
                    None if !power.is_ready() => Err(AdapterError::Unavailable),
                    None => {
                        node.scan = Some(scan);
                        Ok(sightings)
                    }
                },
                None => Err(AdapterError::Unavailable),
            }
        };

        match outcome {
            Ok(sightings) => {
                for device in sightings {
                    (callbacks.on_device)(device);
                }
            }
            Err(error) => (callbacks.on_error)(error),
        }
    }

    fn stop_scan(&self) {
        self.with_node(|node| {
            node.record(Op::StopScan);
            node.scan = None;
        });
    }

    async fn connect(&self, device_id: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let power = state.power;
        let target_advertising = state
            .nodes
            .get(device_id)
            .is_some_and(|target| target.advertisement.is_some());
        let node = state
            .nodes
            .get_mut(&self.id)
            .ok_or(AdapterError::Unavailable)?;

        if let Some(error) = node.record(Op::Connect) {
            return Err(error);
        }
        if !power.is_ready() {
            return Err(AdapterError::Unavailable);
        }
        if !target_advertising {
            return Err(AdapterError::Rejected(format!(
                "{} is not connectable",
                device_id
            )));
        }
        node.connections.insert(device_id.to_string());
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: &[u8],
    ) -> Result<WriteOutcome, AdapterError> {
        let characteristic = {
            let mut state = self.state.lock();
            let node = state
                .nodes
                .get_mut(&self.id)
                .ok_or(AdapterError::Unavailable)?;

            if let Some(error) = node.record(Op::Write) {
                return Err(error);
            }
            if !node.connections.contains(device_id) {
                return Err(AdapterError::NotConnected);
            }

            state
                .nodes
                .get(device_id)
                .and_then(|target| {
                    find_characteristic(&target.services, Some(service_id), characteristic_id)
                })
                .ok_or_else(|| {
                    AdapterError::Rejected(format!(
                        "characteristic {} not found on {}",
                        characteristic_id, device_id
                    ))
                })?
        };

        Ok(characteristic.dispatch_write(value, 0))
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), AdapterError> {
        self.with_node(|node| {
            node.record(Op::Disconnect);
            node.connections.remove(device_id);
        })
        .ok_or(AdapterError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{
        CharacteristicPermissions, CharacteristicProperties, DEFAULT_CHARACTERISTIC_ID,
        DEFAULT_SERVICE_ID,
    };
    use parking_lot::RwLock;

    fn recording_callbacks() -> (ScanCallbacks, Arc<RwLock<Vec<DiscoveredDevice>>>, Arc<RwLock<Vec<AdapterError>>>) {
        let devices = Arc::new(RwLock::new(Vec::new()));
        let errors = Arc::new(RwLock::new(Vec::new()));
        let d = devices.clone();
        let e = errors.clone();
        let callbacks = ScanCallbacks {
            on_device: Arc::new(move |device| d.write().push(device)),
            on_error: Arc::new(move |error| e.write().push(error)),
        };
        (callbacks, devices, errors)
    }

    fn echo_service() -> ServiceDescriptor {
        ServiceDescriptor::new(
            DEFAULT_SERVICE_ID,
            vec![CharacteristicDescriptor::new(
                DEFAULT_CHARACTERISTIC_ID,
                CharacteristicProperties::read_write_notify(),
                CharacteristicPermissions::read_write(),
                Arc::new(|value, _| WriteOutcome::accept(value.to_vec())),
            )],
        )
    }

    fn ticket_config() -> AdvertisingConfig {
        AdvertisingConfig::new("Ticket", vec![DEFAULT_SERVICE_ID]).expect("valid config")
    }

    #[test]
    fn test_adapter_ids_are_unique() {
        let radio = LoopbackRadio::new();
        let a = radio.adapter();
        let b = radio.adapter();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), "00:00:00:00:00:01");
    }

    #[test]
    fn test_adapter_ids_do_not_wrap_past_16_bits() {
        let radio = LoopbackRadio::new();
        let first = radio.adapter();
        radio.state.lock().next_node = 0x1_0001;
        let late = radio.adapter();

        assert_eq!(late.id(), "00:00:00:01:00:01");
        assert_ne!(first.id(), late.id());
        assert_eq!(radio.state.lock().nodes.len(), 2);
    }

    #[test]
    fn test_power_subscribers_notified_until_dropped() {
        let radio = LoopbackRadio::new();
        let adapter = radio.adapter();
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = seen.clone();

        let subscription =
            adapter.subscribe_power_state(Arc::new(move |power| sink.write().push(power)));
        radio.set_power(AdapterPowerState::PoweredOn);
        radio.set_power(AdapterPowerState::PoweredOn);
        drop(subscription);
        radio.set_power(AdapterPowerState::PoweredOff);

        assert_eq!(*seen.read(), vec![AdapterPowerState::PoweredOn]);
    }

    #[tokio::test]
    async fn test_operations_rejected_while_powered_off() {
        let radio = LoopbackRadio::new();
        let adapter = radio.adapter();

        assert_eq!(
            adapter.add_service(&echo_service()).await,
            Err(AdapterError::Unavailable)
        );
        assert_eq!(
            adapter.start_advertising(&ticket_config()).await,
            Err(AdapterError::Unavailable)
        );

        let (callbacks, _, errors) = recording_callbacks();
        adapter.start_scan(None, callbacks);
        assert_eq!(*errors.read(), vec![AdapterError::Unavailable]);
        assert!(!adapter.is_scanning());
    }

    #[tokio::test]
    async fn test_scanner_sees_existing_and_new_advertisements() {
        let radio = LoopbackRadio::new();
        radio.set_power(AdapterPowerState::PoweredOn);
        let first = radio.adapter();
        let central = radio.adapter();
        let second = radio.adapter();

        first.start_advertising(&ticket_config()).await.expect("advertise");

        let (callbacks, devices, _) = recording_callbacks();
        central.start_scan(None, callbacks);
        assert_eq!(devices.read().len(), 1);
        assert_eq!(devices.read()[0].device_id, first.id());
        assert_eq!(devices.read()[0].name.as_deref(), Some("Ticket"));

        let other = AdvertisingConfig::new("Other", vec![DEFAULT_SERVICE_ID]).expect("valid");
        second.start_advertising(&other).await.expect("advertise");
        assert_eq!(devices.read().len(), 2);
        assert_eq!(devices.read()[1].name.as_deref(), Some("Other"));
    }

    #[tokio::test]
    async fn test_scan_service_filter() {
        let radio = LoopbackRadio::new();
        radio.set_power(AdapterPowerState::PoweredOn);
        let peripheral = radio.adapter();
        let central = radio.adapter();
        peripheral.start_advertising(&ticket_config()).await.expect("advertise");

        let (callbacks, devices, _) = recording_callbacks();
        central.start_scan(Some(vec![crate::gatt::uuid_from_u16(0xFEED)]), callbacks);
        assert!(devices.read().is_empty());
    }

    #[tokio::test]
    async fn test_manufacturer_data_limit_enforced() {
        let radio = LoopbackRadio::new().with_manufacturer_data_limit(4);
        radio.set_power(AdapterPowerState::PoweredOn);
        let adapter = radio.adapter();

        let config = ticket_config().with_manufacturer_data(vec![0; 5]);
        assert!(matches!(
            adapter.start_advertising(&config).await,
            Err(AdapterError::Rejected(_))
        ));
        assert!(!adapter.is_advertising());
    }

    #[tokio::test]
    async fn test_connect_and_write_routes_to_characteristic() {
        let radio = LoopbackRadio::new();
        radio.set_power(AdapterPowerState::PoweredOn);
        let peripheral = radio.adapter();
        let central = radio.adapter();

        peripheral.add_service(&echo_service()).await.expect("service");
        peripheral.start_advertising(&ticket_config()).await.expect("advertise");

        assert_eq!(
            central
                .write_characteristic(peripheral.id(), DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID, b"x")
                .await,
            Err(AdapterError::NotConnected)
        );

        central.connect(peripheral.id()).await.expect("connect");
        let outcome = central
            .write_characteristic(peripheral.id(), DEFAULT_SERVICE_ID, DEFAULT_CHARACTERISTIC_ID, b"HELLO")
            .await
            .expect("write");
        assert_eq!(outcome, WriteOutcome::accept(b"HELLO".to_vec()));
    }

    #[tokio::test]
    async fn test_connect_requires_advertising_target() {
        let radio = LoopbackRadio::new();
        radio.set_power(AdapterPowerState::PoweredOn);
        let central = radio.adapter();

        assert!(matches!(
            central.connect("00:00:00:00:00:99").await,
            Err(AdapterError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_next_and_counters() {
        let radio = LoopbackRadio::new();
        radio.set_power(AdapterPowerState::PoweredOn);
        let adapter = radio.adapter();

        adapter.fail_next(Op::AddService, AdapterError::Rejected("duplicate".to_string()));
        assert!(adapter.add_service(&echo_service()).await.is_err());
        assert!(adapter.add_service(&echo_service()).await.is_ok());
        assert_eq!(adapter.calls(Op::AddService), 2);
        assert_eq!(adapter.registered_services(), vec![DEFAULT_SERVICE_ID]);
    }

    #[tokio::test]
    async fn test_power_off_withdraws_advertisement() {
        let radio = LoopbackRadio::new();
        radio.set_power(AdapterPowerState::PoweredOn);
        let adapter = radio.adapter();
        adapter.start_advertising(&ticket_config()).await.expect("advertise");

        radio.set_power(AdapterPowerState::PoweredOff);
        assert!(!adapter.is_advertising());
    }

    #[test]
    fn test_inject_requires_active_scan() {
        let radio = LoopbackRadio::new();
        let adapter = radio.adapter();
        assert!(!adapter.inject_device(DiscoveredDevice::new("x")));
        assert!(!adapter.inject_scan_error(AdapterError::Timeout));
    }
}

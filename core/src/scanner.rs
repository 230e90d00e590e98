//! Central role: discover handshake peripherals and deliver a payload
//!
//! ```text
//! Idle -> Scanning -> Stopped | Failed
//! ```
//!
//! A scan is bounded by a timer that stops it automatically. Every scan run
//! gets a generation number; adapter callbacks and timers carry the
//! generation they were created for and are ignored once it is stale.

use crate::adapter::{AdapterFacade, ScanCallbacks};
use crate::device::{DeviceFilter, DiscoveredDevice};
use crate::error::{AdapterError, ErrorInfo, ErrorKind};
use crate::settings::HandshakeSettings;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Scanning,
    Stopped,
    Failed,
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerState::Idle => write!(f, "Idle"),
            ScannerState::Scanning => write!(f, "Scanning"),
            ScannerState::Stopped => write!(f, "Stopped"),
            ScannerState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time view of a scanner session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerSnapshot {
    pub state: ScannerState,
    /// Deduplicated, in first-sighting order
    pub devices: Vec<DiscoveredDevice>,
    pub last_error: Option<ErrorInfo>,
    pub scan_deadline: Option<Instant>,
}

/// Result of a payload delivery to a discovered peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The peripheral accepted the write and echoed `echo`
    Accepted { echo: Vec<u8> },
    /// The peripheral answered but refused the payload
    Rejected,
    /// The exchange did not complete
    Failed(ErrorKind),
}

impl Delivery {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Delivery::Accepted { .. })
    }
}

struct Inner {
    state: ScannerState,
    filter: Option<DeviceFilter>,
    devices: Vec<DiscoveredDevice>,
    positions: HashMap<String, usize>,
    last_error: Option<ErrorInfo>,
    scan_deadline: Option<Instant>,
    generation: u64,
    stop_timer: Option<JoinHandle<()>>,
}

impl Inner {
    fn snapshot(&self) -> ScannerSnapshot {
        ScannerSnapshot {
            state: self.state,
            devices: self.devices.clone(),
            last_error: self.last_error.clone(),
            scan_deadline: self.scan_deadline,
        }
    }

    fn clear_devices(&mut self) {
        self.devices.clear();
        self.positions.clear();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.stop_timer.take() {
            timer.abort();
        }
        self.scan_deadline = None;
    }

    /// Insert or merge a sighting; returns false when filtered out
    fn upsert(&mut self, device: DiscoveredDevice) -> bool {
        if let Some(filter) = &self.filter {
            if !filter.matches(&device) {
                return false;
            }
        }

        match self.positions.get(&device.device_id).copied() {
            Some(index) => self.devices[index].merge(device),
            None => {
                debug!(
                    "Discovered {} ({})",
                    device.device_id,
                    device.display_name()
                );
                self.positions
                    .insert(device.device_id.clone(), self.devices.len());
                self.devices.push(device);
            }
        }
        true
    }
}

struct Shared {
    adapter: Arc<dyn AdapterFacade>,
    settings: HandshakeSettings,
    inner: Mutex<Inner>,
    changes: watch::Sender<ScannerSnapshot>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.cancel_timer();
        if inner.state == ScannerState::Scanning {
            self.adapter.stop_scan();
        }
    }
}

/// Scanning half of the BLE handshake
///
/// Cloning yields another handle to the same session. Bounded scans are only
/// stopped on time when started inside a tokio runtime; elsewhere the scan
/// runs until [`ScannerSession::stop`].
#[derive(Clone)]
pub struct ScannerSession {
    shared: Arc<Shared>,
}

impl ScannerSession {
    pub fn new(adapter: Arc<dyn AdapterFacade>, settings: HandshakeSettings) -> Self {
        let inner = Inner {
            state: ScannerState::Idle,
            filter: None,
            devices: Vec::new(),
            positions: HashMap::new(),
            last_error: None,
            scan_deadline: None,
            generation: 0,
            stop_timer: None,
        };
        let (changes, _) = watch::channel(inner.snapshot());

        Self {
            shared: Arc::new(Shared {
                adapter,
                settings,
                inner: Mutex::new(inner),
                changes,
            }),
        }
    }

    pub fn state(&self) -> ScannerState {
        self.shared.inner.lock().state
    }

    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.shared.inner.lock().last_error.clone()
    }

    /// Discovered devices in first-sighting order
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.shared.inner.lock().devices.clone()
    }

    pub fn find(&self, device_id: &str) -> Option<DiscoveredDevice> {
        let inner = self.shared.inner.lock();
        inner
            .positions
            .get(device_id)
            .map(|&index| inner.devices[index].clone())
    }

    pub fn filter(&self) -> Option<DeviceFilter> {
        self.shared.inner.lock().filter.clone()
    }

    /// When the running scan stops on its own, if it is bounded
    pub fn scan_deadline(&self) -> Option<Instant> {
        self.shared.inner.lock().scan_deadline
    }

    pub fn snapshot(&self) -> ScannerSnapshot {
        self.shared.inner.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScannerSnapshot> {
        self.shared.changes.subscribe()
    }

    fn publish(&self, inner: &Inner) {
        self.shared.changes.send_replace(inner.snapshot());
    }

    /// Start a scan
    ///
    /// Clears previously discovered devices. `duration` of `None` falls back to
    /// the configured default. A no-op while already scanning. Fails with
    /// `AdapterNotReady` without touching the radio when it is not powered on.
    pub async fn start(&self, filter: Option<DeviceFilter>, duration: Option<Duration>) {
        if self.state() == ScannerState::Scanning {
            debug!("Start ignored: already scanning");
            return;
        }

        let power = self.shared.adapter.query_power_state().await;

        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ScannerState::Scanning {
                debug!("Start ignored: already scanning");
                return;
            }
            inner.cancel_timer();
            inner.clear_devices();
            inner.generation += 1;

            if !power.is_ready() {
                warn!("Scanner cannot start: adapter is {}", power);
                inner.state = ScannerState::Failed;
                inner.last_error = Some(ErrorInfo::new(
                    ErrorKind::AdapterNotReady,
                    format!("adapter is {}", power),
                ));
                self.publish(&inner);
                return;
            }

            inner.state = ScannerState::Scanning;
            inner.last_error = None;
            inner.filter = filter;

            let duration = duration.or_else(|| self.shared.settings.default_scan_duration());
            if let Some(duration) = duration {
                inner.stop_timer = self.arm_timer(inner.generation, duration);
                if inner.stop_timer.is_some() {
                    inner.scan_deadline = Some(Instant::now() + duration);
                }
            }
            info!(
                "Scanner started (filter: {}, duration: {:?})",
                inner
                    .filter
                    .as_ref()
                    .map(|f| f.label().to_string())
                    .unwrap_or_else(|| "none".to_string()),
                duration
            );
            self.publish(&inner);
            inner.generation
        };

        let callbacks = self.callbacks(generation);
        self.shared
            .adapter
            .start_scan(self.shared.settings.scan_filter_ids(), callbacks);
    }

    fn arm_timer(&self, generation: u64, duration: Duration) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; scan window of {:?} not enforced", duration);
            return None;
        };
        let weak = Arc::downgrade(&self.shared);
        Some(handle.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(shared) = weak.upgrade() {
                ScannerSession { shared }.auto_stop(generation);
            }
        }))
    }

    fn callbacks(&self, generation: u64) -> ScanCallbacks {
        let on_device_session: Weak<Shared> = Arc::downgrade(&self.shared);
        let on_error_session: Weak<Shared> = Arc::downgrade(&self.shared);

        ScanCallbacks {
            on_device: Arc::new(move |device| {
                if let Some(shared) = on_device_session.upgrade() {
                    ScannerSession { shared }.handle_sighting(Some(generation), device);
                }
            }),
            on_error: Arc::new(move |error| {
                if let Some(shared) = on_error_session.upgrade() {
                    ScannerSession { shared }.handle_scan_error(Some(generation), error);
                }
            }),
        }
    }

    /// Sighting reported by the adapter
    ///
    /// Ignored unless scanning. Sightings rejected by the filter are dropped;
    /// a repeated device id updates the existing entry in place.
    pub fn on_device_discovered(&self, device: DiscoveredDevice) {
        self.handle_sighting(None, device);
    }

    fn handle_sighting(&self, generation: Option<u64>, device: DiscoveredDevice) {
        let mut inner = self.shared.inner.lock();
        if inner.state != ScannerState::Scanning {
            debug!("Late sighting of {} ignored", device.device_id);
            return;
        }
        if generation.is_some_and(|g| g != inner.generation) {
            debug!("Stale sighting of {} ignored", device.device_id);
            return;
        }
        if inner.upsert(device) {
            self.publish(&inner);
        }
    }

    /// Scan fault reported by the adapter
    pub fn on_scan_error(&self, error: AdapterError) {
        self.handle_scan_error(None, error);
    }

    fn handle_scan_error(&self, generation: Option<u64>, error: AdapterError) {
        let mut inner = self.shared.inner.lock();
        if inner.state != ScannerState::Scanning
            || generation.is_some_and(|g| g != inner.generation)
        {
            debug!("Stale scan error ignored: {}", error);
            return;
        }
        warn!("Scan failed: {}", error);
        inner.cancel_timer();
        inner.generation += 1;
        inner.state = ScannerState::Failed;
        inner.last_error = Some(ErrorInfo::new(ErrorKind::ScanFailed, error));
        self.publish(&inner);
    }

    /// Stop the running scan; a no-op otherwise
    pub fn stop(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ScannerState::Scanning {
                debug!("Stop ignored: scanner {}", inner.state);
                return;
            }
            inner.cancel_timer();
            self.finish_scan(&mut inner);
        }
        self.shared.adapter.stop_scan();
    }

    fn auto_stop(&self, generation: u64) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation || inner.state != ScannerState::Scanning {
                return;
            }
            // This is the timer task itself; let it finish
            inner.stop_timer = None;
            inner.scan_deadline = None;
            info!("Scan window elapsed");
            self.finish_scan(&mut inner);
        }
        self.shared.adapter.stop_scan();
    }

    fn finish_scan(&self, inner: &mut Inner) {
        inner.generation += 1;
        inner.state = ScannerState::Stopped;
        info!("Scanner stopped with {} device(s)", inner.devices.len());
        self.publish(inner);
    }

    /// Return from Stopped or Failed to Idle, clearing results
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        if !matches!(inner.state, ScannerState::Stopped | ScannerState::Failed) {
            return;
        }
        inner.state = ScannerState::Idle;
        inner.filter = None;
        inner.last_error = None;
        inner.clear_devices();
        self.publish(&inner);
    }

    /// Resume a scan the platform kept running across a process restart
    ///
    /// From Idle the session enters Scanning without asking the adapter to
    /// start; the platform delivers further sightings through
    /// [`ScannerSession::on_device_discovered`]. An existing filter wins over
    /// `previous_filter`. Ignored once Stopped or Failed.
    pub fn on_restored_state(
        &self,
        previous_filter: Option<DeviceFilter>,
        previous_devices: Vec<DiscoveredDevice>,
    ) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            ScannerState::Stopped | ScannerState::Failed => {
                debug!("Restored scan state ignored: scanner {}", inner.state);
                return;
            }
            ScannerState::Idle => {
                inner.state = ScannerState::Scanning;
                inner.generation += 1;
                if let Some(duration) = self.shared.settings.default_scan_duration() {
                    inner.stop_timer = self.arm_timer(inner.generation, duration);
                    if inner.stop_timer.is_some() {
                        inner.scan_deadline = Some(Instant::now() + duration);
                    }
                }
                info!("Scanner resumed from restored state");
            }
            ScannerState::Scanning => {}
        }

        if inner.filter.is_none() {
            inner.filter = previous_filter;
        }
        for device in previous_devices {
            inner.upsert(device);
        }
        self.publish(&inner);
    }

    /// Connect to a discovered device, write `payload` and hand back the echo
    ///
    /// Failures are recorded as `last_error` without changing the scan state.
    /// The connection is released afterwards whatever the outcome.
    pub async fn deliver(
        &self,
        device_id: &str,
        service_id: Uuid,
        characteristic_id: Uuid,
        payload: &[u8],
    ) -> Delivery {
        if self.find(device_id).is_none() {
            self.record_error(ErrorKind::ConnectFailed, format!("unknown device {}", device_id));
            return Delivery::Failed(ErrorKind::ConnectFailed);
        }

        if let Err(e) = self.shared.adapter.connect(device_id).await {
            self.record_error(ErrorKind::ConnectFailed, e);
            return Delivery::Failed(ErrorKind::ConnectFailed);
        }

        info!(
            "Writing {} byte(s) to {}: {}",
            payload.len(),
            device_id,
            hex::encode(payload)
        );
        let delivery = match self
            .shared
            .adapter
            .write_characteristic(device_id, service_id, characteristic_id, payload)
            .await
        {
            Ok(outcome) if outcome.accepted => {
                info!("{} echoed {}", device_id, hex::encode(&outcome.response));
                Delivery::Accepted {
                    echo: outcome.response,
                }
            }
            Ok(_) => {
                info!("{} rejected the payload", device_id);
                Delivery::Rejected
            }
            Err(e) => {
                self.record_error(ErrorKind::WriteFailed, e);
                Delivery::Failed(ErrorKind::WriteFailed)
            }
        };

        if let Err(e) = self.shared.adapter.disconnect(device_id).await {
            debug!("Disconnect from {} not acknowledged: {}", device_id, e);
        }
        delivery
    }

    fn record_error(&self, kind: ErrorKind, message: impl fmt::Display) {
        let mut inner = self.shared.inner.lock();
        let error = ErrorInfo::new(kind, message);
        warn!("Delivery failed: {}", error);
        inner.last_error = Some(error);
        self.publish(&inner);
    }
}

/// Peripheral role: advertise one service with a single writable characteristic
///
/// State progression:
///
/// ```text
/// Idle -> ConfiguringService -> ServiceAdded -> Advertising -> Stopped | Failed
/// ```
///
/// Stopped and Failed return to Idle through `reset()`, or directly into a new
/// activation through `activate()`. Adapter failures never escape the session;
/// they are recorded as `last_error` and published with every state change.

use crate::adapter::{AdapterFacade, AdapterPowerState, PowerStateHandler, Subscription};
use crate::advertising::AdvertisingConfig;
use crate::error::{ErrorInfo, ErrorKind};
use crate::gatt::{
    CharacteristicDescriptor, CharacteristicPermissions, CharacteristicProperties, EchoHandler,
    PayloadHandler, ServiceDescriptor, WriteCallback, WriteOutcome, DEFAULT_CHARACTERISTIC_ID,
};
use crate::settings::HandshakeSettings;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Idle,
    ConfiguringService,
    ServiceAdded,
    Advertising,
    Stopped,
    Failed,
}

impl PeripheralState {
    /// States in which a further `activate` is a no-op
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PeripheralState::ConfiguringService
                | PeripheralState::ServiceAdded
                | PeripheralState::Advertising
        )
    }

    /// States in which inbound writes are handled
    pub fn accepts_writes(&self) -> bool {
        matches!(self, PeripheralState::ServiceAdded | PeripheralState::Advertising)
    }
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralState::Idle => write!(f, "Idle"),
            PeripheralState::ConfiguringService => write!(f, "ConfiguringService"),
            PeripheralState::ServiceAdded => write!(f, "ServiceAdded"),
            PeripheralState::Advertising => write!(f, "Advertising"),
            PeripheralState::Stopped => write!(f, "Stopped"),
            PeripheralState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time view of a peripheral session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralSnapshot {
    pub state: PeripheralState,
    pub last_error: Option<ErrorInfo>,
    pub last_received_payload: Option<Vec<u8>>,
    pub power: AdapterPowerState,
    pub writes_received: u64,
}

struct Inner {
    state: PeripheralState,
    config: AdvertisingConfig,
    characteristic_id: Uuid,
    service: Option<ServiceDescriptor>,
    last_error: Option<ErrorInfo>,
    last_received_payload: Option<Vec<u8>>,
    power: AdapterPowerState,
    writes_received: u64,
    // Bumped whenever an in-flight activation must be abandoned
    epoch: u64,
}

impl Inner {
    fn snapshot(&self) -> PeripheralSnapshot {
        PeripheralSnapshot {
            state: self.state,
            last_error: self.last_error.clone(),
            last_received_payload: self.last_received_payload.clone(),
            power: self.power,
            writes_received: self.writes_received,
        }
    }

    fn fail(&mut self, kind: ErrorKind, message: impl fmt::Display) {
        let error = ErrorInfo::new(kind, message);
        warn!("Peripheral {} -> Failed: {}", self.state, error);
        self.state = PeripheralState::Failed;
        self.last_error = Some(error);
        self.epoch += 1;
    }
}

struct Shared {
    adapter: Arc<dyn AdapterFacade>,
    settings: HandshakeSettings,
    handler: RwLock<Arc<dyn PayloadHandler>>,
    inner: Mutex<Inner>,
    changes: watch::Sender<PeripheralSnapshot>,
    subscription: Mutex<Option<Subscription>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.inner.get_mut().state;
        if !matches!(state, PeripheralState::ServiceAdded | PeripheralState::Advertising) {
            return;
        }
        // Teardown: best-effort stop on whatever runtime is still around
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let adapter = self.adapter.clone();
            handle.spawn(async move {
                if let Err(e) = adapter.stop_advertising().await {
                    warn!("Stop advertising on teardown failed: {}", e);
                }
            });
        }
    }
}

/// Everything the async half of an activation needs
struct ActivationPlan {
    epoch: u64,
    service: ServiceDescriptor,
    config: AdvertisingConfig,
}

/// Advertising half of the BLE handshake
///
/// Cloning yields another handle to the same session. Construction subscribes
/// to adapter power changes exactly once; the subscription ends when the last
/// handle is dropped. Must be created inside a tokio runtime for power-driven
/// restarts to be scheduled.
#[derive(Clone)]
pub struct PeripheralSession {
    shared: Arc<Shared>,
}

impl PeripheralSession {
    pub fn new(
        adapter: Arc<dyn AdapterFacade>,
        config: AdvertisingConfig,
        settings: HandshakeSettings,
    ) -> Self {
        let inner = Inner {
            state: PeripheralState::Idle,
            config,
            characteristic_id: DEFAULT_CHARACTERISTIC_ID,
            service: None,
            last_error: None,
            last_received_payload: None,
            power: AdapterPowerState::Unknown,
            writes_received: 0,
            epoch: 0,
        };
        let (changes, _) = watch::channel(inner.snapshot());
        let handler: Arc<dyn PayloadHandler> = Arc::new(EchoHandler::new(settings.max_write_len));

        let shared = Arc::new(Shared {
            adapter,
            settings,
            handler: RwLock::new(handler),
            inner: Mutex::new(inner),
            changes,
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let on_power: PowerStateHandler = Arc::new(move |power| {
            if let Some(shared) = weak.upgrade() {
                PeripheralSession { shared }.on_power_state_changed(power);
            }
        });
        let subscription = shared.adapter.subscribe_power_state(on_power);
        *shared.subscription.lock() = Some(subscription);

        Self { shared }
    }

    /// Replace the payload handler (default: [`EchoHandler`])
    pub fn with_handler(self, handler: Arc<dyn PayloadHandler>) -> Self {
        *self.shared.handler.write() = handler;
        self
    }

    /// Use a different characteristic id for the next activation
    pub fn with_characteristic_id(self, id: Uuid) -> Self {
        self.shared.inner.lock().characteristic_id = id;
        self
    }

    pub fn state(&self) -> PeripheralState {
        self.shared.inner.lock().state
    }

    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.shared.inner.lock().last_error.clone()
    }

    pub fn last_received_payload(&self) -> Option<Vec<u8>> {
        self.shared.inner.lock().last_received_payload.clone()
    }

    pub fn config(&self) -> AdvertisingConfig {
        self.shared.inner.lock().config.clone()
    }

    /// Service handed to the adapter by the current activation
    pub fn service(&self) -> Option<ServiceDescriptor> {
        self.shared.inner.lock().service.clone()
    }

    pub fn writes_received(&self) -> u64 {
        self.shared.inner.lock().writes_received
    }

    pub fn snapshot(&self) -> PeripheralSnapshot {
        self.shared.inner.lock().snapshot()
    }

    /// Change notifications; the receiver always holds the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<PeripheralSnapshot> {
        self.shared.changes.subscribe()
    }

    fn publish(&self, inner: &Inner) {
        self.shared.changes.send_replace(inner.snapshot());
    }

    /// Register the service and start advertising `config`
    ///
    /// No-op while configuring, registered or advertising. From Idle, Stopped
    /// or Failed a fresh activation begins. If the radio is not powered on the
    /// session stays Idle and starts on the next power-on.
    pub async fn activate(&self, config: AdvertisingConfig) {
        if self.state().is_active() {
            debug!("Activate ignored: peripheral already {}", self.state());
            return;
        }

        let power = self.shared.adapter.query_power_state().await;
        if let Some(plan) = self.begin_activation(Some(config), power) {
            self.run_activation(plan).await;
        }
    }

    fn begin_activation(
        &self,
        config: Option<AdvertisingConfig>,
        power: AdapterPowerState,
    ) -> Option<ActivationPlan> {
        let mut inner = self.shared.inner.lock();
        inner.power = power;

        if inner.state.is_active() {
            debug!("Activate ignored: peripheral already {}", inner.state);
            return None;
        }
        if let Some(config) = config {
            inner.config = config;
        }

        if let Err(e) = inner
            .config
            .validate_with_limit(self.shared.settings.max_manufacturer_data_len)
        {
            inner.fail(ErrorKind::InvalidConfig, e);
            self.publish(&inner);
            return None;
        }

        if !power.is_ready() {
            info!("Peripheral waiting for radio (power {})", power);
            inner.state = PeripheralState::Idle;
            inner.last_error = Some(ErrorInfo::new(
                ErrorKind::AdapterNotReady,
                format!("adapter is {}", power),
            ));
            self.publish(&inner);
            return None;
        }

        inner.epoch += 1;
        inner.state = PeripheralState::ConfiguringService;
        inner.last_error = None;

        let service = self.build_service(inner.config.primary_service_id(), inner.characteristic_id);
        inner.service = Some(service.clone());
        info!(
            "Peripheral configuring service {} for {:?}",
            service.id, inner.config.local_name
        );
        self.publish(&inner);

        Some(ActivationPlan {
            epoch: inner.epoch,
            service,
            config: inner.config.clone(),
        })
    }

    async fn run_activation(&self, plan: ActivationPlan) {
        let added = self.shared.adapter.add_service(&plan.service).await;
        {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != plan.epoch || inner.state != PeripheralState::ConfiguringService {
                debug!("Service registration outcome ignored: activation superseded");
                return;
            }
            match added {
                Ok(()) => {
                    info!("Peripheral service {} added", plan.service.id);
                    inner.state = PeripheralState::ServiceAdded;
                }
                Err(e) => inner.fail(ErrorKind::ServiceRegistrationFailed, e),
            }
            self.publish(&inner);
            if inner.state != PeripheralState::ServiceAdded {
                return;
            }
        }

        // Some stacks reject an advertise issued right after service registration
        tokio::time::sleep(self.shared.settings.settle_delay()).await;

        if !self.still_current(plan.epoch, PeripheralState::ServiceAdded) {
            debug!("Advertise skipped: activation superseded during settle delay");
            return;
        }

        let advertised = self.shared.adapter.start_advertising(&plan.config).await;
        let orphaned = {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != plan.epoch || inner.state != PeripheralState::ServiceAdded {
                advertised.is_ok()
            } else {
                match advertised {
                    Ok(()) => {
                        info!("Peripheral advertising as {:?}", plan.config.local_name);
                        inner.state = PeripheralState::Advertising;
                    }
                    Err(e) => inner.fail(ErrorKind::AdvertisingFailed, e),
                }
                self.publish(&inner);
                false
            }
        };

        // The session moved on while the advertise was in flight
        if orphaned {
            debug!("Withdrawing advertisement started by a superseded activation");
            if let Err(e) = self.shared.adapter.stop_advertising().await {
                warn!("Withdrawing superseded advertisement failed: {}", e);
            }
        }
    }

    fn still_current(&self, epoch: u64, state: PeripheralState) -> bool {
        let inner = self.shared.inner.lock();
        inner.epoch == epoch && inner.state == state
    }

    fn build_service(&self, service_id: Uuid, characteristic_id: Uuid) -> ServiceDescriptor {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let on_write: WriteCallback = Arc::new(move |value, offset| match weak.upgrade() {
            Some(shared) => PeripheralSession { shared }.on_write_request(value, offset),
            None => WriteOutcome::reject(),
        });

        ServiceDescriptor::new(
            service_id,
            vec![CharacteristicDescriptor::new(
                characteristic_id,
                CharacteristicProperties::read_write_notify(),
                CharacteristicPermissions::read_write(),
                on_write,
            )],
        )
    }

    /// Radio power change, delivered by the adapter subscription
    ///
    /// Entering PoweredOn while Idle restarts the stored configuration. Leaving
    /// PoweredOn while active forces a stop and fails with `AdapterUnavailable`.
    pub fn on_power_state_changed(&self, power: AdapterPowerState) {
        let previous = {
            let mut inner = self.shared.inner.lock();
            let previous = inner.power;
            inner.power = power;
            previous
        };
        debug!("Peripheral sees power {} -> {}", previous, power);

        if power.is_ready() {
            if previous.is_ready() || self.state() != PeripheralState::Idle {
                self.publish(&self.shared.inner.lock());
                return;
            }
            if let Some(plan) = self.begin_activation(None, power) {
                let session = self.clone();
                self.spawn(async move { session.run_activation(plan).await });
            }
            return;
        }

        let was_advertising = {
            let mut inner = self.shared.inner.lock();
            let was_advertising = inner.state == PeripheralState::Advertising;
            if inner.state.is_active() {
                inner.fail(
                    ErrorKind::AdapterUnavailable,
                    format!("adapter became {}", power),
                );
            }
            self.publish(&inner);
            was_advertising
        };

        if was_advertising {
            let adapter = self.shared.adapter.clone();
            self.spawn(async move {
                if let Err(e) = adapter.stop_advertising().await {
                    debug!("Forced stop after power loss not acknowledged: {}", e);
                }
            });
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(fut);
            }
            Err(_) => warn!("No tokio runtime; peripheral follow-up dropped"),
        }
    }

    /// Inbound write on the handshake characteristic
    ///
    /// Records the payload, runs the payload handler and answers through the
    /// adapter. Writes arriving while the service is not registered are ignored.
    pub fn on_write_request(&self, value: &[u8], offset: usize) -> WriteOutcome {
        let state = self.state();
        if !state.accepts_writes() {
            debug!(
                "Ignoring stale write of {} bytes while {}",
                value.len(),
                state
            );
            return WriteOutcome::reject();
        }

        let handler = self.shared.handler.read().clone();
        let result = handler.handle(value, offset);

        let outcome = {
            let mut inner = self.shared.inner.lock();
            inner.last_received_payload = Some(value.to_vec());
            inner.writes_received += 1;
            let outcome = match result {
                Ok(outcome) => {
                    info!("Payload received: {}", hex::encode(value));
                    outcome
                }
                Err(e) => {
                    warn!("Payload rejected: {}", e);
                    inner.last_error = Some(ErrorInfo::new(ErrorKind::PayloadRejected, e));
                    WriteOutcome::reject()
                }
            };
            self.publish(&inner);
            outcome
        };

        self.shared
            .adapter
            .send_write_response(outcome.accepted, &outcome.response);
        outcome
    }

    /// Stop advertising
    ///
    /// Valid from Advertising or ServiceAdded; anything else is a no-op. The
    /// session is Stopped as soon as this is called; a failed adapter stop is
    /// only recorded as `StopFailed`.
    pub async fn deactivate(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if !matches!(
                inner.state,
                PeripheralState::Advertising | PeripheralState::ServiceAdded
            ) {
                debug!("Deactivate ignored: peripheral {}", inner.state);
                return;
            }
            info!("Peripheral {} -> Stopped", inner.state);
            inner.state = PeripheralState::Stopped;
            inner.epoch += 1;
            self.publish(&inner);
        }

        if let Err(e) = self.shared.adapter.stop_advertising().await {
            warn!("Stop advertising not acknowledged: {}", e);
            let mut inner = self.shared.inner.lock();
            inner.last_error = Some(ErrorInfo::new(ErrorKind::StopFailed, e));
            self.publish(&inner);
        }
    }

    /// Return from Stopped or Failed to Idle
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        if !matches!(inner.state, PeripheralState::Stopped | PeripheralState::Failed) {
            return;
        }
        inner.state = PeripheralState::Idle;
        inner.last_error = None;
        inner.last_received_payload = None;
        self.publish(&inner);
    }
}

// Integration tests for the full handshake over the loopback radio
//
// A peripheral, a decoy peripheral and a central share one simulated radio.
// Run with: cargo test --test integration_handshake

use blehandshake_core::adapter::Op;
use blehandshake_core::{
    AdapterError, AdapterPowerState, AdvertisingConfig, Delivery, DeviceFilter, ErrorKind,
    HandshakeSettings, LoopbackAdapter, LoopbackRadio, PeripheralSession, PeripheralState,
    ScannerSession, ScannerState, DEFAULT_CHARACTERISTIC_ID, DEFAULT_SERVICE_ID,
};
use std::sync::Arc;
use std::time::Duration;

const HELLO: [u8; 5] = [0x48, 0x45, 0x4C, 0x4C, 0x4F];

fn config(name: &str) -> AdvertisingConfig {
    AdvertisingConfig::new(name, vec![DEFAULT_SERVICE_ID]).expect("valid config")
}

fn peripheral(adapter: &LoopbackAdapter, name: &str) -> PeripheralSession {
    PeripheralSession::new(
        Arc::new(adapter.clone()),
        config(name),
        HandshakeSettings::default(),
    )
}

fn scanner(adapter: &LoopbackAdapter) -> ScannerSession {
    ScannerSession::new(Arc::new(adapter.clone()), HandshakeSettings::default())
}

#[tokio::test(start_paused = true)]
async fn test_full_handshake_with_decoy() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);

    let ticket_radio = radio.adapter();
    let decoy_radio = radio.adapter();
    let central_radio = radio.adapter();

    let ticket = peripheral(&ticket_radio, "Ticket");
    let decoy = peripheral(&decoy_radio, "Other");
    ticket.activate(config("Ticket")).await;
    decoy.activate(config("Other")).await;
    assert_eq!(ticket.state(), PeripheralState::Advertising);
    assert_eq!(decoy.state(), PeripheralState::Advertising);

    let central = scanner(&central_radio);
    central
        .start(
            Some(DeviceFilter::by_name("Ticket")),
            Some(Duration::from_secs(30)),
        )
        .await;

    let devices = central.devices();
    assert_eq!(devices.len(), 1, "Decoy should be filtered out");
    assert_eq!(devices[0].device_id, ticket_radio.id());
    assert_eq!(devices[0].name.as_deref(), Some("Ticket"));

    let delivery = central
        .deliver(
            ticket_radio.id(),
            DEFAULT_SERVICE_ID,
            DEFAULT_CHARACTERISTIC_ID,
            &HELLO,
        )
        .await;

    assert_eq!(
        delivery,
        Delivery::Accepted {
            echo: HELLO.to_vec()
        }
    );
    assert_eq!(ticket.last_received_payload(), Some(HELLO.to_vec()));
    assert_eq!(ticket_radio.write_responses(), vec![(true, HELLO.to_vec())]);
    assert!(decoy.last_received_payload().is_none());
    assert_eq!(central.state(), ScannerState::Scanning);
    assert_eq!(central_radio.calls(Op::Disconnect), 1);

    central.stop();
    assert_eq!(central.state(), ScannerState::Stopped);
    assert!(!central_radio.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_peripheral_starts_when_radio_powers_on() {
    let radio = LoopbackRadio::new();
    let ticket_radio = radio.adapter();
    let ticket = peripheral(&ticket_radio, "Ticket");

    ticket.activate(config("Ticket")).await;
    assert_eq!(ticket.state(), PeripheralState::Idle);
    assert_eq!(
        ticket.last_error().map(|e| e.kind),
        Some(ErrorKind::AdapterNotReady)
    );
    assert_eq!(ticket_radio.calls(Op::AddService), 0);

    radio.set_power(AdapterPowerState::PoweredOn);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(ticket.state(), PeripheralState::Advertising);
    assert!(ticket_radio.is_advertising());
    assert_eq!(ticket_radio.calls(Op::AddService), 1);
}

#[tokio::test(start_paused = true)]
async fn test_power_loss_fails_advertising_peripheral() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let ticket_radio = radio.adapter();
    let ticket = peripheral(&ticket_radio, "Ticket");
    ticket.activate(config("Ticket")).await;

    radio.set_power(AdapterPowerState::PoweredOff);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(ticket.state(), PeripheralState::Failed);
    assert_eq!(
        ticket.last_error().map(|e| e.kind),
        Some(ErrorKind::AdapterUnavailable)
    );
    assert!(!ticket_radio.is_advertising());

    // Power returning does not resurrect a failed session
    radio.set_power(AdapterPowerState::PoweredOn);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ticket.state(), PeripheralState::Failed);

    ticket.activate(config("Ticket")).await;
    assert_eq!(ticket.state(), PeripheralState::Advertising);
}

#[tokio::test]
async fn test_scanner_fails_when_radio_off() {
    let radio = LoopbackRadio::new();
    let central_radio = radio.adapter();
    let central = scanner(&central_radio);

    central.start(None, None).await;

    assert_eq!(central.state(), ScannerState::Failed);
    assert_eq!(
        central.last_error().map(|e| e.kind),
        Some(ErrorKind::AdapterNotReady)
    );
    assert_eq!(central_radio.calls(Op::StartScan), 0);
}

#[tokio::test(start_paused = true)]
async fn test_peripheral_appearing_mid_scan_is_discovered() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let ticket_radio = radio.adapter();
    let central_radio = radio.adapter();

    let central = scanner(&central_radio);
    central
        .start(
            Some(DeviceFilter::by_name("Ticket")),
            Some(Duration::from_secs(30)),
        )
        .await;
    assert!(central.devices().is_empty());

    let ticket = peripheral(&ticket_radio, "Ticket");
    ticket.activate(config("Ticket")).await;

    assert_eq!(central.devices().len(), 1);
    assert!(central.find(ticket_radio.id()).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_scan_window_stops_radio_scan() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let central_radio = radio.adapter();
    let central = scanner(&central_radio);

    central.start(None, Some(Duration::from_secs(30))).await;
    assert!(central_radio.is_scanning());

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(central.state(), ScannerState::Stopped);
    assert!(!central_radio.is_scanning());
    assert_eq!(central_radio.calls(Op::StopScan), 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_after_deactivate_is_ignored() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let ticket_radio = radio.adapter();
    let ticket = peripheral(&ticket_radio, "Ticket");
    ticket.activate(config("Ticket")).await;

    ticket.deactivate().await;
    assert_eq!(ticket.state(), PeripheralState::Stopped);

    let outcome = ticket_radio
        .simulate_write(DEFAULT_CHARACTERISTIC_ID, &HELLO, 0)
        .expect("characteristic registered");

    assert!(!outcome.accepted);
    assert!(ticket.last_received_payload().is_none());
    assert!(ticket_radio.write_responses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delivery_to_stopped_peripheral_fails_to_connect() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let ticket_radio = radio.adapter();
    let central_radio = radio.adapter();

    let ticket = peripheral(&ticket_radio, "Ticket");
    ticket.activate(config("Ticket")).await;

    let central = scanner(&central_radio);
    central.start(None, None).await;
    assert_eq!(central.devices().len(), 1);

    ticket.deactivate().await;
    let delivery = central
        .deliver(
            ticket_radio.id(),
            DEFAULT_SERVICE_ID,
            DEFAULT_CHARACTERISTIC_ID,
            &HELLO,
        )
        .await;

    assert_eq!(delivery, Delivery::Failed(ErrorKind::ConnectFailed));
    assert_eq!(central.state(), ScannerState::Scanning);
    assert_eq!(central_radio.calls(Op::Write), 0);
}

#[tokio::test(start_paused = true)]
async fn test_injected_advertise_failure_then_retry() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let ticket_radio = radio.adapter();
    ticket_radio.fail_next(
        Op::StartAdvertising,
        AdapterError::Rejected("too many advertisers".to_string()),
    );

    let ticket = peripheral(&ticket_radio, "Ticket");
    ticket.activate(config("Ticket")).await;
    assert_eq!(ticket.state(), PeripheralState::Failed);
    assert_eq!(
        ticket.last_error().map(|e| e.kind),
        Some(ErrorKind::AdvertisingFailed)
    );

    ticket.activate(config("Ticket")).await;
    assert_eq!(ticket.state(), PeripheralState::Advertising);
    assert_eq!(ticket_radio.registered_services(), vec![DEFAULT_SERVICE_ID]);
}

#[tokio::test]
async fn test_oversized_manufacturer_data_never_reaches_adapter() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let ticket_radio = radio.adapter();
    let ticket = peripheral(&ticket_radio, "Ticket");

    let oversized = config("Ticket").with_manufacturer_data(vec![0xAB; 64]);
    ticket.activate(oversized).await;

    assert_eq!(ticket.state(), PeripheralState::Failed);
    assert_eq!(
        ticket.last_error().map(|e| e.kind),
        Some(ErrorKind::InvalidConfig)
    );
    assert_eq!(ticket_radio.calls(Op::AddService), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scan_fault_fails_scanner() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let central_radio = radio.adapter();
    let central = scanner(&central_radio);

    central.start(None, None).await;
    assert!(central_radio.inject_scan_error(AdapterError::Platform("scan throttled".to_string())));

    assert_eq!(central.state(), ScannerState::Failed);
    assert_eq!(
        central.last_error().map(|e| e.kind),
        Some(ErrorKind::ScanFailed)
    );

    central.reset();
    assert_eq!(central.state(), ScannerState::Idle);
    assert!(central.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_sessions_releases_the_radio() {
    let radio = LoopbackRadio::new();
    radio.set_power(AdapterPowerState::PoweredOn);
    let ticket_radio = radio.adapter();
    let central_radio = radio.adapter();

    let ticket = peripheral(&ticket_radio, "Ticket");
    ticket.activate(config("Ticket")).await;
    let central = scanner(&central_radio);
    central.start(None, Some(Duration::from_secs(30))).await;
    assert!(ticket_radio.is_advertising());
    assert!(central_radio.is_scanning());

    drop(ticket);
    drop(central);
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert!(!ticket_radio.is_advertising());
    assert!(!central_radio.is_scanning());
    assert_eq!(ticket_radio.calls(Op::StopAdvertising), 1);
    assert_eq!(central_radio.calls(Op::StopScan), 1);
}

// Property tests for scanner discovery bookkeeping
//
// Whatever order sightings arrive in, the device list holds each id once,
// in first-sighting order, and only devices the filter accepts.

use blehandshake_core::{
    AdapterPowerState, DeviceFilter, DiscoveredDevice, HandshakeSettings, LoopbackRadio,
    ScannerSession,
};
use proptest::prelude::*;
use std::sync::Arc;

type Sighting = (u8, Option<i16>, Option<String>);

fn sighting_strategy() -> impl Strategy<Value = Vec<Sighting>> {
    prop::collection::vec(
        (
            0u8..6,
            proptest::option::of(-100i16..-20),
            proptest::option::of(prop_oneof![
                Just("Ticket".to_string()),
                Just("Other".to_string()),
                "[A-Z][a-z]{0,6}",
            ]),
        ),
        0..60,
    )
}

fn device(sighting: &Sighting) -> DiscoveredDevice {
    let (id, rssi, name) = sighting;
    let mut device = DiscoveredDevice::new(format!("DEV-{}", id));
    device.rssi = *rssi;
    device.name = name.clone();
    device
}

/// Run a scan on the loopback radio and feed it `sightings`
fn scan(filter: Option<DeviceFilter>, sightings: &[Sighting]) -> Vec<DiscoveredDevice> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    runtime.block_on(async {
        let radio = LoopbackRadio::new();
        radio.set_power(AdapterPowerState::PoweredOn);
        let scanner = ScannerSession::new(Arc::new(radio.adapter()), HandshakeSettings::default());

        scanner.start(filter, None).await;
        for sighting in sightings {
            scanner.on_device_discovered(device(sighting));
        }
        scanner.devices()
    })
}

proptest! {
    #[test]
    fn prop_devices_unique_in_first_sighting_order(sightings in sighting_strategy()) {
        let devices = scan(None, &sightings);

        let mut expected: Vec<String> = Vec::new();
        for sighting in &sightings {
            let id = format!("DEV-{}", sighting.0);
            if !expected.contains(&id) {
                expected.push(id);
            }
        }

        let ids: Vec<String> = devices.iter().map(|d| d.device_id.clone()).collect();
        prop_assert_eq!(ids, expected);
    }

    #[test]
    fn prop_latest_present_fields_win(sightings in sighting_strategy()) {
        let devices = scan(None, &sightings);

        for entry in &devices {
            let history: Vec<&Sighting> = sightings
                .iter()
                .filter(|s| format!("DEV-{}", s.0) == entry.device_id)
                .collect();
            let last_rssi = history.iter().rev().find_map(|s| s.1);
            let last_name = history.iter().rev().find_map(|s| s.2.clone());

            prop_assert_eq!(entry.rssi, last_rssi);
            prop_assert_eq!(entry.name.clone(), last_name);
        }
    }

    #[test]
    fn prop_name_filter_only_keeps_matches(sightings in sighting_strategy()) {
        let devices = scan(Some(DeviceFilter::by_name("Ticket")), &sightings);

        for entry in &devices {
            prop_assert_eq!(entry.name.as_deref(), Some("Ticket"));
        }

        let any_ticket = sightings
            .iter()
            .any(|s| s.2.as_deref() == Some("Ticket"));
        prop_assert_eq!(!devices.is_empty(), any_ticket);
    }
}

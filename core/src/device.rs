//! Discovered devices and the predicates used to filter them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A peripheral sighted during a scan
///
/// Identity is `device_id`: two sightings with the same id are the same device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Stack-assigned identifier, stable for the scan session
    pub device_id: String,
    pub name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
    /// RSSI in dBm
    pub rssi: Option<i16>,
    /// Service ids carried in the advertisement
    pub service_ids: Vec<Uuid>,
}

impl DiscoveredDevice {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: None,
            manufacturer_data: None,
            rssi: None,
            service_ids: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_manufacturer_data(mut self, data: Vec<u8>) -> Self {
        self.manufacturer_data = Some(data);
        self
    }

    pub fn with_service_ids(mut self, service_ids: Vec<Uuid>) -> Self {
        self.service_ids = service_ids;
        self
    }

    /// Fold a later sighting of the same device into this entry
    ///
    /// Present fields overwrite, absent fields keep what was seen before.
    pub fn merge(&mut self, sighting: DiscoveredDevice) {
        debug_assert_eq!(self.device_id, sighting.device_id);
        if sighting.name.is_some() {
            self.name = sighting.name;
        }
        if sighting.manufacturer_data.is_some() {
            self.manufacturer_data = sighting.manufacturer_data;
        }
        if sighting.rssi.is_some() {
            self.rssi = sighting.rssi;
        }
        if !sighting.service_ids.is_empty() {
            self.service_ids = sighting.service_ids;
        }
    }

    /// Display name, falling back the way scanner UIs do
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

/// Caller-supplied predicate deciding which sightings a scan keeps
///
/// Exact-name matching is one instance; prefix, RSSI, service and
/// manufacturer-data filters are provided alongside, and arbitrary closures
/// can be wrapped with [`DeviceFilter::custom`].
#[derive(Clone)]
pub struct DeviceFilter {
    label: String,
    predicate: Arc<dyn Fn(&DiscoveredDevice) -> bool + Send + Sync>,
}

impl DeviceFilter {
    pub fn custom<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&DiscoveredDevice) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Exact local-name equality
    pub fn by_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let label = format!("name == {:?}", name);
        Self::custom(label, move |d| d.name.as_deref() == Some(name.as_str()))
    }

    /// Local name starts with `prefix`
    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let label = format!("name starts with {:?}", prefix);
        Self::custom(label, move |d| {
            d.name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix.as_str()))
        })
    }

    /// RSSI at or above `threshold` dBm; sightings without RSSI are dropped
    pub fn min_rssi(threshold: i16) -> Self {
        Self::custom(format!("rssi >= {}", threshold), move |d| {
            d.rssi.is_some_and(|rssi| rssi >= threshold)
        })
    }

    /// Advertisement carries `service_id`
    pub fn has_service(service_id: Uuid) -> Self {
        Self::custom(format!("service {}", service_id), move |d| {
            d.service_ids.contains(&service_id)
        })
    }

    /// Manufacturer data starts with `prefix`
    pub fn manufacturer_prefix(prefix: Vec<u8>) -> Self {
        let label = format!("manufacturer data starts with {}", hex::encode(&prefix));
        Self::custom(label, move |d| {
            d.manufacturer_data
                .as_deref()
                .is_some_and(|data| data.starts_with(&prefix))
        })
    }

    /// Both filters must match
    pub fn and(self, other: DeviceFilter) -> Self {
        let label = format!("({}) && ({})", self.label, other.label);
        Self::custom(label, move |d| self.matches(d) && other.matches(d))
    }

    /// Either filter may match
    pub fn or(self, other: DeviceFilter) -> Self {
        let label = format!("({}) || ({})", self.label, other.label);
        Self::custom(label, move |d| self.matches(d) || other.matches(d))
    }

    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        (self.predicate)(device)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceFilter").field(&self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::DEFAULT_SERVICE_ID;

    fn ticket() -> DiscoveredDevice {
        DiscoveredDevice::new("AA:BB")
            .with_name("Ticket")
            .with_rssi(-60)
            .with_manufacturer_data(vec![0x4C, 0x00, 0x01])
            .with_service_ids(vec![DEFAULT_SERVICE_ID])
    }

    #[test]
    fn test_by_name_is_exact() {
        let filter = DeviceFilter::by_name("Ticket");
        assert!(filter.matches(&ticket()));
        assert!(!filter.matches(&ticket().with_name("Ticket-2")));
        assert!(!filter.matches(&DiscoveredDevice::new("CC")));
    }

    #[test]
    fn test_name_prefix() {
        let filter = DeviceFilter::name_prefix("Tick");
        assert!(filter.matches(&ticket()));
        assert!(filter.matches(&ticket().with_name("Ticket-2")));
        assert!(!filter.matches(&ticket().with_name("Other")));
    }

    #[test]
    fn test_min_rssi() {
        let filter = DeviceFilter::min_rssi(-70);
        assert!(filter.matches(&ticket()));
        assert!(!filter.matches(&ticket().with_rssi(-90)));
        assert!(!filter.matches(&DiscoveredDevice::new("CC")));
    }

    #[test]
    fn test_service_and_manufacturer_filters() {
        assert!(DeviceFilter::has_service(DEFAULT_SERVICE_ID).matches(&ticket()));
        assert!(DeviceFilter::manufacturer_prefix(vec![0x4C, 0x00]).matches(&ticket()));
        assert!(!DeviceFilter::manufacturer_prefix(vec![0x06]).matches(&ticket()));
    }

    #[test]
    fn test_combinators() {
        let both = DeviceFilter::by_name("Ticket").and(DeviceFilter::min_rssi(-50));
        assert!(!both.matches(&ticket()));

        let either = DeviceFilter::by_name("Other").or(DeviceFilter::min_rssi(-70));
        assert!(either.matches(&ticket()));
        assert_eq!(either.label(), "(name == \"Other\") || (rssi >= -70)");
    }

    #[test]
    fn test_merge_keeps_absent_fields() {
        let mut entry = ticket();
        entry.merge(DiscoveredDevice::new("AA:BB").with_rssi(-40));

        assert_eq!(entry.name.as_deref(), Some("Ticket"));
        assert_eq!(entry.rssi, Some(-40));
        assert_eq!(entry.service_ids, vec![DEFAULT_SERVICE_ID]);
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(DiscoveredDevice::new("CC").display_name(), "Unknown Device");
        assert_eq!(ticket().display_name(), "Ticket");
    }
}

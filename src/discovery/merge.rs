use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ConfigSnapshot;

use super::models::{configured_match, DeviceKey, DiscoveredPrinter, DiscoveryEntry, Protocol};

#[derive(Debug, Clone, PartialEq, Eq)]
struct MergedDevice {
    entry: DiscoveryEntry,
    protocols: BTreeSet<Protocol>,
}

/// Last known good discovery results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryCache {
    devices: BTreeMap<DeviceKey, MergedDevice>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoverySummary {
    pub devices: usize,
    pub unconfigured: usize,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DiscoveryCache {
    /// Replaces the cache with the results of a successful scan.
    ///
    /// Advertisements of one device over `ipp` and `ipps` collapse into one
    /// entry. The `ipps` advertisement provides the entry, whatever the input order.
    pub fn merge(&mut self, scanned: Vec<DiscoveryEntry>, now: DateTime<Utc>) {
        let mut devices: BTreeMap<DeviceKey, MergedDevice> = BTreeMap::new();

        for entry in scanned {
            let key = entry.key();
            match devices.get_mut(&key) {
                Some(device) => {
                    device.protocols.insert(entry.protocol);
                    if preferred(&entry, &device.entry) {
                        let first_seen = device.entry.first_seen.min(entry.first_seen);
                        device.entry = DiscoveryEntry { first_seen, ..entry };
                    } else {
                        device.entry.first_seen = device.entry.first_seen.min(entry.first_seen);
                    }
                },
                None => {
                    let protocols = BTreeSet::from([entry.protocol]);
                    devices.insert(key, MergedDevice { entry, protocols });
                },
            }
        }

        for (key, device) in devices.iter_mut() {
            if let Some(previous) = self.devices.get(key) {
                device.entry.first_seen = device.entry.first_seen.min(previous.entry.first_seen);
            }
            device.entry.last_seen = now;
        }

        self.devices = devices;
        self.last_scan_at = Some(now);
        self.last_error = None;
    }

    /// Keeps previous results and remembers why the refresh failed.
    pub fn record_failure(&mut self, message: String, now: DateTime<Utc>) {
        self.last_scan_at = Some(now);
        self.last_error = Some(message);
    }

    pub fn printers(&self, snapshot: &ConfigSnapshot) -> Vec<DiscoveredPrinter> {
        self.devices
            .iter()
            .map(|(key, device)| {
                let configured_as = configured_match(snapshot, key);
                DiscoveredPrinter {
                    suggested: device.entry.suggest(),
                    entry: device.entry.clone(),
                    protocols: device.protocols.iter().copied().collect(),
                    already_configured: configured_as.is_some(),
                    configured_as,
                }
            })
            .collect()
    }

    /// The discovered device a configured printer points at, if any.
    pub fn match_for(&self, snapshot: &ConfigSnapshot, printer_id: &str) -> Option<DiscoveredPrinter> {
        self.printers(snapshot).into_iter().find(|printer| printer.configured_as.as_deref() == Some(printer_id))
    }

    pub fn summary(&self, snapshot: &ConfigSnapshot) -> DiscoverySummary {
        let printers = self.printers(snapshot);
        DiscoverySummary {
            devices: printers.len(),
            unconfigured: printers.iter().filter(|printer| !printer.already_configured).count(),
            last_scan_at: self.last_scan_at,
            last_error: self.last_error.clone(),
        }
    }
}

fn preferred(candidate: &DiscoveryEntry, current: &DiscoveryEntry) -> bool {
    (candidate.protocol, candidate.port) > (current.protocol, current.port)
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{models::PrinterClass, uri::{normalize_resource_path, printer_slug}, ConfigSnapshot};

pub const IPP_PORT: u16 = 631;

/// Ordered so that the secure variant compares greater and wins merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ipp,
    Ipps,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ipp => f.write_str("ipp"),
            Protocol::Ipps => f.write_str("ipps"),
        }
    }
}

/// One device advertisement, or several collapsed into one after a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub resource_path: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Identity of a physical device across protocols.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceKey {
    pub host: String,
    pub resource_path: String,
}

impl DiscoveryEntry {
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            host: self.host.to_lowercase(),
            resource_path: normalize_resource_path(&self.resource_path),
        }
    }

    pub fn uri(&self) -> String {
        let path = normalize_resource_path(&self.resource_path);
        if self.port == IPP_PORT {
            format!("{}://{}{}", self.protocol, self.host.to_lowercase(), path)
        } else {
            format!("{}://{}:{}{}", self.protocol, self.host.to_lowercase(), self.port, path)
        }
    }

    pub fn suggest(&self) -> SuggestedConfig {
        let name = self.name.clone().or_else(|| self.model.clone()).unwrap_or_else(|| self.host.clone());
        let class = PrinterClass::guess(&format!("{} {}", self.model.as_deref().unwrap_or_default(), name));
        SuggestedConfig {
            id: printer_slug(&name),
            name,
            uri: self.uri(),
            class,
            cadence_hours: class.default_cadence().as_secs() / 3600,
            secure: self.protocol == Protocol::Ipps,
        }
    }
}

/// A ready-to-paste printer block for the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuggestedConfig {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub class: PrinterClass,
    pub cadence_hours: u64,
    pub secure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPrinter {
    #[serde(flatten)]
    pub entry: DiscoveryEntry,
    pub protocols: Vec<Protocol>,
    pub suggested: SuggestedConfig,
    /// Id of the configured printer pointing at this device, if any.
    pub configured_as: Option<String>,
    pub already_configured: bool,
}

/// Finds the configured printer that targets the same device as `key`.
pub fn configured_match(snapshot: &ConfigSnapshot, key: &DeviceKey) -> Option<String> {
    snapshot.printers.iter().find_map(|printer| {
        let url = url::Url::parse(&printer.uri).ok()?;
        let host = url.host_str()?.to_lowercase();
        (host == key.host && normalize_resource_path(url.path()) == key.resource_path).then(|| printer.id.clone())
    })
}

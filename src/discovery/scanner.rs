use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use log::{debug, info};
use snafu::Snafu;
use url::Url;

use crate::config::uri::normalize_printer_uri;
use crate::ipp_client::{IppDevice, TelemetrySnapshot};

use super::models::{DiscoveryEntry, Protocol, IPP_PORT};

/// Produces the list of printers currently visible on the network.
#[async_trait]
pub trait DiscoveryScanner: Send + Sync {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveryEntry>, DiscoveryError>;
}

/// Probes a fixed list of candidate hosts with get-printer-attributes.
pub struct IppProbeScanner {
    device: IppDevice,
    candidates: Vec<String>,
    include_ipps: bool,
}

struct Probe {
    protocol: Protocol,
    host: String,
    port: u16,
    resource_path: String,
}

impl Probe {
    fn uri(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.resource_path)
    }
}

impl IppProbeScanner {
    pub fn new(device: IppDevice, candidates: Vec<String>, include_ipps: bool) -> Self {
        Self { device, candidates, include_ipps }
    }

    fn probes(&self) -> Result<Vec<Probe>, DiscoveryError> {
        let mut probes = Vec::new();
        for candidate in &self.candidates {
            let uri = normalize_printer_uri(candidate, false).map_err(|e| DiscoveryError::InvalidCandidate {
                candidate: candidate.clone(),
                message: e.to_string(),
            })?;
            let url = Url::parse(&uri).map_err(|e| DiscoveryError::InvalidCandidate { candidate: candidate.clone(), message: e.to_string() })?;
            let Some(host) = url.host_str() else {
                return InvalidCandidateSnafu { candidate, message: "no host" }.fail();
            };

            let mut protocols = vec![Protocol::Ipp];
            if self.include_ipps || candidate.starts_with("ipps://") {
                protocols.push(Protocol::Ipps);
            }
            for protocol in protocols {
                probes.push(Probe {
                    protocol,
                    host: host.to_owned(),
                    port: url.port().unwrap_or(IPP_PORT),
                    resource_path: url.path().to_owned(),
                });
            }
        }
        Ok(probes)
    }

    async fn probe(&self, probe: Probe, timeout: Duration) -> Option<DiscoveryEntry> {
        let uri = probe.uri();
        match self.device.printer_attributes(&uri, timeout).await {
            Ok(attributes) => {
                let now = Utc::now();
                let details = TelemetrySnapshot::from_attributes(&probe.host, now, &attributes);
                debug!("Discovery probe {} answered as {:?}", uri, details.make_and_model);
                Some(DiscoveryEntry {
                    protocol: probe.protocol,
                    host: probe.host,
                    port: probe.port,
                    resource_path: probe.resource_path,
                    name: details.device_name,
                    model: details.make_and_model,
                    first_seen: now,
                    last_seen: now,
                })
            },
            Err(e) => {
                debug!("Discovery probe {} failed: {}", uri, e);
                None
            },
        }
    }
}

#[async_trait]
impl DiscoveryScanner for IppProbeScanner {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveryEntry>, DiscoveryError> {
        let probes = self.probes()?;
        let attempted = probes.len();
        let found: Vec<DiscoveryEntry> = join_all(probes.into_iter().map(|probe| self.probe(probe, timeout))).await.into_iter().flatten().collect();

        if attempted > 0 && found.is_empty() {
            return NothingReachableSnafu { attempted }.fail();
        }
        info!("Discovery probed {} endpoint(s), {} answered", attempted, found.len());
        Ok(found)
    }
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum DiscoveryError {
    #[snafu(display("Invalid discovery candidate '{candidate}': {message}"))]
    InvalidCandidate { candidate: String, message: String },

    #[snafu(display("None of the {attempted} probed endpoints answered"))]
    NothingReachable { attempted: usize },

    #[snafu(display("Discovery scan did not finish within {}", humantime::format_duration(*after)))]
    TimedOut { after: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_expand_to_both_protocols() {
        let scanner = IppProbeScanner::new(IppDevice::new(true), vec!["10.0.0.5".to_owned(), "ipp://lab.local:8631/printers/lab".to_owned()], true);
        let uris: Vec<String> = scanner.probes().unwrap().iter().map(Probe::uri).collect();
        assert_eq!(uris, vec![
            "ipp://10.0.0.5:631/ipp/print",
            "ipps://10.0.0.5:631/ipp/print",
            "ipp://lab.local:8631/printers/lab",
            "ipps://lab.local:8631/printers/lab",
        ]);
    }

    #[test]
    fn ipps_probes_can_be_turned_off() {
        let scanner = IppProbeScanner::new(IppDevice::new(true), vec!["10.0.0.5".to_owned()], false);
        assert_eq!(scanner.probes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_candidates_is_an_empty_scan() {
        let scanner = IppProbeScanner::new(IppDevice::new(true), Vec::new(), true);
        assert!(scanner.scan(Duration::from_millis(10)).await.unwrap().is_empty());
    }
}

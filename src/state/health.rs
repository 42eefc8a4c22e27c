use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{models::PrinterClass, PrinterConfig};
use crate::discovery::{DiscoveredPrinter, DiscoverySummary, Protocol};
use crate::ipp_client::{DeviceState, TelemetryErrorKind, TelemetrySnapshot};
use crate::keepalive::{due::next_due, tracker::PrintSource};
use crate::mqtt_client::models::ConnectionState;

use super::store::{AttemptResult, PrinterRuntime};

/// Supplies at or below this level raise a warning.
const LOW_SUPPLY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Critical,
    Warning,
    Busy,
    Healthy,
    Unknown,
    Unreachable,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HealthStatus::Critical => "critical",
            HealthStatus::Warning => "warning",
            HealthStatus::Busy => "busy",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Unreachable => "unreachable",
        };
        f.write_str(text)
    }
}

fn meaningful_reasons(telemetry: &TelemetrySnapshot) -> impl Iterator<Item = &String> {
    telemetry.state_reasons.iter().filter(|reason| !reason.is_empty() && reason.as_str() != "none")
}

pub fn evaluate_health(runtime: &PrinterRuntime) -> HealthStatus {
    match &runtime.poll_failure {
        Some(failure) if failure.kind == TelemetryErrorKind::Unreachable => return HealthStatus::Unreachable,
        Some(_) => return HealthStatus::Unknown,
        None => {},
    }
    let Some(telemetry) = &runtime.telemetry else {
        return HealthStatus::Unknown;
    };

    if telemetry.state == DeviceState::Stopped || meaningful_reasons(telemetry).any(|reason| reason.contains("error")) {
        return HealthStatus::Critical;
    }
    let low_supply = telemetry.supplies.iter().any(|supply| supply.level.is_some_and(|level| level <= LOW_SUPPLY));
    if low_supply || meaningful_reasons(telemetry).next().is_some() {
        return HealthStatus::Warning;
    }
    match telemetry.state {
        DeviceState::Processing => HealthStatus::Busy,
        DeviceState::Ready => HealthStatus::Healthy,
        _ => HealthStatus::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryMatch {
    pub uri: String,
    pub protocols: Vec<Protocol>,
    pub name: Option<String>,
    pub model: Option<String>,
}

impl From<&DiscoveredPrinter> for DiscoveryMatch {
    fn from(printer: &DiscoveredPrinter) -> Self {
        Self {
            uri: printer.entry.uri(),
            protocols: printer.protocols.clone(),
            name: printer.entry.name.clone(),
            model: printer.entry.model.clone(),
        }
    }
}

/// Everything known about one printer. Also the retained MQTT state payload,
/// so it holds no value derived from the current time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterHealth {
    pub printer_id: String,
    pub name: String,
    pub uri: String,
    pub class: PrinterClass,
    pub enabled: bool,
    pub template: String,
    pub cadence_hours: u64,
    pub last_print: DateTime<Utc>,
    pub last_print_source: PrintSource,
    pub next_keepalive_due_at: DateTime<Utc>,
    pub keepalive_count: u64,
    pub external_count: u64,
    pub last_keepalive_result: AttemptResult,
    pub last_keepalive_error: Option<String>,
    pub last_keepalive_attempt_at: Option<DateTime<Utc>>,
    pub health: HealthStatus,
    pub lowest_supply_level: Option<u8>,
    pub telemetry: Option<TelemetrySnapshot>,
    pub poll_error: Option<String>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub discovery: Option<DiscoveryMatch>,
}

impl PrinterHealth {
    pub fn build(printer: &PrinterConfig, runtime: &PrinterRuntime, discovered: Option<&DiscoveredPrinter>) -> Self {
        Self {
            printer_id: printer.id.clone(),
            name: printer.name.clone(),
            uri: printer.uri.clone(),
            class: printer.class,
            enabled: printer.enabled,
            template: printer.template.clone(),
            cadence_hours: printer.cadence_hours(),
            last_print: runtime.record.last_print,
            last_print_source: runtime.record.source,
            next_keepalive_due_at: next_due(&runtime.record, printer),
            keepalive_count: runtime.record.keepalive_count,
            external_count: runtime.record.external_count,
            last_keepalive_result: runtime.keepalive.last_result,
            last_keepalive_error: runtime.keepalive.last_error.clone(),
            last_keepalive_attempt_at: runtime.keepalive.last_attempt_at,
            health: evaluate_health(runtime),
            lowest_supply_level: runtime.telemetry.as_ref().and_then(TelemetrySnapshot::lowest_supply_level),
            telemetry: runtime.telemetry.clone(),
            poll_error: runtime.poll_failure.as_ref().map(|failure| failure.message.clone()),
            degraded: runtime.degraded.is_some(),
            degraded_reason: runtime.degraded.clone(),
            discovery: discovered.map(DiscoveryMatch::from),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub config_generation: u64,
    pub bridge: ConnectionState,
    pub printers: Vec<PrinterHealth>,
    pub discovery: DiscoverySummary,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::ipp_client::models::Supply;
    use crate::keepalive::tracker::{tests::snapshot, PrintRecord};
    use crate::state::store::{KeepaliveStatus, PollFailure};

    fn runtime(telemetry: Option<TelemetrySnapshot>) -> PrinterRuntime {
        PrinterRuntime {
            record: PrintRecord::anchored("office", Utc::now() - Duration::hours(1)),
            keepalive: KeepaliveStatus::default(),
            telemetry,
            poll_failure: None,
            degraded: None,
        }
    }

    #[test]
    fn never_polled_is_unknown() {
        assert_eq!(evaluate_health(&runtime(None)), HealthStatus::Unknown);
    }

    #[test]
    fn ready_printer_is_healthy() {
        assert_eq!(evaluate_health(&runtime(Some(snapshot(Some(1), Utc::now())))), HealthStatus::Healthy);
    }

    #[test]
    fn failed_poll_is_unreachable_even_with_cached_telemetry() {
        let mut state = runtime(Some(snapshot(Some(1), Utc::now())));
        state.poll_failure = Some(PollFailure { kind: TelemetryErrorKind::Unreachable, message: "timeout".to_owned(), at: Utc::now() });
        assert_eq!(evaluate_health(&state), HealthStatus::Unreachable);
    }

    #[test]
    fn stopped_or_error_reasons_are_critical() {
        let mut telemetry = snapshot(Some(1), Utc::now());
        telemetry.state_reasons = vec!["media-jam-error".to_owned()];
        assert_eq!(evaluate_health(&runtime(Some(telemetry.clone()))), HealthStatus::Critical);

        telemetry.state_reasons = vec!["none".to_owned()];
        telemetry.state = DeviceState::Stopped;
        assert_eq!(evaluate_health(&runtime(Some(telemetry))), HealthStatus::Critical);
    }

    #[test]
    fn low_supply_is_a_warning() {
        let mut telemetry = snapshot(Some(1), Utc::now());
        telemetry.supplies = vec![Supply { name: "Black ink".to_owned(), color: Some("#000000".to_owned()), level: Some(8) }];
        assert_eq!(evaluate_health(&runtime(Some(telemetry))), HealthStatus::Warning);
    }

    #[test]
    fn processing_is_busy() {
        let mut telemetry = snapshot(Some(1), Utc::now());
        telemetry.state = DeviceState::Processing;
        assert_eq!(evaluate_health(&runtime(Some(telemetry))), HealthStatus::Busy);
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ipp::prelude::{IppAttribute, IppValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Ready,
    Processing,
    Stopped,
    Unreachable,
    Unknown,
}

impl DeviceState {
    /// Maps the IPP `printer-state` enum (3 idle, 4 processing, 5 stopped).
    pub fn from_ipp(value: i32) -> DeviceState {
        match value {
            3 => DeviceState::Ready,
            4 => DeviceState::Processing,
            5 => DeviceState::Stopped,
            _ => DeviceState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supply {
    pub name: String,
    pub color: Option<String>,
    /// 0-100, `None` when the device reports an unknown level.
    pub level: Option<u8>,
}

/// Normalized device status. Every optional field is `None` when the device
/// did not report it or reported something unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub printer_id: String,
    pub fetched_at: DateTime<Utc>,
    pub state: DeviceState,
    pub state_reasons: Vec<String>,
    pub state_message: Option<String>,
    pub queued_jobs: Option<u32>,
    pub job_counter: Option<u64>,
    pub media_sheets_completed: Option<u64>,
    pub supplies: Vec<Supply>,
    pub uptime_seconds: Option<u64>,
    pub accepting_jobs: Option<bool>,
    pub make_and_model: Option<String>,
    pub device_name: Option<String>,
}

impl TelemetrySnapshot {
    pub fn from_attributes(printer_id: &str, fetched_at: DateTime<Utc>, attributes: &HashMap<String, IppAttribute>) -> Self {
        let value = |name: &str| attributes.get(name).map(IppAttribute::value);

        let state = value("printer-state")
            .and_then(integer)
            .map(DeviceState::from_ipp)
            .unwrap_or(DeviceState::Unknown);

        let state_reasons = value("printer-state-reasons")
            .map(|v| strings(v).into_iter().filter(|reason| !reason.is_empty()).collect())
            .unwrap_or_default();

        Self {
            printer_id: printer_id.to_owned(),
            fetched_at,
            state,
            state_reasons,
            state_message: value("printer-state-message").and_then(text),
            queued_jobs: value("queued-job-count").and_then(integer).and_then(|v| u32::try_from(v).ok()),
            job_counter: value("job-impressions-completed").and_then(integer).and_then(|v| u64::try_from(v).ok()),
            media_sheets_completed: value("media-sheets-completed").and_then(integer).and_then(|v| u64::try_from(v).ok()),
            supplies: supplies(value("marker-names"), value("marker-colors"), value("marker-levels")),
            uptime_seconds: value("printer-up-time").and_then(integer).and_then(|v| u64::try_from(v).ok()),
            accepting_jobs: value("printer-is-accepting-jobs").and_then(|v| match v {
                IppValue::Boolean(b) => Some(*b),
                _ => None,
            }),
            make_and_model: value("printer-make-and-model").and_then(text),
            device_name: value("printer-name").and_then(text),
        }
    }

    pub fn lowest_supply_level(&self) -> Option<u8> {
        self.supplies.iter().filter_map(|supply| supply.level).min()
    }
}

fn members(value: &IppValue) -> Vec<&IppValue> {
    match value {
        IppValue::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn integer(value: &IppValue) -> Option<i32> {
    match value {
        IppValue::Integer(v) | IppValue::Enum(v) => Some(*v),
        IppValue::Array(items) => items.first().and_then(integer),
        _ => None,
    }
}

fn text(value: &IppValue) -> Option<String> {
    let text = value.to_string().trim().to_owned();
    if text.is_empty() { None } else { Some(text) }
}

fn strings(value: &IppValue) -> Vec<String> {
    members(value).into_iter().map(|v| v.to_string().trim().to_owned()).collect()
}

fn supplies(names: Option<&IppValue>, colors: Option<&IppValue>, levels: Option<&IppValue>) -> Vec<Supply> {
    let names = names.map(strings).unwrap_or_default();
    let colors = colors.map(strings).unwrap_or_default();
    // Negative levels are the IPP "unknown" / "unavailable" markers.
    let levels: Vec<Option<u8>> = levels
        .map(|v| members(v).into_iter().map(|m| integer(m).and_then(|l| u8::try_from(l.min(100)).ok())).collect())
        .unwrap_or_default();

    let count = names.len().max(colors.len()).max(levels.len());
    (0..count)
        .map(|index| Supply {
            name: names.get(index).cloned().unwrap_or_else(|| format!("Supply {}", index + 1)),
            color: colors.get(index).cloned().filter(|color| !color.is_empty() && color != "none"),
            level: levels.get(index).copied().flatten(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(values: Vec<(&str, IppValue)>) -> HashMap<String, IppAttribute> {
        values.into_iter().map(|(name, value)| (name.to_owned(), IppAttribute::new(name, value))).collect()
    }

    #[test]
    fn maps_full_attribute_set() {
        let now = Utc::now();
        let attrs = attributes(vec![
            ("printer-state", IppValue::Enum(4)),
            ("printer-state-reasons", IppValue::Keyword("none".to_owned())),
            ("queued-job-count", IppValue::Integer(2)),
            ("job-impressions-completed", IppValue::Integer(1234)),
            ("printer-up-time", IppValue::Integer(3600)),
            ("printer-is-accepting-jobs", IppValue::Boolean(true)),
            ("marker-names", IppValue::Array(vec![
                IppValue::NameWithoutLanguage("Black".to_owned()),
                IppValue::NameWithoutLanguage("Cyan".to_owned()),
            ])),
            ("marker-levels", IppValue::Array(vec![IppValue::Integer(80), IppValue::Integer(-3)])),
        ]);

        let snapshot = TelemetrySnapshot::from_attributes("office", now, &attrs);
        assert_eq!(snapshot.state, DeviceState::Processing);
        assert_eq!(snapshot.queued_jobs, Some(2));
        assert_eq!(snapshot.job_counter, Some(1234));
        assert_eq!(snapshot.uptime_seconds, Some(3600));
        assert_eq!(snapshot.accepting_jobs, Some(true));
        assert_eq!(snapshot.state_reasons, vec!["none".to_owned()]);
        assert_eq!(snapshot.supplies.len(), 2);
        assert_eq!(snapshot.supplies[0].level, Some(80));
        assert_eq!(snapshot.supplies[1].level, None);
        assert_eq!(snapshot.lowest_supply_level(), Some(80));
    }

    #[test]
    fn missing_fields_become_unknown() {
        let attrs = attributes(vec![("printer-state", IppValue::Enum(3))]);
        let snapshot = TelemetrySnapshot::from_attributes("office", Utc::now(), &attrs);

        assert_eq!(snapshot.state, DeviceState::Ready);
        assert_eq!(snapshot.job_counter, None);
        assert_eq!(snapshot.queued_jobs, None);
        assert!(snapshot.supplies.is_empty());
        assert_eq!(snapshot.lowest_supply_level(), None);
    }

    #[test]
    fn negative_counter_is_ignored() {
        let attrs = attributes(vec![("job-impressions-completed", IppValue::Integer(-1))]);
        let snapshot = TelemetrySnapshot::from_attributes("office", Utc::now(), &attrs);

        assert_eq!(snapshot.state, DeviceState::Unknown);
        assert_eq!(snapshot.job_counter, None);
    }
}

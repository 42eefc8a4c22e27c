use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::PrinterConfig;

use super::tracker::PrintRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DueReason {
    Forced,
    Disabled,
    CadenceElapsed,
    RecentActivity,
}

impl fmt::Display for DueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DueReason::Forced => f.write_str("forced"),
            DueReason::Disabled => f.write_str("disabled"),
            DueReason::CadenceElapsed => f.write_str("cadence_elapsed"),
            DueReason::RecentActivity => f.write_str("recent_activity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DueDecision {
    pub due: bool,
    pub reason: DueReason,
}

fn cadence(printer: &PrinterConfig) -> TimeDelta {
    TimeDelta::from_std(printer.cadence).unwrap_or(TimeDelta::MAX)
}

pub fn is_due(record: &PrintRecord, printer: &PrinterConfig, now: DateTime<Utc>, forced: bool) -> DueDecision {
    if forced {
        return DueDecision { due: true, reason: DueReason::Forced };
    }
    if !printer.enabled {
        return DueDecision { due: false, reason: DueReason::Disabled };
    }
    if now.signed_duration_since(record.last_print) >= cadence(printer) {
        DueDecision { due: true, reason: DueReason::CadenceElapsed }
    } else {
        DueDecision { due: false, reason: DueReason::RecentActivity }
    }
}

/// When the cadence runs out, assuming nothing else prints before then.
pub fn next_due(record: &PrintRecord, printer: &PrinterConfig) -> DateTime<Utc> {
    record.last_print.checked_add_signed(cadence(printer)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

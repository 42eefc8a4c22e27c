//! Print activity ledger.
//!
//! A [`PrintRecord`] remembers when a printer last printed and which signal
//! proved it. [`reconcile`] folds new evidence into the record: our own
//! submitted keepalives and the device's cumulative job counter.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ipp_client::TelemetrySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintSource {
    Keepalive,
    External,
    Anchor,
}

impl fmt::Display for PrintSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrintSource::Keepalive => f.write_str("keepalive"),
            PrintSource::External => f.write_str("external"),
            PrintSource::Anchor => f.write_str("anchor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintRecord {
    pub printer_id: String,
    pub last_print: DateTime<Utc>,
    pub source: PrintSource,
    /// Device job counter last used as the reference for external activity.
    pub baseline_counter: Option<u64>,
    #[serde(default)]
    pub keepalive_count: u64,
    #[serde(default)]
    pub external_count: u64,
}

impl PrintRecord {
    /// First sight of a printer: no evidence yet, so the clock starts now.
    pub fn anchored(printer_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            printer_id: printer_id.to_owned(),
            last_print: now,
            source: PrintSource::Anchor,
            baseline_counter: None,
            keepalive_count: 0,
            external_count: 0,
        }
    }
}

/// A keepalive job the printer accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub at: DateTime<Utc>,
    /// Job counter from the freshest telemetry at submission time.
    pub counter: Option<u64>,
}

/// What a reconciliation concluded, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Keepalive,
    External { delta: u64 },
    Reanchored { previous: u64, current: u64 },
    BaselineSet { counter: u64 },
    Unchanged,
}

pub fn reconcile(record: &PrintRecord, snapshot: Option<&TelemetrySnapshot>, submission: Option<&Submission>) -> (PrintRecord, Activity) {
    let mut next = record.clone();

    if let Some(submission) = submission {
        next.last_print = next.last_print.max(submission.at);
        next.source = PrintSource::Keepalive;
        next.keepalive_count += 1;
        if let Some(counter) = submission.counter {
            next.baseline_counter = Some(counter);
        }
        return (next, Activity::Keepalive);
    }

    let Some((snapshot, counter)) = snapshot.and_then(|snapshot| snapshot.job_counter.map(|counter| (snapshot, counter))) else {
        return (next, Activity::Unchanged);
    };

    match record.baseline_counter {
        None => {
            next.baseline_counter = Some(counter);
            (next, Activity::BaselineSet { counter })
        },
        Some(baseline) if counter > baseline => {
            let delta = counter - baseline;
            next.last_print = next.last_print.max(snapshot.fetched_at);
            next.source = PrintSource::External;
            next.baseline_counter = Some(counter);
            next.external_count += delta;
            (next, Activity::External { delta })
        },
        // Reset or replaced device. Wraparound lands here too; never claim activity from it.
        Some(baseline) if counter < baseline => {
            next.baseline_counter = Some(counter);
            next.source = PrintSource::Anchor;
            (next, Activity::Reanchored { previous: baseline, current: counter })
        },
        Some(_) => (next, Activity::Unchanged),
    }
}

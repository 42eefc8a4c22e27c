use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Who asked for a keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduler,
    Mqtt,
    Api,
    Cli,
}

impl Trigger {
    pub fn label(self) -> &'static str {
        match self {
            Trigger::Scheduler => "Automatic scheduler",
            Trigger::Mqtt => "Home Assistant MQTT command",
            Trigger::Api => "API request",
            Trigger::Cli => "Command line",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Metadata handed to the renderer so the page can explain why it was printed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintContext {
    pub trigger: Trigger,
    pub reason: String,
    #[serde(with = "humantime_serde")]
    pub cadence: Duration,
    pub printed_at: DateTime<Utc>,
    pub last_print: DateTime<Utc>,
    pub next_due: DateTime<Utc>,
}

impl PrintContext {
    pub fn new(trigger: Trigger, forced: bool, cadence: Duration, now: DateTime<Utc>, last_print: DateTime<Utc>, next_due: DateTime<Utc>) -> Self {
        Self {
            trigger,
            reason: describe_reason(trigger, forced, cadence, now, last_print, next_due),
            cadence,
            printed_at: now,
            last_print,
            next_due,
        }
    }
}

fn hours(delta: chrono::TimeDelta) -> f64 {
    delta.num_seconds() as f64 / 3600.0
}

fn describe_reason(trigger: Trigger, forced: bool, cadence: Duration, now: DateTime<Utc>, last_print: DateTime<Utc>, next_due: DateTime<Utc>) -> String {
    if !forced {
        let cadence_hours = cadence.as_secs() / 3600;
        let elapsed = hours(now - last_print);
        if now > next_due {
            return format!(
                "Keepalive was overdue by {:.1}h ({:.1}h since last print, cadence {}h).",
                hours(now - next_due),
                elapsed,
                cadence_hours
            );
        }
        return format!("Keepalive was due by cadence ({elapsed:.1}h since last print, cadence {cadence_hours}h).");
    }

    match trigger {
        Trigger::Mqtt => "Manual keepalive requested from Home Assistant MQTT control.".to_owned(),
        Trigger::Api => "Manual keepalive requested from API with force enabled.".to_owned(),
        Trigger::Cli => "Manual keepalive requested from the command line.".to_owned(),
        Trigger::Scheduler => "Manual keepalive requested.".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    #[test]
    fn overdue_reason_mentions_hours() {
        let now = Utc::now();
        let last = now - ChronoDuration::hours(170);
        let context = PrintContext::new(Trigger::Scheduler, false, Duration::from_secs(168 * 3600), now, last, last + ChronoDuration::hours(168));
        assert_eq!(context.reason, "Keepalive was overdue by 2.0h (170.0h since last print, cadence 168h).");
    }

    #[test]
    fn forced_reason_names_the_trigger() {
        let now = Utc::now();
        let context = PrintContext::new(Trigger::Mqtt, true, Duration::from_secs(3600), now, now, now);
        assert!(context.reason.contains("MQTT"));
    }
}

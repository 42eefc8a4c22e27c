use std::{fmt::Formatter, str::FromStr, time::Duration};

use chrono::{DateTime, Local};
use croner::Cron;
use serde::{de::{self, Visitor}, Deserialize};
use snafu::Snafu;

/// How often a background loop fires: a fixed interval or a cron expression.
#[derive(Debug, Clone)]
pub enum Period {
    Every(Duration),
    Cron { expression: String, cron: Cron },
}

impl Period {
    /// Time to wait from `now` until the loop should run again.
    pub fn delay_from(&self, now: DateTime<Local>) -> Result<Duration, ScheduleError> {
        match self {
            Period::Cron { expression, cron } => {
                let next = cron
                    .find_next_occurrence(&now, false)
                    .map_err(|e| ScheduleError::NoOccurrence { pattern: expression.clone(), message: e.to_string() })?;
                Ok((next - now).to_std().unwrap_or_default())
            },
            Period::Every(duration) => Ok(*duration),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Period::Every(duration) => format!("every {}", humantime::format_duration(*duration)),
            Period::Cron { expression, .. } => format!("cron '{expression}'"),
        }
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error> where D: serde::Deserializer<'de> {
        struct PeriodVisitor;

        impl<'de> Visitor<'de> for PeriodVisitor {
            type Value = Period;

            fn expecting(&self, formatter: &mut Formatter) -> Result<(), std::fmt::Error> {
                formatter.write_str("a cron expression or a duration string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Period, E>
            where
                E: de::Error,
            {
                // Durations first, '15m' would otherwise never be tried.
                if let Ok(duration) = humantime::parse_duration(value) {
                    if duration.is_zero() {
                        return Err(E::custom("A period must be longer than zero"));
                    }
                    return Ok(Period::Every(duration));
                }

                if let Ok(cron) = Cron::from_str(value) {
                    return Ok(Period::Cron { expression: value.to_owned(), cron });
                }

                Err(E::custom(format!("Invalid period: '{}'", value)))
            }
        }

        deserializer.deserialize_str(PeriodVisitor)
    }
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum ScheduleError {
    #[snafu(display("Could not resolve next occurrence from cron '{pattern}': {message}"))]
    NoOccurrence {
        pattern: String,
        message: String,
    },
}

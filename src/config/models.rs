use std::{fmt, path::PathBuf, time::Duration};

use serde::Serialize;
use serde_derive::Deserialize;

use super::schedule::Period;

// When changing anything here, make sure to add
// #[serde(alias = "ihavenounderscores")]
// where needed, so it can be read from the ENV vars.
//
// Keys containing an underscore get their default from serde instead of
// `set_default`, otherwise a file using the underscored name would collide
// with the alias default.

pub const TEMPLATES: [&str; 5] = ["color_bars", "home_summary", "weather_snapshot", "entity_report", "hybrid"];
pub const DEFAULT_TEMPLATE: &str = "color_bars";

pub const INKJET_CADENCE: Duration = Duration::from_secs(168 * 3600);
pub const LASER_CADENCE: Duration = Duration::from_secs(720 * 3600);
pub const MIN_CADENCE: Duration = Duration::from_secs(3600);
pub const MAX_CADENCE: Duration = Duration::from_secs(720 * 3600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterClass {
    #[default]
    Inkjet,
    Laser,
}

impl PrinterClass {
    pub fn default_cadence(self) -> Duration {
        match self {
            PrinterClass::Inkjet => INKJET_CADENCE,
            PrinterClass::Laser => LASER_CADENCE,
        }
    }

    /// Best-effort guess from an advertised name or make-and-model string.
    pub fn guess(text: &str) -> PrinterClass {
        const LASER_HINTS: [&str; 7] = ["laser", "toner", "imageclass", "ecosys", "lbp", "hl-l", "phaser"];

        let lowered = text.to_lowercase();
        if LASER_HINTS.iter().any(|hint| lowered.contains(hint)) {
            PrinterClass::Laser
        } else {
            PrinterClass::Inkjet
        }
    }
}

impl fmt::Display for PrinterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrinterClass::Inkjet => f.write_str("inkjet"),
            PrinterClass::Laser => f.write_str("laser"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrinterSettings {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(alias = "printer_uri", alias = "printeruri")]
    pub uri: String,
    #[serde(default)]
    pub class: PrinterClass,
    #[serde(default, with = "humantime_serde")]
    pub cadence: Option<Duration>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scheduler {
    pub tick: Period,
    #[serde(alias = "autoprint", default = "enabled_by_default")]
    pub auto_print: bool,
    #[serde(alias = "failureretry", default = "default_failure_retry", with = "humantime_serde")]
    pub failure_retry: Duration,
    #[serde(alias = "telemetrytimeout", default = "default_telemetry_timeout", with = "humantime_serde")]
    pub telemetry_timeout: Duration,
    #[serde(alias = "submittimeout", default = "default_submit_timeout", with = "humantime_serde")]
    pub submit_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    pub enabled: bool,
    pub period: Period,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(alias = "includeipps", default = "enabled_by_default")]
    pub include_ipps: bool,
    #[serde(default)]
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ipp {
    #[serde(alias = "ignoretlserrors", default)]
    pub ignore_tls_errors: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mqtt {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    #[serde(alias = "ignoretlserrors", default)]
    pub ignore_tls_errors: bool,
    pub username: String,
    pub password: String,
    #[serde(alias = "clientid", default = "default_client_id")]
    pub client_id: String,
    #[serde(alias = "roottopic", default = "default_root_topic")]
    pub root_topic: String,
    pub retain: bool,
    pub ha: HomeAssistant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeAssistant {
    #[serde(alias = "enablediscovery", default = "enabled_by_default")]
    pub enable_discovery: bool,
    #[serde(alias = "discoverytopicprefix", default = "default_discovery_prefix")]
    pub discovery_topic_prefix: String,
    #[serde(alias = "componentid", default = "default_root_topic")]
    pub component_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub printers: Vec<PrinterSettings>,
    pub scheduler: Scheduler,
    pub discovery: Discovery,
    pub ipp: Ipp,
    pub mqtt: Mqtt,
    #[serde(alias = "datadir", default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(alias = "logfilter", default = "default_log_filter")]
    pub log_filter: String,
    #[serde(alias = "sentrydsn", default)]
    pub sentry_dsn: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

fn default_failure_retry() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_telemetry_timeout() -> Duration {
    Duration::from_secs(45)
}

fn default_submit_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_client_id() -> String {
    "printer_keepalive".to_owned()
}

fn default_root_topic() -> String {
    "printer_keepalive".to_owned()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_owned()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_filter() -> String {
    "info".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_laser_from_model_text() {
        assert_eq!(PrinterClass::guess("Brother HL-L2350DW series"), PrinterClass::Laser);
        assert_eq!(PrinterClass::guess("Canon imageCLASS MF743C"), PrinterClass::Laser);
        assert_eq!(PrinterClass::guess("EPSON ET-3850 Series"), PrinterClass::Inkjet);
        assert_eq!(PrinterClass::guess(""), PrinterClass::Inkjet);
    }

    #[test]
    fn class_defaults_match_maintenance_guidance() {
        assert_eq!(PrinterClass::Inkjet.default_cadence(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(PrinterClass::Laser.default_cadence(), Duration::from_secs(30 * 24 * 3600));
    }
}

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

use super::models::{Discovery, Ipp, PrinterClass, PrinterSettings, Scheduler, Settings, DEFAULT_TEMPLATE, MAX_CADENCE, MIN_CADENCE, TEMPLATES};
use super::uri::{normalize_printer_uri, printer_slug};

/// A configured printer after validation, normalization and runtime overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterConfig {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub class: PrinterClass,
    #[serde(with = "humantime_serde")]
    pub cadence: Duration,
    pub enabled: bool,
    pub secure: bool,
    pub template: String,
}

impl PrinterConfig {
    pub fn cadence_hours(&self) -> u64 {
        self.cadence.as_secs() / 3600
    }
}

/// One consistent view of the configuration. Never mutated once published.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub generation: u64,
    pub printers: Vec<PrinterConfig>,
    pub scheduler: Scheduler,
    pub discovery: Discovery,
    pub ipp: Ipp,
}

impl ConfigSnapshot {
    pub fn printer(&self, printer_id: &str) -> Option<&PrinterConfig> {
        self.printers.iter().find(|printer| printer.id == printer_id)
    }

    pub fn printer_ids(&self) -> HashSet<&str> {
        self.printers.iter().map(|printer| printer.id.as_str()).collect()
    }
}

/// Runtime adjustments made through the bridge. They outlive restarts and reloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub cadence: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrinterPatch {
    Enabled(bool),
    Cadence(Duration),
    Template(String),
}

struct StoreState {
    settings: Arc<Settings>,
    overrides: BTreeMap<String, PrinterOverride>,
    current: Arc<ConfigSnapshot>,
}

/// Holds the live configuration and swaps it atomically on reload or patch.
pub struct ConfigStore {
    state: RwLock<StoreState>,
    overrides_path: PathBuf,
}

impl ConfigStore {
    pub fn open(settings: Settings) -> Result<Self, ConfigError> {
        let overrides_path = settings.data_dir.join("overrides.json");
        let overrides = load_overrides(&overrides_path);
        let settings = Arc::new(settings);
        let current = Arc::new(build_snapshot(&settings, &overrides, 1)?);

        Ok(Self {
            state: RwLock::new(StoreState { settings, overrides, current }),
            overrides_path,
        })
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).current.clone()
    }

    /// Applies a runtime patch for one printer and publishes a new snapshot.
    pub fn apply(&self, printer_id: &str, patch: PrinterPatch) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        ensure!(state.current.printer(printer_id).is_some(), UnknownPrinterSnafu { printer_id });

        let mut overrides = state.overrides.clone();
        let entry = overrides.entry(printer_id.to_owned()).or_default();
        match patch {
            PrinterPatch::Enabled(enabled) => entry.enabled = Some(enabled),
            PrinterPatch::Cadence(cadence) => entry.cadence = Some(cadence.clamp(MIN_CADENCE, MAX_CADENCE)),
            PrinterPatch::Template(template) => {
                let template = template.trim().to_lowercase();
                ensure!(
                    TEMPLATES.contains(&template.as_str()),
                    InvalidSettingSnafu { key: "template", message: format!("unsupported template '{template}'") }
                );
                entry.template = Some(template);
            },
        }

        let next = Arc::new(build_snapshot(&state.settings, &overrides, state.current.generation + 1)?);
        if let Err(e) = save_overrides(&self.overrides_path, &overrides) {
            warn!("Could not persist printer overrides to {:?}: {}", self.overrides_path, e);
        }
        state.overrides = overrides;
        state.current = next.clone();
        Ok(next)
    }

    /// Replaces the base settings. On error the previous snapshot stays authoritative.
    pub fn reload(&self, settings: Settings) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let settings = Arc::new(settings);
        let next = Arc::new(build_snapshot(&settings, &state.overrides, state.current.generation + 1)?);

        let known = next.printer_ids().into_iter().map(str::to_owned).collect::<HashSet<_>>();
        let before = state.overrides.len();
        state.overrides.retain(|id, _| known.contains(id));
        if state.overrides.len() != before {
            if let Err(e) = save_overrides(&self.overrides_path, &state.overrides) {
                warn!("Could not persist printer overrides to {:?}: {}", self.overrides_path, e);
            }
        }

        info!("Configuration reloaded, {} printer(s) configured.", next.printers.len());
        state.settings = settings;
        state.current = next.clone();
        Ok(next)
    }
}

fn build_snapshot(settings: &Settings, overrides: &BTreeMap<String, PrinterOverride>, generation: u64) -> Result<ConfigSnapshot, ConfigError> {
    for (key, value) in [
        ("scheduler.telemetry_timeout", settings.scheduler.telemetry_timeout),
        ("scheduler.submit_timeout", settings.scheduler.submit_timeout),
        ("discovery.timeout", settings.discovery.timeout),
    ] {
        ensure!(!value.is_zero(), InvalidSettingSnafu { key, message: "must be longer than zero" });
    }

    Ok(ConfigSnapshot {
        generation,
        printers: build_printers(&settings.printers, overrides)?,
        scheduler: settings.scheduler.clone(),
        discovery: settings.discovery.clone(),
        ipp: settings.ipp.clone(),
    })
}

fn build_printers(entries: &[PrinterSettings], overrides: &BTreeMap<String, PrinterOverride>) -> Result<Vec<PrinterConfig>, ConfigError> {
    let mut seen = HashSet::new();
    let mut printers = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let uri = normalize_printer_uri(&entry.uri, entry.secure)
            .map_err(|e| ConfigError::InvalidPrinter { printer: entry.name.clone(), message: e.to_string() })?;
        if entry.uri.trim() != uri {
            info!("Normalized printer URI for {}: '{}' -> '{}'", entry.name, entry.uri.trim(), uri);
        }

        let mut id = printer_slug(entry.id.as_deref().unwrap_or(&entry.name));
        if seen.contains(&id) {
            let mut suffix = index + 1;
            let mut unique = format!("{}_{}", id, suffix);
            while seen.contains(&unique) {
                suffix += 1;
                unique = format!("{}_{}", id, suffix);
            }
            warn!("Duplicate printer id '{}', using '{}' instead.", id, unique);
            id = unique;
        }
        seen.insert(id.clone());

        let patch = overrides.get(&id).cloned().unwrap_or_default();
        let cadence = patch.cadence.or(entry.cadence).unwrap_or_else(|| entry.class.default_cadence());
        ensure!(
            !cadence.is_zero(),
            InvalidPrinterSnafu { printer: entry.name.clone(), message: "cadence must be longer than zero" }
        );

        let template = patch.template.or_else(|| entry.template.clone()).unwrap_or_else(|| DEFAULT_TEMPLATE.to_owned()).to_lowercase();
        ensure!(
            TEMPLATES.contains(&template.as_str()),
            InvalidPrinterSnafu { printer: entry.name.clone(), message: format!("unsupported template '{template}'") }
        );

        printers.push(PrinterConfig {
            secure: uri.starts_with("ipps://"),
            id,
            name: entry.name.clone(),
            uri,
            class: entry.class,
            cadence,
            enabled: patch.enabled.unwrap_or(entry.enabled),
            template,
        });
    }

    Ok(printers)
}

fn load_overrides(path: &Path) -> BTreeMap<String, PrinterOverride> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring unreadable printer overrides in {:?}: {}", path, e);
            BTreeMap::new()
        }),
        Err(_) => BTreeMap::new(),
    }
}

fn save_overrides(path: &Path, overrides: &BTreeMap<String, PrinterOverride>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_vec_pretty(overrides)?;
    std::fs::write(path, raw)
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Could not load configuration"))]
    Load { source: config::ConfigError },

    #[snafu(display("Invalid printer '{printer}': {message}"))]
    InvalidPrinter { printer: String, message: String },

    #[snafu(display("Invalid setting '{key}': {message}"))]
    InvalidSetting { key: String, message: String },

    #[snafu(display("Unknown printer '{printer_id}'"))]
    UnknownPrinter { printer_id: String },

    #[snafu(display("Invalid printer URI '{uri}'"))]
    InvalidUri { uri: String, source: url::ParseError },

    #[snafu(display("Printer URI '{uri}' has no host"))]
    MissingHost { uri: String },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::schedule::Period;
    use crate::config::models::{HomeAssistant, Mqtt};

    pub(crate) fn printer_settings(name: &str, uri: &str) -> PrinterSettings {
        PrinterSettings {
            id: None,
            name: name.to_owned(),
            uri: uri.to_owned(),
            class: PrinterClass::Inkjet,
            cadence: None,
            enabled: true,
            secure: false,
            template: None,
        }
    }

    pub(crate) fn settings(data_dir: &Path, printers: Vec<PrinterSettings>) -> Settings {
        Settings {
            printers,
            scheduler: Scheduler {
                tick: Period::Every(Duration::from_secs(60)),
                auto_print: true,
                failure_retry: Duration::from_secs(3600),
                telemetry_timeout: Duration::from_secs(5),
                submit_timeout: Duration::from_secs(5),
            },
            discovery: Discovery {
                enabled: false,
                period: Period::Every(Duration::from_secs(3600)),
                timeout: Duration::from_secs(2),
                include_ipps: true,
                candidates: Vec::new(),
            },
            ipp: Ipp { ignore_tls_errors: false },
            mqtt: Mqtt {
                enabled: false,
                host: "localhost".to_owned(),
                port: 1883,
                secure: false,
                ignore_tls_errors: false,
                username: String::new(),
                password: String::new(),
                client_id: "printer_keepalive".to_owned(),
                root_topic: "printer_keepalive".to_owned(),
                retain: true,
                ha: HomeAssistant {
                    enable_discovery: true,
                    discovery_topic_prefix: "homeassistant".to_owned(),
                    component_id: "printer_keepalive".to_owned(),
                },
            },
            data_dir: data_dir.to_path_buf(),
            log_filter: "info".to_owned(),
            sentry_dsn: None,
        }
    }

    #[test]
    fn builds_printers_with_class_defaults_and_unique_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut laser = printer_settings("Office", "10.0.0.2");
        laser.class = PrinterClass::Laser;
        let store = ConfigStore::open(settings(dir.path(), vec![printer_settings("Office", "10.0.0.1"), laser])).unwrap();

        let snapshot = store.current();
        assert_eq!(snapshot.printers[0].id, "office");
        assert_eq!(snapshot.printers[0].cadence, PrinterClass::Inkjet.default_cadence());
        assert_eq!(snapshot.printers[1].id, "office_2");
        assert_eq!(snapshot.printers[1].cadence, PrinterClass::Laser.default_cadence());
        assert_eq!(snapshot.printers[1].uri, "ipp://10.0.0.2/ipp/print");
    }

    #[test]
    fn duplicate_suffix_skips_ids_already_taken() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(settings(dir.path(), vec![
            printer_settings("Office 3", "10.0.0.1"),
            printer_settings("Office", "10.0.0.2"),
            printer_settings("Office", "10.0.0.3"),
        ]))
        .unwrap();

        let snapshot = store.current();
        let ids: Vec<&str> = snapshot.printers.iter().map(|printer| printer.id.as_str()).collect();
        assert_eq!(ids, vec!["office_3", "office", "office_4"]);
        assert_eq!(snapshot.printer_ids().len(), 3);
    }

    #[test]
    fn apply_swaps_snapshot_and_persists_override() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(settings(dir.path(), vec![printer_settings("Office", "10.0.0.1")])).unwrap();
        let before = store.current();

        let after = store.apply("office", PrinterPatch::Cadence(Duration::from_secs(10_000 * 3600))).unwrap();
        assert_eq!(after.printers[0].cadence, MAX_CADENCE);
        assert_eq!(before.printers[0].cadence, PrinterClass::Inkjet.default_cadence());
        assert!(after.generation > before.generation);

        // A fresh store picks the override back up.
        let reopened = ConfigStore::open(settings(dir.path(), vec![printer_settings("Office", "10.0.0.1")])).unwrap();
        assert_eq!(reopened.current().printers[0].cadence, MAX_CADENCE);
    }

    #[test]
    fn invalid_patch_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(settings(dir.path(), vec![printer_settings("Office", "10.0.0.1")])).unwrap();

        assert!(store.apply("office", PrinterPatch::Template("poster".to_owned())).is_err());
        assert!(matches!(store.apply("nope", PrinterPatch::Enabled(false)), Err(ConfigError::UnknownPrinter { .. })));
        assert_eq!(store.current().generation, 1);
    }

    #[test]
    fn invalid_reload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(settings(dir.path(), vec![printer_settings("Office", "10.0.0.1")])).unwrap();

        assert!(store.reload(settings(dir.path(), vec![printer_settings("Broken", "")])).is_err());
        assert_eq!(store.current().printers[0].id, "office");

        let next = store.reload(settings(dir.path(), vec![printer_settings("Lab", "10.0.0.9")])).unwrap();
        assert_eq!(next.printers.len(), 1);
        assert_eq!(next.printers[0].id, "lab");
    }
}

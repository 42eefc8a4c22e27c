//! Operations shared by the scheduler, the MQTT bridge and the command line.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, info, warn};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::watch;

use crate::config::{models::Settings, ConfigError, ConfigSnapshot, ConfigStore, PrinterConfig, PrinterPatch};
use crate::discovery::{DiscoveredPrinter, DiscoveryError, DiscoveryScanner};
use crate::ipp_client::{IppDevice, JobSubmitter, TelemetryError, TelemetrySnapshot, TelemetrySource};
use crate::keepalive::{
    render::Renderer,
    tracker::{reconcile, Activity},
    ExecuteError, Execution, Executor, Trigger,
};
use crate::mqtt_client::models::ConnectionState;
use crate::state::{store::PollFailure, HealthReport, PrinterHealth, StateStore};

/// The pluggable pieces of the service.
pub struct Collaborators {
    pub telemetry: Arc<dyn TelemetrySource>,
    pub submitter: Arc<dyn JobSubmitter>,
    pub renderer: Arc<dyn Renderer>,
    pub scanner: Arc<dyn DiscoveryScanner>,
    pub device: IppDevice,
}

pub struct Service {
    config: Arc<ConfigStore>,
    state: Arc<StateStore>,
    executor: Executor,
    telemetry: Arc<dyn TelemetrySource>,
    scanner: Arc<dyn DiscoveryScanner>,
    device: IppDevice,
    bridge: watch::Receiver<ConnectionState>,
}

impl Service {
    pub fn new(config: Arc<ConfigStore>, state: Arc<StateStore>, collaborators: Collaborators, bridge: watch::Receiver<ConnectionState>) -> Self {
        state.sync_printers(&config.current(), Utc::now());
        let executor = Executor::new(config.clone(), state.clone(), collaborators.submitter, collaborators.renderer);
        Self {
            config,
            state,
            executor,
            telemetry: collaborators.telemetry,
            scanner: collaborators.scanner,
            device: collaborators.device,
            bridge,
        }
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    fn printer(&self, printer_id: &str) -> Result<PrinterConfig, ServiceError> {
        self.config.current().printer(printer_id).cloned().context(UnknownPrinterSnafu { printer_id })
    }

    /// Fetches telemetry, bounded by `timeout` even if the source misbehaves.
    pub async fn fetch(&self, printer: &PrinterConfig, timeout: Duration) -> Result<TelemetrySnapshot, TelemetryError> {
        match tokio::time::timeout(timeout, self.telemetry.fetch(printer, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TelemetryError::Unreachable {
                uri: printer.uri.clone(),
                message: format!("no telemetry within {}", humantime::format_duration(timeout)),
            }),
        }
    }

    /// Folds a poll result into the printer's state. Failed polls keep the
    /// last good telemetry and never touch the print record.
    pub fn record_telemetry(&self, printer_id: &str, result: Result<TelemetrySnapshot, TelemetryError>) -> Option<Activity> {
        match result {
            Ok(snapshot) => self.state.update(printer_id, |runtime| {
                // Concurrent polls may finish out of order. An older snapshot would read as a counter reset.
                if runtime.telemetry.as_ref().is_some_and(|cached| cached.fetched_at > snapshot.fetched_at) {
                    debug!("Dropping stale telemetry for {} fetched at {}", printer_id, snapshot.fetched_at);
                    return Activity::Unchanged;
                }
                let (record, activity) = reconcile(&runtime.record, Some(&snapshot), None);
                runtime.record = record;
                runtime.telemetry = Some(snapshot);
                runtime.poll_failure = None;
                activity
            }),
            Err(e) => {
                warn!("Polling {} failed: {}", printer_id, e);
                self.state.update(printer_id, |runtime| {
                    runtime.poll_failure = Some(PollFailure { kind: e.kind(), message: e.to_string(), at: Utc::now() });
                    Activity::Unchanged
                })
            },
        }
    }

    pub async fn poll_now(&self, printer_id: &str) -> Result<PrinterHealth, ServiceError> {
        let snapshot = self.config.current();
        let printer = snapshot.printer(printer_id).context(UnknownPrinterSnafu { printer_id })?;
        let result = self.fetch(printer, snapshot.scheduler.telemetry_timeout).await;
        let failed = result.as_ref().err().map(ToString::to_string);

        let activity = self.record_telemetry(printer_id, result);
        log_activity(printer_id, activity);
        if matches!(activity, Some(activity) if activity != Activity::Unchanged) {
            self.state.persist_or_degrade().await;
        }
        if let Some(message) = failed {
            return PollSnafu { printer_id, message }.fail();
        }
        self.printer_health(printer_id).context(UnknownPrinterSnafu { printer_id })
    }

    pub async fn force_print(&self, printer_id: &str, trigger: Trigger) -> Result<Execution, ExecuteError> {
        self.executor.execute(printer_id, trigger, true).await
    }

    pub async fn print_if_due(&self, printer_id: &str, trigger: Trigger) -> Result<Execution, ExecuteError> {
        self.executor.execute(printer_id, trigger, false).await
    }

    pub fn apply(&self, printer_id: &str, patch: PrinterPatch) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        info!("Applying {:?} to {}", patch, printer_id);
        let snapshot = self.config.apply(printer_id, patch)?;
        self.state.touch(printer_id);
        Ok(snapshot)
    }

    pub fn reload(&self, settings: Settings) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let snapshot = self.config.reload(settings)?;
        self.state.sync_printers(&snapshot, Utc::now());
        for printer in &snapshot.printers {
            self.state.touch(&printer.id);
        }
        info!("Configuration reloaded, generation {} with {} printer(s)", snapshot.generation, snapshot.printers.len());
        Ok(snapshot)
    }

    pub fn printer_health(&self, printer_id: &str) -> Option<PrinterHealth> {
        let snapshot = self.config.current();
        let printer = snapshot.printer(printer_id)?;
        let runtime = self.state.printer(printer_id)?;
        let discovered = self.state.discovery().match_for(&snapshot, printer_id);
        Some(PrinterHealth::build(printer, &runtime, discovered.as_ref()))
    }

    pub fn health(&self) -> HealthReport {
        let snapshot = self.config.current();
        let runtimes = self.state.printers();
        let discovery = self.state.discovery();

        let printers = snapshot
            .printers
            .iter()
            .filter_map(|printer| {
                let runtime = runtimes.get(&printer.id)?;
                let discovered = discovery.match_for(&snapshot, &printer.id);
                Some(PrinterHealth::build(printer, runtime, discovered.as_ref()))
            })
            .collect();

        HealthReport {
            generated_at: Utc::now(),
            config_generation: snapshot.generation,
            bridge: *self.bridge.borrow(),
            printers,
            discovery: discovery.summary(&snapshot),
        }
    }

    /// Runs one discovery scan. A failed scan keeps the previous results.
    pub async fn discover(&self) -> Result<Vec<DiscoveredPrinter>, DiscoveryError> {
        let snapshot = self.config.current();
        let timeout = snapshot.discovery.timeout;
        // Probes run in parallel, so one timeout plus slack bounds the scan.
        let bound = timeout.saturating_mul(2) + Duration::from_secs(1);

        let scanned = match tokio::time::timeout(bound, self.scanner.scan(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::TimedOut { after: bound }),
        };

        match scanned {
            Ok(entries) => {
                debug!("Discovery returned {} advertisement(s)", entries.len());
                self.state.update_discovery(|cache| cache.merge(entries, Utc::now()));
                Ok(self.state.discovery().printers(&snapshot))
            },
            Err(e) => {
                warn!("Discovery refresh failed, keeping previous results: {}", e);
                self.state.update_discovery(|cache| cache.record_failure(e.to_string(), Utc::now()));
                Err(e)
            },
        }
    }

    pub async fn dump(&self, printer_id: &str) -> Result<BTreeMap<String, String>, ServiceError> {
        let snapshot = self.config.current();
        let printer = self.printer(printer_id)?;
        self.device
            .dump_attributes(&printer.uri, snapshot.scheduler.telemetry_timeout)
            .await
            .context(TelemetrySnafu { printer_id })
    }
}

pub fn log_activity(printer_id: &str, activity: Option<Activity>) {
    match activity {
        Some(Activity::External { delta }) => info!("Detected {} external impression(s) on {}", delta, printer_id),
        Some(Activity::Reanchored { previous, current }) => {
            warn!("Job counter of {} went from {} to {}, treating it as a device reset", printer_id, previous, current)
        },
        Some(Activity::BaselineSet { counter }) => debug!("Job counter baseline for {} set to {}", printer_id, counter),
        _ => {},
    }
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum ServiceError {
    #[snafu(display("Unknown printer '{printer_id}'"))]
    UnknownPrinter { printer_id: String },

    #[snafu(display("Polling {printer_id} failed: {message}"))]
    Poll { printer_id: String, message: String },

    #[snafu(display("Could not read attributes of {printer_id}"))]
    Telemetry { printer_id: String, source: TelemetryError },
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::config::store::tests::{printer_settings, settings};
    use crate::discovery::{merge::tests::entry, models::DiscoveryEntry, Protocol};
    use crate::keepalive::executor::tests::FakeSubmitter;
    use crate::keepalive::render::ColorBarsRenderer;
    use crate::keepalive::tracker::{tests::snapshot, PrintSource};
    use crate::state::health::HealthStatus;

    /// Serves queued poll results per printer; an empty queue is unreachable.
    #[derive(Default)]
    pub(crate) struct FakeTelemetry {
        pub(crate) results: Mutex<BTreeMap<String, Vec<Result<TelemetrySnapshot, TelemetryError>>>>,
        pub(crate) hanging: Mutex<HashSet<String>>,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeTelemetry {
        pub(crate) fn push(&self, printer_id: &str, result: Result<TelemetrySnapshot, TelemetryError>) {
            self.results.lock().unwrap().entry(printer_id.to_owned()).or_default().push(result);
        }

        /// Makes every fetch for `printer_id` stall forever.
        pub(crate) fn hang(&self, printer_id: &str) {
            self.hanging.lock().unwrap().insert(printer_id.to_owned());
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TelemetrySource for FakeTelemetry {
        async fn fetch(&self, printer: &PrinterConfig, _timeout: Duration) -> Result<TelemetrySnapshot, TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let hangs = self.hanging.lock().unwrap().contains(&printer.id);
            if hangs {
                std::future::pending::<()>().await;
            }

            let mut results = self.results.lock().unwrap();
            match results.get_mut(&printer.id).filter(|queue| !queue.is_empty()) {
                Some(queue) => queue.remove(0),
                None => Err(TelemetryError::Unreachable { uri: printer.uri.clone(), message: "no route to host".to_owned() }),
            }
        }
    }

    pub(crate) struct FakeScanner {
        pub(crate) entries: Option<Vec<DiscoveryEntry>>,
    }

    #[async_trait]
    impl DiscoveryScanner for FakeScanner {
        async fn scan(&self, _timeout: Duration) -> Result<Vec<DiscoveryEntry>, DiscoveryError> {
            self.entries.clone().ok_or(DiscoveryError::NothingReachable { attempted: 1 })
        }
    }

    pub(crate) struct Harness {
        pub(crate) _dir: tempfile::TempDir,
        pub(crate) service: Arc<Service>,
        pub(crate) telemetry: Arc<FakeTelemetry>,
        pub(crate) submitter: Arc<FakeSubmitter>,
    }

    pub(crate) fn harness_from(
        names: &[(&str, &str)],
        scanner: Arc<dyn DiscoveryScanner>,
        adjust: impl FnOnce(&mut Settings),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let printers = names.iter().map(|(name, uri)| printer_settings(name, uri)).collect();
        let mut settings = settings(dir.path(), printers);
        adjust(&mut settings);
        let config = Arc::new(ConfigStore::open(settings).unwrap());
        let state = Arc::new(StateStore::open(dir.path()).unwrap());
        let telemetry = Arc::new(FakeTelemetry::default());
        let submitter = Arc::new(FakeSubmitter::default());
        let collaborators = Collaborators {
            telemetry: telemetry.clone(),
            submitter: submitter.clone(),
            renderer: Arc::new(ColorBarsRenderer),
            scanner,
            device: IppDevice::new(true),
        };
        let (_, bridge) = watch::channel(ConnectionState::Disabled);
        let service = Arc::new(Service::new(config, state, collaborators, bridge));
        Harness { _dir: dir, service, telemetry, submitter }
    }

    pub(crate) fn harness_with(names: &[(&str, &str)], scanned: Option<Vec<DiscoveryEntry>>) -> Harness {
        harness_from(names, Arc::new(FakeScanner { entries: scanned }), |_| {})
    }

    pub(crate) fn harness() -> Harness {
        harness_with(&[("Office", "10.0.0.1")], Some(Vec::new()))
    }

    #[tokio::test]
    async fn poll_reconciles_external_activity() {
        let harness = harness();
        harness.telemetry.push("office", Ok(snapshot(Some(10), Utc::now())));
        let later = Utc::now();
        harness.telemetry.push("office", Ok(snapshot(Some(13), later)));

        harness.service.poll_now("office").await.unwrap();
        let health = harness.service.poll_now("office").await.unwrap();
        assert_eq!(health.last_print_source, PrintSource::External);
        assert_eq!(health.last_print, later);
        assert_eq!(health.external_count, 3);
        assert_eq!(health.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn out_of_order_telemetry_is_not_a_reset() {
        let harness = harness();
        let service = &harness.service;
        let start = Utc::now() - chrono::Duration::minutes(5);
        let newer = start + chrono::Duration::minutes(1);

        service.record_telemetry("office", Ok(snapshot(Some(10), start)));
        assert_eq!(service.record_telemetry("office", Ok(snapshot(Some(12), newer))), Some(Activity::External { delta: 2 }));
        assert_eq!(
            service.record_telemetry("office", Ok(snapshot(Some(10), newer - chrono::Duration::seconds(5)))),
            Some(Activity::Unchanged)
        );
        assert_eq!(service.record_telemetry("office", Ok(snapshot(Some(12), Utc::now()))), Some(Activity::Unchanged));

        let runtime = service.state().printer("office").unwrap();
        assert_eq!(runtime.record.source, PrintSource::External);
        assert_eq!(runtime.record.external_count, 2);
        assert_eq!(runtime.telemetry.unwrap().job_counter, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_source_is_cut_off_as_unreachable() {
        let harness = harness();
        harness.telemetry.hang("office");
        let printer = harness.service.config().current().printer("office").cloned().unwrap();

        let started = tokio::time::Instant::now();
        let result = harness.service.fetch(&printer, Duration::from_secs(3)).await;
        assert!(matches!(result, Err(TelemetryError::Unreachable { .. })));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn failed_poll_keeps_last_good_telemetry() {
        let harness = harness();
        harness.telemetry.push("office", Ok(snapshot(Some(10), Utc::now())));
        harness.service.poll_now("office").await.unwrap();

        assert!(matches!(harness.service.poll_now("office").await, Err(ServiceError::Poll { .. })));
        let health = harness.service.printer_health("office").unwrap();
        assert_eq!(health.health, HealthStatus::Unreachable);
        assert_eq!(health.telemetry.unwrap().job_counter, Some(10));
    }

    #[tokio::test]
    async fn apply_is_visible_in_health() {
        let harness = harness();
        harness.service.apply("office", PrinterPatch::Enabled(false)).unwrap();
        assert!(!harness.service.printer_health("office").unwrap().enabled);

        let report = harness.service.health();
        assert_eq!(report.printers.len(), 1);
        assert_eq!(report.bridge, ConnectionState::Disabled);
    }

    #[tokio::test]
    async fn force_print_reaches_the_submitter() {
        let harness = harness();
        let execution = harness.service.force_print("office", Trigger::Api).await.unwrap();
        assert!(matches!(execution, Execution::Submitted { .. }));
        assert_eq!(harness.submitter.submitted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_marks_configured_printers() {
        let now = Utc::now();
        let harness = harness_with(&[("Office", "10.0.0.1")], Some(vec![
            entry(Protocol::Ipp, "10.0.0.1", "/ipp/print", now),
            entry(Protocol::Ipps, "10.0.0.1", "/ipp/print", now),
            entry(Protocol::Ipp, "10.0.0.2", "/ipp/print", now),
        ]));

        let found = harness.service.discover().await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].already_configured);
        assert!(!found[1].already_configured);

        let discovery = harness.service.printer_health("office").unwrap().discovery.unwrap();
        assert_eq!(discovery.uri, "ipps://10.0.0.1/ipp/print");
    }

    #[tokio::test]
    async fn failed_discovery_is_reported() {
        let harness = harness_with(&[("Office", "10.0.0.1")], None);
        assert!(harness.service.discover().await.is_err());
        assert!(harness.service.health().discovery.last_error.is_some());
    }
}

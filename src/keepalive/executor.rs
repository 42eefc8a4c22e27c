use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use log::{info, warn};
use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::config::ConfigStore;
use crate::ipp_client::{DeviceState, JobSubmitter, SubmitError};
use crate::state::{AttemptResult, KeepaliveStatus, StateStore};

use super::context::{PrintContext, Trigger};
use super::due::{is_due, next_due, DueReason};
use super::render::{RenderError, Renderer};
use super::tracker::{reconcile, Submission};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotDue,
    Disabled,
    DeviceBusy,
    FailureCooldown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Execution {
    Submitted {
        printer_id: String,
        job_id: Option<i32>,
        at: DateTime<Utc>,
        reason: String,
        persisted: bool,
    },
    Skipped {
        printer_id: String,
        reason: SkipReason,
    },
}

/// Releases the in-flight slot for a printer when dropped.
struct InFlight<'a> {
    set: &'a DashMap<String, ()>,
    printer_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.printer_id);
    }
}

/// Renders and submits keepalive jobs, one at a time per printer.
pub struct Executor {
    config: Arc<ConfigStore>,
    state: Arc<StateStore>,
    submitter: Arc<dyn JobSubmitter>,
    renderer: Arc<dyn Renderer>,
    in_flight: DashMap<String, ()>,
}

impl Executor {
    pub fn new(config: Arc<ConfigStore>, state: Arc<StateStore>, submitter: Arc<dyn JobSubmitter>, renderer: Arc<dyn Renderer>) -> Self {
        Self { config, state, submitter, renderer, in_flight: DashMap::new() }
    }

    fn claim(&self, printer_id: &str) -> Option<InFlight<'_>> {
        match self.in_flight.entry(printer_id.to_owned()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlight { set: &self.in_flight, printer_id: printer_id.to_owned() })
            },
        }
    }

    #[cfg(test)]
    pub fn is_busy(&self, printer_id: &str) -> bool {
        self.in_flight.contains_key(printer_id)
    }

    pub async fn execute(&self, printer_id: &str, trigger: Trigger, forced: bool) -> Result<Execution, ExecuteError> {
        let _guard = self.claim(printer_id).context(BusySnafu { printer_id })?;

        let snapshot = self.config.current();
        let printer = snapshot.printer(printer_id).context(UnknownPrinterSnafu { printer_id })?.clone();
        let runtime = self.state.printer(printer_id).context(UnknownPrinterSnafu { printer_id })?;
        let now = Utc::now();

        let decision = is_due(&runtime.record, &printer, now, forced);
        if !forced {
            let skip = match decision.reason {
                DueReason::Disabled => Some(SkipReason::Disabled),
                _ if !decision.due => Some(SkipReason::NotDue),
                _ if runtime.telemetry.as_ref().is_some_and(|t| t.state == DeviceState::Processing) => Some(SkipReason::DeviceBusy),
                _ if in_cooldown(&runtime.keepalive, snapshot.scheduler.failure_retry, now) => Some(SkipReason::FailureCooldown),
                _ => None,
            };
            if let Some(reason) = skip {
                info!("Skipping keepalive for {}: {:?}", printer_id, reason);
                return Ok(Execution::Skipped { printer_id: printer_id.to_owned(), reason });
            }
        }

        let context = PrintContext::new(trigger, forced, printer.cadence, now, runtime.record.last_print, next_due(&runtime.record, &printer));
        let document = match self.renderer.render(&printer.template, &printer, &context) {
            Ok(document) => document,
            Err(e) => {
                self.record_failure(printer_id, now, forced, e.to_string()).await;
                return Err(e).context(RenderSnafu { printer_id });
            },
        };

        let job_name = format!("Printer keepalive ({})", printer.name);
        info!("Submitting keepalive to {} ({}): {}", printer_id, trigger, context.reason);
        let submitted = self.submitter.submit(&printer, &job_name, document, snapshot.scheduler.submit_timeout).await;

        let job = match submitted {
            Ok(job) => job,
            Err(e) => {
                warn!("Keepalive for {} failed: {}", printer_id, e);
                self.record_failure(printer_id, now, forced, e.to_string()).await;
                return Err(e).context(SubmissionFailedSnafu { printer_id });
            },
        };

        let at = Utc::now();
        self.state.update(printer_id, |runtime| {
            let submission = Submission { at, counter: runtime.telemetry.as_ref().and_then(|t| t.job_counter) };
            let (record, _) = reconcile(&runtime.record, None, Some(&submission));
            runtime.record = record;
            runtime.keepalive.last_attempt_at = Some(at);
            runtime.keepalive.last_result = AttemptResult::Success;
            runtime.keepalive.last_error = None;
            runtime.keepalive.last_failure_automatic = false;
        });
        let persisted = self.state.persist_or_degrade().await;
        info!("Keepalive submitted to {} (job {:?})", printer_id, job.job_id);

        Ok(Execution::Submitted { printer_id: printer_id.to_owned(), job_id: job.job_id, at, reason: context.reason, persisted })
    }

    async fn record_failure(&self, printer_id: &str, at: DateTime<Utc>, forced: bool, message: String) {
        self.state.update(printer_id, |runtime| {
            runtime.keepalive.last_attempt_at = Some(at);
            runtime.keepalive.last_result = AttemptResult::Failed;
            runtime.keepalive.last_error = Some(message);
            runtime.keepalive.last_failure_automatic = !forced;
        });
        self.state.persist_or_degrade().await;
    }
}

fn in_cooldown(status: &KeepaliveStatus, retry: Duration, now: DateTime<Utc>) -> bool {
    if status.last_result != AttemptResult::Failed || !status.last_failure_automatic {
        return false;
    }
    let retry = TimeDelta::from_std(retry).unwrap_or(TimeDelta::MAX);
    status.last_attempt_at.is_some_and(|at| now.signed_duration_since(at) < retry)
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum ExecuteError {
    #[snafu(display("A keepalive for {printer_id} is already in flight"))]
    Busy { printer_id: String },

    #[snafu(display("Unknown printer '{printer_id}'"))]
    UnknownPrinter { printer_id: String },

    #[snafu(display("Keepalive submission to {printer_id} failed"))]
    SubmissionFailed { printer_id: String, source: SubmitError },

    #[snafu(display("Could not render keepalive page for {printer_id}"))]
    Render { printer_id: String, source: RenderError },
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::store::tests::{printer_settings, settings};
    use crate::config::PrinterConfig;
    use crate::ipp_client::client::SubmittedJob;
    use crate::keepalive::render::{ColorBarsRenderer, RenderedDocument};
    use crate::keepalive::tracker::{tests::snapshot, PrintSource};

    /// Accepts every job, optionally holding each one until released.
    #[derive(Default)]
    pub(crate) struct FakeSubmitter {
        pub(crate) submitted: AtomicUsize,
        pub(crate) fail: bool,
        pub(crate) hold: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl JobSubmitter for FakeSubmitter {
        async fn submit(&self, printer: &PrinterConfig, _job_name: &str, _document: RenderedDocument, _timeout: Duration) -> Result<SubmittedJob, SubmitError> {
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if self.fail {
                return Err(SubmitError::Transport { printer_id: printer.id.clone(), message: "connection refused".to_owned() });
            }
            let n = self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(SubmittedJob { job_id: Some(n as i32 + 1) })
        }
    }

    pub(crate) struct Fixture {
        pub(crate) _dir: tempfile::TempDir,
        pub(crate) config: Arc<ConfigStore>,
        pub(crate) state: Arc<StateStore>,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::open(settings(dir.path(), vec![printer_settings("Office", "10.0.0.1")])).unwrap());
        let state = Arc::new(StateStore::open(dir.path()).unwrap());
        state.sync_printers(&config.current(), Utc::now());
        Fixture { _dir: dir, config, state }
    }

    fn executor(fixture: &Fixture, submitter: Arc<FakeSubmitter>) -> Arc<Executor> {
        Arc::new(Executor::new(fixture.config.clone(), fixture.state.clone(), submitter, Arc::new(ColorBarsRenderer)))
    }

    fn age(fixture: &Fixture, hours: i64) {
        fixture.state.update("office", |runtime| runtime.record.last_print = Utc::now() - ChronoDuration::hours(hours));
    }

    #[tokio::test]
    async fn submits_when_due_and_records_keepalive() {
        let fixture = fixture();
        age(&fixture, 200);
        fixture.state.update("office", |runtime| runtime.telemetry = Some(snapshot(Some(40), Utc::now())));
        let submitter = Arc::new(FakeSubmitter::default());

        let execution = executor(&fixture, submitter.clone()).execute("office", Trigger::Scheduler, false).await.unwrap();
        assert!(matches!(execution, Execution::Submitted { job_id: Some(1), persisted: true, .. }));

        let runtime = fixture.state.printer("office").unwrap();
        assert_eq!(runtime.record.source, PrintSource::Keepalive);
        assert_eq!(runtime.record.baseline_counter, Some(40));
        assert_eq!(runtime.record.keepalive_count, 1);
        assert_eq!(runtime.keepalive.last_result, AttemptResult::Success);
    }

    #[tokio::test]
    async fn skips_when_not_due_unless_forced() {
        let fixture = fixture();
        let submitter = Arc::new(FakeSubmitter::default());
        let executor = executor(&fixture, submitter.clone());

        let skipped = executor.execute("office", Trigger::Scheduler, false).await.unwrap();
        assert_eq!(skipped, Execution::Skipped { printer_id: "office".to_owned(), reason: SkipReason::NotDue });

        executor.execute("office", Trigger::Cli, true).await.unwrap();
        assert_eq!(submitter.submitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_while_device_is_processing() {
        let fixture = fixture();
        age(&fixture, 200);
        let mut busy = snapshot(Some(40), Utc::now());
        busy.state = DeviceState::Processing;
        fixture.state.update("office", |runtime| runtime.telemetry = Some(busy));

        let execution = executor(&fixture, Arc::new(FakeSubmitter::default())).execute("office", Trigger::Scheduler, false).await.unwrap();
        assert!(matches!(execution, Execution::Skipped { reason: SkipReason::DeviceBusy, .. }));
    }

    #[tokio::test]
    async fn failure_keeps_last_print_and_starts_cooldown() {
        let fixture = fixture();
        age(&fixture, 200);
        let before = fixture.state.printer("office").unwrap().record;
        let failing = executor(&fixture, Arc::new(FakeSubmitter { fail: true, ..FakeSubmitter::default() }));

        let error = failing.execute("office", Trigger::Scheduler, false).await.unwrap_err();
        assert!(matches!(error, ExecuteError::SubmissionFailed { .. }));

        let runtime = fixture.state.printer("office").unwrap();
        assert_eq!(runtime.record, before);
        assert_eq!(runtime.keepalive.last_result, AttemptResult::Failed);
        assert!(runtime.keepalive.last_error.is_some());

        let retry = executor(&fixture, Arc::new(FakeSubmitter::default())).execute("office", Trigger::Scheduler, false).await.unwrap();
        assert!(matches!(retry, Execution::Skipped { reason: SkipReason::FailureCooldown, .. }));
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_printer_are_busy() {
        let fixture = fixture();
        let hold = Arc::new(Notify::new());
        let submitter = Arc::new(FakeSubmitter { hold: Some(hold.clone()), ..FakeSubmitter::default() });
        let executor = executor(&fixture, submitter.clone());

        let first = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("office", Trigger::Mqtt, true).await }
        });
        while !executor.is_busy("office") {
            tokio::task::yield_now().await;
        }

        let second = executor.execute("office", Trigger::Cli, true).await;
        assert!(matches!(second, Err(ExecuteError::Busy { .. })));

        hold.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert!(!executor.is_busy("office"));
        assert_eq!(submitter.submitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_printer_is_rejected() {
        let fixture = fixture();
        let result = executor(&fixture, Arc::new(FakeSubmitter::default())).execute("garage", Trigger::Api, true).await;
        assert!(matches!(result, Err(ExecuteError::UnknownPrinter { .. })));
    }
}

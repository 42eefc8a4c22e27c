//! The automation loop.
//!
//! Every tick walks `Idle -> Polling -> Evaluating -> Executing -> Idle`:
//! telemetry of all enabled printers is fetched concurrently, folded into the
//! tracker, due printers are picked and their keepalives run concurrently.
//! Discovery refreshes on its own period.

use std::{sync::Arc, time::Duration};

use chrono::{Local, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{sync::watch, time::Instant};

use crate::config::schedule::Period;
use crate::ipp_client::{TelemetryError, TelemetrySnapshot};
use crate::keepalive::{due::is_due, tracker::Activity, ExecuteError, Execution, Trigger};
use crate::service::{log_activity, Service};

/// Used when a cron expression has no upcoming occurrence.
const FALLBACK_PERIOD: Duration = Duration::from_secs(15 * 60);
/// How often a disabled discovery checks whether a reload turned it on.
const DISCOVERY_RECHECK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPhase {
    Idle,
    Polling,
    Evaluating,
    Executing,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub polled: usize,
    pub poll_failures: usize,
    pub external_activity: Vec<String>,
    pub due: Vec<String>,
    pub submitted: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub suspended: Vec<String>,
}

pub struct Scheduler {
    service: Arc<Service>,
    phase: watch::Sender<TickPhase>,
}

impl Scheduler {
    pub fn new(service: Arc<Service>) -> Self {
        let (phase, _) = watch::channel(TickPhase::Idle);
        Self { service, phase }
    }

    #[cfg(test)]
    pub fn phase(&self) -> watch::Receiver<TickPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: TickPhase) {
        debug!("Tick phase {:?}", phase);
        self.phase.send_replace(phase);
    }

    pub async fn run_tick(&self) -> TickReport {
        let snapshot = self.service.config().current();
        let state = self.service.state();
        state.sync_printers(&snapshot, Utc::now());
        let mut report = TickReport::default();
        let enabled: Vec<_> = snapshot.printers.iter().filter(|printer| printer.enabled).collect();

        self.enter(TickPhase::Polling);
        let timeout = snapshot.scheduler.telemetry_timeout;
        let polls: Vec<Result<TelemetrySnapshot, TelemetryError>> =
            join_all(enabled.iter().map(|printer| self.service.fetch(printer, timeout))).await;

        self.enter(TickPhase::Evaluating);
        let mut records_changed = false;
        for (printer, result) in enabled.iter().zip(polls) {
            report.polled += 1;
            report.poll_failures += usize::from(result.is_err());
            let activity = self.service.record_telemetry(&printer.id, result);
            log_activity(&printer.id, activity);
            match activity {
                Some(Activity::External { .. }) => {
                    records_changed = true;
                    report.external_activity.push(printer.id.clone());
                },
                Some(Activity::Unchanged) | None => {},
                Some(_) => records_changed = true,
            }
        }
        if records_changed {
            state.persist_or_degrade().await;
        }

        let now = Utc::now();
        for printer in &enabled {
            let Some(runtime) = state.printer(&printer.id) else {
                continue;
            };
            if !is_due(&runtime.record, printer, now, false).due {
                continue;
            }
            report.due.push(printer.id.clone());
            if let Some(reason) = &runtime.degraded {
                warn!("{} is due but automation is suspended: {}", printer.id, reason);
                report.suspended.push(printer.id.clone());
            } else if !snapshot.scheduler.auto_print {
                info!("{} is due but automatic printing is turned off", printer.id);
                report.suspended.push(printer.id.clone());
            }
        }

        self.enter(TickPhase::Executing);
        let runnable: Vec<&String> = report.due.iter().filter(|id| !report.suspended.contains(id)).collect();
        let executions = join_all(runnable.iter().map(|id| self.service.print_if_due(id, Trigger::Scheduler))).await;

        for (printer_id, execution) in runnable.into_iter().zip(executions) {
            match execution {
                Ok(Execution::Submitted { .. }) => report.submitted.push(printer_id.clone()),
                Ok(Execution::Skipped { reason, .. }) => {
                    debug!("Keepalive for {} skipped: {:?}", printer_id, reason);
                    report.skipped.push(printer_id.clone());
                },
                Err(ExecuteError::Busy { .. }) => {
                    debug!("Keepalive for {} already running", printer_id);
                    report.skipped.push(printer_id.clone());
                },
                Err(e) => {
                    error!("Keepalive for {} failed: {}", printer_id, snafu::Report::from_error(e));
                    report.failed.push(printer_id.clone());
                },
            }
        }

        self.enter(TickPhase::Idle);
        info!(
            "Tick finished: {} polled ({} failed), {} due, {} submitted",
            report.polled,
            report.poll_failures,
            report.due.len(),
            report.submitted.len()
        );
        report
    }

    async fn refresh_discovery(&self) {
        match self.service.discover().await {
            Ok(printers) => info!("Discovery found {} printer(s)", printers.len()),
            Err(e) => debug!("Discovery refresh failed: {}", e),
        }
    }

    /// Runs ticks and discovery refreshes until `shutdown` flips. Both start
    /// immediately and follow their own periods, so a slow scan never holds back a tick.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tokio::join!(self.tick_loop(shutdown.clone()), self.discovery_loop(shutdown));
        info!("Scheduler stopped");
    }

    async fn tick_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut next_tick = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep_until(next_tick) => {},
            }

            self.run_tick().await;
            let period = self.service.config().current().scheduler.tick.clone();
            next_tick = Instant::now() + delay(&period);
            debug!("Next tick in {:?} ({})", next_tick - Instant::now(), period.describe());
        }
    }

    async fn discovery_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut next_scan = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep_until(next_scan) => {},
            }

            // Re-read every round, a reload may turn discovery on or off.
            let discovery = self.service.config().current().discovery.clone();
            if !discovery.enabled {
                next_scan = Instant::now() + DISCOVERY_RECHECK;
                continue;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.refresh_discovery() => {},
            }
            next_scan = Instant::now() + delay(&discovery.period);
        }
    }
}

fn delay(period: &Period) -> Duration {
    period.delay_from(Local::now()).unwrap_or_else(|e| {
        error!("{}, falling back to {:?}", e, FALLBACK_PERIOD);
        FALLBACK_PERIOD
    })
}

//! Shared runtime state.
//!
//! Every printer's tracker record, keepalive status and cached telemetry live
//! behind a single mutex together with the discovery cache. The lock is only
//! ever held inside the closures passed to [`StateStore::update`] and friends,
//! so no I/O happens under it and no call path can take it twice.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::ConfigSnapshot;
use crate::discovery::DiscoveryCache;
use crate::ipp_client::{TelemetryErrorKind, TelemetrySnapshot};
use crate::keepalive::tracker::PrintRecord;

use super::persistence::{self, PersistError, PersistedPrinter, PersistedState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    #[default]
    Never,
    Success,
    Failed,
}

/// Outcome of the most recent keepalive attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveStatus {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_result: AttemptResult,
    pub last_error: Option<String>,
    /// Whether the failed attempt was automatic. Only those start a retry cooldown.
    #[serde(default)]
    pub last_failure_automatic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollFailure {
    pub kind: TelemetryErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterRuntime {
    pub record: PrintRecord,
    pub keepalive: KeepaliveStatus,
    /// Last successful telemetry, kept across failed polls.
    pub telemetry: Option<TelemetrySnapshot>,
    pub poll_failure: Option<PollFailure>,
    /// Set while the state file cannot be written; automation is paused.
    pub degraded: Option<String>,
}

impl PrinterRuntime {
    fn fresh(record: PrintRecord, keepalive: KeepaliveStatus) -> Self {
        Self { record, keepalive, telemetry: None, poll_failure: None, degraded: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Printer(String),
    PrinterRemoved(String),
    Discovery,
}

struct StoreInner {
    printers: BTreeMap<String, PrinterRuntime>,
    discovery: DiscoveryCache,
}

pub struct StateStore {
    inner: Mutex<StoreInner>,
    path: PathBuf,
    persist_lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<StateChange>,
}

impl StateStore {
    /// Loads `state.json` from `data_dir`. Nothing is anchored until [`Self::sync_printers`].
    pub fn open(data_dir: &Path) -> Result<Self, PersistError> {
        let path = data_dir.join("state.json");
        let persisted = persistence::load(&path)?;
        info!("Loaded state for {} printer(s) from {:?}", persisted.printers.len(), path);

        let printers = persisted
            .printers
            .into_iter()
            .map(|(id, printer)| (id, PrinterRuntime::fresh(printer.record, printer.keepalive)))
            .collect();

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            inner: Mutex::new(StoreInner { printers, discovery: DiscoveryCache::default() }),
            path,
            persist_lock: tokio::sync::Mutex::new(()),
            changes,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: StateChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Anchors printers seen for the first time and drops state of printers no
    /// longer configured. Returns whether anything changed.
    pub fn sync_printers(&self, snapshot: &ConfigSnapshot, now: DateTime<Utc>) -> bool {
        let ids = snapshot.printer_ids();
        let (added, removed) = {
            let mut inner = self.lock();
            let removed: Vec<String> = inner.printers.keys().filter(|id| !ids.contains(id.as_str())).cloned().collect();
            for id in &removed {
                inner.printers.remove(id);
            }
            let mut added = Vec::new();
            for printer in &snapshot.printers {
                if !inner.printers.contains_key(&printer.id) {
                    inner.printers.insert(printer.id.clone(), PrinterRuntime::fresh(PrintRecord::anchored(&printer.id, now), KeepaliveStatus::default()));
                    added.push(printer.id.clone());
                }
            }
            (added, removed)
        };

        for id in &added {
            info!("Anchored new printer {} at {}", id, now);
            self.notify(StateChange::Printer(id.clone()));
        }
        for id in &removed {
            info!("Dropped state of removed printer {}", id);
            self.notify(StateChange::PrinterRemoved(id.clone()));
        }
        !added.is_empty() || !removed.is_empty()
    }

    pub fn printer(&self, printer_id: &str) -> Option<PrinterRuntime> {
        self.lock().printers.get(printer_id).cloned()
    }

    pub fn printers(&self) -> BTreeMap<String, PrinterRuntime> {
        self.lock().printers.clone()
    }

    /// Read-modify-write of one printer. Emits a change when the runtime differs afterwards.
    pub fn update<R>(&self, printer_id: &str, f: impl FnOnce(&mut PrinterRuntime) -> R) -> Option<R> {
        let (result, changed) = {
            let mut inner = self.lock();
            let runtime = inner.printers.get_mut(printer_id)?;
            let before = runtime.clone();
            let result = f(runtime);
            (result, *runtime != before)
        };
        if changed {
            self.notify(StateChange::Printer(printer_id.to_owned()));
        }
        Some(result)
    }

    /// Announces a change that lives outside the store, such as a config patch.
    pub fn touch(&self, printer_id: &str) {
        self.notify(StateChange::Printer(printer_id.to_owned()));
    }

    pub fn discovery(&self) -> DiscoveryCache {
        self.lock().discovery.clone()
    }

    pub fn update_discovery<R>(&self, f: impl FnOnce(&mut DiscoveryCache) -> R) -> R {
        let result = f(&mut self.lock().discovery);
        self.notify(StateChange::Discovery);
        result
    }

    fn persisted(&self) -> PersistedState {
        let inner = self.lock();
        PersistedState {
            printers: inner
                .printers
                .iter()
                .map(|(id, runtime)| (id.clone(), PersistedPrinter { record: runtime.record.clone(), keepalive: runtime.keepalive.clone() }))
                .collect(),
            ..PersistedState::default()
        }
    }

    /// Writes the durable part of the state. Writers are serialized; the
    /// content is captured after the write lock is taken so the newest state wins.
    pub async fn persist(&self) -> Result<(), PersistError> {
        let _guard = self.persist_lock.lock().await;
        let state = self.persisted();
        persistence::save(&self.path, &state).await
    }

    /// Persists, marking every printer degraded on failure and clearing the
    /// mark once a write succeeds again. Returns whether the write succeeded.
    pub async fn persist_or_degrade(&self) -> bool {
        match self.persist().await {
            Ok(()) => {
                for id in self.degraded_ids() {
                    info!("State file writable again, resuming automation for {}", id);
                    self.update(&id, |runtime| runtime.degraded = None);
                }
                true
            },
            Err(e) => {
                let message = snafu::Report::from_error(&e).to_string();
                error!("Persisting state failed, automation paused: {}", message);
                sentry::capture_message(&message, sentry::Level::Error);
                let ids: Vec<String> = self.lock().printers.keys().cloned().collect();
                for id in ids {
                    self.update(&id, |runtime| runtime.degraded = Some(e.to_string()));
                }
                false
            },
        }
    }

    fn degraded_ids(&self) -> Vec<String> {
        self.lock().printers.iter().filter(|(_, runtime)| runtime.degraded.is_some()).map(|(id, _)| id.clone()).collect()
    }
}

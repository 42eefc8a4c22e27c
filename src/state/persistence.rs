use std::{collections::BTreeMap, path::{Path, PathBuf}, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use log::warn;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::keepalive::tracker::PrintRecord;

use super::store::KeepaliveStatus;

const STATE_VERSION: u32 = 3;

/// On-disk layout of `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub printers: BTreeMap<String, PersistedPrinter>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self { version: STATE_VERSION, printers: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPrinter {
    pub record: PrintRecord,
    #[serde(default)]
    pub keepalive: KeepaliveStatus,
}

/// Reads the state file. A missing file is an empty state.
pub fn load(path: &Path) -> Result<PersistedState, PersistError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PersistedState::default()),
        Err(e) => return Err(e).context(ReadSnafu { path }),
    };
    let state: PersistedState = serde_json::from_slice(&raw).context(DecodeSnafu { path })?;
    if state.version != STATE_VERSION {
        warn!("State file {:?} has version {}, expected {}.", path, state.version, STATE_VERSION);
    }
    Ok(state)
}

/// Writes the state through a temp file and rename, retrying transient failures.
pub async fn save(path: &Path, state: &PersistedState) -> Result<(), PersistError> {
    let raw = serde_json::to_vec_pretty(state).context(EncodeSnafu)?;

    (|| write_atomically(path, &raw))
        .retry(ExponentialBuilder::default().with_min_delay(Duration::from_millis(50)).with_max_times(3))
        .notify(|e: &PersistError, after: Duration| warn!("{}, retrying in {:?}", e, after))
        .await
}

async fn write_atomically(path: &Path, raw: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.context(WriteSnafu { path })?;
    }
    let temp = temp_path(path);
    tokio::fs::write(&temp, raw).await.context(WriteSnafu { path: &temp })?;
    tokio::fs::rename(&temp, path).await.context(WriteSnafu { path })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum PersistError {
    #[snafu(display("Could not read state file {path:?}"))]
    Read { path: PathBuf, source: std::io::Error },

    #[snafu(display("State file {path:?} is corrupt"))]
    Decode { path: PathBuf, source: serde_json::Error },

    #[snafu(display("Could not encode state"))]
    Encode { source: serde_json::Error },

    #[snafu(display("Could not write state file {path:?}"))]
    Write { path: PathBuf, source: std::io::Error },
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = PersistedState::default();
        state.printers.insert("office".to_owned(), PersistedPrinter {
            record: PrintRecord::anchored("office", Utc::now()),
            keepalive: KeepaliveStatus::default(),
        });
        save(&path, &state).await.unwrap();

        assert_eq!(load(&path).unwrap(), state);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent.json")).unwrap().printers.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(load(&path), Err(PersistError::Decode { .. })));
    }
}

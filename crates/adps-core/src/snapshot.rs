//! Periodic persistence of the global model.
//!
//! Snapshots are written atomically:
//! 1. Write to a temp file with a PID+TID suffix
//! 2. fsync the temp file
//! 3. Rename over the target path
//!
//! A reader therefore sees either the previous snapshot or the new one,
//! never a partial file.

use crate::error::{PsError, Result};
use crate::shutdown::ShutdownToken;
use crate::store::{FuncStats, GlobalStats, ParameterInterface};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Contents of a snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub functions: BTreeMap<u64, FuncStats>,
}

impl Snapshot {
    pub fn into_global(self) -> GlobalStats {
        GlobalStats {
            functions: self.functions,
        }
    }
}

/// Write the current state of `store` to `path`.
pub fn write_snapshot(path: &Path, store: &dyn ParameterInterface) -> Result<Snapshot> {
    let global = GlobalStats::from_payload(&store.snapshot()?).map_err(|e| PsError::Store {
        message: format!("store export is not a function table: {}", e),
    })?;
    let snapshot = Snapshot {
        taken_at: Utc::now(),
        functions: global.functions,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| PsError::io_with_path(e, parent))?;
        }
    }

    let temp_path = temp_path_for(path);
    let serialized = serde_json::to_string_pretty(&snapshot)?;
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| PsError::io_with_path(e, &temp_path))?;
        file.write_all(serialized.as_bytes())
            .map_err(|e| PsError::io_with_path(e, &temp_path))?;
        file.sync_all()
            .map_err(|e| PsError::io_with_path(e, &temp_path))?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(PsError::io_with_path(e, path));
    }

    debug!(
        "Wrote snapshot of {} functions to {}",
        snapshot.functions.len(),
        path.display()
    );
    Ok(snapshot)
}

/// Read a snapshot; `None` if the file does not exist.
pub fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|e| PsError::io_with_path(e, path))?;
    let snapshot = serde_json::from_str(&contents).map_err(|e| PsError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;
    Ok(Some(snapshot))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let tid = format!("{:?}", thread::current().id())
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}.tmp", process::id(), tid));
    path.with_file_name(name)
}

/// Background thread that snapshots a store at a fixed interval.
///
/// One last snapshot is written when the token fires, so the file reflects
/// the final state of the store.
pub struct SnapshotWriter {
    token: ShutdownToken,
    handle: Option<JoinHandle<usize>>,
}

impl SnapshotWriter {
    pub fn start(
        path: impl Into<PathBuf>,
        store: Arc<dyn ParameterInterface>,
        interval: Duration,
        token: ShutdownToken,
    ) -> Result<Self> {
        let path = path.into();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name("ps-snapshot".to_string())
            .spawn(move || {
                info!(
                    "Snapshotting every {:?} to {}",
                    interval,
                    path.display()
                );
                let mut written = 0;
                loop {
                    let stop = thread_token.wait_timeout(interval);
                    match write_snapshot(&path, store.as_ref()) {
                        Ok(_) => written += 1,
                        Err(e) => error!("Snapshot to {} failed: {}", path.display(), e),
                    }
                    if stop {
                        break;
                    }
                }
                written
            })?;
        Ok(Self {
            token,
            handle: Some(handle),
        })
    }

    /// Fire the token, wait for the final snapshot and return the number of
    /// snapshots written.
    pub fn stop(mut self) -> usize {
        self.token.trigger();
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.token.trigger();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RunningStatistics;
    use crate::store::{StatisticalParameterStore, StatsUpdate};
    use tempfile::TempDir;

    fn store_with(id: u64, samples: &[f64]) -> StatisticalParameterStore {
        let store = StatisticalParameterStore::new();
        let mut update = StatsUpdate::new(0, None);
        let mut f = FuncStats::new("kernel");
        f.inclusive = RunningStatistics::from_samples(samples.iter().copied());
        update.functions.insert(id, f);
        store.merge_update(&update).unwrap();
        store
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("snap.json");
        let store = store_with(7, &[1.0, 2.0, 3.0]);

        let written = write_snapshot(&path, &store).unwrap();
        let read = read_snapshot(&path).unwrap().unwrap();
        assert_eq!(read, written);
        assert_eq!(read.functions[&7].inclusive.count(), 3);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_missing_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(read_snapshot(&temp.path().join("none.json")).unwrap().is_none());
    }

    #[test]
    fn test_read_corrupt_is_json_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(read_snapshot(&path), Err(PsError::Json { .. })));
    }

    #[test]
    fn test_restore_from_snapshot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snap.json");
        write_snapshot(&path, &store_with(2, &[4.0, 6.0])).unwrap();

        let global = read_snapshot(&path).unwrap().unwrap().into_global();
        let restored = StatisticalParameterStore::restore(&global);
        assert_eq!(restored.get(2).unwrap().inclusive.mean(), 5.0);
    }

    #[test]
    fn test_writer_writes_final_snapshot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("periodic.json");
        let store: Arc<dyn ParameterInterface> = Arc::new(store_with(1, &[1.0]));

        let writer = SnapshotWriter::start(
            &path,
            Arc::clone(&store),
            Duration::from_secs(3600),
            ShutdownToken::new(),
        )
        .unwrap();
        assert_eq!(writer.stop(), 1);
        assert!(read_snapshot(&path).unwrap().is_some());
    }

    #[test]
    fn test_writer_periodic() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("periodic.json");
        let store: Arc<dyn ParameterInterface> = Arc::new(store_with(1, &[1.0]));

        let interval = Duration::from_millis(10);
        let writer = SnapshotWriter::start(&path, store, interval, ShutdownToken::new()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(writer.stop() >= 2);
    }
}

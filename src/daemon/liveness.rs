//! Per-role liveness record.
//!
//! A running daemon holds an exclusive lock on `<run_dir>/<role>.pid` for its
//! whole lifetime. The file content names the holder. A file that exists but
//! is not locked belongs to a daemon that died without cleaning up.

use crate::errors::DaemonError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub pid: u32,
    pub role: String,
    pub started_at: DateTime<Utc>,
}

/// Holds the lock; dropping it removes the record.
#[derive(Debug)]
pub struct LivenessGuard {
    file: File,
    path: PathBuf,
    record: LivenessRecord,
}

impl LivenessGuard {
    /// Lock the record file and write this process into it.
    pub fn acquire(path: &Path, role: &str) -> Result<Self, DaemonError> {
        let liveness_err = |source| DaemonError::Liveness {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(liveness_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(liveness_err)?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            let pid = read_record(&mut file).map(|r| r.pid).unwrap_or(0);
            return Err(DaemonError::AlreadyRunning {
                role: role.to_string(),
                pid,
            });
        }

        let record = LivenessRecord {
            pid: std::process::id(),
            role: role.to_string(),
            started_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| liveness_err(std::io::Error::other(e)))?;
        file.set_len(0).map_err(liveness_err)?;
        file.seek(SeekFrom::Start(0)).map_err(liveness_err)?;
        file.write_all(json.as_bytes()).map_err(liveness_err)?;
        file.sync_all().map_err(liveness_err)?;

        debug!(role, pid = record.pid, path = %path.display(), "liveness record written");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            record,
        })
    }

    pub fn record(&self) -> &LivenessRecord {
        &self.record
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove liveness record");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// The live holder of a record file, if any.
pub fn read_live(path: &Path) -> Option<LivenessRecord> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).ok()?;
    if FileExt::try_lock_shared(&file).is_ok() {
        // Nobody holds it: stale.
        let _ = FileExt::unlock(&file);
        return None;
    }
    read_record(&mut file)
}

fn read_record(file: &mut File) -> Option<LivenessRecord> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_record_and_drop_removes_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/spec-reviewer.pid");

        let guard = LivenessGuard::acquire(&path, "spec-reviewer").unwrap();
        assert_eq!(guard.record().pid, std::process::id());
        let live = read_live(&path).unwrap();
        assert_eq!(live.role, "spec-reviewer");

        drop(guard);
        assert!(!path.exists());
        assert!(read_live(&path).is_none());
    }

    #[test]
    fn test_second_acquire_is_already_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.pid");

        let _guard = LivenessGuard::acquire(&path, "r").unwrap();
        match LivenessGuard::acquire(&path, "r") {
            Err(DaemonError::AlreadyRunning { role, pid }) => {
                assert_eq!(role, "r");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("Expected AlreadyRunning, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_record_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.pid");
        fs::write(&path, r#"{"pid": 1, "role": "r", "started_at": "2026-01-01T00:00:00Z"}"#).unwrap();

        assert!(read_live(&path).is_none());
        let guard = LivenessGuard::acquire(&path, "r").unwrap();
        assert_eq!(guard.record().pid, std::process::id());
    }
}

//! Cross-process session locking
//!
//! A lock is an exclusive file under the session directory containing the
//! holder's pid and acquisition time. A lock whose holder is dead, or whose
//! timestamp is older than the TTL, is stale and may be broken.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::error::{ClaudioError, Result};

pub const LOCK_FILE_NAME: &str = "session.lock";

/// Lock staleness TTL.
pub const DEFAULT_LOCK_TTL_HOURS: i64 = 24;

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Held session lock; released on drop or via [`SessionLock::release`].
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    released: bool,
}

impl SessionLock {
    /// Acquire the lock for a session directory.
    ///
    /// An existing lock file is broken when the recorded process is no
    /// longer alive or the record is older than `ttl_hours`. Otherwise
    /// [`ClaudioError::LockBusy`] is returned with the holder's pid.
    pub fn acquire(session_dir: &Path, ttl_hours: i64) -> Result<Self> {
        let path = session_dir.join(LOCK_FILE_NAME);
        std::fs::create_dir_all(session_dir)?;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        started_at: Utc::now(),
                    };
                    file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
                    file.sync_all()?;
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::read_info(&path) {
                        Ok(info) if !is_stale(&info, ttl_hours) => {
                            return Err(ClaudioError::LockBusy { pid: info.pid });
                        }
                        // Stale or unreadable: break it and retry.
                        _ => {
                            tracing::warn!("breaking stale lock at {}", path.display());
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
                Err(e) => return Err(ClaudioError::Io(e)),
            }
        }
    }

    pub fn read_info(path: &Path) -> Result<LockInfo> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn is_stale(info: &LockInfo, ttl_hours: i64) -> bool {
    if Utc::now() - info.started_at > ChronoDuration::hours(ttl_hours) {
        return true;
    }
    !process_alive(info.pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 probes existence without delivering anything.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a liveness probe, rely on the TTL alone.
    true
}

/// Remove stale lock files under a sessions root. Returns broken count.
pub fn cleanup_stale_locks(sessions_root: &Path, ttl_hours: i64) -> Result<usize> {
    if !sessions_root.exists() {
        return Ok(0);
    }
    let mut broken = 0;
    for entry in std::fs::read_dir(sessions_root)? {
        let lock_path = entry?.path().join(LOCK_FILE_NAME);
        if !lock_path.exists() {
            continue;
        }
        let stale = match SessionLock::read_info(&lock_path) {
            Ok(info) => is_stale(&info, ttl_hours),
            Err(_) => true,
        };
        if stale {
            std::fs::remove_file(&lock_path)?;
            broken += 1;
        }
    }
    Ok(broken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = SessionLock::acquire(dir.path(), 24).unwrap();
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
        lock.release().unwrap();
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_second_acquire_reports_holder_pid() {
        let dir = TempDir::new().unwrap();
        let _lock = SessionLock::acquire(dir.path(), 24).unwrap();

        match SessionLock::acquire(dir.path(), 24) {
            Err(ClaudioError::LockBusy { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected LockBusy, got {other:?}"),
        }
    }

    #[test]
    fn test_dead_holder_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);
        // A pid from the far end of the range is almost certainly dead.
        let info = LockInfo {
            pid: u32::MAX - 2,
            started_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();

        let lock = SessionLock::acquire(dir.path(), 24).unwrap();
        let held = SessionLock::read_info(&path).unwrap();
        assert_eq!(held.pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn test_expired_ttl_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);
        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now() - ChronoDuration::hours(48),
        };
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();

        assert!(SessionLock::acquire(dir.path(), 24).is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = SessionLock::acquire(dir.path(), 24).unwrap();
        }
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_cleanup_stale_locks() {
        let root = TempDir::new().unwrap();
        let s1 = root.path().join("s1");
        std::fs::create_dir_all(&s1).unwrap();
        let info = LockInfo {
            pid: u32::MAX - 2,
            started_at: Utc::now(),
        };
        std::fs::write(
            s1.join(LOCK_FILE_NAME),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();

        assert_eq!(cleanup_stale_locks(root.path(), 24).unwrap(), 1);
        assert_eq!(cleanup_stale_locks(root.path(), 24).unwrap(), 0);
    }
}

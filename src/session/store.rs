//! Persistent session store
//!
//! Layout under `<repo>/.claudio/`:
//!   sessions/<sid>/session.json    session record
//!   sessions/<sid>/session.lock    cross-process lock
//!   sessions/<sid>/debug.log       NDJSON log
//!   sessions/<sid>/worktrees/<iid> instance checkouts
//!
//! A legacy single-session `session.json` at the root is migrated into the
//! per-session layout on first start.

use std::fs;
use std::path::{Path, PathBuf};

use super::lock::{self, SessionLock, DEFAULT_LOCK_TTL_HOURS};
use super::{Session, SessionId, SessionInfo};
use crate::utils::error::{ClaudioError, Result};

pub const CLAUDIO_DIR: &str = ".claudio";
pub const SESSION_FILE: &str = "session.json";

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the store under `repo_root/.claudio`.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let root = repo_root.join(CLAUDIO_DIR);
        fs::create_dir_all(root.join("sessions"))?;
        let store = Self { root };
        store.migrate_legacy()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.sessions_root().join(id)
    }

    pub fn session_file(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(SESSION_FILE)
    }

    pub fn worktrees_dir(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("worktrees")
    }

    /// Canonical worktree path for an instance.
    pub fn worktree_path(&self, session_id: &str, instance_id: &str) -> PathBuf {
        self.worktrees_dir(session_id).join(instance_id)
    }

    pub fn create_session(&self, name: &str) -> Result<Session> {
        let session = Session::new(name.to_string());
        fs::create_dir_all(self.worktrees_dir(&session.id))?;
        self.save_session(&session)?;
        Ok(session)
    }

    pub fn save_session(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(session)?;
        // Write-then-rename keeps the record readable under a crash.
        let tmp = dir.join(format!("{}.tmp", SESSION_FILE));
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, self.session_file(&session.id))?;
        Ok(())
    }

    pub fn load_session(&self, id: &str) -> Result<Session> {
        let path = self.session_file(id);
        if !path.exists() {
            return Err(ClaudioError::SessionNotFound(id.to_string()));
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Find a session by full id, short id prefix, or name.
    pub fn resolve_session(&self, needle: &str) -> Result<Session> {
        if let Ok(session) = self.load_session(needle) {
            return Ok(session);
        }
        for info in self.list_sessions()? {
            if info.id.starts_with(needle) || info.name == needle {
                return self.load_session(&info.id);
            }
        }
        Err(ClaudioError::SessionNotFound(needle.to_string()))
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut infos = Vec::new();
        let root = self.sessions_root();
        if !root.exists() {
            return Ok(infos);
        }
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load_session(&id) {
                Ok(session) => infos.push(SessionInfo::from(&session)),
                Err(e) => tracing::warn!("skipping unreadable session {}: {}", id, e),
            }
        }
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(infos)
    }

    pub fn remove_session(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Err(ClaudioError::SessionNotFound(id.to_string()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    pub fn acquire_lock(&self, id: &SessionId) -> Result<SessionLock> {
        SessionLock::acquire(&self.session_dir(id), DEFAULT_LOCK_TTL_HOURS)
    }

    pub fn cleanup_stale_locks(&self) -> Result<usize> {
        lock::cleanup_stale_locks(&self.sessions_root(), DEFAULT_LOCK_TTL_HOURS)
    }

    /// Move a legacy root-level `session.json` into the per-session layout.
    fn migrate_legacy(&self) -> Result<()> {
        let legacy = self.root.join(SESSION_FILE);
        if !legacy.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&legacy)?;
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => {
                tracing::info!("migrating legacy session record {}", session.id);
                self.save_session(&session)?;
                fs::remove_file(&legacy)?;
            }
            Err(e) => {
                tracing::warn!("legacy session.json unreadable, leaving in place: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Instance, InstanceStatus};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store();
        let mut session = store.create_session("demo").unwrap();
        let mut instance = Instance::new(
            "wire up config".to_string(),
            "claudio/wire-up-config".to_string(),
            store.worktree_path(&session.id, "iid"),
        );
        instance.status = InstanceStatus::Working;
        session.add_instance(instance);
        store.save_session(&session).unwrap();

        let loaded = store.load_session(&session.id).unwrap();
        assert_eq!(
            serde_json::to_value(&session).unwrap(),
            serde_json::to_value(&loaded).unwrap()
        );
    }

    #[test]
    fn test_list_sorted_newest_first() {
        let (_dir, store) = store();
        store.create_session("one").unwrap();
        store.create_session("two").unwrap();
        let infos = store.list_sessions().unwrap();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].created_at >= infos[1].created_at);
    }

    #[test]
    fn test_resolve_by_prefix_and_name() {
        let (_dir, store) = store();
        let session = store.create_session("named-run").unwrap();

        assert_eq!(store.resolve_session(&session.id[..8]).unwrap().id, session.id);
        assert_eq!(store.resolve_session("named-run").unwrap().id, session.id);
        assert!(store.resolve_session("missing").is_err());
    }

    #[test]
    fn test_remove_session() {
        let (_dir, store) = store();
        let session = store.create_session("gone").unwrap();
        store.remove_session(&session.id).unwrap();
        assert!(matches!(
            store.load_session(&session.id),
            Err(ClaudioError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_legacy_migration() {
        let dir = TempDir::new().unwrap();
        let claudio_dir = dir.path().join(CLAUDIO_DIR);
        fs::create_dir_all(&claudio_dir).unwrap();
        let legacy = Session::new("old-style".to_string());
        fs::write(
            claudio_dir.join(SESSION_FILE),
            serde_json::to_string_pretty(&legacy).unwrap(),
        )
        .unwrap();

        let store = SessionStore::open(dir.path()).unwrap();
        assert!(!claudio_dir.join(SESSION_FILE).exists());
        assert_eq!(store.load_session(&legacy.id).unwrap().name, "old-style");
    }

    #[test]
    fn test_lock_through_store() {
        let (_dir, store) = store();
        let session = store.create_session("locked").unwrap();
        let lock = store.acquire_lock(&session.id).unwrap();
        assert!(matches!(
            store.acquire_lock(&session.id),
            Err(ClaudioError::LockBusy { .. })
        ));
        lock.release().unwrap();
        assert!(store.acquire_lock(&session.id).is_ok());
    }
}

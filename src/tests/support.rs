//! In-memory fakes for the external tool seams

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::git::GitBackend;
use crate::tmux::{Multiplexer, TmuxError, WindowSize};
use crate::utils::error::Result;

/// What a fake agent sees when it is "launched".
pub struct FakeStart {
    pub name: String,
    pub cwd: PathBuf,
    pub prompt: String,
}

pub type AgentScript = Arc<dyn Fn(&FakeStart) + Send + Sync>;

/// Multiplexer fake: sessions live in a map, and a script plays the agent,
/// typically by writing sentinel files into the worktree at start.
pub struct FakeMux {
    sessions: Mutex<HashMap<String, PathBuf>>,
    pane_content: Mutex<HashMap<String, Vec<u8>>>,
    script: AgentScript,
    pub created: Mutex<Vec<String>>,
}

impl FakeMux {
    pub fn new(script: AgentScript) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            pane_content: Mutex::new(HashMap::new()),
            script,
            created: Mutex::new(Vec::new()),
        })
    }

    /// A mux whose agents never do anything.
    pub fn inert() -> Arc<Self> {
        Self::new(Arc::new(|_| {}))
    }

    pub fn set_pane(&self, name: &str, content: &[u8]) {
        self.pane_content
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
    }

    /// Simulate the user killing a pane out from under us.
    pub fn vanish(&self, name: &str) {
        self.sessions.lock().unwrap().remove(name);
    }

    pub fn session_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

fn prompt_from_command(command: &str) -> String {
    // Commands look like: agent < '/tmp/claudio-prompt-x.md'
    let Some(path) = command
        .split('<')
        .nth(1)
        .map(|p| p.trim().trim_matches('\''))
    else {
        return String::new();
    };
    std::fs::read_to_string(path).unwrap_or_default()
}

#[async_trait]
impl Multiplexer for FakeMux {
    async fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        _size: WindowSize,
        command: &str,
    ) -> Result<(), TmuxError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(name.to_string(), cwd.to_path_buf());
        self.created.lock().unwrap().push(name.to_string());
        let start = FakeStart {
            name: name.to_string(),
            cwd: cwd.to_path_buf(),
            prompt: prompt_from_command(command),
        };
        (self.script)(&start);
        Ok(())
    }

    async fn send_keys(&self, name: &str, _keys: &str) -> Result<(), TmuxError> {
        if !self.sessions.lock().unwrap().contains_key(name) {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn capture_pane(&self, name: &str) -> Result<Vec<u8>, TmuxError> {
        if !self.sessions.lock().unwrap().contains_key(name) {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        Ok(self
            .pane_content
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| b"agent is working\n".to_vec()))
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.sessions.lock().unwrap().remove(name);
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, TmuxError> {
        Ok(self.sessions.lock().unwrap().contains_key(name))
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        Ok(self.sessions.lock().unwrap().keys().cloned().collect())
    }
}

/// Git fake: worktrees are plain directories, branches a set of names.
#[derive(Default)]
pub struct FakeGit {
    pub branches: Mutex<HashSet<String>>,
    pub remote_branches: Mutex<HashSet<String>>,
    pub dirty: Mutex<HashSet<PathBuf>>,
    pub removed_worktrees: Mutex<Vec<PathBuf>>,
    pub deleted_branches: Mutex<Vec<String>>,
    pub created_worktrees: Mutex<Vec<(PathBuf, String, String)>>,
}

impl FakeGit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl GitBackend for FakeGit {
    async fn find_repo_root(&self, cwd: &Path) -> Result<PathBuf> {
        Ok(cwd.to_path_buf())
    }

    async fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        std::fs::create_dir_all(path)?;
        self.branches.lock().unwrap().insert(branch.to_string());
        self.created_worktrees.lock().unwrap().push((
            path.to_path_buf(),
            branch.to_string(),
            base.to_string(),
        ));
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        self.removed_worktrees.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        self.branches.lock().unwrap().remove(name);
        self.deleted_branches.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool> {
        Ok(self.dirty.lock().unwrap().contains(path))
    }

    async fn changed_files(&self, _path: &Path) -> Result<Vec<String>> {
        Ok(vec!["src/lib.rs".to_string()])
    }

    async fn behind_count(&self, _path: &Path) -> Result<u32> {
        Ok(0)
    }

    async fn would_conflict(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    async fn rebase_on_main(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn push(&self, _path: &Path, _force_with_lease: bool) -> Result<()> {
        Ok(())
    }

    async fn diff_against_main(&self, _path: &Path) -> Result<String> {
        Ok(String::new())
    }

    async fn commit_log(&self, _path: &Path) -> Result<String> {
        Ok(String::new())
    }

    async fn branch_exists_on_remote(&self, name: &str) -> Result<bool> {
        Ok(self.remote_branches.lock().unwrap().contains(name))
    }

    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let needle = format!("{}/", prefix);
        let mut names: Vec<String> = self
            .branches
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.starts_with(&needle))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

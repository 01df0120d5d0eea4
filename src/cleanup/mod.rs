//! Stale resource cleanup
//!
//! Discovers worktrees, branches, tmux sessions, and session records that
//! no live instance accounts for, reports a dry-run summary, and removes
//! them in an order that never orphans a resource: worktree, then branch,
//! then tmux session, then session record. Dirty worktrees are skipped
//! unless forced; branches that exist on a remote are never deleted
//! unless explicitly overridden.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::agent::{instance_id_candidates, SESSION_PREFIX};
use crate::git::GitBackend;
use crate::session::{SessionId, SessionStore};
use crate::tmux::Multiplexer;
use crate::utils::error::Result;

/// Which resource classes a cleanup run covers. Modeled as explicit
/// parameters rather than globals so callers state what they mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupScope {
    pub worktrees: bool,
    pub branches: bool,
    pub tmux: bool,
    pub sessions: bool,
}

impl CleanupScope {
    pub fn all() -> Self {
        Self {
            worktrees: true,
            branches: true,
            tmux: true,
            sessions: true,
        }
    }

    pub fn any(&self) -> bool {
        self.worktrees || self.branches || self.tmux || self.sessions
    }
}

/// Everything a discovery pass found, plus what it chose to skip.
#[derive(Debug, Default)]
pub struct CleanupPlan {
    pub stale_worktrees: Vec<PathBuf>,
    pub skipped_dirty: Vec<PathBuf>,
    pub stale_branches: Vec<String>,
    pub skipped_remote: Vec<String>,
    pub stale_mux_sessions: Vec<String>,
    pub empty_sessions: Vec<SessionId>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.stale_worktrees.is_empty()
            && self.stale_branches.is_empty()
            && self.stale_mux_sessions.is_empty()
            && self.empty_sessions.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{} worktrees, {} branches, {} tmux sessions, {} empty sessions",
            self.stale_worktrees.len(),
            self.stale_branches.len(),
            self.stale_mux_sessions.len(),
            self.empty_sessions.len()
        )];
        if !self.skipped_dirty.is_empty() {
            lines.push(format!(
                "skipped {} dirty worktrees (use --force)",
                self.skipped_dirty.len()
            ));
        }
        if !self.skipped_remote.is_empty() {
            lines.push(format!(
                "skipped {} branches present on remote",
                self.skipped_remote.len()
            ));
        }
        lines.join("\n")
    }
}

/// Counts of what was actually removed.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub worktrees_removed: usize,
    pub branches_removed: usize,
    pub mux_sessions_removed: usize,
    pub sessions_removed: usize,
}

pub struct CleanupEngine {
    store: Arc<SessionStore>,
    git: Arc<dyn GitBackend>,
    mux: Arc<dyn Multiplexer>,
    branch_prefix: String,
}

impl CleanupEngine {
    pub fn new(
        store: Arc<SessionStore>,
        git: Arc<dyn GitBackend>,
        mux: Arc<dyn Multiplexer>,
        branch_prefix: String,
    ) -> Self {
        Self {
            store,
            git,
            mux,
            branch_prefix,
        }
    }

    /// Collect the known universe once: every instance id, branch, and
    /// worktree path recorded in any persisted session.
    async fn known_state(&self) -> Result<KnownState> {
        let mut state = KnownState::default();
        for info in self.store.list_sessions()? {
            let session = self.store.load_session(&info.id)?;
            if session.instances.is_empty() {
                state.empty_sessions.push(session.id.clone());
            }
            for instance in &session.instances {
                state.instance_ids.insert(instance.id.clone());
                state.branches.insert(instance.branch.clone());
                state.worktrees.insert(instance.worktree_path.clone());
            }
            if let Some(ultra) = &session.ultra_plan {
                for record in &ultra.group_consolidations {
                    state.branches.insert(record.branch.clone());
                }
            }
        }
        Ok(state)
    }

    pub async fn discover(&self, scope: CleanupScope, force: bool) -> Result<CleanupPlan> {
        let known = self.known_state().await?;
        let mut plan = CleanupPlan::default();

        if scope.worktrees {
            // sessions/<sid>/worktrees/<iid> directories.
            for entry in WalkDir::new(self.store.sessions_root())
                .min_depth(3)
                .max_depth(3)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_dir() {
                    continue;
                }
                let parent_is_worktrees = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n == "worktrees")
                    .unwrap_or(false);
                if !parent_is_worktrees {
                    continue;
                }
                let path = entry.path().to_path_buf();
                if known.worktrees.contains(&path) {
                    continue;
                }
                let dirty = self
                    .git
                    .has_uncommitted_changes(&path)
                    .await
                    .unwrap_or(false);
                if dirty && !force {
                    plan.skipped_dirty.push(path);
                } else {
                    plan.stale_worktrees.push(path);
                }
            }
            plan.stale_worktrees.sort();
        }

        if scope.branches {
            for branch in self.git.list_branches(&self.branch_prefix).await? {
                if known.branches.contains(&branch) {
                    continue;
                }
                if self.git.branch_exists_on_remote(&branch).await? {
                    plan.skipped_remote.push(branch);
                } else {
                    plan.stale_branches.push(branch);
                }
            }
            plan.stale_branches.sort();
        }

        if scope.tmux {
            for name in self.mux.list_sessions().await? {
                if !name.starts_with(SESSION_PREFIX) {
                    continue;
                }
                let known_instance = instance_id_candidates(&name)
                    .iter()
                    .any(|candidate| known.instance_ids.contains(*candidate));
                if !known_instance {
                    plan.stale_mux_sessions.push(name);
                }
            }
            plan.stale_mux_sessions.sort();
        }

        if scope.sessions {
            plan.empty_sessions = known.empty_sessions;
            plan.empty_sessions.sort();
        }

        Ok(plan)
    }

    /// Remove everything in the plan. Ordering never orphans resources.
    pub async fn execute(&self, plan: &CleanupPlan, delete_remote: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for path in &plan.stale_worktrees {
            match self.git.remove_worktree(path).await {
                Ok(()) => report.worktrees_removed += 1,
                Err(e) => {
                    tracing::warn!("worktree {} not removable via git: {}", path.display(), e);
                    if path.exists() {
                        std::fs::remove_dir_all(path)?;
                        report.worktrees_removed += 1;
                    }
                }
            }
        }

        for branch in &plan.stale_branches {
            self.git.delete_branch(branch).await?;
            report.branches_removed += 1;
        }
        if delete_remote {
            for branch in &plan.skipped_remote {
                self.git.delete_branch(branch).await?;
                report.branches_removed += 1;
            }
        }

        for name in &plan.stale_mux_sessions {
            if let Err(e) = self.mux.kill_session(name).await {
                tracing::warn!("failed to kill tmux session {}: {}", name, e);
            } else {
                report.mux_sessions_removed += 1;
            }
        }

        for session_id in &plan.empty_sessions {
            self.store.remove_session(session_id)?;
            report.sessions_removed += 1;
        }

        Ok(report)
    }
}

#[derive(Debug, Default)]
struct KnownState {
    instance_ids: HashSet<String>,
    branches: HashSet<String>,
    worktrees: HashSet<PathBuf>,
    empty_sessions: Vec<SessionId>,
}

//! Git worktree operations
//!
//! Every instance gets an isolated checkout sharing object storage with the
//! main repository. The core consumes the narrow [`GitBackend`] trait;
//! [`ShellGitBackend`] shells out to git and surfaces stderr verbatim.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::BranchConfig;
use crate::session::short_id;
use crate::utils::command::CommandExecutor;
use crate::utils::error::{ClaudioError, Result};

/// Narrow capability interface over git.
#[async_trait]
pub trait GitBackend: Send + Sync {
    async fn find_repo_root(&self, cwd: &Path) -> Result<PathBuf>;

    /// Create a worktree at `path` on a new `branch` forked from `base`.
    async fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()>;

    async fn remove_worktree(&self, path: &Path) -> Result<()>;

    async fn delete_branch(&self, name: &str) -> Result<()>;

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool>;

    async fn changed_files(&self, path: &Path) -> Result<Vec<String>>;

    /// Commits `main` has that this worktree's branch lacks.
    async fn behind_count(&self, path: &Path) -> Result<u32>;

    /// Whether rebasing onto main would conflict.
    async fn would_conflict(&self, path: &Path) -> Result<bool>;

    async fn rebase_on_main(&self, path: &Path) -> Result<()>;

    async fn push(&self, path: &Path, force_with_lease: bool) -> Result<()>;

    async fn diff_against_main(&self, path: &Path) -> Result<String>;

    async fn commit_log(&self, path: &Path) -> Result<String>;

    async fn branch_exists_on_remote(&self, name: &str) -> Result<bool>;

    /// Local branches under `prefix/`.
    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Shell implementation against a real repository.
pub struct ShellGitBackend {
    repo_root: PathBuf,
    main_branch: String,
}

impl ShellGitBackend {
    pub fn new(repo_root: PathBuf, main_branch: String) -> Self {
        Self {
            repo_root,
            main_branch,
        }
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    async fn git(&self, args: &[&str], dir: Option<&Path>) -> Result<String> {
        CommandExecutor::run("git", args, Some(dir.unwrap_or(&self.repo_root))).await
    }
}

#[async_trait]
impl GitBackend for ShellGitBackend {
    async fn find_repo_root(&self, cwd: &Path) -> Result<PathBuf> {
        let out = CommandExecutor::run("git", &["rev-parse", "--show-toplevel"], Some(cwd)).await?;
        Ok(PathBuf::from(out.trim()))
    }

    async fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path.to_string_lossy();
        self.git(
            &["worktree", "add", "-b", branch, &path_str, base],
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.git(&["worktree", "remove", "--force", &path_str], None)
            .await?;
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        self.git(&["branch", "-D", name], None).await?;
        Ok(())
    }

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool> {
        let out = self.git(&["status", "--porcelain"], Some(path)).await?;
        Ok(!out.trim().is_empty())
    }

    async fn changed_files(&self, path: &Path) -> Result<Vec<String>> {
        let range = format!("{}...HEAD", self.main_branch);
        let out = self
            .git(&["diff", "--name-only", &range], Some(path))
            .await?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn behind_count(&self, path: &Path) -> Result<u32> {
        let range = format!("HEAD..{}", self.main_branch);
        let out = self.git(&["rev-list", "--count", &range], Some(path)).await?;
        out.trim()
            .parse()
            .map_err(|_| ClaudioError::ExternalTool {
                tool: "git rev-list".to_string(),
                stderr: format!("unparseable count: {}", out.trim()),
            })
    }

    async fn would_conflict(&self, path: &Path) -> Result<bool> {
        // merge-tree reports conflicts without touching the worktree.
        let base = self
            .git(&["merge-base", "HEAD", &self.main_branch], Some(path))
            .await?;
        let (out, _, ok) = CommandExecutor::run_unchecked(
            "git",
            &[
                "merge-tree",
                base.trim(),
                "HEAD",
                &self.main_branch,
            ],
            Some(path),
        )
        .await?;
        Ok(!ok || out.contains("<<<<<<<"))
    }

    async fn rebase_on_main(&self, path: &Path) -> Result<()> {
        self.git(&["rebase", &self.main_branch], Some(path)).await?;
        Ok(())
    }

    async fn push(&self, path: &Path, force_with_lease: bool) -> Result<()> {
        let mut args = vec!["push", "--set-upstream", "origin", "HEAD"];
        if force_with_lease {
            args.push("--force-with-lease");
        }
        self.git(&args, Some(path)).await?;
        Ok(())
    }

    async fn diff_against_main(&self, path: &Path) -> Result<String> {
        let range = format!("{}...HEAD", self.main_branch);
        self.git(&["diff", &range], Some(path)).await
    }

    async fn commit_log(&self, path: &Path) -> Result<String> {
        let range = format!("{}..HEAD", self.main_branch);
        self.git(&["log", "--oneline", &range], Some(path)).await
    }

    async fn branch_exists_on_remote(&self, name: &str) -> Result<bool> {
        let (out, _, ok) = CommandExecutor::run_unchecked(
            "git",
            &["ls-remote", "--heads", "origin", name],
            Some(&self.repo_root),
        )
        .await?;
        Ok(ok && !out.trim().is_empty())
    }

    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}/*", prefix);
        let out = self
            .git(
                &["branch", "--list", "--format=%(refname:short)", &pattern],
                None,
            )
            .await?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// Resolve the repository's main branch: origin's HEAD when set, falling
/// back to `main`.
pub async fn detect_main_branch(repo_root: &Path) -> String {
    if let Ok((out, _, true)) = CommandExecutor::run_unchecked(
        "git",
        &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"],
        Some(repo_root),
    )
    .await
    {
        if let Some(name) = out.trim().strip_prefix("origin/") {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "main".to_string()
}

/// Turn a task title into a branch-safe slug.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for ch in text.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    slug.chars().take(40).collect::<String>().trim_matches('-').to_string()
}

/// Branch name for an instance: `<prefix>/<iid[:8]>-<slug>` when
/// `include_id` is set, else `<prefix>/<slug>`.
pub fn branch_name(config: &BranchConfig, instance_id: &str, title: &str) -> String {
    let slug = slugify(title);
    if config.include_id {
        format!("{}/{}-{}", config.prefix, short_id(instance_id), slug)
    } else {
        format!("{}/{}", config.prefix, slug)
    }
}

/// Consolidated branch for one execution group.
pub fn group_branch_name(prefix: &str, session_id: &str, group: usize) -> String {
    format!("{}/ultraplan-{}-group-{}", prefix, short_id(session_id), group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add user auth!"), "add-user-auth");
        assert_eq!(slugify("  multiple   spaces  "), "multiple-spaces");
        assert_eq!(slugify("CamelCase & symbols #42"), "camelcase-symbols-42");
    }

    #[test]
    fn test_slugify_truncates() {
        let long = "a".repeat(100);
        assert_eq!(slugify(&long).len(), 40);
    }

    #[test]
    fn test_branch_name_with_id() {
        let config = BranchConfig {
            prefix: "claudio".to_string(),
            include_id: true,
        };
        let name = branch_name(&config, "deadbeef-cafe-0000", "Fix login flow");
        assert_eq!(name, "claudio/deadbeef-fix-login-flow");
    }

    #[test]
    fn test_branch_name_without_id() {
        let config = BranchConfig {
            prefix: "feat".to_string(),
            include_id: false,
        };
        assert_eq!(
            branch_name(&config, "deadbeef", "Fix login flow"),
            "feat/fix-login-flow"
        );
    }

    #[test]
    fn test_group_branch_name() {
        assert_eq!(
            group_branch_name("claudio", "0123456789abcdef", 2),
            "claudio/ultraplan-01234567-group-2"
        );
    }
}

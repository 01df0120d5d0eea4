//! Pull-request workflow
//!
//! Per-instance pipeline: verify the worktree is clean, compute changed
//! files, optionally rebase on main (refusing on predicted conflicts),
//! push, produce a title and body, and create the PR through the external
//! tool. Each instance is processed independently; one failure never
//! aborts the others.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::multiplexer_session_name;
use crate::config::PrConfig;
use crate::coordination::{Event, EventBus};
use crate::git::GitBackend;
use crate::session::{short_id, Instance, InstanceId, Session};
use crate::tmux::{Multiplexer, WindowSize};
use crate::utils::command::CommandExecutor;
use crate::utils::error::{ClaudioError, Result};

/// Draft file an AI sub-agent writes its title/body suggestion into.
const PR_DRAFT_FILE: &str = ".claudio-pr-draft.txt";

/// Everything the external PR tool needs.
#[derive(Debug, Clone)]
pub struct PrRequest {
    pub title: String,
    pub body: String,
    pub base: String,
    pub draft: bool,
    pub reviewers: Vec<String>,
    pub labels: Vec<String>,
}

/// External PR-creation tool.
#[async_trait]
pub trait PrBackend: Send + Sync {
    /// Create a PR for the branch checked out at `worktree`; returns the
    /// PR url.
    async fn create_pr(&self, worktree: &Path, request: &PrRequest) -> Result<String>;
}

/// `gh pr create` backend.
pub struct GhPrBackend;

#[async_trait]
impl PrBackend for GhPrBackend {
    async fn create_pr(&self, worktree: &Path, request: &PrRequest) -> Result<String> {
        let mut args: Vec<String> = vec![
            "pr".into(),
            "create".into(),
            "--title".into(),
            request.title.clone(),
            "--body".into(),
            request.body.clone(),
            "--base".into(),
            request.base.clone(),
        ];
        if request.draft {
            args.push("--draft".into());
        }
        for reviewer in &request.reviewers {
            args.push("--reviewer".into());
            args.push(reviewer.clone());
        }
        for label in &request.labels {
            args.push("--label".into());
            args.push(label.clone());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = CommandExecutor::run("gh", &arg_refs, Some(worktree)).await?;
        Ok(out.trim().to_string())
    }
}

/// Result for one instance in a batch run.
#[derive(Debug)]
pub struct PrOutcome {
    pub instance_id: InstanceId,
    pub result: Result<String>,
}

pub struct PrWorkflow {
    git: Arc<dyn GitBackend>,
    mux: Arc<dyn Multiplexer>,
    backend: Arc<dyn PrBackend>,
    bus: Arc<EventBus>,
    config: PrConfig,
    agent_command: String,
    main_branch: String,
}

impl PrWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        git: Arc<dyn GitBackend>,
        mux: Arc<dyn Multiplexer>,
        backend: Arc<dyn PrBackend>,
        bus: Arc<EventBus>,
        config: PrConfig,
        agent_command: String,
        main_branch: String,
    ) -> Self {
        Self {
            git,
            mux,
            backend,
            bus,
            config,
            agent_command,
            main_branch,
        }
    }

    /// Run the pipeline for every completed instance; errors are
    /// collected per-instance.
    pub async fn run_all(&self, session: &Session) -> Vec<PrOutcome> {
        let mut outcomes = Vec::new();
        for instance in &session.instances {
            if !instance.status.is_terminal() {
                continue;
            }
            let result = self.run_for_instance(session, instance).await;
            if let Err(e) = &result {
                tracing::error!("pr for instance {} failed: {}", instance.id, e);
            }
            outcomes.push(PrOutcome {
                instance_id: instance.id.clone(),
                result,
            });
        }
        outcomes
    }

    /// The full pipeline for one instance. Returns the PR url.
    pub async fn run_for_instance(
        &self,
        session: &Session,
        instance: &Instance,
    ) -> Result<String> {
        let worktree = instance.worktree_path.as_path();
        let step_err = |reason: String| ClaudioError::PhaseFailure {
            phase: "pr".to_string(),
            reason,
        };

        if self.git.has_uncommitted_changes(worktree).await? {
            return Err(step_err(format!(
                "worktree {} has uncommitted changes",
                worktree.display()
            )));
        }

        let changed = self.git.changed_files(worktree).await?;
        if changed.is_empty() {
            return Err(step_err("no changes against main".to_string()));
        }

        let mut rebased = false;
        if self.config.auto_rebase && self.git.behind_count(worktree).await? > 0 {
            if self.git.would_conflict(worktree).await? {
                return Err(step_err(format!(
                    "rebase of '{}' onto '{}' would conflict; resolve manually",
                    instance.branch, self.main_branch
                )));
            }
            self.git.rebase_on_main(worktree).await?;
            rebased = true;
        }
        self.git.push(worktree, rebased).await?;

        let (title, body) = self.describe(session, instance, &changed).await;
        let request = PrRequest {
            title,
            body,
            base: self.main_branch.clone(),
            draft: self.config.draft,
            reviewers: self.config.reviewers.clone(),
            labels: self.config.labels.clone(),
        };
        let url = self.backend.create_pr(worktree, &request).await?;

        self.bus.publish(Event::PrCompleted {
            session_id: session.id.clone(),
            instance_id: instance.id.clone(),
            url: url.clone(),
        });
        Ok(url)
    }

    /// Produce (title, body), via an AI sub-agent when configured, else
    /// from the template.
    async fn describe(
        &self,
        session: &Session,
        instance: &Instance,
        changed: &[String],
    ) -> (String, String) {
        if self.config.use_ai {
            match self.ai_description(session, instance).await {
                Ok(pair) => return pair,
                Err(e) => {
                    tracing::warn!("AI PR description failed, using template: {}", e);
                }
            }
        }
        (
            truncate_title(&instance.task),
            self.config
                .template
                .replace("{task}", &instance.task)
                .replace("{branch}", &instance.branch)
                .replace("{files}", &changed.join("\n")),
        )
    }

    /// Run a short-lived agent in the instance worktree to draft the PR
    /// description. The multiplexer session carries the session id so
    /// concurrent runs never collide.
    async fn ai_description(
        &self,
        session: &Session,
        instance: &Instance,
    ) -> Result<(String, String)> {
        let worktree = instance.worktree_path.clone();
        let draft_path = worktree.join(PR_DRAFT_FILE);
        if draft_path.exists() {
            std::fs::remove_file(&draft_path)?;
        }

        let log = self.git.commit_log(&worktree).await.unwrap_or_default();
        let prompt = format!(
            "Write a pull request description for this change. First line is \
             the title; the rest is the body. Task: {}. Commits:\n{}\nWrite \
             ONLY the description to {} and exit.",
            instance.task, log, PR_DRAFT_FILE
        );
        let mux_name = format!(
            "{}-pr-{}",
            multiplexer_session_name(&session.id, short_id(&instance.id)),
            short_id(&instance.id)
        );
        let command = format!("{} -p {}", self.agent_command, shell_quote(&prompt));
        self.mux
            .create_session(
                &mux_name,
                &worktree,
                WindowSize {
                    width: 200,
                    height: 50,
                },
                &command,
            )
            .await?;

        // Poll for the draft; the sub-agent has a fixed grace period.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        let content = loop {
            if draft_path.exists() {
                if let Ok(content) = std::fs::read_to_string(&draft_path) {
                    if !content.trim().is_empty() {
                        break content;
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.mux.kill_session(&mux_name).await;
                return Err(ClaudioError::ExternalTool {
                    tool: self.agent_command.clone(),
                    stderr: "PR description sub-agent produced no draft".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        };
        let _ = self.mux.kill_session(&mux_name).await;
        let _ = std::fs::remove_file(&draft_path);

        let mut lines = content.lines();
        let title = lines.next().unwrap_or_default().trim().to_string();
        let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        if title.is_empty() {
            return Err(ClaudioError::ExternalTool {
                tool: self.agent_command.clone(),
                stderr: "empty PR title in draft".to_string(),
            });
        }
        Ok((title, body))
    }
}

fn truncate_title(task: &str) -> String {
    let first_line = task.lines().next().unwrap_or_default();
    if first_line.chars().count() <= 72 {
        first_line.to_string()
    } else {
        let head: String = first_line.chars().take(71).collect();
        format!("{}…", head)
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_title() {
        assert_eq!(truncate_title("short task"), "short task");
        assert_eq!(truncate_title("line one\nline two"), "line one");
        let long = "x".repeat(100);
        assert_eq!(truncate_title(&long).chars().count(), 72);
    }

    #[test]
    fn test_template_substitution() {
        let config = PrConfig::default();
        let body = config
            .template
            .replace("{task}", "add auth")
            .replace("{files}", "src/auth.rs");
        assert!(body.contains("add auth"));
        assert!(body.contains("src/auth.rs"));
    }
}

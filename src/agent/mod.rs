//! Agent process management
//!
//! Starts the agent binary detached inside a tmux session rooted at an
//! instance's worktree, with the prompt piped in through a temporary file.
//! The runner never interprets agent output; completion is signalled by
//! sentinel files watched by the instance supervisor.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::{AgentConfig, InstanceConfig};
use crate::session::short_id;
use crate::tmux::{Multiplexer, WindowSize};
use crate::utils::error::Result;

pub const SESSION_PREFIX: &str = "claudio-";

/// tmux session name for an instance: `claudio-<sid[:8]>-<iid>`.
pub fn multiplexer_session_name(session_id: &str, instance_id: &str) -> String {
    format!("{}{}-{}", SESSION_PREFIX, short_id(session_id), instance_id)
}

/// Pre-multi-session naming, still recognized by cleanup.
pub fn legacy_session_name(instance_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, instance_id)
}

/// Possible instance ids encoded in a claudio tmux session name. Both the
/// legacy (`claudio-<iid>`) and multi-session (`claudio-<sid[:8]>-<iid>`)
/// readings are returned; callers match against known ids.
pub fn instance_id_candidates(name: &str) -> Vec<&str> {
    let Some(rest) = name.strip_prefix(SESSION_PREFIX) else {
        return Vec::new();
    };
    let mut candidates = vec![rest];
    if let Some((sid8, iid)) = rest.split_once('-') {
        if sid8.len() == 8 && !iid.is_empty() {
            candidates.push(iid);
        }
    }
    candidates
}

/// Launches and controls detached agent processes.
pub struct AgentRunner {
    mux: Arc<dyn Multiplexer>,
    agent: AgentConfig,
    size: WindowSize,
}

impl AgentRunner {
    pub fn new(mux: Arc<dyn Multiplexer>, agent: AgentConfig, instance: &InstanceConfig) -> Self {
        Self {
            mux,
            agent,
            size: WindowSize {
                width: instance.tmux_width,
                height: instance.tmux_height,
            },
        }
    }

    /// Start the agent in `worktree` under the given tmux session name.
    pub async fn start(&self, mux_name: &str, worktree: &Path, prompt: &str) -> Result<()> {
        let prompt_path = self.write_prompt_file(prompt)?;
        let command = format!(
            "{} < {}",
            self.agent.command,
            shell_quote(&prompt_path.to_string_lossy())
        );
        self.mux
            .create_session(mux_name, worktree, self.size, &command)
            .await?;
        tracing::info!("started agent in tmux session {}", mux_name);
        Ok(())
    }

    /// Prompt files outlive the spawn call; the agent reads them after we
    /// return. They land in the system temp dir and are cleaned by the OS.
    fn write_prompt_file(&self, prompt: &str) -> Result<std::path::PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix("claudio-prompt-")
            .suffix(".md")
            .tempfile()?;
        file.write_all(prompt.as_bytes())?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }

    pub async fn send_keys(&self, mux_name: &str, keys: &str) -> Result<()> {
        self.mux.send_keys(mux_name, keys).await?;
        Ok(())
    }

    pub async fn capture_pane(&self, mux_name: &str) -> Result<Vec<u8>> {
        Ok(self.mux.capture_pane(mux_name).await?)
    }

    pub async fn kill(&self, mux_name: &str) -> Result<()> {
        self.mux.kill_session(mux_name).await?;
        Ok(())
    }

    pub async fn alive(&self, mux_name: &str) -> Result<bool> {
        Ok(self.mux.session_exists(mux_name).await?)
    }

    /// All live claudio-prefixed multiplexer sessions.
    pub async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .mux
            .list_sessions()
            .await?
            .into_iter()
            .filter(|n| n.starts_with(SESSION_PREFIX))
            .collect())
    }
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

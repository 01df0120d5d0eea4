//! tmux integration
//!
//! Instances run inside detached tmux sessions. The core talks to the
//! multiplexer through the [`Multiplexer`] trait so tests can substitute
//! an in-memory fake; [`TmuxClient`] is the real implementation.

use async_trait::async_trait;
use std::path::Path;

use crate::utils::command::CommandExecutor;
use crate::utils::error::ClaudioError;

/// Error types for tmux operations
#[derive(Debug, thiserror::Error)]
pub enum TmuxError {
    #[error("tmux not found or not installed")]
    TmuxNotFound,
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("invalid session name: {0}")]
    InvalidSessionName(String),
    #[error("tmux command failed: {0}")]
    CommandFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TmuxError> for ClaudioError {
    fn from(e: TmuxError) -> Self {
        ClaudioError::ExternalTool {
            tool: "tmux".to_string(),
            stderr: e.to_string(),
        }
    }
}

/// Geometry for new windows.
#[derive(Debug, Clone, Copy)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Narrow capability interface over the terminal multiplexer.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Create a detached session running `command` in `cwd`.
    async fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        size: WindowSize,
        command: &str,
    ) -> Result<(), TmuxError>;

    /// Send keys through the multiplexer's keystroke API so control
    /// characters keep their meaning.
    async fn send_keys(&self, name: &str, keys: &str) -> Result<(), TmuxError>;

    /// Capture the current pane contents.
    async fn capture_pane(&self, name: &str) -> Result<Vec<u8>, TmuxError>;

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError>;

    async fn session_exists(&self, name: &str) -> Result<bool, TmuxError>;

    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError>;
}

/// Client for a real tmux server.
pub struct TmuxClient;

impl TmuxClient {
    /// Create a client, verifying tmux is installed.
    pub async fn new() -> Result<Self, TmuxError> {
        CommandExecutor::run("tmux", &["-V"], None)
            .await
            .map_err(|_| TmuxError::TmuxNotFound)?;
        Ok(Self)
    }

    fn validate_session_name(name: &str) -> Result<(), TmuxError> {
        if name.is_empty() {
            return Err(TmuxError::InvalidSessionName(
                "session name cannot be empty".to_string(),
            ));
        }
        if name.contains(':') || name.contains('.') {
            return Err(TmuxError::InvalidSessionName(
                "session name cannot contain ':' or '.'".to_string(),
            ));
        }
        Ok(())
    }

    async fn run(args: &[&str]) -> Result<String, TmuxError> {
        CommandExecutor::run("tmux", args, None)
            .await
            .map_err(|e| match e {
                ClaudioError::ExternalTool { stderr, .. } => TmuxError::CommandFailed(stderr),
                other => TmuxError::CommandFailed(other.to_string()),
            })
    }
}

#[async_trait]
impl Multiplexer for TmuxClient {
    async fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        size: WindowSize,
        command: &str,
    ) -> Result<(), TmuxError> {
        Self::validate_session_name(name)?;
        if self.session_exists(name).await? {
            return Err(TmuxError::CommandFailed(format!(
                "session '{}' already exists",
                name
            )));
        }
        let cwd_str = cwd.to_string_lossy();
        let width = size.width.to_string();
        let height = size.height.to_string();
        Self::run(&[
            "new-session",
            "-d",
            "-s",
            name,
            "-c",
            &cwd_str,
            "-x",
            &width,
            "-y",
            &height,
            command,
        ])
        .await?;
        Ok(())
    }

    async fn send_keys(&self, name: &str, keys: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await? {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        Self::run(&["send-keys", "-t", name, keys]).await?;
        Ok(())
    }

    async fn capture_pane(&self, name: &str) -> Result<Vec<u8>, TmuxError> {
        if !self.session_exists(name).await? {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        let out = Self::run(&["capture-pane", "-t", name, "-p"]).await?;
        Ok(out.into_bytes())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await? {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        Self::run(&["kill-session", "-t", name]).await?;
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> Result<bool, TmuxError> {
        let (_, _, ok) = CommandExecutor::run_unchecked("tmux", &["has-session", "-t", name], None)
            .await
            .map_err(|e| TmuxError::CommandFailed(e.to_string()))?;
        Ok(ok)
    }

    async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        let (stdout, _, ok) = CommandExecutor::run_unchecked(
            "tmux",
            &["list-sessions", "-F", "#{session_name}"],
            None,
        )
        .await
        .map_err(|e| TmuxError::CommandFailed(e.to_string()))?;
        if !ok {
            // No server running means no sessions.
            return Ok(Vec::new());
        }
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_validation() {
        assert!(TmuxClient::validate_session_name("claudio-abcd1234-xyz").is_ok());
        assert!(TmuxClient::validate_session_name("agent_123").is_ok());

        assert!(TmuxClient::validate_session_name("").is_err());
        assert!(TmuxClient::validate_session_name("a:b").is_err());
        assert!(TmuxClient::validate_session_name("a.b").is_err());
    }

    #[test]
    fn test_tmux_error_display() {
        let error = TmuxError::SessionNotFound("claudio-x".to_string());
        assert_eq!(error.to_string(), "session 'claudio-x' not found");
    }
}

//! Command execution utilities

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::error::{ClaudioError, Result};

/// Utility for executing external tools with consistent error handling.
///
/// Nonzero exits surface as [`ClaudioError::ExternalTool`] carrying the
/// captured stderr verbatim.
pub struct CommandExecutor;

impl CommandExecutor {
    /// Run a command and return trimmed stdout.
    pub async fn run(cmd: &str, args: &[&str], dir: Option<&Path>) -> Result<String> {
        let mut command = Command::new(cmd);
        command.args(args);

        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let output = command.output().await.map_err(ClaudioError::Io)?;

        if !output.status.success() {
            return Err(ClaudioError::ExternalTool {
                tool: format!("{} {}", cmd, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command with a timeout.
    pub async fn run_with_timeout(
        cmd: &str,
        args: &[&str],
        dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<String> {
        match tokio::time::timeout(timeout, Self::run(cmd, args, dir)).await {
            Ok(result) => result,
            Err(_) => Err(ClaudioError::ExternalTool {
                tool: format!("{} {}", cmd, args.join(" ")),
                stderr: format!("timed out after {:?}", timeout),
            }),
        }
    }

    /// Run a command, returning (stdout, stderr, success) without failing
    /// on nonzero exit. Used where the exit code itself is the answer.
    pub async fn run_unchecked(
        cmd: &str,
        args: &[&str],
        dir: Option<&Path>,
    ) -> Result<(String, String, bool)> {
        let mut command = Command::new(cmd);
        command.args(args);

        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let output = command.output().await.map_err(ClaudioError::Io)?;

        Ok((
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.success(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = CommandExecutor::run("echo", &["hello"], None).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let err = CommandExecutor::run("sh", &["-c", "echo boom >&2; exit 3"], None)
            .await
            .unwrap_err();
        match err {
            ClaudioError::ExternalTool { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("expected ExternalTool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_unchecked_reports_failure() {
        let (_, _, ok) = CommandExecutor::run_unchecked("sh", &["-c", "exit 1"], None)
            .await
            .unwrap();
        assert!(!ok);
    }
}

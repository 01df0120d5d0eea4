//! Crate-wide error taxonomy

use std::path::PathBuf;

/// Errors surfaced by claudio subsystems.
///
/// Recovery policy: `MalformedSentinel` and `ExternalTool` failures during
/// output capture are retried with bounded backoff before being surfaced;
/// `LockBusy` is fatal for the current invocation; `BudgetExceeded` pauses
/// instances without terminating them. Everything else propagates and the
/// session is persisted as-is so it can be attached or recovered later.
#[derive(Debug, thiserror::Error)]
pub enum ClaudioError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session lock held by pid {pid}")]
    LockBusy { pid: u32 },

    #[error("{tool} exited nonzero: {stderr}")]
    ExternalTool { tool: String, stderr: String },

    #[error("malformed completion file at {path}: {reason}")]
    MalformedSentinel { path: PathBuf, reason: String },

    #[error("session cost ${cost:.2} exceeded limit ${limit:.2}")]
    BudgetExceeded { cost: f64, limit: f64 },

    #[error("plan validation failed: {0}")]
    PlanInvalid(String),

    #[error("phase '{phase}' failed: {reason}")]
    PhaseFailure { phase: String, reason: String },

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T, E = ClaudioError> = std::result::Result<T, E>;

impl ClaudioError {
    /// Whether a bounded silent retry is appropriate for this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClaudioError::MalformedSentinel { .. }
                | ClaudioError::ExternalTool { .. }
                | ClaudioError::Io(_)
        )
    }
}

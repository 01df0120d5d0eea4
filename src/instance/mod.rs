//! Instance supervision
//!
//! One supervisor per instance runs a capture loop: it snapshots the tmux
//! pane into a bounded ring buffer, watches the worktree root for the
//! phase sentinel, enforces activity and completion timeouts, and feeds
//! metrics to the budget manager. Status is mirrored in a shared handle so
//! the UI can read snapshots without touching the loop.

pub mod buffer;
pub mod sentinel;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRunner;
use crate::budget::{BudgetManager, Pausable};
use crate::config::InstanceConfig;
use crate::coordination::{Event, EventBus};
use crate::session::{InstanceId, InstanceMetrics, InstanceStatus, SessionId};
use crate::utils::error::{ClaudioError, Result};
use crate::utils::retry::RetryPolicy;

pub use buffer::OutputBuffer;
pub use sentinel::{
    Completion, CompletionStatus, SentinelKind, CONSOLIDATION_SENTINEL,
    GROUP_CONSOLIDATION_SENTINEL, PLAN_FILE, REVISION_SENTINEL, SYNTHESIS_SENTINEL, TASK_SENTINEL,
};

/// Per-call usage report dropped by the agent next to the sentinels.
pub const METRICS_FILE: &str = ".claudio-metrics.json";

/// Pane tails matching any of these mark the instance `waiting_input`.
const INPUT_PATTERNS: &[&str] = &[
    r"(?i)\(y/n\)",
    r"(?i)do you want to",
    r"(?i)waiting for (your )?input",
    r"(?i)press enter to continue",
];

/// Timing knobs derived from [`InstanceConfig`]; zero minutes disables the
/// corresponding timeout.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub capture_interval: Duration,
    pub buffer_size: usize,
    pub activity_timeout: Option<Duration>,
    pub completion_timeout: Option<Duration>,
}

impl SupervisorOptions {
    pub fn from_config(config: &InstanceConfig) -> Self {
        let minutes = |m: u64| (m > 0).then(|| Duration::from_secs(m * 60));
        Self {
            capture_interval: Duration::from_millis(config.capture_interval_ms),
            buffer_size: config.output_buffer_size,
            activity_timeout: minutes(config.activity_timeout_minutes),
            completion_timeout: minutes(config.completion_timeout_minutes),
        }
    }
}

/// Shared, read-only view of a supervised instance.
pub struct InstanceHandle {
    pub session_id: SessionId,
    pub instance_id: InstanceId,
    pub mux_name: String,
    status: Mutex<InstanceStatus>,
    buffer: Mutex<OutputBuffer>,
    metrics: Mutex<InstanceMetrics>,
    pause_requested: AtomicBool,
    resume_requested: AtomicBool,
    cancel: CancellationToken,
}

impl InstanceHandle {
    fn new(
        session_id: SessionId,
        instance_id: InstanceId,
        mux_name: String,
        buffer_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            instance_id,
            mux_name,
            status: Mutex::new(InstanceStatus::Pending),
            buffer: Mutex::new(OutputBuffer::new(buffer_size)),
            metrics: Mutex::new(InstanceMetrics::default()),
            pause_requested: AtomicBool::new(false),
            resume_requested: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.lock().expect("status lock")
    }

    fn set_status(&self, status: InstanceStatus) {
        *self.status.lock().expect("status lock") = status;
    }

    pub fn output_tail(&self, bytes: usize) -> String {
        self.buffer.lock().expect("buffer lock").tail(bytes)
    }

    pub fn metrics(&self) -> InstanceMetrics {
        self.metrics.lock().expect("metrics lock").clone()
    }

    /// Ask the capture loop to resume a paused instance.
    pub fn request_resume(&self) {
        self.resume_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Pausable for InstanceHandle {
    fn request_pause(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        true
    }

    fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Final result of a supervision run.
#[derive(Debug)]
pub struct SupervisionOutcome {
    pub status: InstanceStatus,
    pub completion: Option<Completion>,
    pub error: Option<String>,
}

pub struct InstanceSupervisor {
    handle: Arc<InstanceHandle>,
    runner: Arc<AgentRunner>,
    bus: Arc<EventBus>,
    budget: Arc<BudgetManager>,
    worktree: PathBuf,
    sentinel: SentinelKind,
    opts: SupervisorOptions,
    capture_retry: RetryPolicy,
}

impl InstanceSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        instance_id: InstanceId,
        mux_name: String,
        worktree: PathBuf,
        sentinel: SentinelKind,
        runner: Arc<AgentRunner>,
        bus: Arc<EventBus>,
        budget: Arc<BudgetManager>,
        opts: SupervisorOptions,
        cancel: CancellationToken,
    ) -> Self {
        let handle = Arc::new(InstanceHandle::new(
            session_id,
            instance_id.clone(),
            mux_name,
            opts.buffer_size,
            cancel,
        ));
        budget.register(instance_id, handle.clone());
        Self {
            handle,
            runner,
            bus,
            budget,
            worktree,
            sentinel,
            opts,
            capture_retry: RetryPolicy::default(),
        }
    }

    pub fn handle(&self) -> Arc<InstanceHandle> {
        self.handle.clone()
    }

    fn transition(&self, to: InstanceStatus) {
        let from = self.handle.status();
        if from == to {
            return;
        }
        self.handle.set_status(to);
        self.bus.publish(Event::InstanceStatusChanged {
            session_id: self.handle.session_id.clone(),
            instance_id: self.handle.instance_id.clone(),
            from,
            to,
        });
    }

    /// Start the agent and supervise it to a terminal state.
    pub async fn run(&self, prompt: &str) -> Result<SupervisionOutcome> {
        {
            let mut metrics = self.handle.metrics.lock().expect("metrics lock");
            metrics.started_at = Some(chrono::Utc::now());
        }

        if let Err(e) = self
            .runner
            .start(&self.handle.mux_name, &self.worktree, prompt)
            .await
        {
            self.transition(InstanceStatus::Error);
            return Ok(self.outcome(None, Some(format!("failed to start agent: {}", e))));
        }
        self.transition(InstanceStatus::Working);

        let started = Instant::now();
        let mut last_activity = Instant::now();
        let mut last_capture: Vec<u8> = Vec::new();
        let mut malformed_reported = false;
        let input_patterns: Vec<regex::Regex> = INPUT_PATTERNS
            .iter()
            .map(|p| regex::Regex::new(p).expect("static regex"))
            .collect();

        loop {
            tokio::select! {
                _ = self.handle.cancel.cancelled() => {
                    let _ = self.runner.kill(&self.handle.mux_name).await;
                    self.finish_metrics();
                    return Err(ClaudioError::Cancelled);
                }
                _ = tokio::time::sleep(self.opts.capture_interval) => {}
            }

            // Pause and resume requests come from the budget manager or
            // the user; timers freeze while paused.
            if self.handle.pause_requested.swap(false, Ordering::SeqCst)
                && self.handle.status().is_active()
            {
                self.transition(InstanceStatus::Paused);
            }
            if self.handle.status() == InstanceStatus::Paused {
                if self.handle.resume_requested.swap(false, Ordering::SeqCst) {
                    self.transition(InstanceStatus::Working);
                    last_activity = Instant::now();
                }
                continue;
            }
            self.handle.resume_requested.store(false, Ordering::SeqCst);

            // Completion timeout wins when both timeouts expire in the
            // same tick.
            if let Some(limit) = self.opts.completion_timeout {
                if started.elapsed() >= limit {
                    let _ = self.runner.kill(&self.handle.mux_name).await;
                    self.transition(InstanceStatus::Timeout);
                    self.finish_metrics();
                    return Ok(self.outcome(None, Some("completion timeout exceeded".into())));
                }
            }

            // Sentinel check before the stall check so a completed agent
            // is never misread as stuck.
            match sentinel::poll_sentinel(&self.worktree, self.sentinel) {
                Ok(Some(completion)) => {
                    let _ = self.runner.kill(&self.handle.mux_name).await;
                    let status = completion.status();
                    if status.is_success() {
                        self.transition(InstanceStatus::Completed);
                        self.finish_metrics();
                        return Ok(self.outcome(Some(completion), None));
                    } else {
                        self.transition(InstanceStatus::Error);
                        self.finish_metrics();
                        return Ok(self.outcome(
                            Some(completion),
                            Some(format!("agent reported status {:?}", status)),
                        ));
                    }
                }
                Err(e @ ClaudioError::MalformedSentinel { .. }) => {
                    // The agent may still be writing; keep working and
                    // surface a warning once.
                    if !malformed_reported {
                        tracing::warn!(
                            "instance {}: {}",
                            self.handle.instance_id,
                            e
                        );
                        malformed_reported = true;
                    }
                }
                Err(e) => tracing::debug!("sentinel poll failed: {}", e),
                Ok(None) => malformed_reported = false,
            }

            // Capture the pane; a vanished pane is an external kill.
            let capture = self
                .capture_retry
                .run(|| async { self.runner.capture_pane(&self.handle.mux_name).await })
                .await;
            match capture {
                Ok(bytes) => {
                    if bytes != last_capture {
                        let appended = bytes.len();
                        {
                            let mut buffer = self.handle.buffer.lock().expect("buffer lock");
                            buffer.push(&bytes);
                        }
                        self.bus.publish(Event::InstanceOutputAppended {
                            session_id: self.handle.session_id.clone(),
                            instance_id: self.handle.instance_id.clone(),
                            bytes: appended,
                        });
                        last_activity = Instant::now();

                        let tail = String::from_utf8_lossy(&bytes);
                        let waiting = input_patterns.iter().any(|re| re.is_match(&tail));
                        match (waiting, self.handle.status()) {
                            (true, InstanceStatus::Working) => {
                                self.transition(InstanceStatus::WaitingInput)
                            }
                            (false, InstanceStatus::WaitingInput) => {
                                self.transition(InstanceStatus::Working)
                            }
                            _ => {}
                        }
                        last_capture = bytes;
                    }
                }
                Err(_) => {
                    if !self.runner.alive(&self.handle.mux_name).await.unwrap_or(false) {
                        self.transition(InstanceStatus::Error);
                        self.finish_metrics();
                        return Ok(
                            self.outcome(None, Some("agent pane disappeared".to_string()))
                        );
                    }
                }
            }

            self.poll_metrics();

            if let Some(limit) = self.opts.activity_timeout {
                if last_activity.elapsed() >= limit {
                    let _ = self.runner.kill(&self.handle.mux_name).await;
                    self.transition(InstanceStatus::Stuck);
                    self.finish_metrics();
                    return Ok(self.outcome(None, Some("no output activity".to_string())));
                }
            }
        }
    }

    /// Read the agent's usage report if present and feed the budget.
    fn poll_metrics(&self) {
        let path = self.worktree.join(METRICS_FILE);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return;
        };
        let Ok(reported) = serde_json::from_str::<InstanceMetrics>(&raw) else {
            return;
        };
        let merged = {
            let mut metrics = self.handle.metrics.lock().expect("metrics lock");
            let mut updated = reported;
            updated.started_at = metrics.started_at;
            updated.ended_at = metrics.ended_at;
            if *metrics == updated {
                return;
            }
            *metrics = updated;
            metrics.clone()
        };
        self.bus.publish(Event::InstanceMetricsUpdated {
            session_id: self.handle.session_id.clone(),
            instance_id: self.handle.instance_id.clone(),
            metrics: merged.clone(),
        });
        self.budget
            .update(&self.handle.instance_id, self.handle.status(), merged);
    }

    fn finish_metrics(&self) {
        let mut metrics = self.handle.metrics.lock().expect("metrics lock");
        metrics.ended_at = Some(chrono::Utc::now());
    }

    fn outcome(&self, completion: Option<Completion>, error: Option<String>) -> SupervisionOutcome {
        self.budget.unregister(&self.handle.instance_id);
        SupervisionOutcome {
            status: self.handle.status(),
            completion,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let mut config = InstanceConfig::default();
        config.capture_interval_ms = 250;
        config.activity_timeout_minutes = 0;
        config.completion_timeout_minutes = 90;

        let opts = SupervisorOptions::from_config(&config);
        assert_eq!(opts.capture_interval, Duration::from_millis(250));
        assert!(opts.activity_timeout.is_none());
        assert_eq!(opts.completion_timeout, Some(Duration::from_secs(90 * 60)));
    }

    #[test]
    fn test_handle_pause_rules() {
        let handle = InstanceHandle::new(
            "s".to_string(),
            "i".to_string(),
            "claudio-s-i".to_string(),
            1024,
            CancellationToken::new(),
        );
        handle.set_status(InstanceStatus::Working);
        assert!(handle.request_pause());

        handle.set_status(InstanceStatus::Completed);
        assert!(!handle.request_pause());
        assert!(Pausable::is_terminal(&handle));
    }
}

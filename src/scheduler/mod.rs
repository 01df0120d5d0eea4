//! Dependency-aware group scheduler
//!
//! Executes one group of an execution order at a time, keeping at most
//! `max_parallel` tasks in flight (0 means unbounded). A new task starts
//! as soon as a slot frees; the next group only starts once every task of
//! the current group is terminal. A terminal failure halts scheduling
//! unless the caller opted into continuing (auto-revision).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::session::InstanceStatus;
use crate::utils::error::{ClaudioError, Result};

/// Runs a single task to a terminal state.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch(&self, task_id: &str) -> Result<InstanceStatus>;
}

/// Observer invoked on every task completion.
pub type StatusObserver = Box<dyn Fn(&str, InstanceStatus) + Send + Sync>;

/// Final statuses for one group run.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub statuses: HashMap<String, InstanceStatus>,
    pub failed: Vec<String>,
    /// Tasks never started because scheduling halted.
    pub not_started: Vec<String>,
}

impl GroupOutcome {
    pub fn all_completed(&self) -> bool {
        self.failed.is_empty() && self.not_started.is_empty()
    }
}

pub struct GroupScheduler {
    max_parallel: usize,
    continue_on_failure: bool,
    cancel: CancellationToken,
    observer: Option<StatusObserver>,
}

impl GroupScheduler {
    pub fn new(max_parallel: usize, cancel: CancellationToken) -> Self {
        Self {
            max_parallel,
            continue_on_failure: false,
            cancel,
            observer: None,
        }
    }

    /// Keep launching queued tasks after a failure; used when the
    /// coordinator will revise failed tasks afterwards.
    pub fn continue_on_failure(mut self, yes: bool) -> Self {
        self.continue_on_failure = yes;
        self
    }

    pub fn with_observer(mut self, observer: StatusObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn slots(&self) -> usize {
        if self.max_parallel == 0 {
            usize::MAX
        } else {
            self.max_parallel
        }
    }

    /// Run one group to quiescence.
    pub async fn run_group(
        &self,
        group: &[String],
        launcher: Arc<dyn TaskLauncher>,
    ) -> Result<GroupOutcome> {
        let mut queue: VecDeque<String> = group.iter().cloned().collect();
        let (tx, rx) = async_channel::unbounded::<(String, Result<InstanceStatus>)>();
        let mut outcome = GroupOutcome::default();
        let mut in_flight = 0usize;
        let mut halted = false;

        loop {
            while !halted && in_flight < self.slots() {
                let Some(task_id) = queue.pop_front() else {
                    break;
                };
                let launcher = launcher.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = launcher.launch(&task_id).await;
                    let _ = tx.send((task_id, result)).await;
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let received = tokio::select! {
                _ = self.cancel.cancelled(), if !halted => {
                    // Stop issuing starts; in-flight tasks observe the
                    // same token and wind down.
                    halted = true;
                    continue;
                }
                received = rx.recv() => received,
            };

            let Ok((task_id, result)) = received else {
                break;
            };
            in_flight -= 1;

            match result {
                Ok(status) => {
                    if let Some(observer) = &self.observer {
                        observer(&task_id, status);
                    }
                    if status.is_failure() {
                        outcome.failed.push(task_id.clone());
                        if !self.continue_on_failure {
                            halted = true;
                        }
                    }
                    outcome.statuses.insert(task_id, status);
                }
                Err(ClaudioError::Cancelled) => {
                    halted = true;
                }
                Err(e) => {
                    tracing::error!("task {} failed to launch: {}", task_id, e);
                    if let Some(observer) = &self.observer {
                        observer(&task_id, InstanceStatus::Error);
                    }
                    outcome.statuses.insert(task_id.clone(), InstanceStatus::Error);
                    outcome.failed.push(task_id);
                    if !self.continue_on_failure {
                        halted = true;
                    }
                }
            }
        }

        outcome.not_started = queue.into_iter().collect();

        if self.cancel.is_cancelled() {
            return Err(ClaudioError::Cancelled);
        }
        Ok(outcome)
    }

    /// Run a whole execution order, group by group, stopping at the first
    /// group that does not fully complete.
    pub async fn run_all(
        &self,
        order: &[Vec<String>],
        launcher: Arc<dyn TaskLauncher>,
    ) -> Result<Vec<GroupOutcome>> {
        let mut outcomes = Vec::new();
        for group in order {
            let outcome = self.run_group(group, launcher.clone()).await?;
            let done = outcome.all_completed();
            outcomes.push(outcome);
            if !done && !self.continue_on_failure {
                break;
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fake launcher tracking concurrency and scripted outcomes.
    struct FakeLauncher {
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        failures: Vec<String>,
        launched: Mutex<Vec<String>>,
    }

    impl FakeLauncher {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                failures: Vec::new(),
                launched: Mutex::new(Vec::new()),
            })
        }

        fn failing(delay_ms: u64, failures: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                failures: failures.iter().map(|s| s.to_string()).collect(),
                launched: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskLauncher for FakeLauncher {
        async fn launch(&self, task_id: &str) -> Result<InstanceStatus> {
            self.launched.lock().unwrap().push(task_id.to_string());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.failures.iter().any(|f| f == task_id) {
                Ok(InstanceStatus::Error)
            } else {
                Ok(InstanceStatus::Completed)
            }
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_parallel_cap_respected() {
        let launcher = FakeLauncher::new(20);
        let scheduler = GroupScheduler::new(2, CancellationToken::new());
        let outcome = scheduler
            .run_group(&ids(&["a", "b", "c", "d", "e"]), launcher.clone())
            .await
            .unwrap();

        assert!(outcome.all_completed());
        assert_eq!(outcome.statuses.len(), 5);
        assert!(launcher.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_unbounded_when_zero() {
        let launcher = FakeLauncher::new(30);
        let scheduler = GroupScheduler::new(0, CancellationToken::new());
        scheduler
            .run_group(&ids(&["a", "b", "c", "d"]), launcher.clone())
            .await
            .unwrap();
        assert_eq!(launcher.peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failure_halts_queue() {
        let launcher = FakeLauncher::failing(5, &["a"]);
        let scheduler = GroupScheduler::new(1, CancellationToken::new());
        let outcome = scheduler
            .run_group(&ids(&["a", "b", "c"]), launcher.clone())
            .await
            .unwrap();

        assert_eq!(outcome.failed, vec!["a"]);
        assert_eq!(outcome.not_started, vec!["b", "c"]);
        assert!(!outcome.all_completed());
    }

    #[tokio::test]
    async fn test_continue_on_failure_drains_group() {
        let launcher = FakeLauncher::failing(5, &["b"]);
        let scheduler =
            GroupScheduler::new(1, CancellationToken::new()).continue_on_failure(true);
        let outcome = scheduler
            .run_group(&ids(&["a", "b", "c"]), launcher.clone())
            .await
            .unwrap();

        assert_eq!(outcome.failed, vec!["b"]);
        assert!(outcome.not_started.is_empty());
        assert_eq!(outcome.statuses.len(), 3);
    }

    #[tokio::test]
    async fn test_groups_are_gated() {
        let launcher = FakeLauncher::new(10);
        let scheduler = GroupScheduler::new(4, CancellationToken::new());
        let order = vec![ids(&["g0a", "g0b"]), ids(&["g1a"])];
        scheduler.run_all(&order, launcher.clone()).await.unwrap();

        let launched = launcher.launched.lock().unwrap().clone();
        let g1_pos = launched.iter().position(|t| t == "g1a").unwrap();
        assert!(launched[..g1_pos].contains(&"g0a".to_string()));
        assert!(launched[..g1_pos].contains(&"g0b".to_string()));
    }

    #[tokio::test]
    async fn test_failed_group_stops_run_all() {
        let launcher = FakeLauncher::failing(5, &["g0a"]);
        let scheduler = GroupScheduler::new(2, CancellationToken::new());
        let order = vec![ids(&["g0a"]), ids(&["g1a"])];
        let outcomes = scheduler.run_all(&order, launcher.clone()).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(!launcher.launched.lock().unwrap().contains(&"g1a".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_starts() {
        let launcher = FakeLauncher::new(50);
        let cancel = CancellationToken::new();
        let scheduler = GroupScheduler::new(1, cancel.clone());
        let cancel_soon = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_soon.cancel();
        });

        let err = scheduler
            .run_group(&ids(&["a", "b", "c", "d"]), launcher.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ClaudioError::Cancelled));
        assert!(launcher.launched.lock().unwrap().len() < 4);
    }

    #[tokio::test]
    async fn test_observer_sees_every_completion() {
        let launcher = FakeLauncher::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_observer = seen.clone();
        let scheduler = GroupScheduler::new(2, CancellationToken::new()).with_observer(
            Box::new(move |id, status| {
                seen_in_observer.lock().unwrap().push((id.to_string(), status));
            }),
        );
        scheduler
            .run_group(&ids(&["a", "b"]), launcher)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}

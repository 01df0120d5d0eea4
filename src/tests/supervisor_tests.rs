//! Supervisor behavior against fake agents

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::support::FakeMux;
use crate::agent::AgentRunner;
use crate::budget::BudgetManager;
use crate::config::{AgentConfig, InstanceConfig, ResourceConfig};
use crate::coordination::{Event, EventBus, Topic};
use crate::instance::{
    InstanceHandle, InstanceSupervisor, SentinelKind, SupervisorOptions, METRICS_FILE,
    TASK_SENTINEL,
};
use crate::session::InstanceStatus;
use crate::tmux::Multiplexer;
use crate::utils::error::Result;

struct Harness {
    worktree: TempDir,
    mux: Arc<FakeMux>,
    bus: Arc<EventBus>,
    budget: Arc<BudgetManager>,
    handle: Arc<InstanceHandle>,
    join: tokio::task::JoinHandle<Result<crate::instance::SupervisionOutcome>>,
}

fn options() -> SupervisorOptions {
    SupervisorOptions {
        capture_interval: Duration::from_millis(10),
        buffer_size: 16 * 1024,
        activity_timeout: None,
        completion_timeout: None,
    }
}

fn start_supervised(
    opts: SupervisorOptions,
    resources: ResourceConfig,
    mux: Arc<FakeMux>,
) -> Harness {
    let worktree = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let budget = Arc::new(BudgetManager::new("sid".to_string(), resources, bus.clone()));
    let runner = Arc::new(AgentRunner::new(
        mux.clone(),
        AgentConfig::default(),
        &InstanceConfig::default(),
    ));
    let supervisor = InstanceSupervisor::new(
        "sid".to_string(),
        "iid".to_string(),
        "claudio-sid-iid".to_string(),
        worktree.path().to_path_buf(),
        SentinelKind::Task,
        runner,
        bus.clone(),
        budget.clone(),
        opts,
        CancellationToken::new(),
    );
    let handle = supervisor.handle();
    let join = tokio::spawn(async move { supervisor.run("do the task").await });
    Harness {
        worktree,
        mux,
        bus,
        budget,
        handle,
        join,
    }
}

async fn wait_for_status(handle: &InstanceHandle, want: InstanceStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.status() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}, at {:?}", want, handle.status()));
}

#[tokio::test]
async fn test_sentinel_at_root_completes() {
    let h = start_supervised(options(), ResourceConfig::default(), FakeMux::inert());
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    std::fs::write(
        h.worktree.path().join(TASK_SENTINEL),
        r#"{"status": "complete", "files_modified": ["a.rs", "b.rs"]}"#,
    )
    .unwrap();

    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Completed);
    // The pane is torn down once the instance is terminal.
    assert!(!h.mux.session_exists("claudio-sid-iid").await.unwrap());
}

#[tokio::test]
async fn test_sentinel_in_subdirectory_is_ignored() {
    let h = start_supervised(options(), ResourceConfig::default(), FakeMux::inert());
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    let sub = h.worktree.path().join("src");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(sub.join(TASK_SENTINEL), r#"{"status": "complete"}"#).unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.handle.status(), InstanceStatus::Working);

    // The same file at the root transitions immediately.
    std::fs::write(
        h.worktree.path().join(TASK_SENTINEL),
        r#"{"status": "complete"}"#,
    )
    .unwrap();
    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_malformed_sentinel_keeps_working() {
    let h = start_supervised(options(), ResourceConfig::default(), FakeMux::inert());
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    std::fs::write(h.worktree.path().join(TASK_SENTINEL), "{truncated").unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.handle.status(), InstanceStatus::Working);

    std::fs::write(
        h.worktree.path().join(TASK_SENTINEL),
        r#"{"status": "complete"}"#,
    )
    .unwrap();
    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_failed_status_is_error() {
    let h = start_supervised(options(), ResourceConfig::default(), FakeMux::inert());
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    std::fs::write(
        h.worktree.path().join(TASK_SENTINEL),
        r#"{"status": "failed", "summary": "could not build"}"#,
    )
    .unwrap();
    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Error);
    assert!(outcome.error.unwrap().contains("Failed"));
}

#[tokio::test]
async fn test_completion_timeout() {
    let mut opts = options();
    opts.completion_timeout = Some(Duration::from_millis(60));
    let h = start_supervised(opts, ResourceConfig::default(), FakeMux::inert());

    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Timeout);
}

#[tokio::test]
async fn test_activity_stall_marks_stuck() {
    let mut opts = options();
    opts.activity_timeout = Some(Duration::from_millis(80));
    let h = start_supervised(opts, ResourceConfig::default(), FakeMux::inert());

    // Pane content never changes after the first capture, so the stall
    // clock runs out.
    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Stuck);
}

#[tokio::test]
async fn test_vanished_pane_is_error() {
    let h = start_supervised(options(), ResourceConfig::default(), FakeMux::inert());
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    h.mux.vanish("claudio-sid-iid");
    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Error);
    assert!(outcome.error.unwrap().contains("pane"));
}

#[tokio::test]
async fn test_cancellation_kills_agent() {
    let h = start_supervised(options(), ResourceConfig::default(), FakeMux::inert());
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    h.handle.cancel();
    let result = h.join.await.unwrap();
    assert!(result.is_err());
    assert!(!h.mux.session_exists("claudio-sid-iid").await.unwrap());
}

#[tokio::test]
async fn test_budget_limit_pauses_then_resume_completes() {
    let resources = ResourceConfig {
        cost_warning_threshold: 0.5,
        cost_limit: 1.0,
        token_limit_per_instance: 0,
    };
    let h = start_supervised(options(), resources, FakeMux::inert());
    let limit_events = h.bus.subscribe_topics(vec![Topic::BudgetLimit]);
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    // The agent reports spend past the limit; the supervisor feeds the
    // budget manager, which pauses the instance.
    std::fs::write(
        h.worktree.path().join(METRICS_FILE),
        r#"{"input_tokens": 1000, "output_tokens": 500, "cost_usd": 2.0, "api_calls": 3}"#,
    )
    .unwrap();
    wait_for_status(&h.handle, InstanceStatus::Paused).await;
    assert!(h.budget.limit_reached());
    assert!(matches!(limit_events.recv().await, Event::BudgetLimit { .. }));
    assert!(limit_events.try_recv().is_none(), "limit fired twice");

    // While paused, a sentinel is not consumed.
    std::fs::write(
        h.worktree.path().join(TASK_SENTINEL),
        r#"{"status": "complete"}"#,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.status(), InstanceStatus::Paused);

    h.handle.request_resume();
    let outcome = h.join.await.unwrap().unwrap();
    assert_eq!(outcome.status, InstanceStatus::Completed);
    assert_eq!(h.handle.metrics().api_calls, 3);
}

#[tokio::test]
async fn test_output_events_and_buffer() {
    let mux = FakeMux::inert();
    let h = start_supervised(options(), ResourceConfig::default(), mux.clone());
    let output_events = h.bus.subscribe_topics(vec![Topic::InstanceOutputAppended]);
    wait_for_status(&h.handle, InstanceStatus::Working).await;

    mux.set_pane("claudio-sid-iid", b"compiling...\ntests passing\n");
    tokio::time::timeout(Duration::from_secs(5), output_events.recv())
        .await
        .expect("no output event");

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(h.handle.output_tail(1024).contains("tests passing"));

    std::fs::write(
        h.worktree.path().join(TASK_SENTINEL),
        r#"{"status": "complete"}"#,
    )
    .unwrap();
    h.join.await.unwrap().unwrap();
}

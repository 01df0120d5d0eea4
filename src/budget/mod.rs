//! Resource budget enforcement
//!
//! Aggregates per-instance metrics into a session-wide total on every
//! update. Crossing the warning threshold is advisory and fires once;
//! crossing the cost limit pauses every registered non-terminal instance.
//! Instances that are not actively working are ignored.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ResourceConfig;
use crate::coordination::{Event, EventBus};
use crate::session::{InstanceId, InstanceMetrics, InstanceStatus, SessionId};

/// Pause capability exposed by instance supervisors.
pub trait Pausable: Send + Sync {
    /// Ask the instance to pause; returns false if already terminal.
    fn request_pause(&self) -> bool;

    fn is_terminal(&self) -> bool;
}

pub struct BudgetManager {
    session_id: SessionId,
    config: ResourceConfig,
    bus: Arc<EventBus>,
    per_instance: DashMap<InstanceId, InstanceMetrics>,
    targets: DashMap<InstanceId, Arc<dyn Pausable>>,
    warned: AtomicBool,
    limited: AtomicBool,
    token_flagged: DashMap<InstanceId, ()>,
}

impl BudgetManager {
    pub fn new(session_id: SessionId, config: ResourceConfig, bus: Arc<EventBus>) -> Self {
        Self {
            session_id,
            config,
            bus,
            per_instance: DashMap::new(),
            targets: DashMap::new(),
            warned: AtomicBool::new(false),
            limited: AtomicBool::new(false),
            token_flagged: DashMap::new(),
        }
    }

    /// Register an instance that can be paused on a limit breach.
    pub fn register(&self, instance_id: InstanceId, target: Arc<dyn Pausable>) {
        self.targets.insert(instance_id, target);
    }

    pub fn unregister(&self, instance_id: &str) {
        self.targets.remove(instance_id);
    }

    /// Record a metrics update from a supervisor.
    pub fn update(&self, instance_id: &str, status: InstanceStatus, metrics: InstanceMetrics) {
        if !status.is_active() {
            return;
        }

        if self.config.token_limit_per_instance > 0
            && metrics.total_tokens() > self.config.token_limit_per_instance
            && self
                .token_flagged
                .insert(instance_id.to_string(), ())
                .is_none()
        {
            tracing::warn!(
                "instance {} exceeded token limit ({} > {}), pausing",
                instance_id,
                metrics.total_tokens(),
                self.config.token_limit_per_instance
            );
            if let Some(target) = self.targets.get(instance_id) {
                target.request_pause();
            }
        }

        self.per_instance.insert(instance_id.to_string(), metrics);
        let total = self.session_cost();

        if self.config.cost_warning_threshold > 0.0
            && total >= self.config.cost_warning_threshold
            && !self.warned.swap(true, Ordering::SeqCst)
        {
            self.bus.publish(Event::BudgetWarning {
                session_id: self.session_id.clone(),
                cost_usd: total,
            });
        }

        if self.config.cost_limit > 0.0
            && total >= self.config.cost_limit
            && !self.limited.swap(true, Ordering::SeqCst)
        {
            tracing::warn!(
                "session cost ${:.2} crossed limit ${:.2}, pausing all instances",
                total,
                self.config.cost_limit
            );
            self.pause_all();
            self.bus.publish(Event::BudgetLimit {
                session_id: self.session_id.clone(),
                cost_usd: total,
            });
        }
    }

    fn pause_all(&self) {
        for entry in self.targets.iter() {
            if !entry.value().is_terminal() {
                entry.value().request_pause();
            }
        }
    }

    /// Whether the cost limit has been crossed; no further starts until
    /// the user resumes.
    pub fn limit_reached(&self) -> bool {
        self.limited.load(Ordering::SeqCst)
    }

    pub fn session_cost(&self) -> f64 {
        self.per_instance.iter().map(|e| e.value().cost_usd).sum()
    }

    pub fn session_totals(&self) -> InstanceMetrics {
        let mut totals = InstanceMetrics::default();
        for entry in self.per_instance.iter() {
            totals.merge_totals(entry.value());
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Topic;
    use std::sync::atomic::AtomicU32;

    struct FakeTarget {
        paused: AtomicU32,
        terminal: AtomicBool,
    }

    impl FakeTarget {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                paused: AtomicU32::new(0),
                terminal: AtomicBool::new(false),
            })
        }
    }

    impl Pausable for FakeTarget {
        fn request_pause(&self) -> bool {
            self.paused.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn is_terminal(&self) -> bool {
            self.terminal.load(Ordering::SeqCst)
        }
    }

    fn metrics(cost: f64) -> InstanceMetrics {
        InstanceMetrics {
            cost_usd: cost,
            ..Default::default()
        }
    }

    fn manager(limit: f64, warn: f64) -> (Arc<EventBus>, BudgetManager) {
        let bus = Arc::new(EventBus::new());
        let config = ResourceConfig {
            cost_warning_threshold: warn,
            cost_limit: limit,
            token_limit_per_instance: 0,
        };
        let mgr = BudgetManager::new("sid".to_string(), config, bus.clone());
        (bus, mgr)
    }

    #[tokio::test]
    async fn test_warning_fires_once() {
        let (bus, mgr) = manager(0.0, 1.0);
        let sub = bus.subscribe_topics(vec![Topic::BudgetWarning]);

        mgr.update("a", InstanceStatus::Working, metrics(0.6));
        mgr.update("b", InstanceStatus::Working, metrics(0.6));
        mgr.update("b", InstanceStatus::Working, metrics(0.9));

        assert!(matches!(sub.recv().await, Event::BudgetWarning { .. }));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_limit_pauses_non_terminal() {
        let (bus, mgr) = manager(1.0, 0.5);
        let sub = bus.subscribe_topics(vec![Topic::BudgetLimit]);

        let live = FakeTarget::new();
        let done = FakeTarget::new();
        done.terminal.store(true, Ordering::SeqCst);
        mgr.register("live".to_string(), live.clone());
        mgr.register("done".to_string(), done.clone());

        mgr.update("live", InstanceStatus::Working, metrics(1.25));

        assert!(mgr.limit_reached());
        assert_eq!(live.paused.load(Ordering::SeqCst), 1);
        assert_eq!(done.paused.load(Ordering::SeqCst), 0);
        assert!(matches!(sub.recv().await, Event::BudgetLimit { .. }));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_non_working_updates_ignored() {
        let (_bus, mgr) = manager(1.0, 0.5);
        mgr.update("a", InstanceStatus::Completed, metrics(5.0));
        assert!(!mgr.limit_reached());
        assert_eq!(mgr.session_cost(), 0.0);
    }

    #[tokio::test]
    async fn test_token_limit_pauses_single_instance() {
        let bus = Arc::new(EventBus::new());
        let config = ResourceConfig {
            cost_warning_threshold: 0.0,
            cost_limit: 0.0,
            token_limit_per_instance: 100,
        };
        let mgr = BudgetManager::new("sid".to_string(), config, bus);
        let target = FakeTarget::new();
        mgr.register("a".to_string(), target.clone());

        let m = InstanceMetrics {
            input_tokens: 80,
            output_tokens: 40,
            ..Default::default()
        };
        mgr.update("a", InstanceStatus::Working, m.clone());
        mgr.update("a", InstanceStatus::Working, m);

        assert_eq!(target.paused.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_disables() {
        let (_bus, mgr) = manager(0.0, 0.0);
        mgr.update("a", InstanceStatus::Working, metrics(1_000.0));
        assert!(!mgr.limit_reached());
    }
}

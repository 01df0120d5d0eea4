//! Typed event bus
//!
//! Lifecycle notifications flow from supervisors, the budget manager, and
//! the phase coordinator to any number of subscribers. Each subscription
//! owns a bounded mailbox; publishers never block. When a mailbox is full
//! the oldest event for that subscriber is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

use crate::orchestrator::phase::Phase;
use crate::session::{InstanceId, InstanceMetrics, InstanceStatus, SessionId};

pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Event topics, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    InstanceStatusChanged,
    InstanceOutputAppended,
    InstanceMetricsUpdated,
    PrCompleted,
    PhaseAdvanced,
    BudgetWarning,
    BudgetLimit,
}

/// A lifecycle event.
#[derive(Debug, Clone)]
pub enum Event {
    InstanceStatusChanged {
        session_id: SessionId,
        instance_id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    InstanceOutputAppended {
        session_id: SessionId,
        instance_id: InstanceId,
        bytes: usize,
    },
    InstanceMetricsUpdated {
        session_id: SessionId,
        instance_id: InstanceId,
        metrics: InstanceMetrics,
    },
    PrCompleted {
        session_id: SessionId,
        instance_id: InstanceId,
        url: String,
    },
    PhaseAdvanced {
        session_id: SessionId,
        phase: Phase,
    },
    BudgetWarning {
        session_id: SessionId,
        cost_usd: f64,
    },
    BudgetLimit {
        session_id: SessionId,
        cost_usd: f64,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::InstanceStatusChanged { .. } => Topic::InstanceStatusChanged,
            Event::InstanceOutputAppended { .. } => Topic::InstanceOutputAppended,
            Event::InstanceMetricsUpdated { .. } => Topic::InstanceMetricsUpdated,
            Event::PrCompleted { .. } => Topic::PrCompleted,
            Event::PhaseAdvanced { .. } => Topic::PhaseAdvanced,
            Event::BudgetWarning { .. } => Topic::BudgetWarning,
            Event::BudgetLimit { .. } => Topic::BudgetLimit,
        }
    }
}

struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    /// None subscribes to every topic.
    topics: Option<Vec<Topic>>,
}

impl Mailbox {
    fn accepts(&self, topic: Topic) -> bool {
        match &self.topics {
            None => true,
            Some(list) => list.contains(&topic),
        }
    }

    fn deliver(&self, event: Event) {
        {
            let mut queue = self.queue.lock().expect("mailbox lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Receiving side of a subscription.
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.mailbox.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.mailbox.queue.lock().expect("mailbox lock").pop_front()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }
}

/// The bus itself. Cheap to clone through `Arc`.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<Mailbox>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_filtered(None, DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn subscribe_topics(&self, topics: Vec<Topic>) -> Subscription {
        self.subscribe_filtered(Some(topics), DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn subscribe_filtered(
        &self,
        topics: Option<Vec<Topic>>,
        capacity: usize,
    ) -> Subscription {
        let mailbox = Arc::new(Mailbox {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            topics,
        });
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .push(Arc::downgrade(&mailbox));
        Subscription { mailbox }
    }

    /// Deliver to every live subscriber whose filter matches. Dead
    /// subscriptions are pruned as a side effect.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        subscribers.retain(|weak| match weak.upgrade() {
            Some(mailbox) => {
                if mailbox.accepts(topic) {
                    mailbox.deliver(event.clone());
                }
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event(to: InstanceStatus) -> Event {
        Event::InstanceStatusChanged {
            session_id: "s".to_string(),
            instance_id: "i".to_string(),
            from: InstanceStatus::Pending,
            to,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.publish(status_event(InstanceStatus::Working));

        match sub.recv().await {
            Event::InstanceStatusChanged { to, .. } => assert_eq!(to, InstanceStatus::Working),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_topic_filter() {
        let bus = EventBus::new();
        let sub = bus.subscribe_topics(vec![Topic::BudgetWarning]);

        bus.publish(status_event(InstanceStatus::Working));
        bus.publish(Event::BudgetWarning {
            session_id: "s".to_string(),
            cost_usd: 10.5,
        });

        match sub.recv().await {
            Event::BudgetWarning { cost_usd, .. } => assert!((cost_usd - 10.5).abs() < 1e-9),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new();
        let sub = bus.subscribe_filtered(None, 2);

        bus.publish(status_event(InstanceStatus::Working));
        bus.publish(status_event(InstanceStatus::Paused));
        bus.publish(status_event(InstanceStatus::Completed));

        assert_eq!(sub.dropped(), 1);
        match sub.recv().await {
            Event::InstanceStatusChanged { to, .. } => assert_eq!(to, InstanceStatus::Paused),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_per_publisher_order_preserved() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for status in [
            InstanceStatus::Working,
            InstanceStatus::Paused,
            InstanceStatus::Completed,
        ] {
            bus.publish(status_event(status));
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            if let Event::InstanceStatusChanged { to, .. } = sub.recv().await {
                seen.push(to);
            }
        }
        assert_eq!(
            seen,
            vec![
                InstanceStatus::Working,
                InstanceStatus::Paused,
                InstanceStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_dead_subscribers_pruned() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe();
        }
        bus.publish(status_event(InstanceStatus::Working));
        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }
}

//! In-process event bus for updater lifecycle notifications
//!
//! Other parts of the portal (and the logs) want to know when an update
//! starts, succeeds or fails without caring about percentages. One bus is
//! built by the composition root and handed to whoever needs it.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    UpdateSources,
    Prepare,
    Upgrade,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::UpdateSources => "os_update_sources",
            Topic::Prepare => "os_updater_prepare",
            Topic::Upgrade => "os_updater_upgrade",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Started,
    Success,
    Failed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Started => "started",
            LifecycleStatus::Success => "success",
            LifecycleStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub topic: Topic,
    pub status: LifecycleStatus,
}

pub type Subscriber = Arc<dyn Fn(Lifecycle) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<(Topic, Subscriber)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, subscriber: F)
    where
        F: Fn(Lifecycle) + Send + Sync + 'static,
    {
        self.subscribers.lock().push((topic, Arc::new(subscriber)));
    }

    /// Call every subscriber of `topic` in subscription order
    ///
    /// A panicking subscriber is logged and skipped. Subscribers may publish
    /// or subscribe themselves; the registry is not held while they run.
    pub fn publish(&self, topic: Topic, status: LifecycleStatus) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, s)| Arc::clone(s))
            .collect();

        let event = Lifecycle { topic, status };
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                error!("Subscriber to {} panicked on {}", topic, status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, topic: Topic) -> Arc<Mutex<Vec<Lifecycle>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(topic, move |event| sink.lock().push(event));
        seen
    }

    #[test]
    fn only_matching_topic_is_delivered() {
        let bus = EventBus::new();
        let prepare = recorder(&bus, Topic::Prepare);
        let upgrade = recorder(&bus, Topic::Upgrade);

        bus.publish(Topic::Prepare, LifecycleStatus::Started);

        assert_eq!(
            *prepare.lock(),
            vec![Lifecycle {
                topic: Topic::Prepare,
                status: LifecycleStatus::Started
            }]
        );
        assert!(upgrade.lock().is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_stop_the_others() {
        let bus = EventBus::new();
        bus.subscribe(Topic::Upgrade, |_| panic!("subscriber bug"));
        let seen = recorder(&bus, Topic::Upgrade);

        bus.publish(Topic::Upgrade, LifecycleStatus::Failed);

        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn subscriber_may_publish() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe(Topic::Prepare, move |event| {
            if event.status == LifecycleStatus::Success {
                inner.publish(Topic::Upgrade, LifecycleStatus::Started);
            }
        });
        let upgrade = recorder(&bus, Topic::Upgrade);

        bus.publish(Topic::Prepare, LifecycleStatus::Success);

        assert_eq!(upgrade.lock().len(), 1);
    }

    #[test]
    fn topic_names() {
        assert_eq!(Topic::UpdateSources.to_string(), "os_update_sources");
        assert_eq!(Topic::Prepare.to_string(), "os_updater_prepare");
        assert_eq!(Topic::Upgrade.to_string(), "os_updater_upgrade");
        assert_eq!(LifecycleStatus::Started.to_string(), "started");
    }
}

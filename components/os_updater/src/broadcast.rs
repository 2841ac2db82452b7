//! Fan-out of updater events to live observers
//!
//! Observers are typically WebSocket connections. Delivery never blocks: an
//! observer whose delivery fails is assumed gone and dropped from the
//! registry on the spot.

use crate::progress::EventReceiver;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use updater_protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("observer is no longer reachable")]
pub struct ObserverGone;

pub trait Observer: Send + Sync {
    fn id(&self) -> ObserverId;

    fn deliver(&self, envelope: &Envelope) -> Result<(), ObserverGone>;

    /// Liveness check used when counting observers
    fn ping(&self) -> Result<(), ObserverGone>;
}

/// Who gets admitted when an observer asks for state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistrationPolicy {
    /// Only admit when nobody else is registered
    FirstAttacher,
    /// Admit every distinct observer
    #[default]
    Shared,
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    observers: Arc<Mutex<Vec<Arc<dyn Observer>>>>,
    policy: RegistrationPolicy,
}

impl Broadcaster {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Self {
            observers: Arc::default(),
            policy,
        }
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    /// Register `observer` if the policy allows it. Returns whether it is
    /// registered afterwards.
    pub fn admit(&self, observer: Arc<dyn Observer>) -> bool {
        let mut observers = self.observers.lock();
        let id = observer.id();
        if observers.iter().any(|o| o.id() == id) {
            return true;
        }
        if self.policy == RegistrationPolicy::FirstAttacher && !observers.is_empty() {
            debug!("Not admitting {}, single viewer already attached", id);
            return false;
        }
        info!("👀 {} attached", id);
        observers.push(observer);
        true
    }

    pub fn remove(&self, id: ObserverId) {
        self.observers.lock().retain(|o| o.id() != id);
    }

    /// Deliver to every registered observer, dropping the ones that fail
    pub fn broadcast(&self, envelope: &Envelope) {
        let mut observers = self.observers.lock();
        observers.retain(|observer| match observer.deliver(envelope) {
            Ok(()) => true,
            Err(ObserverGone) => {
                info!("{} gone, dropping it", observer.id());
                false
            }
        });
    }

    /// Ping every observer, prune the unreachable ones, count the rest
    pub fn active_observer_count(&self) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(|observer| observer.ping().is_ok());
        observers.len()
    }

    /// Drain the event channel until every sender is gone
    pub async fn run(self, mut events: EventReceiver) {
        while let Some(envelope) = events.recv().await {
            self.broadcast(&envelope);
        }
        debug!("Event channel closed, broadcaster stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::event_channel;
    use std::sync::atomic::AtomicBool;
    use updater_protocol::{MessageType, ProgressEvent, Status};

    struct Recording {
        id: ObserverId,
        alive: AtomicBool,
        received: Mutex<Vec<Envelope>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ObserverId::next(),
                alive: AtomicBool::new(true),
                received: Mutex::new(Vec::new()),
            })
        }

        fn disconnect(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        fn received(&self) -> usize {
            self.received.lock().len()
        }

        fn check(&self) -> Result<(), ObserverGone> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ObserverGone)
            }
        }
    }

    impl Observer for Recording {
        fn id(&self) -> ObserverId {
            self.id
        }

        fn deliver(&self, envelope: &Envelope) -> Result<(), ObserverGone> {
            self.check()?;
            self.received.lock().push(envelope.clone());
            Ok(())
        }

        fn ping(&self) -> Result<(), ObserverGone> {
            self.check()
        }
    }

    fn event(message: &str) -> Envelope {
        Envelope::progress(
            MessageType::OsUpgrade,
            ProgressEvent::new(Status::Status, 10.0, message),
        )
    }

    #[test]
    fn shared_policy_admits_everyone_once() {
        let broadcaster = Broadcaster::new(RegistrationPolicy::Shared);
        let first = Recording::new();
        let second = Recording::new();

        assert!(broadcaster.admit(first.clone()));
        assert!(broadcaster.admit(second.clone()));
        assert!(broadcaster.admit(first.clone()));

        assert_eq!(broadcaster.active_observer_count(), 2);
    }

    #[test]
    fn first_attacher_policy_turns_away_later_observers() {
        let broadcaster = Broadcaster::new(RegistrationPolicy::FirstAttacher);
        let first = Recording::new();
        let second = Recording::new();

        assert!(broadcaster.admit(first.clone()));
        assert!(!broadcaster.admit(second.clone()));

        broadcaster.broadcast(&event("hello"));
        assert_eq!(first.received(), 1);
        assert_eq!(second.received(), 0);
    }

    #[test]
    fn failed_delivery_drops_the_observer() {
        let broadcaster = Broadcaster::default();
        let alive = Recording::new();
        let dead = Recording::new();
        broadcaster.admit(alive.clone());
        broadcaster.admit(dead.clone());

        dead.disconnect();
        broadcaster.broadcast(&event("one"));
        broadcaster.broadcast(&event("two"));

        assert_eq!(alive.received(), 2);
        assert_eq!(broadcaster.active_observer_count(), 1);
    }

    #[test]
    fn counting_prunes_unreachable_observers() {
        let broadcaster = Broadcaster::default();
        let observer = Recording::new();
        broadcaster.admit(observer.clone());

        observer.disconnect();

        assert_eq!(broadcaster.active_observer_count(), 0);
    }

    #[test]
    fn first_attacher_slot_frees_up_after_disconnect() {
        let broadcaster = Broadcaster::new(RegistrationPolicy::FirstAttacher);
        let first = Recording::new();
        broadcaster.admit(first.clone());
        first.disconnect();
        broadcaster.active_observer_count();

        assert!(broadcaster.admit(Recording::new()));
    }

    #[tokio::test]
    async fn pump_delivers_in_channel_order() {
        let broadcaster = Broadcaster::default();
        let observer = Recording::new();
        broadcaster.admit(observer.clone());
        let (tx, rx) = event_channel();

        tx.send(event("a")).unwrap();
        tx.send(event("b")).unwrap();
        drop(tx);
        broadcaster.clone().run(rx).await;

        let messages: Vec<String> = observer
            .received
            .lock()
            .iter()
            .map(|e| e.progress_event().unwrap().message.clone())
            .collect();
        assert_eq!(messages, vec!["a", "b"]);
    }
}

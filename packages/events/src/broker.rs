//! Process-wide publish/subscribe broker for [`Notification`]s.
//!
//! The broker owns every listener. A [`Subscription`] is the disposer: it
//! deregisters itself on [`Subscription::unsubscribe`] or when dropped, so
//! a component that goes away can never leave a listener behind.
//!
//! Each listener has a bounded queue. A listener that stops reading loses
//! notifications once its queue is full instead of growing without limit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{Notification, Topic};

/// Notifications a listener may have queued before further ones are dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

struct Listener {
    topics: Option<BTreeSet<Topic>>,
    sender: mpsc::Sender<Notification>,
}

impl Listener {
    fn wants(&self, topic: Topic) -> bool {
        self.topics.as_ref().is_none_or(|topics| topics.contains(&topic))
    }
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener>>,
}

impl Registry {
    fn listeners(&self) -> MutexGuard<'_, BTreeMap<u64, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fans notifications out to live subscribers.
///
/// Cloning the broker yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventBroker {
    registry: Arc<Registry>,
}

impl EventBroker {
    /// Creates a broker with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the given topics only.
    #[must_use]
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.register(Some(topics.iter().copied().collect()))
    }

    /// Subscribes to every topic.
    #[must_use]
    pub fn subscribe_all(&self) -> Subscription {
        self.register(None)
    }

    fn register(&self, topics: Option<BTreeSet<Topic>>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.registry
            .listeners()
            .insert(id, Listener { topics, sender });
        log::debug!("Subscriber {id} registered");

        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Publishes to every live listener interested in the topic.
    ///
    /// Never waits. Returns how many listeners received it. A listener
    /// whose queue is full misses this notification; listeners whose
    /// receiving side is gone are pruned.
    pub fn publish(&self, notification: &Notification) -> usize {
        let mut listeners = self.registry.listeners();
        let mut delivered = 0;

        listeners.retain(|id, listener| {
            if !listener.wants(notification.topic) {
                return !listener.sender.is_closed();
            }
            match listener.sender.try_send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "Subscriber {id} is not keeping up, dropping {}",
                        notification.topic
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Pruning closed subscriber {id}");
                    false
                }
            }
        });

        log::debug!(
            "Published {} to {delivered} subscriber(s)",
            notification.topic
        );
        delivered
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.listeners().len()
    }
}

/// A live listener registration. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Notification>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Waits for the next notification.
    ///
    /// Returns `None` once the broker has been dropped.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Returns an already-delivered notification without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly removes this listener.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.listeners().remove(&self.id);
            log::debug!("Subscriber {} removed", self.id);
        }
    }
}

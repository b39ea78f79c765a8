//! Auth-state fan-out to in-process subscribers
//!
//! Subscribers are plain callbacks receiving the current user record, or
//! `None` once nobody is signed in. Each subscription is an RAII handle:
//! dropping it (or calling [`Subscription::unsubscribe`]) removes exactly
//! that callback and nothing else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use auth_core::UserRecord;
use tracing::debug;

type Callback = Arc<dyn Fn(Option<&UserRecord>) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback)>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(sub, _)| *sub != id);
    }
}

/// Registry of auth-state subscribers.
#[derive(Clone, Default)]
pub struct AuthStateBroadcaster {
    registry: Arc<Registry>,
}

impl AuthStateBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`; it stays registered while the handle lives.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&UserRecord>) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        debug!(subscription = id, "auth-state subscriber added");
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `user` to every subscriber, one after another.
    ///
    /// The registry lock is released before any callback runs, so a callback
    /// may subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, user: Option<&UserRecord>) {
        let snapshot: Vec<Callback> = self
            .registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        crate::metrics::record_notification(user.is_some(), snapshot.len());
        for callback in snapshot {
            callback(user);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle keeping one subscriber registered.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Remove this subscriber now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
            debug!(subscription = self.id, "auth-state subscriber removed");
        }
    }
}

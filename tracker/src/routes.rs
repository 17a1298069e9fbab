//! Route-change notification.
//!
//! Single-page-app glue reports navigations through
//! [`RouteChangeChannel::notify`]; subscribers run synchronously in
//! registration order. A failing or panicking subscriber is logged and does
//! not prevent the others from running.

use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

/// Error type subscribers may return.
pub type SubscriberError = Box<dyn Error + Send + Sync>;

type Subscriber = Arc<dyn Fn(&str) -> Result<(), SubscriberError> + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, Subscriber)>,
}

/// Ordered list of route-change subscribers.
#[derive(Default)]
pub struct RouteChangeChannel {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl RouteChangeChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`. It stays registered until the returned
    /// [`Subscription`] is cancelled.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let mut subscribers = self.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.entries.push((id, Arc::new(callback)));

        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Invokes every subscriber with `path`. Returns how many completed
    /// without error.
    pub fn notify(&self, path: &str) -> usize {
        // Snapshot so subscribers may (un)subscribe while being notified.
        let snapshot: Vec<(u64, Subscriber)> = self.lock().entries.clone();
        debug!(path, subscribers = snapshot.len(), "Route changed");

        let mut succeeded = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(path))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => warn!(subscriber = id, error = %e, "Route change subscriber failed"),
                Err(_) => warn!(subscriber = id, "Route change subscriber panicked"),
            }
        }
        succeeded
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by [`RouteChangeChannel::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::cancel`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Removes the subscriber. Returns `false` if it was already gone.
    pub fn cancel(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.entries.len();
        subscribers.entries.retain(|(id, _)| *id != self.id);
        subscribers.entries.len() != before
    }
}

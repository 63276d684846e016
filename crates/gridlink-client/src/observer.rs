// ABOUTME: Session observers: request listeners and subscription creation listeners.
// ABOUTME: Listener sets deduplicate by identity and are notified on the caller's thread.

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::envelope::Verb;
use crate::promise::Promise;
use crate::session::Response;
use crate::subscription::SubscriptionBinding;

/// Sees every request a session issues, right after it is sent (or queued
/// for a batch). Runs on the thread that made the request.
///
/// The response has usually not arrived yet. Use `Promise::listen` rather
/// than blocking on it; a batched request only completes on flush.
pub trait RequestListener: Send + Sync + 'static {
    fn on_request(
        &self,
        verb: Verb,
        service: &str,
        request: &Value,
        response: Promise<Response<Value>>,
    );
}

/// Told about every subscription a session creates, so one place can own
/// their cleanup.
pub trait SubscriptionCreationListener: Send + Sync + 'static {
    fn on_subscription_created(&self, binding: SubscriptionBinding);
}

/// Ordered set of listeners compared by pointer identity.
pub(crate) struct ListenerSet<L: ?Sized> {
    entries: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<L: ?Sized> ListenerSet<L> {
    /// Adding a listener that is already present has no effect.
    pub(crate) fn add(&self, listener: Arc<L>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.iter().any(|entry| same(entry, &listener)) {
            entries.push(listener);
        }
    }

    /// Unknown listeners are ignored.
    pub(crate) fn remove(&self, listener: &Arc<L>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| !same(entry, listener));
    }

    /// Current listeners; callbacks run on this copy, outside the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SubscriptionCreationListener for Counter {
        fn on_subscription_created(&self, _binding: SubscriptionBinding) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_set_deduplicates_by_identity() {
        let set: ListenerSet<dyn SubscriptionCreationListener> = ListenerSet::default();
        let first: Arc<dyn SubscriptionCreationListener> = Arc::new(Counter::default());
        let second: Arc<dyn SubscriptionCreationListener> = Arc::new(Counter::default());

        set.add(Arc::clone(&first));
        set.add(Arc::clone(&first));
        set.add(Arc::clone(&second));
        assert_eq!(set.snapshot().len(), 2);

        set.remove(&first);
        set.remove(&first);
        let left = set.snapshot();
        assert_eq!(left.len(), 1);
        assert!(same(&left[0], &second));

        set.remove(&second);
        assert!(set.is_empty());
    }
}

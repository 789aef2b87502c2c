//! Listener registry for sync and network notifications.
//!
//! Listeners are plain closures. Subscribing returns a [`Subscription`]
//! whose [`unsubscribe`](Subscription::unsubscribe) removes the listener
//! again. Dropping the handle keeps the listener registered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Listener callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    listeners: RwLock<BTreeMap<u64, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Inner<T> {
    fn remove(&self, id: u64) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

/// Thread-safe set of listeners for events of type `T`.
pub struct ListenerRegistry<T> {
    inner: Arc<Inner<T>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Box::new(move |id| weak.upgrade().is_some_and(|inner| inner.remove(id))),
        }
    }

    /// Call every listener once, in subscription order.
    ///
    /// A panicking listener is logged and does not stop the others.
    pub fn emit(&self, event: &T) {
        // Snapshot first so a listener may unsubscribe from inside the call.
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for listener in listeners {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event)));
            if outcome.is_err() {
                tracing::error!("listener panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &count)
            .finish()
    }
}

/// Handle returned by a subscription.
pub struct Subscription {
    id: u64,
    remove: Box<dyn Fn(u64) -> bool + Send + Sync>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Returns whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        (self.remove)(self.id)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribe_emit_unsubscribe() {
        let registry = ListenerRegistry::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let sum = Arc::clone(&total);
        let subscription = registry.subscribe(move |n| {
            sum.fetch_add(*n as usize, Ordering::SeqCst);
        });
        assert_eq!(registry.len(), 1);

        registry.emit(&2);
        registry.emit(&3);
        assert_eq!(total.load(Ordering::SeqCst), 5);

        assert!(subscription.unsubscribe());
        registry.emit(&100);
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert!(registry.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = ListenerRegistry::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = registry.subscribe(|_| panic!("boom"));
        let counter = Arc::clone(&calls);
        let _good = registry.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_registry_dropped() {
        let registry = ListenerRegistry::<()>::new();
        let subscription = registry.subscribe(|_| {});
        drop(registry);
        assert!(!subscription.unsubscribe());
    }
}

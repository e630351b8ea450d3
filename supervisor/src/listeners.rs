//! Callback registries behind `listen`.
//!
//! Each registration gets a fresh UUID, so removing one callback never
//! disturbs another registered for the same method. Callers snapshot the
//! callbacks and invoke them after the lock is released; a callback may
//! therefore subscribe or dispose from inside itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::lock;

/// Handle returned by `listen`. Disposing removes exactly the callback it was
/// created for.
///
/// Dropping a `Subscription` does not unsubscribe; call [`Subscription::dispose`].
#[must_use = "a dropped subscription can no longer be disposed"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Merge several subscriptions into one handle.
    pub fn combine(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for mut subscription in subscriptions {
                subscription.dispose();
            }
        })
    }

    /// Remove the callback. Later calls are no-ops.
    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.dispose.is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type Flat<F> = HashMap<Uuid, Arc<F>>;

/// Listeners that all receive every event.
pub(crate) struct ListenerRegistry<F: ?Sized> {
    inner: Arc<Mutex<Flat<F>>>,
}

impl<F: ?Sized> Clone for ListenerRegistry<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> ListenerRegistry<F> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn insert(&self, callback: Arc<F>) -> Subscription {
        let id = Uuid::new_v4();
        lock(&self.inner).insert(id, callback);
        let weak: Weak<Mutex<Flat<F>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).remove(&id);
            }
        })
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.inner).values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub(crate) fn clear(&self) {
        lock(&self.inner).clear();
    }
}

type ByMethod<F> = HashMap<String, Flat<F>>;

/// Listeners keyed by notification method.
pub(crate) struct MethodRegistry<F: ?Sized> {
    inner: Arc<Mutex<ByMethod<F>>>,
}

impl<F: ?Sized> Clone for MethodRegistry<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> MethodRegistry<F> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `callback` for `method`. The flag is true when this is the
    /// first listener for that method.
    pub(crate) fn insert(&self, method: &str, callback: Arc<F>) -> (Subscription, bool) {
        let id = Uuid::new_v4();
        let first = {
            let mut map = lock(&self.inner);
            let entry = map.entry(method.to_string()).or_default();
            entry.insert(id, callback);
            entry.len() == 1
        };

        let weak: Weak<Mutex<ByMethod<F>>> = Arc::downgrade(&self.inner);
        let method = method.to_string();
        let subscription = Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut map = lock(&inner);
            if let Some(entry) = map.get_mut(&method) {
                entry.remove(&id);
                if entry.is_empty() {
                    map.remove(&method);
                }
            }
        });
        (subscription, first)
    }

    pub(crate) fn snapshot(&self, method: &str) -> Vec<Arc<F>> {
        lock(&self.inner)
            .get(method)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        lock(&self.inner).get(method).map_or(0, HashMap::len)
    }

    #[cfg(test)]
    pub(crate) fn methods(&self) -> usize {
        lock(&self.inner).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    type Callback = dyn Fn() + Send + Sync;

    fn counter(hits: &Arc<AtomicUsize>) -> Arc<Callback> {
        let hits = Arc::clone(hits);
        Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn dispose_is_idempotent_and_targeted() {
        let registry: MethodRegistry<Callback> = MethodRegistry::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let (mut first, is_first) = registry.insert("workspace/refresh", counter(&a));
        let (_second, second_is_first) = registry.insert("workspace/refresh", counter(&b));
        assert!(is_first);
        assert!(!second_is_first);
        assert_eq!(registry.count("workspace/refresh"), 2);

        first.dispose();
        first.dispose();
        assert!(!first.is_active());
        assert_eq!(registry.count("workspace/refresh"), 1);

        for callback in registry.snapshot("workspace/refresh") {
            callback();
        }
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_removal_drops_the_method() {
        let registry: MethodRegistry<Callback> = MethodRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let (mut sub, _) = registry.insert("a", counter(&hits));
        let (_other, _) = registry.insert("b", counter(&hits));
        assert_eq!(registry.methods(), 2);

        sub.dispose();
        assert_eq!(registry.methods(), 1);
        assert_eq!(registry.count("a"), 0);
        assert!(registry.snapshot("a").is_empty());
    }

    #[test]
    fn subscriber_count_tracks_listen_minus_dispose() {
        let registry: MethodRegistry<Callback> = MethodRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut subs: Vec<Subscription> = (0..5)
            .map(|_| registry.insert("m", counter(&hits)).0)
            .collect();

        subs[1].dispose();
        subs[3].dispose();
        subs[3].dispose();
        assert_eq!(registry.count("m"), 3);

        for callback in registry.snapshot("m") {
            callback();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn disposing_after_registry_dropped_is_harmless() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut sub = registry.insert(counter(&hits));
        assert_eq!(registry.len(), 1);
        drop(registry);
        sub.dispose();
        assert!(!sub.is_active());
    }

    #[test]
    fn combined_subscription_disposes_all() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut combined = Subscription::combine(vec![
            registry.insert(counter(&hits)),
            registry.insert(counter(&hits)),
        ]);
        assert_eq!(registry.len(), 2);
        combined.dispose();
        assert_eq!(registry.len(), 0);

        let _kept = registry.insert(counter(&hits));
        registry.clear();
        assert_eq!(registry.len(), 0);
    }
}

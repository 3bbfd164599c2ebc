//! Synchronous change notification primitives used by the stores.
//!
//! Listeners run on the thread that emits, after the emitter released its own
//! locks. The listener list is snapshotted before invocation, so a listener
//! may unsubscribe itself (or others) while being called.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Notify = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by `listen`. Dropping it or calling
/// [`Subscription::unsubscribe`] removes the listener. Both are idempotent.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct ListenerList<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Callback<T>)>>,
}

impl<T> ListenerList<T> {
    fn snapshot(&self) -> Vec<Callback<T>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    fn remove(&self, id: u64) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Single-channel dispatcher that also caches the last emitted value.
pub struct EventDispatcher<T> {
    current: RwLock<Option<T>>,
    listeners: Arc<ListenerList<T>>,
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
            listeners: Arc::new(ListenerList {
                next_id: AtomicU64::new(0),
                entries: RwLock::new(Vec::new()),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> EventDispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: T) -> Self {
        let dispatcher = Self::default();
        *dispatcher
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(value);
        dispatcher
    }

    /// Last emitted value, if any.
    pub fn current(&self) -> Option<T> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn listen(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));

        let weak: Weak<ListenerList<T>> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.remove(id);
            }
        })
    }

    /// Cache `value` and invoke every listener with it.
    pub fn emit(&self, value: T) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        for callback in self.listeners.snapshot() {
            callback(&value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

type KeyedListeners<K> = RwLock<HashMap<K, Vec<(u64, Notify)>>>;

/// Keyed notifier: listeners subscribe to one key and are told when it changed.
pub struct MultiNotifier<K> {
    next_id: AtomicU64,
    listeners: Arc<KeyedListeners<K>>,
}

impl<K> Default for MultiNotifier<K> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> MultiNotifier<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, key: K, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let weak: Weak<KeyedListeners<K>> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            let Some(listeners) = weak.upgrade() else {
                return;
            };
            let mut listeners = listeners.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entries) = listeners.get_mut(&key) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    listeners.remove(&key);
                }
            }
        })
    }

    pub fn notify(&self, key: &K) {
        let snapshot: Vec<Notify> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in snapshot {
            callback();
        }
    }

    pub fn listener_count(&self, key: &K) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, atomic::AtomicUsize};

    use super::*;

    #[test]
    fn caches_last_value_and_fans_out() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.current(), None::<u32>);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = dispatcher.listen(move |value: &u32| {
            sink.lock().expect("test mutex should lock").push(*value);
        });

        dispatcher.emit(1);
        dispatcher.emit(2);
        assert_eq!(dispatcher.current(), Some(2));
        assert_eq!(*seen.lock().expect("test mutex should lock"), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_unsubscribes() {
        let dispatcher = EventDispatcher::<u32>::new();
        let mut sub = dispatcher.listen(|_| {});
        let other = dispatcher.listen(|_| {});
        assert_eq!(dispatcher.listener_count(), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(dispatcher.listener_count(), 1);

        drop(other);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn listener_may_unsubscribe_during_emit() {
        let dispatcher = Arc::new(EventDispatcher::<u32>::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let slot_in_cb = slot.clone();
        let calls_in_cb = calls.clone();
        let sub = dispatcher.listen(move |_| {
            calls_in_cb.fetch_add(1, Ordering::SeqCst);
            if let Some(mut own) = slot_in_cb.lock().expect("test mutex should lock").take() {
                own.unsubscribe();
            }
        });
        *slot.lock().expect("test mutex should lock") = Some(sub);

        dispatcher.emit(1);
        dispatcher.emit(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn keyed_notifier_only_wakes_matching_key() {
        let notifier = MultiNotifier::<String>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let sub = notifier.listen("$a".to_owned(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify(&"$b".to_owned());
        notifier.notify(&"$a".to_owned());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(notifier.listener_count(&"$a".to_owned()), 0);
        notifier.notify(&"$a".to_owned());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_outliving_dispatcher_is_harmless() {
        let dispatcher = EventDispatcher::<u32>::new();
        let mut sub = dispatcher.listen(|_| {});
        drop(dispatcher);
        sub.unsubscribe();
    }
}

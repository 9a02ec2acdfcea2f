//! Observer registries with RAII subscriptions.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T: ?Sized> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A list of callbacks notified with a borrowed value.
pub struct Observers<T: ?Sized> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: ?Sized + 'static> Observers<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                    registry.callbacks.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Call every registered callback with `value`.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Check if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized + 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").finish_non_exhaustive()
    }
}

/// Registration handle; unregisters its callback when dropped.
#[must_use = "the callback is unregistered when the subscription is dropped"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Keep the callback registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_notify_and_unsubscribe() {
        let observers: Observers<u8> = Observers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let subscription = observers.subscribe(move |value| {
            counter.fetch_add(usize::from(*value), Ordering::SeqCst);
        });
        observers.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(observers.len(), 1);

        drop(subscription);
        observers.notify(&5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_slice_observers() {
        let observers: Observers<[u8]> = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = observers.subscribe(move |values: &[u8]| {
            sink.lock().unwrap().extend_from_slice(values);
        });

        observers.notify(&[1, 2, 3][..]);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_detach_keeps_callback() {
        let observers: Observers<()> = Observers::new();
        observers.subscribe(|_| {}).detach();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let observers: Observers<()> = Observers::new();
        let subscription = observers.subscribe(|_| {});
        drop(observers);
        drop(subscription);
    }
}

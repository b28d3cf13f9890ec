//! Observer lists.
//!
//! An [`Emitter`] holds listeners for one kind of event. Firing with no
//! listeners, or after disposal, does nothing. Listeners are called outside
//! the emitter's lock, so a listener may subscribe or unsubscribe while it
//! runs.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct EmitterState<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
    disposed: bool,
}

/// A list of listeners for events of type `T`.
pub struct Emitter<T> {
    state: Arc<Mutex<EmitterState<T>>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(EmitterState {
                next_id: 0,
                listeners: Vec::new(),
                disposed: false,
            })),
        }
    }
}

/// Clones share the same listener list.
impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. On a disposed emitter this is a no-op.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let mut state = lock(&self.state);
        if state.disposed {
            return Subscription::empty();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        drop(state);

        let weak: Weak<Mutex<EmitterState<T>>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                lock(&state).listeners.retain(|(other, _)| *other != id);
            }
        })
    }

    pub fn fire(&self, event: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.state)
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Drops every listener; later subscriptions are ignored.
    pub fn dispose(&self) {
        let mut state = lock(&self.state);
        state.disposed = true;
        state.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }
}

/// Handle returned by every registration. Calling [`Subscription::dispose`]
/// removes the registration; dropping the handle leaves it in place.
#[must_use = "dropping a subscription keeps the listener registered; call dispose() to remove it"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn empty() -> Self {
        Self { unsubscribe: None }
    }

    pub fn dispose(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Locks a mutex, recovering the data if a listener panicked while it was held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_reaches_listeners() {
        let emitter = Emitter::<usize>::new();
        let total = Arc::new(AtomicUsize::new(0));
        let seen = total.clone();
        let _sub = emitter.subscribe(move |n| {
            seen.fetch_add(*n, Ordering::SeqCst);
        });

        emitter.fire(&2);
        emitter.fire(&3);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_fire_without_listeners_is_noop() {
        let emitter = Emitter::<()>::new();
        emitter.fire(&());
        let sub = emitter.subscribe(|_| panic!("unsubscribed listener must not run"));
        sub.dispose();
        emitter.fire(&());
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_dispose_clears_and_ignores_later_subscriptions() {
        let emitter = Emitter::<()>::new();
        let _a = emitter.subscribe(|_| {});
        emitter.dispose();
        assert_eq!(emitter.listener_count(), 0);

        let _b = emitter.subscribe(|_| panic!("disposed emitter must not fire"));
        emitter.fire(&());
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_others_while_firing() {
        let emitter = Arc::new(Emitter::<()>::new());
        let victim = Arc::new(Mutex::new(Some(emitter.subscribe(|_| {}))));
        let handle = victim.clone();
        let _killer = emitter.subscribe(move |_| {
            if let Some(sub) = handle.lock().unwrap().take() {
                sub.dispose();
            }
        });

        emitter.fire(&());
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_debug_shows_listener_count() {
        let emitter: Emitter<String> = Emitter::new();
        let _sub = emitter.subscribe(|_| {});
        assert_eq!(format!("{emitter:?}"), "Emitter { listeners: 1 }");
    }
}

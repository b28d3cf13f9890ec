//! FIFO write semaphore.
//!
//! At most `capacity` thunks run at once; the rest wait in arrival order.
//! The slot is released when the thunk's future completes, panics or is
//! dropped.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct Semaphore {
    permits: tokio::sync::Semaphore,
    capacity: usize,
    active: AtomicUsize,
}

struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicUsize, capacity: usize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(now <= capacity, "too many concurrent thunks: {now} > {capacity}");
        Self { active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Semaphore {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "semaphore capacity must be greater than 0");
        Self {
            permits: tokio::sync::Semaphore::new(capacity),
            capacity,
            active: AtomicUsize::new(0),
        }
    }

    /// Runs `thunk` once a slot is free. Returns `None` if the semaphore was
    /// closed before the slot was granted.
    pub async fn lock<F, Fut, T>(&self, thunk: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.permits.acquire().await.ok()?;
        let _active = ActiveGuard::enter(&self.active, self.capacity);
        Some(thunk().await)
    }

    /// Rejects every waiting and future `lock` call.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

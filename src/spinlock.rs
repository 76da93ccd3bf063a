//! A minimal try-lock-only spinlock for per-side serialization (§5).
//!
//! The only operation workers and control code ever need is "try to take
//! it, and give up immediately if it's held" — there is no fast-path
//! blocking wait anywhere in this crate, so a full `Mutex` is unnecessary
//! weight. `TryLock::try_lock` never parks a thread.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct TryLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TryLock<T> {}
unsafe impl<T: Send> Sync for TryLock<T> {}

impl<T> TryLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Attempt to acquire the lock. Returns `None` immediately if it is
    /// already held; never spins or blocks.
    pub fn try_lock(&self) -> Option<TryLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TryLockGuard { lock: self })
    }
}

pub struct TryLockGuard<'a, T> {
    lock: &'a TryLock<T>,
}

impl<T> Deref for TryLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for TryLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TryLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_try_lock_fails_while_held() {
        let lock = TryLock::new(5);
        let guard = lock.try_lock().expect("first lock succeeds");
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn mutation_is_visible_after_release() {
        let lock = TryLock::new(vec![1, 2, 3]);
        {
            let mut g = lock.try_lock().unwrap();
            g.push(4);
        }
        let g = lock.try_lock().unwrap();
        assert_eq!(*g, vec![1, 2, 3, 4]);
    }
}

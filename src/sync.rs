// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A spin mutex that can report contention.
//!
//! The compaction scanners take two very coarse per-zone locks and need to
//! know whether anybody else is spinning on them so an async run can back
//! out instead of starving an allocator (the `spin_is_contended` idiom).

use core::sync::atomic::{AtomicUsize, Ordering};

pub use spin::MutexGuard;

/// A `spin::Mutex` that keeps a count of tasks currently spinning on it.
pub struct ContendedMutex<T> {
    waiters: AtomicUsize,
    inner: spin::Mutex<T>,
}

impl<T> ContendedMutex<T> {
    pub fn new(t: T) -> ContendedMutex<T> {
        ContendedMutex {
            waiters: AtomicUsize::new(0),
            inner: spin::Mutex::new(t),
        }
    }

    /// Acquire the lock, registering as a waiter while spinning.
    pub fn lock(&self) -> MutexGuard<T> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        self.waiters.fetch_add(1, Ordering::Acquire);
        let guard = self.inner.lock();
        self.waiters.fetch_sub(1, Ordering::Release);
        guard
    }

    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        self.inner.try_lock()
    }

    /// Is anybody currently spinning on this lock?
    ///
    /// Only counts waiters that went through `lock()`; a failed `try_lock`
    /// leaves no trace, which mirrors how hardware ticket locks report
    /// contention.
    pub fn is_contended(&self) -> bool {
        self.waiters.load(Ordering::Relaxed) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_lock_roundtrip() {
        let m = ContendedMutex::new(7usize);
        assert!(!m.is_contended());
        {
            let mut guard = m.lock();
            *guard += 1;
            assert!(!m.is_contended());
        }
        assert_eq!(*m.lock(), 8);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = ContendedMutex::new(());
        let guard = m.lock();
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    /// A spinning waiter is visible to the lock holder.
    #[test]
    fn waiter_reports_contention() {
        let m = Arc::new(ContendedMutex::new(0usize));
        let released = Arc::new(AtomicBool::new(false));

        let guard = m.lock();
        let t = {
            let m = Arc::clone(&m);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let mut guard = m.lock();
                assert!(released.load(Ordering::SeqCst));
                *guard = 1;
            })
        };

        // Wait until the thread registered itself as a waiter.
        while !m.is_contended() {
            thread::yield_now();
        }
        released.store(true, Ordering::SeqCst);
        drop(guard);

        t.join().unwrap();
        assert_eq!(*m.lock(), 1);
        assert!(!m.is_contended());
    }
}

//! Wait-and-yield lock for state shared between processes.
//!
//! On a single core a holder that has been preempted can only make progress
//! if the waiter gives the CPU away, so contention yields instead of spinning.
//! This is not a true spinlock once several cores run concurrently: a holder
//! that never releases leaves waiters cycling through the scheduler forever,
//! and there is no timeout or cancellation.

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::mutex::{SpinMutex, SpinMutexGuard};
use spin::relax::RelaxStrategy;

/// Relax strategy that hands the CPU to the next ready process.
pub struct YieldRelax;

impl RelaxStrategy for YieldRelax {
    #[inline]
    fn relax() {
        crate::scheduler::relax();
    }
}

pub type SpinlockGuard<'a, T> = SpinMutexGuard<'a, T>;

/// A lock value plus the number of processes currently waiting for it.
pub struct Spinlock<T> {
    inner: SpinMutex<T, YieldRelax>,
    waiters: AtomicUsize,
}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Spinlock {
            inner: SpinMutex::new(value),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Acquires the lock, yielding the CPU while another holder keeps it.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let guard = self.inner.lock();
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        guard
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Exclusive access proves no guard is outstanding.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Clone> Spinlock<T> {
    /// Copies the protected value into a fresh, unlocked lock.
    pub fn snapshot(&self) -> Spinlock<T> {
        Spinlock::new(self.lock().clone())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &self.is_locked())
            .field("waiters", &self.waiters())
            .finish()
    }
}

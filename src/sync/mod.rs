pub mod spinlock;

pub use spinlock::{Spinlock, SpinlockGuard};

/// Runs `f` with interrupts masked. Host test builds have no interrupts to mask.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(not(test))]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(test)]
    {
        f()
    }
}

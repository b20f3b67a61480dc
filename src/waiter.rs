use std::sync::atomic::{AtomicU32, Ordering};

/// A counter of outstanding work that threads can block on until it drops to zero.
///
/// This type is used internally by `TaskGroup` to track running tasks.
#[derive(Debug, Default)]
pub struct WaitCounter(AtomicU32);

impl WaitCounter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Registers one more unit of outstanding work.
    pub fn add(&self) {
        let prev = self.0.fetch_add(1, Ordering::Relaxed);
        assert_ne!(prev, u32::MAX, "too many pending tasks");
    }

    /// Marks one unit of work as finished, waking all waiters when none is left.
    pub fn done(&self) {
        let prev = self.0.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(prev, 0);
        if prev == 1 {
            atomic_wait::wake_all(&self.0);
        }
    }

    pub fn pending(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        loop {
            let pending = self.0.load(Ordering::Acquire);
            if pending == 0 {
                return;
            }
            atomic_wait::wait(&self.0, pending);
        }
    }
}

/// Calls `WaitCounter::done` when dropped, including while unwinding.
pub struct DoneGuard<'a>(pub &'a WaitCounter);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

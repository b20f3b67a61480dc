// Modified from https://github.com/rust-lang/rust/blob/master/library/std/src/sys/sync/rwlock/futex.rs
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{
    AtomicU32,
    Ordering::{Acquire, Relaxed, Release},
};

/// A futex based reader-writer lock without any data attached.
///
/// The state word holds the number of active readers (or `WRITE_LOCKED` when a writer
/// holds it) in its lower 30 bits, plus two flags for sleeping readers and writers.
pub struct RawRwLock {
    state: AtomicU32,
    /// Bumped by every unlock that hands the lock to a writer; writers sleep on it.
    writer_notify: AtomicU32,
}

const READ_LOCKED: u32 = 1;
const MASK: u32 = (1 << 30) - 1;
const WRITE_LOCKED: u32 = MASK;
const MAX_READERS: u32 = MASK - 1;
const READERS_WAITING: u32 = 1 << 30;
const WRITERS_WAITING: u32 = 1 << 31;

#[inline]
fn is_unlocked(state: u32) -> bool {
    state & MASK == 0
}

#[inline]
fn is_write_locked(state: u32) -> bool {
    state & MASK == WRITE_LOCKED
}

#[inline]
fn has_readers_waiting(state: u32) -> bool {
    state & READERS_WAITING != 0
}

#[inline]
fn has_writers_waiting(state: u32) -> bool {
    state & WRITERS_WAITING != 0
}

#[inline]
fn is_read_lockable(state: u32) -> bool {
    // New readers queue up behind waiting writers, and also behind readers that are
    // already asleep: the thread that sets those bits takes care of waking them.
    state & MASK < MAX_READERS && !has_readers_waiting(state) && !has_writers_waiting(state)
}

#[inline]
fn has_reached_max_readers(state: u32) -> bool {
    state & MASK == MAX_READERS
}

impl RawRwLock {
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            writer_notify: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn try_read(&self) -> bool {
        self.state
            .fetch_update(Acquire, Relaxed, |s| {
                is_read_lockable(s).then(|| s + READ_LOCKED)
            })
            .is_ok()
    }

    #[inline]
    pub fn read(&self) {
        let state = self.state.load(Relaxed);
        if !is_read_lockable(state)
            || self
                .state
                .compare_exchange_weak(state, state + READ_LOCKED, Acquire, Relaxed)
                .is_err()
        {
            self.read_contended();
        }
    }

    /// # Safety
    ///
    /// The lock must be read locked by the caller.
    #[inline]
    pub unsafe fn read_unlock(&self) {
        let state = self.state.fetch_sub(READ_LOCKED, Release) - READ_LOCKED;

        // A reader only sleeps on a read locked lock when a writer is waiting too.
        debug_assert!(!has_readers_waiting(state) || has_writers_waiting(state));

        // The last reader out hands the lock to a waiting writer.
        if is_unlocked(state) && has_writers_waiting(state) {
            self.wake_writer_or_readers(state);
        }
    }

    #[cold]
    fn read_contended(&self) {
        let mut state = self.spin_read();

        loop {
            if is_read_lockable(state) {
                match self
                    .state
                    .compare_exchange_weak(state, state + READ_LOCKED, Acquire, Relaxed)
                {
                    Ok(_) => return, // Locked!
                    Err(s) => {
                        state = s;
                        continue;
                    }
                }
            }

            if has_reached_max_readers(state) {
                panic!("too many active read locks on RwLock");
            }

            // Make sure the readers waiting bit is set before we go to sleep.
            if !has_readers_waiting(state) {
                if let Err(s) =
                    self.state
                        .compare_exchange(state, state | READERS_WAITING, Relaxed, Relaxed)
                {
                    state = s;
                    continue;
                }
            }

            atomic_wait::wait(&self.state, state | READERS_WAITING);

            // Spin again after waking up.
            state = self.spin_read();
        }
    }

    #[inline]
    pub fn write(&self) {
        if self
            .state
            .compare_exchange_weak(0, WRITE_LOCKED, Acquire, Relaxed)
            .is_err()
        {
            self.write_contended();
        }
    }

    /// # Safety
    ///
    /// The lock must be write locked by the caller.
    #[inline]
    pub unsafe fn write_unlock(&self) {
        let state = self.state.fetch_sub(WRITE_LOCKED, Release) - WRITE_LOCKED;

        debug_assert!(is_unlocked(state));

        if has_writers_waiting(state) || has_readers_waiting(state) {
            self.wake_writer_or_readers(state);
        }
    }

    #[cold]
    fn write_contended(&self) {
        let mut state = self.spin_write();

        let mut other_writers_waiting = 0;

        loop {
            if is_unlocked(state) {
                match self.state.compare_exchange_weak(
                    state,
                    state | WRITE_LOCKED | other_writers_waiting,
                    Acquire,
                    Relaxed,
                ) {
                    Ok(_) => return, // Locked!
                    Err(s) => {
                        state = s;
                        continue;
                    }
                }
            }

            if !has_writers_waiting(state) {
                if let Err(s) =
                    self.state
                        .compare_exchange(state, state | WRITERS_WAITING, Relaxed, Relaxed)
                {
                    state = s;
                    continue;
                }
            }

            // Other writers might be asleep as well, so the bit is kept once we lock it.
            other_writers_waiting = WRITERS_WAITING;

            // The sequence number is read before the state is checked again,
            // so a notification in between is never missed.
            let seq = self.writer_notify.load(Acquire);

            state = self.state.load(Relaxed);
            if is_unlocked(state) || !has_writers_waiting(state) {
                continue;
            }

            atomic_wait::wait(&self.writer_notify, seq);

            // Spin again after waking up.
            state = self.spin_write();
        }
    }

    /// Called by the unlocking thread once the lock is free and someone is asleep.
    #[cold]
    fn wake_writer_or_readers(&self, mut state: u32) {
        assert!(is_unlocked(state));

        // If the lock gets locked in the meantime, the thread that locked it
        // takes over the duty of waking the waiters when it unlocks.

        // Only writers are waiting: wake one of them.
        if state == WRITERS_WAITING {
            match self.state.compare_exchange(state, 0, Relaxed, Relaxed) {
                Ok(_) => {
                    self.wake_writer();
                    return;
                }
                Err(s) => {
                    state = s;
                }
            }
        }

        // Both are waiting: wake one writer. `atomic_wait` does not report whether a
        // sleeping writer was actually woken, so readers are woken as well and the
        // losers go back to sleep.
        if state == READERS_WAITING + WRITERS_WAITING {
            if self
                .state
                .compare_exchange(state, READERS_WAITING, Relaxed, Relaxed)
                .is_err()
            {
                // The lock got locked. Not our problem anymore.
                return;
            }
            self.wake_writer();
            state = READERS_WAITING;
        }

        // Only readers are waiting: wake them all.
        if state == READERS_WAITING
            && self
                .state
                .compare_exchange(state, 0, Relaxed, Relaxed)
                .is_ok()
        {
            atomic_wait::wake_all(&self.state);
        }
    }

    fn wake_writer(&self) {
        self.writer_notify.fetch_add(1, Release);
        atomic_wait::wake_one(&self.writer_notify);
    }

    fn spin_until(&self, f: impl Fn(u32) -> bool) -> u32 {
        let mut spin = 100;
        loop {
            // We only use `load` while spinning, to be easier on the caches.
            let state = self.state.load(Relaxed);
            if f(state) || spin == 0 {
                return state;
            }
            std::hint::spin_loop();
            spin -= 1;
        }
    }

    fn spin_write(&self) -> u32 {
        // Stop spinning when it's unlocked or when there's waiting writers, to keep things somewhat fair.
        self.spin_until(|state| is_unlocked(state) || has_writers_waiting(state))
    }

    fn spin_read(&self) -> u32 {
        // Stop spinning when it's unlocked or read locked, or when there's waiting threads.
        self.spin_until(|state| {
            !is_write_locked(state) || has_readers_waiting(state) || has_writers_waiting(state)
        })
    }
}

/// A reader-writer lock protecting a value of type `T`.
///
/// Unlike `std::sync::RwLock` it never poisons: a guard dropped while unwinding
/// releases the lock like any other guard.
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks with shared read access, blocking until it can be acquired.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.read();
        RwLockReadGuard { lock: self }
    }

    /// Locks with shared read access if that is possible without blocking.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.raw
            .try_read()
            .then(|| RwLockReadGuard { lock: self })
    }

    /// Locks with exclusive write access, blocking until it can be acquired.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.write();
        RwLockWriteGuard { lock: self }
    }
}

/// RAII guard for shared read access. The lock is released when it is dropped.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the shared lock is held for the lifetime of the guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: the guard was created by a successful read lock.
        unsafe { self.lock.raw.read_unlock() }
    }
}

/// RAII guard for exclusive write access. The lock is released when it is dropped.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the exclusive lock is held for the lifetime of the guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the exclusive lock is held for the lifetime of the guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        // Safety: the guard was created by a successful write lock.
        unsafe { self.lock.raw.write_unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_futex_rwlock() {
        let lock = RawRwLock::new();
        lock.read();
        lock.read();
        assert_eq!(lock.state.load(Relaxed), 2 * READ_LOCKED);
        unsafe {
            lock.read_unlock();
            lock.read_unlock();
        }
        assert!(is_unlocked(lock.state.load(Relaxed)));
        lock.write();
        assert!(is_write_locked(lock.state.load(Relaxed)));
        unsafe { lock.write_unlock() };
        assert_eq!(lock.state.load(Relaxed), 0);
    }

    #[test]
    fn test_try_read() {
        let lock = RawRwLock::new();
        assert!(lock.try_read());
        assert!(lock.try_read());
        unsafe {
            lock.read_unlock();
            lock.read_unlock();
        }
        lock.write();
        assert!(!lock.try_read());
        unsafe { lock.write_unlock() };
        assert!(lock.try_read());
        unsafe { lock.read_unlock() };
        assert_eq!(lock.state.load(Relaxed), 0);

        let lock = RwLock::new(5u32);
        {
            let _writer = lock.write();
            assert!(lock.try_read().is_none());
        }
        let reader = lock.try_read().unwrap();
        assert_eq!(*reader, 5);
        // Readers share the lock.
        assert_eq!(lock.try_read().map(|r| *r), Some(5));
    }

    #[test]
    fn test_writers_exclusive() {
        let lock = Arc::new(RwLock::new(0usize));
        let current = Arc::new(AtomicU32::new(0));
        const N: usize = 8;
        const M: usize = 1 << 16;

        let mut tasks = vec![];
        for _ in 0..N {
            let lock = lock.clone();
            let current = current.clone();
            tasks.push(std::thread::spawn(move || {
                for _ in 0..M {
                    let mut value = lock.write();
                    assert_eq!(current.fetch_add(1, Acquire), 0);
                    *value += 1;
                    current.fetch_sub(1, Acquire);
                }
            }));
        }
        for task in tasks {
            task.join().unwrap();
        }
        assert_eq!(*lock.read(), N * M);
    }

    #[test]
    fn test_readers_and_writers() {
        let lock = Arc::new(RwLock::new((0u64, 0u64)));
        const READERS: usize = 4;
        const WRITERS: usize = 4;
        const ITERATIONS: u64 = 10000;

        let mut handles = vec![];

        for _ in 0..WRITERS {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let mut pair = lock.write();
                    pair.0 += 1;
                    std::thread::yield_now(); // Force a context switch to increase contention
                    pair.1 += 1;
                }
            }));
        }

        for _ in 0..READERS {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let pair = lock.read();
                    // A reader never observes a half finished write.
                    assert_eq!(pair.0, pair.1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let pair = lock.read();
        assert_eq!(pair.0, WRITERS as u64 * ITERATIONS);
        assert_eq!(pair.0, pair.1);
    }

    #[test]
    fn test_shared_readers() {
        let lock = Arc::new(RwLock::new(7u32));
        let held = lock.read();
        // Another reader gets in while this one holds the lock.
        let other = {
            let lock = lock.clone();
            std::thread::spawn(move || *lock.read())
        };
        assert_eq!(other.join().unwrap(), 7);
        drop(held);
        *lock.write() += 1;
        assert_eq!(*lock.read(), 8);
    }

    #[test]
    fn test_no_poison_on_panic() {
        let lock = Arc::new(RwLock::new(vec![1u32]));
        let result = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let mut guard = lock.write();
                guard.push(2);
                panic!("boom");
            })
            .join()
        };
        assert!(result.is_err());
        assert_eq!(*lock.read(), vec![1, 2]);
        lock.write().push(3);
        assert_eq!(lock.read().len(), 3);
    }
}

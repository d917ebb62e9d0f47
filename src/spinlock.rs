// Mutual exclusion spin locks for short critical sections shared across
// CPUs. The kernel is non-preemptible, so a lock is only ever contended
// by other CPUs and plain spinning is enough.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::x86;

#[cfg(feature = "debug")]
const NO_OWNER: u32 = u32::MAX;

/// Raw spin lock in the style of the classic `xchg` loop.
///
/// With the `debug` feature the lock records which CPU holds it, which
/// turns double-acquire and stray-release bugs into immediate panics
/// instead of silent deadlocks.
pub(crate) struct SpinLock {
    locked: AtomicU32,
    #[allow(dead_code)]
    name: &'static str,
    #[cfg(feature = "debug")]
    cpu: AtomicU32,
}

impl SpinLock {
    pub(crate) const fn new(name: &'static str) -> SpinLock {
        SpinLock {
            locked: AtomicU32::new(0),
            name,
            #[cfg(feature = "debug")]
            cpu: AtomicU32::new(NO_OWNER),
        }
    }

    pub(crate) fn acquire(&self) {
        #[cfg(feature = "debug")]
        assert!(
            !self.holding(),
            "cpu {} attempted to re-acquire lock {}",
            crate::lapic::cpu_num(),
            self.name
        );

        // The xchg is atomic and totally ordered, so it doubles as the
        // acquire barrier for everything the lock protects.
        while x86::xchg(&self.locked, 1) != 0 {
            x86::pause();
        }

        #[cfg(feature = "debug")]
        self.cpu
            .store(crate::lapic::cpu_num() as u32, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        #[cfg(feature = "debug")]
        {
            assert!(
                self.holding(),
                "cpu {} released lock {} it does not hold",
                crate::lapic::cpu_num(),
                self.name
            );
            self.cpu.store(NO_OWNER, Ordering::Relaxed);
        }

        x86::xchg(&self.locked, 0);
    }

    /// Whether this CPU holds the lock.
    #[cfg(feature = "debug")]
    pub(crate) fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != 0
            && self.cpu.load(Ordering::Relaxed) == crate::lapic::cpu_num() as u32
    }
}

/// Spin-lock-protected value with a scoped guard, used for kernel state
/// that several modules touch (environment table, page allocator,
/// console input).
pub(crate) struct Mutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub(crate) const fn new(name: &'static str, data: T) -> Mutex<T> {
        Mutex {
            lock: SpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.acquire();
        MutexGuard { mutex: self }
    }
}

pub(crate) struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::Mutex;

    #[test]
    fn guard_serializes_access() {
        static COUNTER: Mutex<u32> = Mutex::new("counter", 0);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..1000 {
                        *COUNTER.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*COUNTER.lock(), 4000);
    }
}

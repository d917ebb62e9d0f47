// The big kernel lock.
//
// One coarse lock serializes all kernel execution across CPUs: it is
// taken on every entry from user mode (and on wakeup from the halt loop)
// and dropped on the way back out, either when resuming an environment
// or just before a halted CPU goes to sleep. See trap(), env_run() and
// sched_halt() for the three hand-off points.

use crate::spinlock::SpinLock;
use crate::x86;

static KERNEL_LOCK: SpinLock = SpinLock::new("kernel_lock");

pub(crate) fn lock_kernel() {
    KERNEL_LOCK.acquire();
}

pub(crate) fn unlock_kernel() {
    KERNEL_LOCK.release();

    // Normally we wouldn't need to do this, but QEMU only runs
    // one CPU at a time and has a long time-slice.  Without the
    // pause, this CPU is likely to reacquire the lock before
    // another CPU has even been given a chance to acquire it.
    x86::pause();
}

#[cfg(feature = "debug")]
pub(crate) fn holding_kernel_lock() -> bool {
    KERNEL_LOCK.holding()
}

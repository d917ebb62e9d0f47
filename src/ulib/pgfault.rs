// User page-fault handler registration.
//
// The kernel jumps to _pgfault_upcall (pfentry.S) with a UTrapframe on
// the exception stack; the trampoline calls the function stored in
// _pgfault_handler and afterwards pops the saved registers and returns
// to the faulting eip/esp in one atomic tail.

use core::sync::atomic::AtomicUsize;

use crate::trap::UTrapframe;

pub type PgfaultHandler = extern "C" fn(&mut UTrapframe);

// Read by pfentry.S; the asm knows it by name.
#[allow(non_upper_case_globals)]
#[no_mangle]
static _pgfault_handler: AtomicUsize = AtomicUsize::new(0);

/// Install a page-fault handler for this environment. The first call
/// allocates the exception stack and registers the assembly trampoline
/// with the kernel.
#[cfg(target_os = "none")]
pub fn set_pgfault_handler(handler: PgfaultHandler) {
    use core::sync::atomic::Ordering;

    use crate::constants::{PGSIZE, UXSTACKTOP};
    use crate::pmap::PteFlags;

    extern "C" {
        fn _pgfault_upcall();
    }

    if _pgfault_handler.load(Ordering::Relaxed) == 0 {
        let perm = (PteFlags::P | PteFlags::U | PteFlags::W).bits();
        let r = super::syscall::sys_page_alloc(0, UXSTACKTOP - PGSIZE, perm);
        if r < 0 {
            crate::upanic!("cannot allocate the exception stack: {}", r);
        }
        let r = super::syscall::sys_env_set_pgfault_upcall(0, _pgfault_upcall as usize);
        if r < 0 {
            crate::upanic!("cannot set the pgfault upcall: {}", r);
        }
    }

    _pgfault_handler.store(handler as usize, Ordering::Relaxed);
}

#[cfg(not(target_os = "none"))]
pub fn set_pgfault_handler(_handler: PgfaultHandler) {
    unimplemented!("user page-fault delivery only exists on the target")
}

/// The trampoline's address, for handing a child the same upcall.
#[cfg(target_os = "none")]
pub(crate) fn upcall_va() -> usize {
    extern "C" {
        fn _pgfault_upcall();
    }
    _pgfault_upcall as usize
}

#[cfg(not(target_os = "none"))]
pub(crate) fn upcall_va() -> usize {
    unimplemented!("user page-fault delivery only exists on the target")
}

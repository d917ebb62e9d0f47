// An exokernel-style multitasking microkernel for 32-bit x86.
//
// The kernel exports primitive mechanisms only: physical page
// allocation, explicit virtual-memory mapping, round-robin scheduling,
// synchronous IPC with optional page transfer, and user-level page
// fault delivery. Everything resembling policy (fork, copy-on-write,
// message retry) lives in the user runtime under ulib.
//
// The crate doubles as a host library so the core logic runs under
// cargo test with the hardware stubbed; only the bare-metal image
// (target_os = "none") carries the boot, trap and context-switch
// assembly.

#![cfg_attr(not(test), no_std)]
// Half of the kernel (boot, trap entry, AP bring-up) only runs on the
// bare-metal image; host builds compile it for type checking and tests
// without calling it.
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

extern crate alloc;

#[macro_use]
pub(crate) mod console;

pub(crate) mod allocator;
pub(crate) mod constants;
#[cfg(target_os = "none")]
pub(crate) mod elf;
pub(crate) mod env;
pub(crate) mod error;
pub(crate) mod gdt;
pub(crate) mod kbd;
pub(crate) mod kclock;
pub(crate) mod kernel_lock;
pub(crate) mod lapic;
pub(crate) mod logger;
#[cfg(target_os = "none")]
pub(crate) mod mp;
pub(crate) mod mpconfig;
pub(crate) mod picirq;
pub(crate) mod pmap;
pub(crate) mod sched;
pub(crate) mod serial;
pub(crate) mod spinlock;
pub(crate) mod syscall;
pub(crate) mod trap;
pub mod ulib;
pub(crate) mod util;
pub(crate) mod vga_buffer;
pub(crate) mod volatile;
pub(crate) mod x86;

use core::sync::atomic::{AtomicBool, Ordering};

// Set once some CPU panics; the others stop at their next trap.
static PANICKED: AtomicBool = AtomicBool::new(false);

pub(crate) fn panicked() -> bool {
    PANICKED.load(Ordering::SeqCst)
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    PANICKED.store(true, Ordering::SeqCst);
    println!("kernel panic on CPU {}: {}", lapic::cpu_num(), info);
    loop {
        x86::hlt();
    }
}

/// Kernel entry point, called from entry.S on the boot processor once
/// protected mode and the entry page tables are up.
#[cfg(target_os = "none")]
pub fn kernel_main() -> ! {
    console::console_init();
    logger::init();
    log::info!("exokern booting");

    pmap::mem_init();
    env::env_init();

    gdt::init_percpu();
    unsafe {
        trap::trap_init();
        mpconfig::mp_init();
    }
    lapic::lapic_init();
    picirq::pic_init();

    // Take the lock before waking anyone else up.
    kernel_lock::lock_kernel();
    mp::boot_aps();

    // The initial user image, embedded into the kernel binary by the
    // image build (objcopy -B i386 on the built user program).
    #[allow(non_upper_case_globals)]
    extern "C" {
        static _binary_obj_user_icode_start: u8;
    }
    env::env_create(
        unsafe { core::ptr::addr_of!(_binary_obj_user_icode_start) },
        env::EnvType::User,
    );

    sched::sched_yield();
}

#[cfg(test)]
pub(crate) mod kerntest {
    use std::sync::Mutex;

    // The env table, page allocator and per-CPU records are process
    // globals; tests take this lock and rebuild them from scratch.
    static KERNEL_TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn with_kernel<R>(f: impl FnOnce() -> R) -> R {
        let _guard = KERNEL_TEST_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        crate::env::reset_for_test();
        f()
    }
}

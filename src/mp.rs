// Application-processor bring-up.
//
// The BSP parks the 16-bit AP entry code at MPENTRY_PADDR and kicks
// each AP with the INIT/STARTUP sequence; every AP climbs through
// mpentry.S into mp_main and waits for the scheduler.

use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::constants::*;
use crate::mpconfig::CpuStatus;
use crate::pmap::{PhysAddr, VirtAddr};
use crate::{gdt, kernel_lock, lapic, mpconfig, pmap, sched, trap, util, x86};

#[allow(non_upper_case_globals)]
extern "C" {
    static mpentry_start: u8;
    static mpentry_end: u8;
}

// Stack pointer handed to the next booting AP by mpentry.S.
#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mpentry_kstack: AtomicU32 = AtomicU32::new(0);

/// Start the non-boot (AP) processors, one at a time.
pub(crate) fn boot_aps() {
    // Write entry code to the unused memory at MPENTRY_PADDR.
    let entry_start = unsafe { ptr::addr_of!(mpentry_start) as usize };
    let entry_end = unsafe { ptr::addr_of!(mpentry_end) as usize };
    let entry_len = entry_end - entry_start;
    assert!(entry_len <= PGSIZE, "mp entry code is too large");

    let code = PhysAddr(MPENTRY_PADDR).to_va();
    unsafe { util::memmove(code, VirtAddr(entry_start), entry_len) };

    let bsp_id = mpconfig::this_cpu().cpu_id;
    for cpu in mpconfig::cpus() {
        if cpu.cpu_id == bsp_id {
            continue; // already running
        }

        log::info!("starting CPU {}", cpu.cpu_id);

        // Tell mpentry.S what stack to use, kick the AP, and wait for
        // it to announce itself before recycling mpentry_kstack.
        mpentry_kstack.store(
            (pmap::percpu_kstack_base(cpu.cpu_id as usize) + KSTKSIZE).0 as u32,
            Ordering::SeqCst,
        );
        lapic::startap(cpu.cpu_id, PhysAddr(MPENTRY_PADDR));
        while !cpu.is_started() {
            x86::pause();
        }
    }
}

/// Per-AP setup, entered from mpentry.S once the AP runs 32-bit code
/// on its own stack.
#[no_mangle]
pub extern "C" fn mp_main() -> ! {
    // Switch off the low-memory entry page directory as early as
    // possible.
    pmap::load_kern_pgdir();
    log::info!("SMP: CPU {} starting", lapic::cpu_num());

    lapic::lapic_init();
    gdt::init_percpu();
    unsafe { trap::trap_init_percpu() };

    // Flag readiness; boot_aps is spinning on this.
    mpconfig::this_cpu().exchange_status(CpuStatus::Started);

    // Grab the big kernel lock and find something to run.
    kernel_lock::lock_kernel();
    sched::sched_yield();
}

// Local APIC driver: CPU identity, timer programming, EOI, and the
// startup IPIs used to bring up the application processors.
// ref. Intel SDM Vol.3 Chapter 8 and 10 (APIC)

use core::ptr;

use crate::pmap::VirtAddr;
use consts::*;

#[cfg(target_os = "none")]
use crate::trap::consts::{IRQ_ERROR, IRQ_OFFSET, IRQ_SPURIOUS, IRQ_TIMER};

#[cfg(target_os = "none")]
use crate::constants::PGSIZE;
#[cfg(target_os = "none")]
use crate::pmap::PhysAddr;
#[cfg(target_os = "none")]
use crate::{kclock, mpconfig, pmap};

mod consts {
    // Local APIC registers, divided by 4 for use as u32[] indices.
    // ref. Intel SDM Vol.3 Table 10-1
    pub(crate) const ID: isize = 0x0020 / 4; // ID
    pub(crate) const VER: isize = 0x0030 / 4; // Version (read only)
    pub(crate) const TPR: isize = 0x0080 / 4; // Task Priority Register
    pub(crate) const EOI: isize = 0x00b0 / 4; // EOI register (write only)
    pub(crate) const SVR: isize = 0x00f0 / 4; // Spurious Interrupt Vector Register
    pub(crate) const ESR: isize = 0x0280 / 4; // Error Status (read only)
    pub(crate) const ICRLO: isize = 0x0300 / 4; // Interrupt Command [31:0]
    pub(crate) const ICRHI: isize = 0x0310 / 4; // Interrupt Command [63:32]
    pub(crate) const LVT_TIMER: isize = 0x0320 / 4;
    pub(crate) const LVT_PC: isize = 0x0340 / 4; // performance counter overflow
    pub(crate) const LVT_LINT0: isize = 0x0350 / 4;
    pub(crate) const LVT_LINT1: isize = 0x0360 / 4;
    pub(crate) const LVT_ERROR: isize = 0x0370 / 4;
    pub(crate) const TICR: isize = 0x0380 / 4; // Initial Count Register (timer)
    pub(crate) const TDCR: isize = 0x03e0 / 4; // Divide Configuration Register (timer)

    pub(crate) const SVR_ENABLE: i32 = 0x0000_0100; // unit enable

    // ref. Intel SDM Vol.3 Figure 10-8 Local Vector Table
    pub(crate) const LVT_TIMER_PERIODIC: i32 = 0x0002_0000;
    pub(crate) const LVT_MASKED: i32 = 0x0001_0000;

    // ref. Intel SDM Vol.3 10.6.1 Interrupt Command Register
    pub(crate) const ICR_INIT: i32 = 0x0000_0500;
    pub(crate) const ICR_STARTUP: i32 = 0x0000_0600;
    pub(crate) const ICR_DELIVS: i32 = 0x0000_1000;
    pub(crate) const ICR_ASSERT: i32 = 0x0000_4000;
    pub(crate) const ICR_LEVEL: i32 = 0x0000_8000;
    pub(crate) const ICR_BCAST: i32 = 0x0008_0000;

    pub(crate) const TDCR_X1: i32 = 0x0000_000b; // divide counts by 1
}

struct LocalAPIC(VirtAddr);

impl LocalAPIC {
    fn write(&self, index: isize, value: i32) {
        unsafe {
            let p = self.0.as_mut_ptr::<i32>();
            p.offset(index).write_volatile(value);
            // Wait for the write to finish, by reading.
            p.offset(ID).read_volatile();
        }
    }

    fn read(&self, index: isize) -> i32 {
        unsafe { self.0.as_ptr::<i32>().offset(index).read_volatile() }
    }

    /// See Intel SDM Vol.3 10.4.6 Local APIC ID
    fn cpu_num(&self) -> i32 {
        self.read(ID) >> 24
    }

    /// See Intel SDM Vol.3 10.4.8 Local APIC Version Register
    fn max_lvt_entry(&self) -> i32 {
        (self.read(VER) >> 16) & 0xff
    }

    /// Clear the error status register; requires back-to-back writes.
    fn reset_esr(&self) {
        self.write(ESR, 0);
        self.write(ESR, 0);
    }

    fn eoi(&self) {
        self.write(EOI, 0);
    }

    /// Spin for a given number of microseconds.
    /// On real hardware would want to tune this dynamically.
    fn micro_delay(&self, _us: u32) {}
}

static mut LAPIC: Option<LocalAPIC> = None;

fn lapic() -> Option<&'static LocalAPIC> {
    unsafe { (*ptr::addr_of!(LAPIC)).as_ref() }
}

/// Identity of the executing CPU; 0 until the LAPIC window is mapped
/// (and always 0 when there is none, e.g. under cargo test).
pub(crate) fn cpu_num() -> i32 {
    lapic().map(|l| l.cpu_num()).unwrap_or(0)
}

/// Acknowledge the current interrupt.
pub(crate) fn eoi() {
    if let Some(l) = lapic() {
        l.eoi();
    }
}

#[cfg(target_os = "none")]
pub(crate) fn lapic_init() {
    let lapic_addr = mpconfig::lapic_addr().expect("lapic_addr not found");

    // lapic_addr is the physical address of the LAPIC's 4K MMIO region;
    // map it into virtual memory so we can access it.
    let lapic = {
        let va = pmap::mmio_map_region(lapic_addr, PGSIZE);
        unsafe {
            *ptr::addr_of_mut!(LAPIC) = Some(LocalAPIC(va));
            (*ptr::addr_of!(LAPIC)).as_ref().unwrap()
        }
    };

    // Enable local APIC; set spurious interrupt vector.
    lapic.write(SVR, SVR_ENABLE | (IRQ_OFFSET + IRQ_SPURIOUS) as i32);

    // The timer repeatedly counts down at bus frequency from TICR and
    // then issues an interrupt. If we cared more about precise
    // timekeeping, TICR would be calibrated using an external time
    // source. See Intel SDM Vol.3 10.5.4 APIC Timer.
    lapic.write(TDCR, TDCR_X1);
    lapic.write(
        LVT_TIMER,
        LVT_TIMER_PERIODIC | (IRQ_OFFSET + IRQ_TIMER) as i32,
    );
    lapic.write(TICR, 10_000_000);

    // Leave LINT0 of the BSP enabled so that it can get interrupts from
    // the 8259A chip. The BIOS initializes the BSP's LAPIC in Virtual
    // Wire Mode, where 8259A's INTR is connected to LINTIN0.
    if mpconfig::this_cpu().cpu_id != mpconfig::boot_cpu().cpu_id {
        lapic.write(LVT_LINT0, LVT_MASKED);
    }

    // Disable NMI (LINT1) on all CPUs.
    lapic.write(LVT_LINT1, LVT_MASKED);

    // Disable performance counter overflow interrupts on machines that
    // provide that interrupt entry (5 LVT entries or more).
    if lapic.max_lvt_entry() >= 4 {
        lapic.write(LVT_PC, LVT_MASKED);
    }

    // Map error interrupt to IRQ_ERROR.
    lapic.write(LVT_ERROR, (IRQ_OFFSET + IRQ_ERROR) as i32);

    lapic.reset_esr();

    // Ack any outstanding interrupts.
    lapic.eoi();

    // Send an Init Level De-Assert to synchronize arbitration IDs.
    // See Intel SDM Vol.3 10.6.1 Interrupt Command Register.
    lapic.write(ICRHI, 0);
    lapic.write(ICRLO, ICR_BCAST | ICR_INIT | ICR_LEVEL);
    while lapic.read(ICRLO) & ICR_DELIVS != 0 {}

    // Enable interrupts on the APIC (but not on the processor).
    lapic.write(TPR, 0);
}

/// Start an application processor running entry code at addr, which
/// must be in the form 0x000VV000. See Appendix B of the MP spec
/// ("universal startup algorithm").
#[cfg(target_os = "none")]
pub(crate) fn startap(apic_id: u8, addr: PhysAddr) {
    assert!(addr.0 & 0xfff == 0 && addr.0 >> 20 == 0 && addr.0 != 0);

    let lapic = lapic().expect("LAPIC should exist");

    // "The BSP must initialize CMOS shutdown code to 0AH and the warm
    // reset vector (DWORD based at 40:67) to point at the AP startup
    // code prior to the [universal startup algorithm]."
    kclock::mc146818_write(0x0f, 0x0a);
    {
        let wrv = PhysAddr((0x40 << 4) | 0x67).to_va();
        let p = wrv.as_mut_ptr::<u16>();
        unsafe {
            p.offset(0).write(0);
            p.offset(1).write((addr.0 >> 4) as u16);
        }
    }

    // Send INIT (level-triggered) interrupt to reset the other CPU.
    lapic.write(ICRHI, (apic_id as i32) << 24);
    lapic.write(ICRLO, ICR_INIT | ICR_LEVEL | ICR_ASSERT);
    lapic.micro_delay(200);
    lapic.write(ICRLO, ICR_INIT | ICR_LEVEL);
    lapic.micro_delay(100); // should be 10ms, but too slow in Bochs!

    // Send startup IPI (twice!) to enter the code. Regular hardware is
    // supposed to only accept a STARTUP when it is in the halted state
    // due to an INIT, so the second one should be ignored.
    for _ in 0..2 {
        lapic.write(ICRHI, (apic_id as i32) << 24);
        lapic.write(ICRLO, ICR_STARTUP | (addr.0 as i32 >> 12));
        lapic.micro_delay(200);
    }
}

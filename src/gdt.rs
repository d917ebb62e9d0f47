// Global descriptor table and task-state segments.
//
// Segments are used only to switch privilege levels; the kernel and
// user segments are identical except for the DPL. Each CPU gets its own
// TSS slot so the hardware finds the right kernel stack on a trap.

use core::mem;
use core::ptr;

use crate::mpconfig::consts::MAX_NUM_CPU;
use crate::pmap::{PhysAddr, VirtAddr};
use crate::x86;
use consts::*;

pub(crate) mod consts {
    pub(crate) const GDT_NULL: u16 = 0x0;
    pub(crate) const GDT_KERNEL_CODE: u16 = 0x8;
    pub(crate) const GDT_KERNEL_DATA: u16 = 0x10;
    pub(crate) const GDT_USER_CODE: u16 = 0x18;
    pub(crate) const GDT_USER_DATA: u16 = 0x20;
    // First TSS selector; CPU i uses GDT_TSS0 + (i << 3).
    pub(crate) const GDT_TSS0: u16 = 0x28;

    pub(crate) const GDT_A_PRESENT: u8 = 1 << 7;
    pub(crate) const GDT_A_RING_0: u8 = 0 << 5;
    pub(crate) const GDT_A_RING_3: u8 = 3 << 5;
    pub(crate) const GDT_A_SYSTEM: u8 = 1 << 4; // 0 for system, 1 for code or data
    pub(crate) const GDT_A_EXECUTABLE: u8 = 1 << 3;
    pub(crate) const GDT_A_PRIVILEGE: u8 = 1 << 1; // readable code / writable data

    // 32-bit available TSS, in a system (S = 0) descriptor.
    pub(crate) const GDT_A_TSS32A: u8 = 0x9;

    pub(crate) const GDT_F_PAGE_SIZE: u8 = 1 << 7;
    pub(crate) const GDT_F_PROTECTED_MODE: u8 = 1 << 6;
}

const NGDT: usize = 5 + MAX_NUM_CPU;

type GlobalDescriptorTable = [SegDesc; NGDT];

// TSS slots are filled in per CPU by trap_init_percpu.
static mut GDT: GlobalDescriptorTable = {
    let mut gdt = [SegDesc::null(); NGDT];
    gdt[1] = SegDesc::new(
        0x0,
        0xffff_ffff,
        GDT_A_PRESENT | GDT_A_RING_0 | GDT_A_SYSTEM | GDT_A_EXECUTABLE | GDT_A_PRIVILEGE,
        GDT_F_PAGE_SIZE | GDT_F_PROTECTED_MODE,
    );
    gdt[2] = SegDesc::new(
        0x0,
        0xffff_ffff,
        GDT_A_PRESENT | GDT_A_RING_0 | GDT_A_SYSTEM | GDT_A_PRIVILEGE,
        GDT_F_PAGE_SIZE | GDT_F_PROTECTED_MODE,
    );
    gdt[3] = SegDesc::new(
        0x0,
        0xffff_ffff,
        GDT_A_PRESENT | GDT_A_RING_3 | GDT_A_SYSTEM | GDT_A_EXECUTABLE | GDT_A_PRIVILEGE,
        GDT_F_PAGE_SIZE | GDT_F_PROTECTED_MODE,
    );
    gdt[4] = SegDesc::new(
        0x0,
        0xffff_ffff,
        GDT_A_PRESENT | GDT_A_RING_3 | GDT_A_SYSTEM | GDT_A_PRIVILEGE,
        GDT_F_PAGE_SIZE | GDT_F_PROTECTED_MODE,
    );
    gdt
};

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct SegDesc {
    limitl: u16,
    offsetl: u16,
    offsetm: u8,
    access: u8,
    flags_limith: u8,
    offseth: u8,
}

impl SegDesc {
    const fn null() -> SegDesc {
        SegDesc::new(0, 0, 0, 0)
    }

    const fn new(offset: u32, limit: u32, access: u8, flags: u8) -> SegDesc {
        SegDesc {
            limitl: (limit & 0xffff) as u16,
            offsetl: (offset & 0xffff) as u16,
            offsetm: ((offset >> 16) & 0xff) as u8,
            access,
            flags_limith: (flags & 0xf0) | (((limit >> 16) & 0xff) as u8 & 0x0f),
            offseth: ((offset >> 24) & 0xff) as u8,
        }
    }

    /// System descriptor for a 32-bit TSS at the given address.
    fn tss(base: u32, limit: u32) -> SegDesc {
        // S = 0 (system), type = available 32-bit TSS, byte granularity.
        SegDesc::new(base, limit, GDT_A_PRESENT | GDT_A_TSS32A, 0)
    }
}

#[repr(C, packed)]
pub(crate) struct TaskState {
    ts_link: u32, // old ts selector
    ts_esp0: VirtAddr, // stack pointer and segment selector
    ts_ss0: u16,  // after an increase in privilege level
    ts_padding1: u16,
    ts_esp1: VirtAddr,
    ts_ss1: u16,
    ts_padding2: u16,
    ts_esp2: VirtAddr,
    ts_ss2: u16,
    ts_padding3: u16,
    ts_cr3: PhysAddr, // page directory base
    ts_eip: VirtAddr, // saved state from last task switch
    ts_eflags: u32,
    ts_eax: u32, // more saved state (registers)
    ts_ecx: u32,
    ts_edx: u32,
    ts_ebx: u32,
    ts_esp: VirtAddr,
    ts_ebp: VirtAddr,
    ts_esi: u32,
    ts_edi: u32,
    ts_es: u16, // even more saved state (segment selectors)
    ts_padding4: u16,
    ts_cs: u16,
    ts_padding5: u16,
    ts_ss: u16,
    ts_padding6: u16,
    ts_ds: u16,
    ts_padding7: u16,
    ts_fs: u16,
    ts_padding8: u16,
    ts_gs: u16,
    ts_padding9: u16,
    ts_ldt: u16,
    ts_padding10: u16,
    ts_t: u16,    // trap on task switch
    ts_iomb: u16, // I/O map base address
}

impl TaskState {
    pub(crate) const fn new() -> TaskState {
        TaskState {
            ts_link: 0,
            ts_esp0: VirtAddr(0),
            ts_ss0: 0,
            ts_padding1: 0,
            ts_esp1: VirtAddr(0),
            ts_ss1: 0,
            ts_padding2: 0,
            ts_esp2: VirtAddr(0),
            ts_ss2: 0,
            ts_padding3: 0,
            ts_cr3: PhysAddr(0),
            ts_eip: VirtAddr(0),
            ts_eflags: 0,
            ts_eax: 0,
            ts_ecx: 0,
            ts_edx: 0,
            ts_ebx: 0,
            ts_esp: VirtAddr(0),
            ts_ebp: VirtAddr(0),
            ts_esi: 0,
            ts_edi: 0,
            ts_es: 0,
            ts_padding4: 0,
            ts_cs: 0,
            ts_padding5: 0,
            ts_ss: 0,
            ts_padding6: 0,
            ts_ds: 0,
            ts_padding7: 0,
            ts_fs: 0,
            ts_padding8: 0,
            ts_gs: 0,
            ts_padding9: 0,
            ts_ldt: 0,
            ts_padding10: 0,
            ts_t: 0,
            ts_iomb: 0,
        }
    }

    pub(crate) fn init(&mut self, esp0: VirtAddr, ss0: u16, iomb: u16) {
        self.ts_esp0 = esp0;
        self.ts_ss0 = ss0;
        self.ts_iomb = iomb;
    }
}

/// A pointer to a descriptor table (GDT / IDT) in the format expected
/// by `lgdt` / `lidt`.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct DescriptorTablePointer {
    pub(crate) limit: u16,
    pub(crate) base: u32,
}

/// Point the given TSS selector's GDT slot at ts.
pub(crate) fn set_tss(selector: u16, ts: &TaskState) {
    let idx = (selector >> 3) as usize;
    let base = ts as *const TaskState as usize as u32;
    let limit = (mem::size_of::<TaskState>() - 1) as u32;
    unsafe {
        (*ptr::addr_of_mut!(GDT))[idx] = SegDesc::tss(base, limit);
    }
}

/// Load the GDT and reload every segment register.
pub(crate) fn init_percpu() {
    let gdt_pointer = DescriptorTablePointer {
        limit: (mem::size_of::<GlobalDescriptorTable>() - 1) as u16,
        base: unsafe { ptr::addr_of!(GDT) as usize as u32 },
    };
    x86::lgdt(&gdt_pointer);

    #[cfg(target_arch = "x86")]
    unsafe {
        use core::arch::asm;

        // The kernel never uses GS or FS, so we leave those set to
        // the user data segment; ES, DS and SS change between the
        // kernel and user data segments as needed.
        asm!(
            "mov gs, {user:x}",
            "mov fs, {user:x}",
            "mov es, {kern:x}",
            "mov ds, {kern:x}",
            "mov ss, {kern:x}",
            user = in(reg) GDT_USER_DATA | 3,
            kern = in(reg) GDT_KERNEL_DATA,
        );

        // Reload CS with the kernel text segment via a far return.
        asm!(
            "push {sel}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            sel = in(reg) GDT_KERNEL_CODE as u32,
            tmp = out(reg) _,
        );
    }

    // For good measure, clear the local descriptor table (LDT),
    // since we don't use it.
    x86::lldt(GDT_NULL);
}

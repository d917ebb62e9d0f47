// Trap handling: IDT setup, the kernel entry discipline, dispatch by
// vector, and delivery of user page faults onto the user exception
// stack.
//
// Every vector enters through a thin stub (vectors.S) that pushes the
// trap number and an error code, then falls into the common stub
// (alltraps.S) which builds a Trapframe on the kernel stack and calls
// trap(). The kernel never returns through the stubs; it leaves via
// env_run (iret) or the scheduler's halt loop.

use core::mem;
use core::ptr;

use crate::constants::*;
use crate::env::{self, Env};
use crate::gdt::consts::*;
use crate::gdt::DescriptorTablePointer;
use crate::mpconfig::CpuStatus;
use crate::pmap::{PteFlags, VirtAddr};
use crate::{console, gdt, kernel_lock, lapic, mpconfig, sched, syscall, x86};
use consts::*;

pub(crate) mod consts {
    // Trap numbers defined by the processor:
    pub(crate) const T_DIVIDE: u32 = 0; // divide error
    pub(crate) const T_DEBUG: u32 = 1; // debug exception
    pub(crate) const T_NMI: u32 = 2; // non-maskable interrupt
    pub(crate) const T_BRKPT: u32 = 3; // breakpoint
    pub(crate) const T_OFLOW: u32 = 4; // overflow
    pub(crate) const T_BOUND: u32 = 5; // bounds check
    pub(crate) const T_ILLOP: u32 = 6; // illegal opcode
    pub(crate) const T_DEVICE: u32 = 7; // device not available
    pub(crate) const T_DBLFLT: u32 = 8; // double fault
    pub(crate) const T_TSS: u32 = 10; // invalid task switch segment
    pub(crate) const T_SEGNP: u32 = 11; // segment not present
    pub(crate) const T_STACK: u32 = 12; // stack exception
    pub(crate) const T_GPFLT: u32 = 13; // general protection fault
    pub(crate) const T_PGFLT: u32 = 14; // page fault
    pub(crate) const T_FPERR: u32 = 16; // floating point error
    pub(crate) const T_ALIGN: u32 = 17; // alignment check
    pub(crate) const T_MCHK: u32 = 18; // machine check
    pub(crate) const T_SIMDERR: u32 = 19; // SIMD floating point error

    // Chosen arbitrarily, but with care not to overlap processor
    // defined exceptions or interrupt vectors.
    pub(crate) const T_SYSCALL: u32 = 48;

    // System segment type bits
    pub(crate) const STS_IG32: u8 = 0xe; // 32-bit interrupt gate
    pub(crate) const STS_TG32: u8 = 0xf; // 32-bit trap gate

    // Hardware IRQ numbers. We receive these as (IRQ_OFFSET + IRQ_x).
    pub(crate) const IRQ_OFFSET: u8 = 32;

    pub(crate) const IRQ_TIMER: u8 = 0;
    pub(crate) const IRQ_KBD: u8 = 1;
    pub(crate) const IRQ_SERIAL: u8 = 4;
    pub(crate) const IRQ_SPURIOUS: u8 = 7;
    pub(crate) const IRQ_ERROR: u8 = 19;
}

#[repr(C, align(4096))]
struct InterruptDescriptorTable([GateDesc; 256]);

#[derive(Clone, Copy)]
#[repr(C, align(8))]
struct GateDesc {
    offsetl: u16,
    selector: u16,
    count: u8,
    typ: u8,
    offseth: u16,
}

impl GateDesc {
    const fn empty() -> GateDesc {
        GateDesc {
            offsetl: 0,
            selector: 0,
            count: 0,
            typ: 0,
            offseth: 0,
        }
    }

    /// Gate descriptor for an interrupt or trap handler.
    ///
    /// - istrap: a trap gate leaves IF alone, an interrupt gate clears
    ///   it. The kernel runs with interrupts off, so everything here is
    ///   an interrupt gate.
    /// - sel: code segment selector of the handler.
    /// - off: offset of the handler in that segment.
    /// - dpl: privilege level required to raise the trap with an
    ///   explicit int instruction.
    fn new(istrap: bool, sel: u16, off: u32, dpl: u8) -> GateDesc {
        let typ = if istrap { STS_TG32 } else { STS_IG32 };
        GateDesc {
            offsetl: (off & 0xffff) as u16,
            selector: sel,
            count: 0,
            typ: typ | (dpl << 5) | (1 << 7), // typ | dpl | present
            offseth: (off >> 16) as u16,
        }
    }
}

static mut IDT: InterruptDescriptorTable = InterruptDescriptorTable([GateDesc::empty(); 256]);

// For debugging: lets print_trapframe tell a live frame from a saved
// one and decorate it with cr2.
static mut LAST_TF: *const Trapframe = ptr::null();

/// Registers as pushed by pushad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PushRegs {
    pub reg_edi: u32,
    pub reg_esi: u32,
    pub reg_ebp: u32,
    pub reg_oesp: u32, // useless
    pub reg_ebx: u32,
    pub reg_edx: u32,
    pub reg_ecx: u32,
    pub reg_eax: u32,
}

impl PushRegs {
    const fn new() -> PushRegs {
        PushRegs {
            reg_edi: 0,
            reg_esi: 0,
            reg_ebp: 0,
            reg_oesp: 0,
            reg_ebx: 0,
            reg_edx: 0,
            reg_ecx: 0,
            reg_eax: 0,
        }
    }
}

/// Full register snapshot built by the trap entry path and mirrored in
/// the env record. The tail (esp, ss) is pushed by the hardware only
/// when crossing from user to kernel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Trapframe {
    pub(crate) tf_regs: PushRegs,
    pub(crate) tf_es: u16,
    pub(crate) tf_padding1: u16,
    pub(crate) tf_ds: u16,
    pub(crate) tf_padding2: u16,
    pub(crate) tf_trapno: u32,
    // below here defined by x86 hardware
    pub(crate) tf_err: u32,
    pub(crate) tf_eip: u32,
    pub(crate) tf_cs: u16,
    pub(crate) tf_padding3: u16,
    pub(crate) tf_eflags: u32,
    // below here only when crossing rings
    pub(crate) tf_esp: u32,
    pub(crate) tf_ss: u16,
    pub(crate) tf_padding4: u16,
}

impl Trapframe {
    pub(crate) const fn new() -> Trapframe {
        Trapframe {
            tf_regs: PushRegs::new(),
            tf_es: 0,
            tf_padding1: 0,
            tf_ds: 0,
            tf_padding2: 0,
            tf_trapno: 0,
            tf_err: 0,
            tf_eip: 0,
            tf_cs: 0,
            tf_padding3: 0,
            tf_eflags: 0,
            tf_esp: 0,
            tf_ss: 0,
            tf_padding4: 0,
        }
    }

    /// Initial register state for a user environment: user segments
    /// (RPL 3), the stack at USTACKTOP, interrupts enabled. The entry
    /// point is set separately.
    pub(crate) fn new_for_user() -> Trapframe {
        let mut tf = Trapframe::new();

        tf.tf_ds = GDT_USER_DATA | 3;
        tf.tf_es = GDT_USER_DATA | 3;
        tf.tf_ss = GDT_USER_DATA | 3;
        tf.tf_esp = USTACKTOP as u32;
        tf.tf_cs = GDT_USER_CODE | 3;
        tf.tf_eflags |= FL_IF;

        tf
    }

    pub(crate) fn set_entry_point(&mut self, va: VirtAddr) {
        self.tf_eip = va.0 as u32;
    }

    pub(crate) fn from_user_mode(&self) -> bool {
        self.tf_cs & 3 == 3
    }
}

/// Fault record pushed onto the user exception stack.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UTrapframe {
    pub utf_fault_va: u32,
    pub utf_err: u32,
    pub utf_regs: PushRegs,
    pub utf_eip: u32,
    pub utf_eflags: u32,
    pub utf_esp: u32,
}

// ---------------------------------------------------------------------
// IDT setup
// ---------------------------------------------------------------------

#[cfg(target_os = "none")]
#[allow(non_upper_case_globals)]
extern "C" {
    // Table of the 256 per-vector entry points, built in vectors.S.
    static vectors: [u32; 256];
}

/// Build the IDT: the architectural vectors, the 16 IRQ vectors and the
/// system-call vector. Breakpoint, debug and syscall may be raised from
/// user mode with int; everything else traps with a GP fault instead.
#[cfg(target_os = "none")]
pub(crate) unsafe fn trap_init() {
    let idt = &mut (*ptr::addr_of_mut!(IDT)).0;

    for t in 0..=19 {
        idt[t] = GateDesc::new(false, GDT_KERNEL_CODE, vectors[t], 0);
    }
    for irq in 32..48 {
        idt[irq] = GateDesc::new(false, GDT_KERNEL_CODE, vectors[irq], 0);
    }

    idt[T_DEBUG as usize] = GateDesc::new(false, GDT_KERNEL_CODE, vectors[T_DEBUG as usize], 3);
    idt[T_BRKPT as usize] = GateDesc::new(false, GDT_KERNEL_CODE, vectors[T_BRKPT as usize], 3);
    idt[T_SYSCALL as usize] =
        GateDesc::new(false, GDT_KERNEL_CODE, vectors[T_SYSCALL as usize], 3);

    trap_init_percpu();
}

/// Initialize and load the per-CPU TSS and the IDT.
pub(crate) unsafe fn trap_init_percpu() {
    // Set up a TSS so that we get the right kernel stack when we trap
    // from user mode. Each CPU loads its own TSS selector; loading the
    // same one twice would triple fault, since ltr marks it busy.
    let cpu = mpconfig::this_cpu_mut();
    let selector = GDT_TSS0 + ((cpu.cpu_id as u16) << 3);

    let esp0 = cpu.kstacktop();
    let iomb = mem::size_of::<gdt::TaskState>() as u16;
    let ts = cpu.init_ts(esp0, GDT_KERNEL_DATA, iomb);

    gdt::set_tss(selector, ts);
    x86::ltr(selector);

    let idt_pointer = DescriptorTablePointer {
        limit: (mem::size_of::<InterruptDescriptorTable>() - 1) as u16,
        base: ptr::addr_of!(IDT) as usize as u32,
    };
    x86::lidt(&idt_pointer);
}

// ---------------------------------------------------------------------
// Trap-frame printing
// ---------------------------------------------------------------------

fn trapname(trapno: u32) -> &'static str {
    match trapno {
        T_DIVIDE => "Divide error",
        T_DEBUG => "Debug",
        T_NMI => "Non-Maskable Interrupt",
        T_BRKPT => "Breakpoint",
        T_OFLOW => "Overflow",
        T_BOUND => "BOUND Range Exceeded",
        T_ILLOP => "Invalid Opcode",
        T_DEVICE => "Device Not Available",
        T_DBLFLT => "Double Fault",
        T_TSS => "Invalid TSS",
        T_SEGNP => "Segment Not Present",
        T_STACK => "Stack Fault",
        T_GPFLT => "General Protection",
        T_PGFLT => "Page Fault",
        T_FPERR => "x87 FPU Floating-Point Error",
        T_ALIGN => "Alignment Check",
        T_MCHK => "Machine-Check",
        T_SIMDERR => "SIMD Floating-Point Exception",
        T_SYSCALL => "System call",
        t if t >= IRQ_OFFSET as u32 && t < IRQ_OFFSET as u32 + 16 => "Hardware Interrupt",
        _ => "(unknown trap)",
    }
}

pub(crate) fn print_trapframe(tf: &Trapframe) {
    println!("TRAP frame at {:p} from CPU {}", tf, lapic::cpu_num());
    print_regs(&tf.tf_regs);
    println!("  es    0x----{:04x}", tf.tf_es);
    println!("  ds    0x----{:04x}", tf.tf_ds);
    println!("  trap  0x{:08x} {}", tf.tf_trapno, trapname(tf.tf_trapno));
    // If this trap was a page fault that just happened (so cr2 is
    // meaningful), print the faulting linear address.
    if ptr::eq(tf, unsafe { *ptr::addr_of!(LAST_TF) }) && tf.tf_trapno == T_PGFLT {
        println!("  cr2   0x{:08x}", x86::rcr2().0);
    }
    print!("  err   0x{:08x}", tf.tf_err);
    // For page faults, decode the error code: user/kernel mode,
    // write/read access, protection violation/page absent.
    if tf.tf_trapno == T_PGFLT {
        println!(
            " [{}, {}, {}]",
            if tf.tf_err & FEC_U != 0 { "user" } else { "kernel" },
            if tf.tf_err & FEC_WR != 0 { "write" } else { "read" },
            if tf.tf_err & FEC_PR != 0 {
                "protection"
            } else {
                "not-present"
            }
        );
    } else {
        println!();
    }
    println!("  eip   0x{:08x}", tf.tf_eip);
    println!("  cs    0x----{:04x}", tf.tf_cs);
    println!("  flags 0x{:08x}", tf.tf_eflags);
    if tf.from_user_mode() {
        println!("  esp   0x{:08x}", tf.tf_esp);
        println!("  ss    0x----{:04x}", tf.tf_ss);
    }
}

fn print_regs(regs: &PushRegs) {
    println!("  edi   0x{:08x}", regs.reg_edi);
    println!("  esi   0x{:08x}", regs.reg_esi);
    println!("  ebp   0x{:08x}", regs.reg_ebp);
    println!("  oesp  0x{:08x}", regs.reg_oesp);
    println!("  ebx   0x{:08x}", regs.reg_ebx);
    println!("  edx   0x{:08x}", regs.reg_edx);
    println!("  ecx   0x{:08x}", regs.reg_ecx);
    println!("  eax   0x{:08x}", regs.reg_eax);
}

/// Walk the saved frame-pointer chain, as far as it stays readable.
fn print_backtrace(env: &mut Env, tf: &Trapframe) {
    println!("backtrace:");
    let mut ebp = tf.tf_regs.reg_ebp as usize;
    let mut eip = tf.tf_eip as usize;
    for _ in 0..16 {
        println!("  ebp 0x{:08x}  eip 0x{:08x}", ebp, eip);
        let readable = {
            let mut allocator = crate::pmap::page_allocator();
            env.pgdir()
                .user_mem_check(VirtAddr(ebp), 8, PteFlags::U, &mut allocator)
                .is_ok()
        };
        if ebp == 0 || !readable {
            break;
        }
        unsafe {
            eip = (*((ebp + 4) as *const u32)) as usize;
            ebp = (*(ebp as *const u32)) as usize;
        }
    }
}

// ---------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------

fn trap_dispatch(tf: &mut Trapframe) {
    match tf.tf_trapno {
        T_PGFLT => page_fault_handler(tf),
        T_BRKPT | T_DEBUG => {
            // Debugger hook: dump state and resume.
            print_trapframe(tf);
            if tf.from_user_mode() {
                let curenv = env::cur_env_mut().expect("breakpoint outside any env");
                print_backtrace(curenv, tf);
            }
        }
        T_SYSCALL => {
            let regs = &tf.tf_regs;
            let ret = syscall::syscall(
                regs.reg_eax,
                regs.reg_edx,
                regs.reg_ecx,
                regs.reg_ebx,
                regs.reg_edi,
                regs.reg_esi,
            );
            tf.tf_regs.reg_eax = ret as u32;
        }
        t if t == (IRQ_OFFSET + IRQ_TIMER) as u32 => {
            // Acknowledge before the scheduler switches away; the
            // resumed env runs with interrupts enabled and an un-EOI'd
            // LAPIC would never fire again.
            lapic::eoi();
            sched::sched_yield();
        }
        t if t == (IRQ_OFFSET + IRQ_KBD) as u32 => {
            console::kbd_intr();
            lapic::eoi();
        }
        t if t == (IRQ_OFFSET + IRQ_SERIAL) as u32 => {
            console::serial_intr();
            lapic::eoi();
        }
        t if t == (IRQ_OFFSET + IRQ_SPURIOUS) as u32 => {
            // The hardware sometimes raises these because of noise on
            // the IRQ line or other reasons; no EOI wanted.
            log::debug!("spurious interrupt on irq 7");
            print_trapframe(tf);
        }
        _ => {
            // Unexpected trap: the user process or the kernel has a bug.
            print_trapframe(tf);
            if !tf.from_user_mode() {
                panic!("unhandled trap in kernel");
            }
            let curenv = env::cur_env().expect("trap from user without an env");
            let env_id = curenv.get_env_id();
            env::env_destroy(env_id, env::env_table());
        }
    }
}

/// Common trap entry, called from alltraps.S with the frame that was
/// just built on this CPU's kernel stack. Never returns; every path
/// ends in env_run, the halt loop, or a panic.
#[no_mangle]
pub(crate) extern "C" fn trap(orig_tf: *mut Trapframe) -> ! {
    let mut tf = unsafe { orig_tf.as_mut().unwrap() };

    // The environment may have set DF and some versions of GCC rely on
    // DF being clear.
    x86::cld();

    // Halt if some other CPU has called panic().
    if crate::panicked() {
        loop {
            x86::hlt();
        }
    }

    // Re-acquire the big kernel lock if we were halted in sched_yield.
    if mpconfig::this_cpu().exchange_status(CpuStatus::Started) == CpuStatus::Halted {
        kernel_lock::lock_kernel();
    }

    // Check that interrupts are disabled. If this assertion fails, DO
    // NOT be tempted to fix it by inserting a "cli" in the interrupt
    // path: the interrupt gates already clear IF.
    assert_eq!(
        x86::read_eflags() & FL_IF,
        0,
        "interrupts enabled inside the kernel"
    );

    if tf.from_user_mode() {
        // Trapped from user mode: serialize against the other CPUs
        // before touching any kernel state.
        kernel_lock::lock_kernel();

        let curenv = env::cur_env_mut().expect("trap from user without an env");

        // Garbage collect if the current environment was killed from
        // another CPU while it was running here.
        if curenv.is_dying() {
            let env_id = curenv.get_env_id();
            env::env_destroy(env_id, env::env_table());
            unreachable!("a dying curenv is freed, not resumed");
        }

        // Copy the trap frame (which is currently on the stack) into
        // the env record, so that running the environment will restart
        // at the trap point; the stack copy is dead from here on.
        curenv.set_tf(tf);
        tf = curenv.get_tf_mut();
    }

    unsafe { LAST_TF = tf };

    trap_dispatch(tf);

    // No other environment was scheduled during dispatch; resume the
    // current one if that still makes sense.
    match env::cur_env() {
        Some(curenv) if curenv.is_running() => {
            let env_id = curenv.get_env_id();
            env::env_run(env_id, env::env_table());
        }
        _ => sched::sched_yield(),
    }
}

// ---------------------------------------------------------------------
// User page-fault delivery
// ---------------------------------------------------------------------

/// Where the fault record lands. A fault with esp already inside the
/// exception stack is recursive: the new record goes right below the
/// old esp, with one scratch word left for the return trampoline.
/// Otherwise the record starts a fresh exception stack at UXSTACKTOP.
pub(crate) fn utrapframe_va(fault_esp: usize) -> VirtAddr {
    if (UXSTACKTOP - PGSIZE..UXSTACKTOP).contains(&fault_esp) {
        VirtAddr(fault_esp - mem::size_of::<UTrapframe>() - 4)
    } else {
        VirtAddr(UXSTACKTOP - mem::size_of::<UTrapframe>())
    }
}

/// The guard gap between the user stack and the exception stack; esp
/// here means the exception stack has overflowed. The gap ends where
/// the exception stack begins: esp == UXSTACKTOP - PGSIZE is the first
/// mapped word and still a valid recursive fault.
pub(crate) fn exception_stack_overflowed(fault_esp: usize) -> bool {
    fault_esp > USTACKTOP && fault_esp < UXSTACKTOP - PGSIZE
}

fn page_fault_handler(tf: &mut Trapframe) {
    let fault_va = x86::rcr2();

    if !tf.from_user_mode() {
        print_trapframe(tf);
        panic!(
            "kernel page fault at va {:08x} eip {:08x}",
            fault_va.0, tf.tf_eip
        );
    }

    let curenv = env::cur_env_mut().expect("page fault from user without an env");

    // Without an upcall (or with an unusable exception stack) the fault
    // is fatal for the environment.
    let upcall = curenv.pgfault_upcall();
    if upcall.0 == 0 || exception_stack_overflowed(tf.tf_esp as usize) {
        log::warn!(
            "[{:08x}] user fault va {:08x} ip {:08x}",
            curenv.get_env_id(),
            fault_va.0,
            tf.tf_eip
        );
        print_trapframe(tf);
        let env_id = curenv.get_env_id();
        env::env_destroy(env_id, env::env_table());
        unreachable!("a faulting curenv is freed, not resumed");
    }

    let utf_va = utrapframe_va(tf.tf_esp as usize);

    // The record must be writable by the environment; destroys it if
    // not (and then does not return).
    env::user_mem_assert(
        curenv,
        utf_va,
        mem::size_of::<UTrapframe>(),
        PteFlags::W,
    );

    // We are running on the env's page directory, so plain stores reach
    // its exception stack.
    let utf = unsafe { &mut *utf_va.as_mut_ptr::<UTrapframe>() };
    utf.utf_fault_va = fault_va.0 as u32;
    utf.utf_err = tf.tf_err;
    utf.utf_regs = tf.tf_regs;
    utf.utf_eip = tf.tf_eip;
    utf.utf_eflags = tf.tf_eflags;
    utf.utf_esp = tf.tf_esp;

    // Restart the environment inside its handler, on the exception
    // stack.
    tf.tf_eip = upcall.0 as u32;
    tf.tf_esp = utf_va.0 as u32;
    let env_id = curenv.get_env_id();
    env::env_run(env_id, env::env_table());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utrapframe_is_13_words() {
        assert_eq!(mem::size_of::<UTrapframe>(), 52);
    }

    #[test]
    fn fresh_fault_lands_at_uxstacktop() {
        // esp on the normal user stack: the record starts a fresh
        // exception stack.
        let va = utrapframe_va(USTACKTOP - 64);
        assert_eq!(va.0, UXSTACKTOP - mem::size_of::<UTrapframe>());
    }

    #[test]
    fn recursive_fault_leaves_a_scratch_word() {
        let esp = UXSTACKTOP - 200; // inside the exception stack
        let va = utrapframe_va(esp);
        assert_eq!(va.0, esp - mem::size_of::<UTrapframe>() - 4);
    }

    #[test]
    fn esp_at_exception_stack_base_counts_as_recursive() {
        let esp = UXSTACKTOP - PGSIZE;
        let va = utrapframe_va(esp);
        assert_eq!(va.0, esp - mem::size_of::<UTrapframe>() - 4);
    }

    #[test]
    fn guard_gap_is_an_overflow() {
        assert!(exception_stack_overflowed(UXSTACKTOP - PGSIZE - 4));
        assert!(!exception_stack_overflowed(USTACKTOP));
        assert!(!exception_stack_overflowed(UXSTACKTOP - 4));
        assert!(!exception_stack_overflowed(UTEXT));
        // The base of the exception stack is mapped, recursive
        // territory, not part of the gap.
        assert!(!exception_stack_overflowed(UXSTACKTOP - PGSIZE));
    }

    #[test]
    fn user_trapframe_starts_with_user_segments() {
        let tf = Trapframe::new_for_user();
        assert!(tf.from_user_mode());
        assert_eq!(tf.tf_esp, USTACKTOP as u32);
        assert_eq!(tf.tf_eflags & FL_IF, FL_IF);
        assert_eq!(tf.tf_cs, GDT_USER_CODE | 3);
        assert_eq!(tf.tf_ss, GDT_USER_DATA | 3);
    }
}

// Per-CPU state and multiprocessor configuration.
//
// CPU discovery follows the MultiProcessor Specification
// (https://pdos.csail.mit.edu/6.828/2018/readings/ia32/MPspec.pdf):
// find the MP floating pointer structure, follow it to the
// configuration table and collect one CpuInfo per processor entry.

use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::constants::*;
use crate::env::Env;
use crate::gdt::TaskState;
use crate::pmap::{PhysAddr, VirtAddr};
use crate::{lapic, x86};
use consts::*;

pub(crate) mod consts {
    // Table entry types
    pub(crate) const MP_PROC: u8 = 0x00; // one per processor
    pub(crate) const MP_BUS: u8 = 0x01; // one per bus
    pub(crate) const MP_IOAPIC: u8 = 0x02; // one per I/O APIC
    pub(crate) const MP_IOINTR: u8 = 0x03; // one per bus interrupt source
    pub(crate) const MP_LINTR: u8 = 0x04; // one per system interrupt source

    // Bit flags of MpProc.flags
    pub(crate) const MPPROC_FLAGS_BP: u8 = 1 << 1;

    pub(crate) const MAX_NUM_CPU: usize = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum CpuStatus {
    Unused = 0,
    Started = 1,
    Halted = 2,
}

impl CpuStatus {
    fn from_u32(v: u32) -> CpuStatus {
        match v {
            0 => CpuStatus::Unused,
            1 => CpuStatus::Started,
            2 => CpuStatus::Halted,
            _ => unreachable!("bad cpu status {}", v),
        }
    }
}

/// Per-CPU state.
#[repr(C)]
pub(crate) struct CpuInfo {
    pub(crate) cpu_id: u8,
    // Toggled with an atomic exchange: the HALTED -> STARTED transition
    // observed in trap() tells a waking CPU to re-take the kernel lock.
    cpu_status: AtomicU32,
    cpu_env: *mut Env,
    cpu_ts: TaskState,
}

impl CpuInfo {
    const fn empty() -> CpuInfo {
        CpuInfo {
            cpu_id: 0,
            cpu_status: AtomicU32::new(CpuStatus::Unused as u32),
            cpu_env: null_mut(),
            cpu_ts: TaskState::new(),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.cpu_status.load(Ordering::SeqCst) == CpuStatus::Started as u32
    }

    /// Atomically swap in a new status, returning the previous one.
    pub(crate) fn exchange_status(&self, new: CpuStatus) -> CpuStatus {
        CpuStatus::from_u32(x86::xchg(&self.cpu_status, new as u32))
    }

    pub(crate) fn init_ts(&mut self, esp0: VirtAddr, ss0: u16, iomb: u16) -> &TaskState {
        self.cpu_ts.init(esp0, ss0, iomb);
        &self.cpu_ts
    }

    /// Top of this CPU's kernel stack.
    pub(crate) fn kstacktop(&self) -> VirtAddr {
        VirtAddr(KSTACKTOP - (KSTKSIZE + KSTKGAP) * self.cpu_id as usize)
    }

    pub(crate) fn cur_env(&self) -> Option<&Env> {
        unsafe { self.cpu_env.as_ref() }
    }

    pub(crate) fn cur_env_mut(&mut self) -> Option<&mut Env> {
        unsafe { self.cpu_env.as_mut() }
    }

    pub(crate) fn set_env(&mut self, env: *mut Env) {
        self.cpu_env = env;
    }

    pub(crate) fn unset_env(&mut self) {
        self.cpu_env = null_mut();
    }
}

static mut CPUS: [CpuInfo; MAX_NUM_CPU] = [const { CpuInfo::empty() }; MAX_NUM_CPU];
/// Total number of CPUs in the system (1 until mp_init runs).
static mut NCPU: usize = 1;
/// Index of the bootstrap processor.
static mut BOOT_CPU: usize = 0;
/// Physical MMIO address of the local APIC.
static mut LAPIC_ADDR: Option<PhysAddr> = None;

pub(crate) fn this_cpu() -> &'static CpuInfo {
    unsafe { &(*ptr::addr_of!(CPUS))[lapic::cpu_num() as usize] }
}

pub(crate) fn this_cpu_mut() -> &'static mut CpuInfo {
    unsafe { &mut (*ptr::addr_of_mut!(CPUS))[lapic::cpu_num() as usize] }
}

pub(crate) fn boot_cpu() -> &'static CpuInfo {
    unsafe { &(*ptr::addr_of!(CPUS))[BOOT_CPU] }
}

pub(crate) fn cpus() -> &'static [CpuInfo] {
    unsafe { &(&*ptr::addr_of!(CPUS))[..NCPU] }
}

pub(crate) fn lapic_addr() -> Option<PhysAddr> {
    unsafe { LAPIC_ADDR }
}

/// Wipe CPU 0 back to "just booted" for a host test; each test starts
/// with no current environment.
#[cfg(not(target_os = "none"))]
pub(crate) fn reset_for_test() {
    let cpu = this_cpu_mut();
    cpu.unset_env();
    cpu.cpu_status
        .store(CpuStatus::Started as u32, Ordering::SeqCst);
}

// ---------------------------------------------------------------------
// MP configuration table scan (bare-metal only)
// ---------------------------------------------------------------------

#[cfg(target_os = "none")]
mod table {
    use super::*;
    use core::mem;

    /// MP Floating Pointer Structure (MP 4.1).
    #[repr(C, packed)]
    pub(super) struct Mp {
        signature: [u8; 4],  // "_MP_"
        pub(super) phys_addr: PhysAddr, // physical address of the MP configuration table
        length: u8,          // 1
        spec_rev: u8,
        checksum: u8, // all bytes must add up to 0
        typ: u8,      // MP system config type
        pub(super) imcrp: u8,
        reserved: [u8; 3],
    }

    impl Mp {
        /// Search for the MP Floating Pointer Structure, which according
        /// to MP 4 is in one of the following three locations:
        /// 1) in the first KB of the EBDA;
        /// 2) if there is no EBDA, in the last KB of system base memory;
        /// 3) in the BIOS ROM between 0xF0000 and 0xFFFFF.
        pub(super) unsafe fn new() -> Option<&'static Mp> {
            assert_eq!(mem::size_of::<Mp>(), 16);

            let bda: *const u8 = PhysAddr(0x0000_0400).to_va().as_ptr();

            // The 16-bit segment of the EBDA is usually in the two bytes
            // starting at byte 0x0E of the BDA; 0 if not present.
            let seg = *(bda.offset(0x0e).cast::<u16>());
            if seg != 0 {
                let pa = PhysAddr((seg as u32) << 4);
                if let Some(v) = Mp::search(pa, 1024) {
                    return Some(v);
                }
            } else {
                let sz = *(bda.offset(0x13).cast::<u16>());
                let pa = PhysAddr((sz as u32) * 1024 - 1024);
                if let Some(v) = Mp::search(pa, 1024) {
                    return Some(v);
                }
            }

            Mp::search(PhysAddr(0xf0000), 0x10000)
        }

        unsafe fn search(base: PhysAddr, len: usize) -> Option<&'static Mp> {
            let mut mp = base.to_va().as_ptr::<Mp>();
            let end = base.to_va().as_ptr::<u8>().add(len).cast::<Mp>();

            while mp < end {
                if (*mp).signature == *b"_MP_" {
                    break;
                }
                mp = mp.add(1);
            }

            if mp != end && check_sum(mp, mem::size_of::<Mp>()) {
                mp.as_ref()
            } else {
                None
            }
        }

        pub(super) fn conf_addr(&self) -> PhysAddr {
            self.phys_addr
        }

        pub(super) fn is_default_config(&self) -> bool {
            let pa = self.phys_addr;
            pa == PhysAddr(0) || self.typ != 0
        }
    }

    /// MP Configuration Table Header (MP 4.2).
    #[repr(C, packed)]
    pub(super) struct MpConf {
        signature: [u8; 4], // "PCMP"
        length: u16,
        version: u8,
        checksum: u8,
        product: [u8; 20],
        oem_table: PhysAddr,
        oem_length: u16,
        pub(super) entry: u16, // number of entries in the variable portion
        pub(super) lapic_addr: PhysAddr,
        xlength: u16,
        xchecksum: u8,
        reserved: u8,
        pub(super) entries: [u8; 0],
    }

    impl MpConf {
        pub(super) unsafe fn from(mp: &Mp) -> Result<&'static MpConf, &'static str> {
            if mp.is_default_config() {
                return Err("SMP: default configurations not implemented");
            }

            let conf = mp
                .conf_addr()
                .to_va()
                .as_ptr::<MpConf>()
                .as_ref()
                .ok_or("null MP configuration pointer")?;
            if conf.signature != *b"PCMP" {
                return Err("SMP: incorrect MP configuration table signature");
            }
            if !check_sum(conf, conf.length as usize) {
                return Err("SMP: bad MP configuration checksum");
            }
            if conf.version != 1 && conf.version != 4 {
                return Err("SMP: unsupported MP version");
            }

            Ok(conf)
        }
    }

    /// Processor entry.
    #[repr(C, packed)]
    pub(super) struct MpProc {
        typ: u8,
        pub(super) apicid: u8,
        version: u8,
        flags: u8,
        signature: [u8; 4],
        feature: u32,
        reserved: [u8; 8],
    }

    impl MpProc {
        pub(super) fn is_bsp(&self) -> bool {
            self.flags & MPPROC_FLAGS_BP != 0
        }
    }

    unsafe fn check_sum<T>(p: *const T, size: usize) -> bool {
        let p = p.cast::<u8>();
        let mut sum: u32 = 0;
        for i in 0..size {
            sum += p.add(i).read() as u32;
        }
        sum & 0xff == 0
    }
}

/// Collect the CPUs from the MP configuration table. See MP Appendix B
/// for the expected bring-up sequence.
#[cfg(target_os = "none")]
pub(crate) unsafe fn mp_init() {
    use core::mem;
    use table::*;

    let mp = match Mp::new() {
        Some(mp) => mp,
        None => {
            log::warn!("SMP: no MP structure found, SMP disabled");
            boot_cpu_started();
            return;
        }
    };

    let conf = match MpConf::from(mp) {
        Ok(conf) => conf,
        Err(msg) => {
            log::warn!("{}; SMP disabled", msg);
            boot_cpu_started();
            return;
        }
    };

    LAPIC_ADDR = Some(conf.lapic_addr);
    NCPU = 0;
    let mut ismp = true;

    let mut p = conf.entries.as_ptr();
    for _ in 0..conf.entry {
        match *p {
            MP_PROC => {
                let proc = &*(p.cast::<MpProc>());
                if proc.is_bsp() {
                    BOOT_CPU = NCPU;
                }
                if NCPU < MAX_NUM_CPU {
                    (*ptr::addr_of_mut!(CPUS))[NCPU].cpu_id = NCPU as u8;
                    NCPU += 1;
                } else {
                    log::warn!("SMP: too many CPUs, CPU {} disabled", proc.apicid);
                }
                p = p.add(mem::size_of::<MpProc>());
            }
            MP_BUS | MP_IOAPIC | MP_IOINTR | MP_LINTR => p = p.add(8),
            typ => {
                log::warn!("mp_init: unknown config type {:#x}", typ);
                ismp = false;
                break;
            }
        }
    }

    if !ismp {
        // Didn't like what we found; fall back to no MP.
        NCPU = 1;
        BOOT_CPU = 0;
        LAPIC_ADDR = None;
        log::warn!("SMP: configuration not found, SMP disabled");
        boot_cpu_started();
        return;
    }

    boot_cpu_started();
    log::info!("SMP: CPU {} found {} CPU(s)", boot_cpu().cpu_id, NCPU);

    if mp.imcrp > 0 {
        // Switch interrupt delivery from PIC mode to symmetric I/O mode
        // through the IMCR.
        log::info!("SMP: setting IMCR to switch from PIC mode");
        x86::outb(0x22, 0x70);
        let orig = x86::inb(0x23);
        x86::outb(0x23, orig | 0x01);
    }
}

#[cfg(target_os = "none")]
unsafe fn boot_cpu_started() {
    (*ptr::addr_of_mut!(CPUS))[BOOT_CPU]
        .cpu_status
        .store(CpuStatus::Started as u32, Ordering::SeqCst);
}

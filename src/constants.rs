// Memory layout and processor constants.
//
// Virtual address space:
//
//     4 Gig -------->  +------------------------------+
//                      |   Remapped physical memory   | RW/--
//     KERNBASE, ---->  +------------------------------+ 0xf0000000
//     KSTACKTOP        |  CPU0's kernel stack         | RW/--
//                      |  - - - - - - - - - - - - - - |
//                      |     invalid memory (gap)     | --/--
//                      |  CPU1's kernel stack         | RW/--
//                      :               :              :
//     MMIOLIM ------>  +------------------------------+ 0xefc00000
//                      |   Memory-mapped I/O          | RW/--
//     ULIM, MMIOBASE > +------------------------------+ 0xef800000
//                      |   Cur. page table (UVPT)     | R-/R-
//     UVPT --------->  +------------------------------+ 0xef400000
//                      |   Kernel heap                | RW/--
//     KHEAPBASE ---->  +------------------------------+ 0xee800000
//                      |   RO copy of env table       | R-/R-
//     UTOP, UENVS -->  +------------------------------+ 0xee400000
//     UXSTACKTOP ----/ |   User exception stack       | RW/RW
//                      +------------------------------+ 0xee3ff000
//                      |   Empty memory (guard)       | --/--
//     USTACKTOP ---->  +------------------------------+ 0xee3fe000
//                      |   Normal user stack          | RW/RW
//                      +------------------------------+
//                      :               :              :
//     UTEXT -------->  +------------------------------+ 0x00800000
//     PFTEMP ------->  |   COW scratch page           |
//                      :               :              :
//     0 ------------>  +------------------------------+

pub(crate) const PGSIZE: usize = 4096;
pub(crate) const PGSHIFT: usize = 12;

pub(crate) const NPDENTRIES: usize = 1024;
pub(crate) const NPTENTRIES: usize = 1024;

// Bytes mapped by one page-directory entry.
pub(crate) const PTSIZE: usize = NPTENTRIES * PGSIZE;

pub(crate) const KERNBASE: usize = 0xf000_0000;

// Per-CPU kernel stacks grow down from KSTACKTOP, each followed by an
// unmapped guard gap so an overflow faults instead of silently running
// into the next CPU's stack.
pub(crate) const KSTACKTOP: usize = KERNBASE;
pub(crate) const KSTKSIZE: usize = 8 * PGSIZE;
pub(crate) const KSTKGAP: usize = 8 * PGSIZE;

pub(crate) const MMIOLIM: usize = KSTACKTOP - PTSIZE;
pub(crate) const MMIOBASE: usize = MMIOLIM - PTSIZE;

pub(crate) const ULIM: usize = MMIOBASE;

// User read-only virtual page table: the page directory doubles as a
// page table via a self-referencing entry at PDX(UVPT).
pub(crate) const UVPT: usize = ULIM - PTSIZE;

pub(crate) const KHEAPSIZE: usize = 3 * PTSIZE;
pub(crate) const KHEAPBASE: usize = UVPT - KHEAPSIZE;

// User read-only mapping of the environment table.
pub(crate) const UENVS: usize = KHEAPBASE - PTSIZE;

// Top of the user-mappable region.
pub(crate) const UTOP: usize = UENVS;
pub(crate) const UXSTACKTOP: usize = UTOP;
// One invalid page between the exception stack and the normal stack.
pub(crate) const USTACKTOP: usize = UTOP - 2 * PGSIZE;

pub(crate) const UTEXT: usize = 0x0080_0000;

// Scratch mapping used by the user COW fault handler.
pub(crate) const PFTEMP: usize = 0x007f_f000;

// Physical address of the AP bootstrap code (see mpentry.S).
pub(crate) const MPENTRY_PADDR: u32 = 0x7000;

// EFLAGS
pub(crate) const FL_IF: u32 = 0x0000_0200; // Interrupt enable

// Page-fault error code bits
pub(crate) const FEC_PR: u32 = 0x1; // caused by a protection violation
pub(crate) const FEC_WR: u32 = 0x2; // caused by a write
pub(crate) const FEC_U: u32 = 0x4; // occurred while in user mode

// Control register 0
pub(crate) const CR0_PE: u32 = 0x0000001; // Protection Enable
pub(crate) const CR0_MP: u32 = 0x0000002; // Monitor coProcessor
pub(crate) const CR0_EM: u32 = 0x0000004; // Emulation
pub(crate) const CR0_TS: u32 = 0x0000008; // Task Switched
pub(crate) const CR0_NE: u32 = 0x0000020; // Numeric Error
pub(crate) const CR0_WP: u32 = 0x0010000; // Write Protect
pub(crate) const CR0_AM: u32 = 0x0040000; // Alignment Mask
pub(crate) const CR0_PG: u32 = 0x8000000; // Paging

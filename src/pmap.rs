// Physical page allocator and two-level page tables.
//
// Physical pages are tracked by a PageInfo array with an intrusive free
// list and per-frame reference counts; shared frames (page_map, COW) are
// multiplexed through those counts rather than through locks. The
// kernel sees all of physical memory through the direct map at KERNBASE;
// host builds substitute a static arena for that window so the walker
// and allocator run unmodified under cargo test.

use core::ops::{Add, AddAssign, Deref, DerefMut, Index, IndexMut, Sub};
use core::ptr::{self, null_mut};

use bitflags::bitflags;

use crate::constants::*;
use crate::error::Error;
use crate::mpconfig::consts::MAX_NUM_CPU;
use crate::spinlock::{Mutex, MutexGuard};
use crate::x86;

#[cfg(target_os = "none")]
use crate::kclock;

bitflags! {
    /// Page table/directory entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PteFlags: u32 {
        const P = 0x001;
        const W = 0x002;
        const U = 0x004;
        const PWT = 0x008; // write-through
        const PCD = 0x010; // cache-disable
        const A = 0x020;
        const D = 0x040;
        const PS = 0x080;
        const G = 0x100;
        // The three bits the hardware ignores; software owns them.
        const AVAIL = 0xe00;
        // Software copy-on-write marker, within AVAIL.
        const COW = 0x800;
    }
}

impl PteFlags {
    /// Flag bits a user environment may pass to the page system calls.
    pub(crate) const SYSCALL: PteFlags = PteFlags::P
        .union(PteFlags::W)
        .union(PteFlags::U)
        .union(PteFlags::AVAIL);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VirtAddr(pub(crate) usize);

impl VirtAddr {
    /// Page-directory index of this address.
    pub(crate) fn pdx(self) -> usize {
        (self.0 >> 22) & 0x3ff
    }

    /// Page-table index of this address.
    pub(crate) fn ptx(self) -> usize {
        (self.0 >> PGSHIFT) & 0x3ff
    }

    pub(crate) fn is_page_aligned(self) -> bool {
        self.0 % PGSIZE == 0
    }

    pub(crate) fn round_up(self, base: usize) -> VirtAddr {
        VirtAddr((self.0 + base - 1) / base * base)
    }

    pub(crate) fn round_down(self, base: usize) -> VirtAddr {
        VirtAddr(self.0 / base * base)
    }

    pub(crate) fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub(crate) fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Physical address behind a direct-map (kernel) virtual address.
    pub(crate) fn to_pa(self) -> PhysAddr {
        #[cfg(target_os = "none")]
        {
            if self.0 < KERNBASE {
                panic!("cannot convert va {:#x} to a physical address", self.0);
            }
            PhysAddr((self.0 - KERNBASE) as u32)
        }
        #[cfg(not(target_os = "none"))]
        {
            let base = host::arena_base();
            if self.0 < base || self.0 >= base + host::NPAGES as usize * PGSIZE {
                panic!("cannot convert va {:#x} to a physical address", self.0);
            }
            PhysAddr((self.0 - base) as u32)
        }
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: usize) -> VirtAddr {
        VirtAddr(self.0 + rhs)
    }
}

impl AddAssign<usize> for VirtAddr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<usize> for VirtAddr {
    type Output = VirtAddr;

    fn sub(self, rhs: usize) -> VirtAddr {
        VirtAddr(self.0 - rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PhysAddr(pub(crate) u32);

impl PhysAddr {
    /// Kernel virtual address of this frame through the direct map.
    pub(crate) fn to_va(self) -> VirtAddr {
        #[cfg(target_os = "none")]
        {
            VirtAddr(self.0 as usize + KERNBASE)
        }
        #[cfg(not(target_os = "none"))]
        {
            VirtAddr(host::arena_base() + self.0 as usize)
        }
    }

    pub(crate) fn is_page_aligned(self) -> bool {
        self.0 as usize % PGSIZE == 0
    }
}

impl Add<usize> for PhysAddr {
    type Output = PhysAddr;

    fn add(self, rhs: usize) -> PhysAddr {
        PhysAddr(self.0 + rhs as u32)
    }
}

// ---------------------------------------------------------------------
// Page table entries
// ---------------------------------------------------------------------

#[derive(Debug)]
#[repr(transparent)]
pub(crate) struct Pde(u32);

impl Pde {
    const fn empty() -> Pde {
        Pde(0)
    }

    pub(crate) fn exists(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    pub(crate) fn addr(&self) -> PhysAddr {
        PhysAddr(self.0 & 0xffff_f000)
    }

    pub(crate) fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xfff)
    }

    fn set(&mut self, pa: PhysAddr, flags: PteFlags) {
        self.0 = pa.0 | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    fn table(&self) -> &'static mut PageTable {
        unsafe { &mut *self.addr().to_va().as_mut_ptr::<PageTable>() }
    }
}

#[derive(Debug)]
#[repr(transparent)]
pub(crate) struct Pte(u32);

impl Pte {
    pub(crate) fn exists(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    pub(crate) fn addr(&self) -> PhysAddr {
        PhysAddr(self.0 & 0xffff_f000)
    }

    pub(crate) fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xfff)
    }

    fn set(&mut self, pa: PhysAddr, flags: PteFlags) {
        self.0 = pa.0 | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
struct PageTable {
    entries: [Pte; NPTENTRIES],
}

impl Index<usize> for PageTable {
    type Output = Pte;
    fn index(&self, index: usize) -> &Pte {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Pte {
        &mut self.entries[index]
    }
}

// ---------------------------------------------------------------------
// Page directory
// ---------------------------------------------------------------------

#[repr(C, align(4096))]
pub(crate) struct PageDirectory {
    entries: [Pde; NPDENTRIES],
}

impl Index<usize> for PageDirectory {
    type Output = Pde;
    fn index(&self, index: usize) -> &Pde {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageDirectory {
    fn index_mut(&mut self, index: usize) -> &mut Pde {
        &mut self.entries[index]
    }
}

impl PageDirectory {
    /// Physical address of the directory page itself; directories are
    /// page-allocated, so they sit in the direct map.
    pub(crate) fn paddr(&self) -> PhysAddr {
        VirtAddr(self as *const PageDirectory as usize).to_pa()
    }

    /// Allocate a fresh user page directory: kernel mappings shared from
    /// kern_pgdir, the UVPT slot pointing back at the directory, and the
    /// user portion empty.
    pub(crate) fn alloc_user(
        kern_pgdir: &PageDirectory,
        allocator: &mut PageAllocator,
    ) -> Result<*mut PageDirectory, Error> {
        let pa = allocator.alloc(AllocFlag::Zero).ok_or(Error::NoMem)?;
        allocator.incref(pa);

        let pgdir = unsafe { &mut *pa.to_va().as_mut_ptr::<PageDirectory>() };
        for i in VirtAddr(UTOP).pdx()..NPDENTRIES {
            if kern_pgdir.entries[i].exists() {
                pgdir.entries[i] = Pde(kern_pgdir.entries[i].0);
            }
        }
        pgdir.entries[VirtAddr(UVPT).pdx()].set(pa, PteFlags::P | PteFlags::U);

        Ok(pgdir as *mut PageDirectory)
    }

    /// Release the directory page. All user mappings must have been
    /// removed already (env_free walks them first).
    pub(crate) fn free_user(pgdir: *mut PageDirectory, allocator: &mut PageAllocator) {
        let pa = VirtAddr(pgdir as usize).to_pa();
        allocator.decref(pa);
    }

    /// Return a pointer to the page table entry for va, optionally
    /// allocating the page-table page on the way down. Returns None if
    /// the table is absent (create == false) or cannot be allocated.
    fn walk(
        &mut self,
        va: VirtAddr,
        create: bool,
        allocator: &mut PageAllocator,
    ) -> Option<&mut Pte> {
        let pde = &mut self.entries[va.pdx()];
        if !pde.exists() {
            if !create {
                return None;
            }
            let pa = allocator.alloc(AllocFlag::Zero)?;
            pde.set(pa, PteFlags::P | PteFlags::W | PteFlags::U);
            allocator.incref(pa);
        }

        Some(&mut pde.table()[va.ptx()])
    }

    /// Map the frame at pa to va with `perm | PTE_P`. An existing
    /// mapping at va is removed first; the frame's refcount is taken
    /// before the removal so re-inserting a page at its own address is
    /// safe.
    pub(crate) fn insert(
        &mut self,
        pa: PhysAddr,
        va: VirtAddr,
        perm: PteFlags,
        allocator: &mut PageAllocator,
    ) -> Result<(), Error> {
        let pte = self.walk(va, true, allocator).ok_or(Error::NoMem)?;
        allocator.incref(pa);
        if pte.exists() {
            PageDirectory::remove_pte(va, pte, allocator);
        }
        pte.set(pa, perm | PteFlags::P);
        Ok(())
    }

    /// Entry for the frame mapped at va, if any.
    pub(crate) fn lookup(
        &mut self,
        va: VirtAddr,
        allocator: &mut PageAllocator,
    ) -> Option<&mut Pte> {
        self.walk(va, false, allocator)
            .filter(|pte| pte.exists())
    }

    /// Unmap va. Silently does nothing if no page is mapped there.
    pub(crate) fn remove(&mut self, va: VirtAddr, allocator: &mut PageAllocator) {
        if let Some(pte) = self.lookup(va, allocator) {
            PageDirectory::remove_pte(va, pte, allocator);
        }
    }

    fn remove_pte(va: VirtAddr, pte: &mut Pte, allocator: &mut PageAllocator) {
        allocator.decref(pte.addr());
        pte.clear();
        // Flush the entry only if we're modifying the current address
        // space; the environment switch reloads cr3 anyway, so always
        // invalidating is merely wasteful, not wrong.
        x86::invlpg(va);
    }

    /// Unmap every present entry of the page table behind the given
    /// directory slot, then drop the table page itself.
    pub(crate) fn remove_pt(&mut self, pdx: usize, allocator: &mut PageAllocator) {
        let pde = &mut self.entries[pdx];
        let pt = pde.table();
        for i in 0..NPTENTRIES {
            let pte = &mut pt[i];
            if pte.exists() {
                let va = VirtAddr((pdx << 22) | (i << PGSHIFT));
                PageDirectory::remove_pte(va, pte, allocator);
            }
        }

        allocator.decref(pde.addr());
        pde.clear();
    }

    /// Map [va, va+size) to [pa, pa+size); va, pa and size must be
    /// page-aligned. Used only at boot; these mappings are never
    /// refcounted or removed.
    pub(crate) fn boot_map_region(
        &mut self,
        start_va: VirtAddr,
        size: usize,
        start_pa: PhysAddr,
        perm: PteFlags,
        allocator: &mut PageAllocator,
    ) {
        assert!(start_va.is_page_aligned(), "start_va is not page aligned");
        assert!(start_pa.is_page_aligned(), "start_pa is not page aligned");
        assert_eq!(size % PGSIZE, 0, "size should be a multiple of PGSIZE");

        for i in 0..(size / PGSIZE) {
            let va = start_va + i * PGSIZE;
            let pa = start_pa + i * PGSIZE;
            let pte = self.walk(va, true, allocator).expect("boot_map_region: no memory");
            pte.set(pa, perm | PteFlags::P);
        }
    }

    /// Allocate len bytes of physical memory and map them at va,
    /// writable by user and kernel. Does not zero the pages. Panics if
    /// allocation fails; only used while loading boot-time images.
    #[cfg(target_os = "none")]
    pub(crate) fn region_alloc(&mut self, va: VirtAddr, len: usize, allocator: &mut PageAllocator) {
        let start = va.round_down(PGSIZE);
        let end = (va + len).round_up(PGSIZE);

        let mut va = start;
        while va < end {
            let pa = allocator
                .alloc(AllocFlag::None)
                .expect("region_alloc: out of memory");
            self.insert(pa, va, PteFlags::U | PteFlags::W, allocator)
                .expect("region_alloc: out of memory");
            va += PGSIZE;
        }
    }

    /// Physical address behind an arbitrary mapped virtual address.
    pub(crate) fn convert_to_pa(
        &mut self,
        va: VirtAddr,
        allocator: &mut PageAllocator,
    ) -> Option<PhysAddr> {
        self.lookup(va, allocator)
            .map(|pte| pte.addr() + (va.0 & 0xfff))
    }

    /// Check that [va, va+len) lies below ULIM and that every page in
    /// the range carries `perm | PTE_P`. Returns the first offending
    /// address on failure.
    pub(crate) fn user_mem_check(
        &mut self,
        orig_va: VirtAddr,
        len: usize,
        perm: PteFlags,
        allocator: &mut PageAllocator,
    ) -> Result<(), VirtAddr> {
        let start = orig_va.round_down(PGSIZE);
        let end = (orig_va + len).round_up(PGSIZE);
        let want = perm | PteFlags::P;

        let mut va = start;
        while va < end {
            if va.0 >= ULIM {
                return Err(core::cmp::max(va, orig_va));
            }
            match self.walk(va, false, allocator) {
                None => return Err(core::cmp::max(va, orig_va)),
                Some(pte) if !pte.flags().contains(want) => {
                    return Err(core::cmp::max(va, orig_va));
                }
                _ => (),
            }
            va += PGSIZE;
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------
// Tracking of physical pages
// ---------------------------------------------------------------------

/// Per-frame bookkeeping: a free-list link and a reference count.
/// Frames with pp_ref == 0 that are not on the free list are in flight
/// (allocated but not yet inserted anywhere).
#[derive(Debug)]
#[repr(C)]
pub(crate) struct PageInfo {
    pp_link: *mut PageInfo,
    pp_ref: u16,
}

pub(crate) struct PageAllocator {
    pages: *mut PageInfo,
    npages: u32,
    page_free_list: *mut PageInfo,
}

unsafe impl Send for PageAllocator {}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocFlag {
    None,
    Zero,
}

impl PageAllocator {
    fn page_to_pa(&self, pp: *const PageInfo) -> PhysAddr {
        let offset = unsafe { pp.offset_from(self.pages) } as usize;
        PhysAddr((offset << PGSHIFT) as u32)
    }

    fn pa_to_page(&self, pa: PhysAddr) -> *mut PageInfo {
        let idx = (pa.0 as usize) >> PGSHIFT;
        assert!(idx < self.npages as usize, "pa {:#x} out of range", pa.0);
        unsafe { self.pages.add(idx) }
    }

    /// Allocate a frame, optionally zeroed through the direct map. Does
    /// not touch the reference count; page insertion does.
    pub(crate) fn alloc(&mut self, flag: AllocFlag) -> Option<PhysAddr> {
        let pp = self.page_free_list;
        if pp.is_null() {
            return None;
        }

        unsafe {
            self.page_free_list = (*pp).pp_link;
            (*pp).pp_link = null_mut();
            (*pp).pp_ref = 0;
        }

        let pa = self.page_to_pa(pp);
        if flag == AllocFlag::Zero {
            unsafe { ptr::write_bytes(pa.to_va().as_mut_ptr::<u8>(), 0, PGSIZE) };
        }
        Some(pa)
    }

    /// Return a frame to the free list. Only legal once pp_ref is zero.
    pub(crate) fn free(&mut self, pa: PhysAddr) {
        let pp = self.pa_to_page(pa);
        unsafe {
            assert_eq!((*pp).pp_ref, 0, "freeing a referenced page");
            assert!((*pp).pp_link.is_null(), "double free of a page");
            (*pp).pp_link = self.page_free_list;
            self.page_free_list = pp;
        }
    }

    pub(crate) fn incref(&mut self, pa: PhysAddr) {
        let pp = self.pa_to_page(pa);
        unsafe { (*pp).pp_ref += 1 };
    }

    pub(crate) fn decref(&mut self, pa: PhysAddr) {
        let pp = self.pa_to_page(pa);
        unsafe {
            (*pp).pp_ref -= 1;
            if (*pp).pp_ref == 0 {
                self.free(pa);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, pa: PhysAddr) -> u16 {
        unsafe { (*self.pa_to_page(pa)).pp_ref }
    }
}

static PAGE_ALLOCATOR: Mutex<PageAllocator> = Mutex::new(
    "page_allocator",
    PageAllocator {
        pages: null_mut(),
        npages: 0,
        page_free_list: null_mut(),
    },
);

pub(crate) fn page_allocator() -> MutexGuard<'static, PageAllocator> {
    PAGE_ALLOCATOR.lock()
}

// Acquire KERN_PGDIR before PAGE_ALLOCATOR when both are needed.
pub(crate) struct KernelPageDirectory(*mut PageDirectory);

unsafe impl Send for KernelPageDirectory {}

impl Deref for KernelPageDirectory {
    type Target = PageDirectory;

    fn deref(&self) -> &PageDirectory {
        unsafe { &*self.0 }
    }
}

impl DerefMut for KernelPageDirectory {
    fn deref_mut(&mut self) -> &mut PageDirectory {
        unsafe { &mut *self.0 }
    }
}

static KERN_PGDIR: Mutex<KernelPageDirectory> =
    Mutex::new("kern_pgdir", KernelPageDirectory(null_mut()));

pub(crate) fn kern_pgdir() -> MutexGuard<'static, KernelPageDirectory> {
    KERN_PGDIR.lock()
}

/// Switch the MMU back to the kernel's own page directory.
pub(crate) fn load_kern_pgdir() {
    let kern_pgdir = KERN_PGDIR.lock();
    x86::lcr3(kern_pgdir.paddr());
}

// ---------------------------------------------------------------------
// Per-CPU kernel stacks
// ---------------------------------------------------------------------

#[repr(C, align(4096))]
pub(crate) struct CpuStack([u8; KSTKSIZE]);

static mut PERCPU_KSTACKS: [CpuStack; MAX_NUM_CPU] = [const { CpuStack([0; KSTKSIZE]) }; MAX_NUM_CPU];

pub(crate) fn percpu_kstack_base(cpu_id: usize) -> VirtAddr {
    let stacks = unsafe { &*ptr::addr_of!(PERCPU_KSTACKS) };
    VirtAddr(&stacks[cpu_id] as *const CpuStack as usize)
}

// ---------------------------------------------------------------------
// Boot-time initialization (bare-metal only)
// ---------------------------------------------------------------------

#[cfg(target_os = "none")]
mod boot {
    use super::*;

    extern "C" {
        // End of the kernel image, provided by the linker script.
        static end: u8;
    }

    pub(super) struct BootAllocator {
        next_free: VirtAddr,
    }

    impl BootAllocator {
        pub(super) fn new() -> BootAllocator {
            let bss_end = VirtAddr(unsafe { &end as *const u8 as usize });
            BootAllocator {
                next_free: bss_end.round_up(PGSIZE),
            }
        }

        /// Allocate n bytes of physically contiguous memory without
        /// initializing it. Only usable before the page free list is
        /// built.
        pub(super) fn alloc(&mut self, n: usize) -> VirtAddr {
            let res = self.next_free;
            self.next_free = (res + n).round_up(PGSIZE);
            res
        }
    }

    fn nvram_read(reg: u8) -> u16 {
        let low = kclock::mc146818_read(reg) as u16;
        let high = kclock::mc146818_read(reg + 1) as u16;
        low | (high << 8)
    }

    /// Amount of physical memory (in pages) and of base memory
    /// (in pages), measured through the CMOS.
    pub(super) fn i386_detect_memory() -> (u32, u32) {
        let basemem = nvram_read(kclock::NVRAM_BASELO) as u32;
        let extmem = nvram_read(kclock::NVRAM_EXTLO) as u32;
        let ext16mem = nvram_read(kclock::NVRAM_EXT16LO) as u32 * 64;

        let totalmem = if ext16mem > 0 {
            16 * 1024 + ext16mem
        } else if extmem > 0 {
            1024 + extmem
        } else {
            basemem
        };

        let npages = totalmem / (PGSIZE as u32 / 1024);
        let npages_basemem = basemem / (PGSIZE as u32 / 1024);

        log::info!(
            "physical memory: {}KB available, base = {}K, extended = {}K",
            totalmem,
            basemem,
            totalmem - basemem
        );

        (npages, npages_basemem)
    }
}

#[cfg(target_os = "none")]
impl PageAllocator {
    /// Build the PageInfo array and thread the free list through every
    /// frame not already spoken for: page 0 (real-mode IDT and BIOS
    /// structures), the AP entry page, the I/O hole and the kernel
    /// image plus everything boot-allocated behind it.
    fn init(
        &mut self,
        pages: *mut PageInfo,
        npages: u32,
        npages_basemem: u32,
        first_free_page: u32,
    ) {
        self.pages = pages;
        self.npages = npages;
        self.page_free_list = null_mut();

        let mpentry_page = MPENTRY_PADDR >> PGSHIFT as u32;
        for i in 0..npages {
            if i == 0 || i == mpentry_page {
                continue;
            }
            if i >= npages_basemem && i < first_free_page {
                continue;
            }

            let page = unsafe { &mut *pages.add(i as usize) };
            page.pp_ref = 0;
            page.pp_link = self.page_free_list;
            self.page_free_list = page as *mut PageInfo;
        }

        // Reverse the list so that low pages come off first: the entry
        // page directory only maps the first 4MB, and the page tables
        // allocated while it is still live must fall inside that window.
        unsafe {
            let mut prev: *mut PageInfo = null_mut();
            let mut cur = self.page_free_list;
            while !cur.is_null() {
                let next = (*cur).pp_link;
                (*cur).pp_link = prev;
                prev = cur;
                cur = next;
            }
            self.page_free_list = prev;
        }
    }
}

/// Set up the kernel address space: the PageInfo array, the kernel heap,
/// the per-CPU stacks and the direct map of physical memory, then switch
/// off the minimal entry page directory.
#[cfg(target_os = "none")]
pub fn mem_init() {
    use boot::*;

    let (npages, npages_basemem) = i386_detect_memory();

    let mut ba = BootAllocator::new();

    let mut kern_pgdir = KERN_PGDIR.lock();
    let kern_pgdir_va = ba.alloc(PGSIZE);
    unsafe { ptr::write_bytes(kern_pgdir_va.as_mut_ptr::<u8>(), 0, PGSIZE) };
    kern_pgdir.0 = kern_pgdir_va.as_mut_ptr();

    let pages_bytes = npages as usize * core::mem::size_of::<PageInfo>();
    let pages = ba.alloc(pages_bytes);
    unsafe { ptr::write_bytes(pages.as_mut_ptr::<u8>(), 0, pages_bytes) };

    let kheap = ba.alloc(KHEAPSIZE);

    // Everything boot-allocated; all further memory management goes
    // through the page allocator.
    let first_free_page = (ba.alloc(0).to_pa().0 as usize >> PGSHIFT) as u32;
    let mut allocator = PAGE_ALLOCATOR.lock();
    allocator.init(
        pages.as_mut_ptr(),
        npages,
        npages_basemem,
        first_free_page,
    );

    // The page directory doubles as its own page table for the UVPT
    // window, read-only for user code.
    let kern_pgdir_pa = kern_pgdir_va.to_pa();
    kern_pgdir[VirtAddr(UVPT).pdx()].set(kern_pgdir_pa, PteFlags::P | PteFlags::U);

    // Kernel heap.
    kern_pgdir.boot_map_region(
        VirtAddr(KHEAPBASE),
        KHEAPSIZE,
        kheap.to_pa(),
        PteFlags::W,
        &mut allocator,
    );
    unsafe { crate::allocator::heap_init(KHEAPBASE, KHEAPSIZE) };

    // Per-CPU kernel stacks below KSTACKTOP, each backed by the static
    // percpu_kstacks storage with an unbacked guard gap above the next.
    for i in 0..MAX_NUM_CPU {
        let top = KSTACKTOP - (KSTKSIZE + KSTKGAP) * i;
        kern_pgdir.boot_map_region(
            VirtAddr(top - KSTKSIZE),
            KSTKSIZE,
            percpu_kstack_base(i).to_pa(),
            PteFlags::W,
            &mut allocator,
        );
    }

    // Direct map of all of physical memory at KERNBASE. We might not
    // have 2^32 - KERNBASE bytes of physical memory, but we set up the
    // mapping anyway.
    kern_pgdir.boot_map_region(
        VirtAddr(KERNBASE),
        usize::MAX - KERNBASE + 1,
        PhysAddr(0),
        PteFlags::W,
        &mut allocator,
    );

    x86::lcr3(kern_pgdir_pa);

    // entry.S set the really important flags in cr0 (including enabling
    // paging); configure the rest.
    let mut cr0 = x86::rcr0();
    cr0 |= CR0_PE | CR0_PG | CR0_AM | CR0_WP | CR0_NE | CR0_MP;
    cr0 &= !(CR0_TS | CR0_EM);
    x86::lcr0(cr0);
}

/// Reserve size bytes of the MMIO window and map [pa, pa+size) there
/// with caching disabled. Returns the base of the reserved region.
#[cfg(target_os = "none")]
pub(crate) fn mmio_map_region(start_pa: PhysAddr, orig_size: usize) -> VirtAddr {
    static NEXT_MMIO_VA: Mutex<VirtAddr> = Mutex::new("mmio_base", VirtAddr(MMIOBASE));

    let mut kern_pgdir = KERN_PGDIR.lock();
    let mut allocator = PAGE_ALLOCATOR.lock();
    let mut next = NEXT_MMIO_VA.lock();

    let start_va = *next;
    let end_va = (start_va + orig_size).round_up(PGSIZE);
    if end_va.0 > MMIOLIM {
        panic!("mmio_map_region overflows MMIOLIM");
    }

    kern_pgdir.boot_map_region(
        start_va,
        end_va.0 - start_va.0,
        start_pa,
        PteFlags::W | PteFlags::PCD | PteFlags::PWT,
        &mut allocator,
    );
    *next = end_va;

    start_va
}

// ---------------------------------------------------------------------
// Host stand-in for the direct map (cargo test)
// ---------------------------------------------------------------------

#[cfg(not(target_os = "none"))]
pub(crate) mod host {
    use super::*;

    pub(crate) const NPAGES: u32 = 2048;

    #[repr(C, align(4096))]
    struct Arena([u8; NPAGES as usize * PGSIZE]);

    static mut ARENA: Arena = Arena([0; NPAGES as usize * PGSIZE]);
    static mut PAGE_INFOS: [PageInfo; NPAGES as usize] =
        [const { PageInfo { pp_link: null_mut(), pp_ref: 0 } }; NPAGES as usize];

    pub(crate) fn arena_base() -> usize {
        unsafe { ptr::addr_of!(ARENA) as usize }
    }

    /// Rebuild the allocator over the arena and give the kernel a fresh
    /// empty page directory. Callers serialize through the test lock.
    pub(crate) fn reset() {
        let mut kern = KERN_PGDIR.lock();
        let mut allocator = PAGE_ALLOCATOR.lock();

        let pages = unsafe { ptr::addr_of_mut!(PAGE_INFOS) as *mut PageInfo };
        allocator.pages = pages;
        allocator.npages = NPAGES;
        allocator.page_free_list = null_mut();
        for i in (0..NPAGES as usize).rev() {
            let page = unsafe { &mut *pages.add(i) };
            page.pp_ref = 0;
            page.pp_link = allocator.page_free_list;
            allocator.page_free_list = page as *mut PageInfo;
        }

        let pa = allocator.alloc(AllocFlag::Zero).unwrap();
        allocator.incref(pa);
        kern.0 = pa.to_va().as_mut_ptr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kerntest;

    #[test]
    fn insert_lookup_remove_round_trip() {
        kerntest::with_kernel(|| {
            let mut kern = KERN_PGDIR.lock();
            let mut allocator = PAGE_ALLOCATOR.lock();

            let va = VirtAddr(0x40_0000);
            assert!(kern.lookup(va, &mut allocator).is_none());

            let pa = allocator.alloc(AllocFlag::Zero).unwrap();
            kern.insert(pa, va, PteFlags::U | PteFlags::W, &mut allocator)
                .unwrap();
            assert_eq!(allocator.refcount(pa), 1);

            let pte = kern.lookup(va, &mut allocator).unwrap();
            assert_eq!(pte.addr(), pa);
            assert!(pte.flags().contains(PteFlags::U | PteFlags::W | PteFlags::P));

            kern.remove(va, &mut allocator);
            assert!(kern.lookup(va, &mut allocator).is_none());
        });
    }

    #[test]
    fn reinsert_at_same_va_keeps_frame_alive() {
        kerntest::with_kernel(|| {
            let mut kern = KERN_PGDIR.lock();
            let mut allocator = PAGE_ALLOCATOR.lock();

            let va = VirtAddr(0x80_0000);
            let pa = allocator.alloc(AllocFlag::Zero).unwrap();
            kern.insert(pa, va, PteFlags::U | PteFlags::W, &mut allocator)
                .unwrap();
            // Same frame, same slot, tighter permissions.
            kern.insert(pa, va, PteFlags::U, &mut allocator).unwrap();

            let pte = kern.lookup(va, &mut allocator).unwrap();
            assert_eq!(pte.addr(), pa);
            assert!(!pte.flags().contains(PteFlags::W));
            assert_eq!(allocator.refcount(pa), 1);
        });
    }

    #[test]
    fn shared_frame_refcounting() {
        kerntest::with_kernel(|| {
            let mut kern = KERN_PGDIR.lock();
            let mut allocator = PAGE_ALLOCATOR.lock();

            let (va1, va2) = (VirtAddr(0x40_0000), VirtAddr(0x40_1000));
            let pa = allocator.alloc(AllocFlag::None).unwrap();
            kern.insert(pa, va1, PteFlags::U | PteFlags::W, &mut allocator)
                .unwrap();
            kern.insert(pa, va2, PteFlags::U, &mut allocator).unwrap();
            assert_eq!(allocator.refcount(pa), 2);

            kern.remove(va1, &mut allocator);
            assert_eq!(allocator.refcount(pa), 1);
            assert!(kern.lookup(va2, &mut allocator).is_some());

            kern.remove(va2, &mut allocator);
            // Frame went back to the free list and can be allocated again.
            let mut seen = false;
            for _ in 0..host::NPAGES {
                match allocator.alloc(AllocFlag::None) {
                    Some(p) if p == pa => {
                        seen = true;
                        break;
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
            assert!(seen, "removed frame never returned to the free list");
        });
    }

    #[test]
    fn user_mem_check_reports_first_bad_address() {
        kerntest::with_kernel(|| {
            let mut kern = KERN_PGDIR.lock();
            let mut allocator = PAGE_ALLOCATOR.lock();

            let va = VirtAddr(0x20_0000);
            let pa = allocator.alloc(AllocFlag::Zero).unwrap();
            kern.insert(pa, va, PteFlags::U | PteFlags::W, &mut allocator)
                .unwrap();

            assert!(kern
                .user_mem_check(va, PGSIZE, PteFlags::U, &mut allocator)
                .is_ok());
            // Second page is unmapped.
            assert_eq!(
                kern.user_mem_check(va, PGSIZE + 1, PteFlags::U, &mut allocator),
                Err(va + PGSIZE)
            );
            // Write access to a read-only mapping fails on page one.
            kern.insert(pa, va, PteFlags::U, &mut allocator).unwrap();
            assert_eq!(
                kern.user_mem_check(va + 8, 16, PteFlags::U | PteFlags::W, &mut allocator),
                Err(va + 8)
            );
            // Kernel addresses are never user-accessible.
            assert!(kern
                .user_mem_check(VirtAddr(ULIM), PGSIZE, PteFlags::U, &mut allocator)
                .is_err());
        });
    }
}

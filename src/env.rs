// The environment table and environment lifecycle.
//
// Environments live in a fixed arena of NENV records with an intrusive
// LIFO free list threaded through the free slots. Identifiers carry the
// slot index in their low bits and a per-slot generation above it, so a
// stale id for a recycled slot is recognized and refused. The arena is
// also mapped read-only for user code at UENVS, which is how the user
// runtime resolves "self" and reads its own IPC fields.

use alloc::alloc::{alloc_zeroed, Layout};
use core::fmt::{self, Formatter};
use core::mem;
use core::ptr::null_mut;

use crate::constants::*;
use crate::error::Error;
use crate::pmap::{self, PageDirectory, PteFlags, VirtAddr};
use crate::spinlock::{Mutex, MutexGuard};
use crate::trap::Trapframe;
use crate::{kernel_lock, mpconfig, sched, x86};

pub(crate) const LOG2NENV: u32 = 10;
pub(crate) const NENV: usize = 1 << LOG2NENV;
// Generations advance above this bit, keeping ids positive as i32.
const ENVGENSHIFT: u32 = 12;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[repr(transparent)]
pub struct EnvId(pub(crate) u32);

impl EnvId {
    /// Id 0 addresses the caller itself in every system call.
    pub(crate) const NONE: EnvId = EnvId(0);

    pub(crate) fn index(self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl fmt::LowerHex for EnvId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvType {
    User = 0,
    /// Well-known service environments, found by type (ipc_find_env).
    Service = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

/// One schedulable unit. The layout is fixed (repr C) because user code
/// reads these records through the UENVS window.
#[repr(C)]
pub(crate) struct Env {
    env_tf: Trapframe,        // saved registers
    env_link: *mut Env,       // free-list link, meaningful only when Free
    env_id: EnvId,            // unique environment identifier
    env_parent_id: EnvId,     // id of this env's creator, NONE for the root
    env_type: EnvType,
    env_status: EnvStatus,
    env_runs: u32,            // times this env has been scheduled
    env_generation: u32,      // survives the slot being freed and reused
    env_pgdir: *mut PageDirectory, // address space root (kernel va)

    // Page-fault upcall entry point; 0 means faults destroy the env.
    env_pgfault_upcall: VirtAddr,

    // IPC receive slot.
    env_ipc_recving: bool,    // blocked in sys_ipc_recv
    env_ipc_dstva: VirtAddr,  // where a transferred page lands; >= UTOP: none wanted
    env_ipc_value: u32,       // delivered payload
    env_ipc_from: EnvId,      // sender's id
    env_ipc_perm: PteFlags,   // nonempty iff a page was transferred
}

impl Env {
    pub(crate) fn get_env_id(&self) -> EnvId {
        self.env_id
    }

    pub(crate) fn parent_id(&self) -> EnvId {
        self.env_parent_id
    }

    pub(crate) fn env_type(&self) -> EnvType {
        self.env_type
    }

    pub(crate) fn is_free(&self) -> bool {
        self.env_status == EnvStatus::Free
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.env_status == EnvStatus::Runnable
    }

    pub(crate) fn is_running(&self) -> bool {
        self.env_status == EnvStatus::Running
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.env_status == EnvStatus::Dying
    }

    pub(crate) fn status(&self) -> EnvStatus {
        self.env_status
    }

    pub(crate) fn set_status(&mut self, status: EnvStatus) {
        self.env_status = status;
    }

    pub(crate) fn get_tf(&self) -> &Trapframe {
        &self.env_tf
    }

    pub(crate) fn get_tf_mut(&mut self) -> &mut Trapframe {
        &mut self.env_tf
    }

    pub(crate) fn set_tf(&mut self, tf: &Trapframe) {
        self.env_tf = *tf;
    }

    pub(crate) fn pgdir(&mut self) -> &mut PageDirectory {
        unsafe { &mut *self.env_pgdir }
    }

    pub(crate) fn pgfault_upcall(&self) -> VirtAddr {
        self.env_pgfault_upcall
    }

    pub(crate) fn set_pgfault_upcall(&mut self, func: VirtAddr) {
        self.env_pgfault_upcall = func;
    }

    pub(crate) fn ipc_recving(&self) -> bool {
        self.env_ipc_recving
    }

    pub(crate) fn ipc_dstva(&self) -> VirtAddr {
        self.env_ipc_dstva
    }

    pub(crate) fn ipc_value(&self) -> u32 {
        self.env_ipc_value
    }

    pub(crate) fn ipc_from(&self) -> EnvId {
        self.env_ipc_from
    }

    pub(crate) fn ipc_perm(&self) -> PteFlags {
        self.env_ipc_perm
    }

    /// Park this env waiting for a sender; dstva has been validated.
    pub(crate) fn ipc_start_recv(&mut self, dstva: VirtAddr) {
        self.env_ipc_dstva = dstva;
        self.env_ipc_recving = true;
        self.env_status = EnvStatus::NotRunnable;
    }

    /// Complete a receive: record the message and make the env runnable
    /// again, with 0 in its saved return-value register so the paused
    /// sys_ipc_recv appears to return success.
    pub(crate) fn ipc_deliver(&mut self, from: EnvId, value: u32, perm: PteFlags) {
        self.env_ipc_recving = false;
        self.env_ipc_from = from;
        self.env_ipc_value = value;
        self.env_ipc_perm = perm;
        self.env_status = EnvStatus::Runnable;
        self.env_tf.tf_regs.reg_eax = 0;
    }
}

pub(crate) struct EnvTable {
    envs: *mut Env,
    env_free_list: *mut Env,
}

unsafe impl Send for EnvTable {}

static ENV_TABLE: Mutex<EnvTable> = Mutex::new(
    "env_table",
    EnvTable {
        envs: null_mut(),
        env_free_list: null_mut(),
    },
);

pub(crate) fn env_table() -> MutexGuard<'static, EnvTable> {
    ENV_TABLE.lock()
}

pub(crate) fn cur_env() -> Option<&'static Env> {
    mpconfig::this_cpu().cur_env()
}

pub(crate) fn cur_env_mut() -> Option<&'static mut Env> {
    mpconfig::this_cpu_mut().cur_env_mut()
}

impl EnvTable {
    // The arena outlives every caller and the table's Mutex serializes
    // all access to it, so handing out 'static references is fine.
    fn slot(&self, idx: usize) -> &'static mut Env {
        assert!(idx < NENV);
        unsafe { &mut *self.envs.add(idx) }
    }

    /// Resolve an environment id.
    ///
    /// Id 0 means the caller itself and skips the permission check.
    /// Otherwise the slot indexed by the low bits must be live and must
    /// still carry exactly this id; with check_perm the target must be
    /// the caller or one of its direct children.
    pub(crate) fn envid2env(
        &mut self,
        id: EnvId,
        check_perm: bool,
    ) -> Result<&'static mut Env, Error> {
        let cur_id = cur_env().ok_or(Error::BadEnv)?.get_env_id();

        if id == EnvId::NONE {
            return Ok(self.slot(cur_id.index()));
        }

        let e = self.slot(id.index());
        if e.is_free() || e.env_id != id {
            return Err(Error::BadEnv);
        }

        if check_perm && e.env_id != cur_id && e.env_parent_id != cur_id {
            return Err(Error::BadEnv);
        }

        Ok(e)
    }

    /// Allocate and initialize a new environment: fresh generation-
    /// tagged id, empty user address space, user-mode segment state.
    /// The new env is NotRunnable; the caller decides when it may run.
    pub(crate) fn env_alloc(
        &mut self,
        parent_id: EnvId,
        typ: EnvType,
    ) -> Result<&'static mut Env, Error> {
        if self.env_free_list.is_null() {
            return Err(Error::NoFreeEnv);
        }
        let e = unsafe { &mut *self.env_free_list };

        let pgdir = {
            let kern_pgdir = pmap::kern_pgdir();
            let mut allocator = pmap::page_allocator();
            PageDirectory::alloc_user(&kern_pgdir, &mut allocator)?
        };

        // A fresh generation makes any id for this slot's previous
        // occupants stale.
        let mut generation = e.env_generation.wrapping_add(1 << ENVGENSHIFT) & !(NENV as u32 - 1);
        if generation == 0 {
            generation = 1 << ENVGENSHIFT;
        }
        let idx = unsafe { (e as *const Env).offset_from(self.envs) } as u32;

        self.env_free_list = e.env_link;
        e.env_link = null_mut();
        e.env_generation = generation;
        e.env_id = EnvId(generation | idx);
        e.env_parent_id = parent_id;
        e.env_type = typ;
        e.env_status = EnvStatus::NotRunnable;
        e.env_runs = 0;
        e.env_pgdir = pgdir;
        e.env_pgfault_upcall = VirtAddr(0);
        e.env_ipc_recving = false;
        e.env_ipc_dstva = VirtAddr(UTOP);
        e.env_ipc_value = 0;
        e.env_ipc_from = EnvId::NONE;
        e.env_ipc_perm = PteFlags::empty();
        e.env_tf = Trapframe::new_for_user();

        log::debug!("allocated env {:08x}", e.env_id);
        Ok(e)
    }

    /// Release everything the env holds and return its slot to the free
    /// list. The caller has already decided this is safe (the env is
    /// not running anywhere).
    pub(crate) fn env_free(&mut self, env_id: EnvId) {
        let is_cur = cur_env().map_or(false, |cur| cur.get_env_id() == env_id);
        // If freeing the current environment, switch to the kernel page
        // directory before freeing the page directory it is running on.
        if is_cur {
            pmap::load_kern_pgdir();
        }

        {
            let cur_id = cur_env().map_or(0, |cur| cur.get_env_id().0);
            log::info!("[{:08x}] free env {:08x}", cur_id, env_id);
        }

        let e = self.slot(env_id.index());
        assert!(!e.is_free(), "freeing a free env");
        assert_eq!(e.env_id, env_id, "freeing a stale env id");

        // Flush all mapped pages in the user portion of the address
        // space, then the tables, then the directory itself.
        let mut allocator = pmap::page_allocator();
        let pgdir = unsafe { &mut *e.env_pgdir };
        for pdx in 0..VirtAddr(UTOP).pdx() {
            if pgdir[pdx].exists() {
                pgdir.remove_pt(pdx, &mut allocator);
            }
        }
        PageDirectory::free_user(e.env_pgdir, &mut allocator);
        drop(allocator);

        e.env_pgdir = null_mut();
        e.env_status = EnvStatus::Free;
        e.env_id = EnvId::NONE;
        e.env_link = self.env_free_list;
        self.env_free_list = e as *mut Env;
    }

    /// Round-robin pick: the first Runnable env after the caller's
    /// slot, wrapping once; the still-Running caller as a fallback.
    pub(crate) fn find_runnable(&mut self) -> Option<EnvId> {
        let cur = cur_env().map(|e| e.get_env_id());
        let start = cur.map(|id| id.index() + 1).unwrap_or(0);

        for off in 0..NENV {
            let e = self.slot((start + off) % NENV);
            if e.is_runnable() {
                return Some(e.env_id);
            }
        }

        // No env is runnable, but the env previously running on this
        // CPU may still be Running; it's okay to choose it.
        match (cur, cur_env()) {
            (Some(id), Some(e)) if e.is_running() => Some(id),
            _ => None,
        }
    }

    /// Whether any env at all is alive (used to report a dead system
    /// before the CPUs go to sleep).
    pub(crate) fn any_env_alive(&mut self) -> bool {
        for idx in 0..NENV {
            match self.slot(idx).env_status {
                EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying => return true,
                _ => (),
            }
        }
        false
    }
}

/// Allocate the env arena, thread the free list through it (slot 0
/// first) and expose it read-only to user code at UENVS.
pub(crate) fn env_init() {
    let mut table = ENV_TABLE.lock();
    assert!(table.envs.is_null(), "env_init called twice");

    let layout = Layout::from_size_align(NENV * mem::size_of::<Env>(), PGSIZE).unwrap();
    let envs = unsafe { alloc_zeroed(layout) } as *mut Env;
    assert!(!envs.is_null(), "cannot allocate the env table");

    table.envs = envs;
    table.env_free_list = null_mut();
    for i in (0..NENV).rev() {
        let e = table.slot(i);
        e.env_link = table.env_free_list;
        table.env_free_list = e as *mut Env;
    }

    #[cfg(target_os = "none")]
    map_envs_readonly(envs);
}

/// Map the arena's frames user-read-only at UENVS.
#[cfg(target_os = "none")]
fn map_envs_readonly(envs: *mut Env) {
    let mut kern_pgdir = pmap::kern_pgdir();
    let mut allocator = pmap::page_allocator();

    let bytes = VirtAddr(NENV * mem::size_of::<Env>()).round_up(PGSIZE).0;
    assert!(bytes <= PTSIZE, "env table does not fit its user window");
    let mut off = 0;
    while off < bytes {
        let pa = kern_pgdir
            .convert_to_pa(VirtAddr(envs as usize + off), &mut allocator)
            .expect("env table is not mapped");
        kern_pgdir
            .insert(pa, VirtAddr(UENVS + off), PteFlags::U, &mut allocator)
            .expect("cannot map the env table at UENVS");
        off += PGSIZE;
    }
}

/// The user-visible env record for a given slot index.
pub(crate) fn uenv_va(idx: usize) -> VirtAddr {
    VirtAddr(UENVS + idx * mem::size_of::<Env>())
}

/// Restore the register values in the Trapframe with the iret
/// instruction, entering user mode. Never returns.
#[cfg(target_os = "none")]
fn env_pop_tf(tf: *const Trapframe) -> ! {
    unsafe {
        core::arch::asm!(
            "mov esp, {tf}",
            "popad",
            "pop es",
            "pop ds",
            "add esp, 8", // skip trapno and err
            "iretd",
            tf = in(reg) tf,
            options(noreturn),
        );
    }
}

#[cfg(not(target_os = "none"))]
fn env_pop_tf(_tf: *const Trapframe) -> ! {
    unreachable!("env_pop_tf outside the kernel image");
}

/// Context switch to the given environment: mark it Running, make it
/// this CPU's current env, load its address space, release the kernel
/// lock and resume it. Never returns. If this is the first env to run
/// on this CPU, curenv is None.
pub(crate) fn env_run(env_id: EnvId, table: MutexGuard<'_, EnvTable>) -> ! {
    if let Some(cur) = cur_env_mut().filter(|e| e.is_running()) {
        cur.set_status(EnvStatus::Runnable);
    }

    let e = table.slot(env_id.index());
    assert_eq!(e.env_id, env_id, "env_run on a stale env id");
    e.env_status = EnvStatus::Running;
    e.env_runs += 1;

    mpconfig::this_cpu_mut().set_env(e as *mut Env);
    x86::lcr3(e.pgdir().paddr());

    let tf = e.get_tf() as *const Trapframe;
    drop(table);
    kernel_lock::unlock_kernel();

    env_pop_tf(tf)
}

/// Destroy an environment.
///
/// An env running on another CPU only becomes Dying; that CPU reaps it
/// on its next trap entry. Destroying the current env frees it and
/// yields, so this function does not return in that case.
pub(crate) fn env_destroy(env_id: EnvId, mut table: MutexGuard<'_, EnvTable>) {
    let is_cur = cur_env().map_or(false, |cur| cur.get_env_id() == env_id);
    let e = table.slot(env_id.index());
    assert_eq!(e.env_id, env_id, "env_destroy on a stale env id");

    if e.is_running() && !is_cur {
        e.set_status(EnvStatus::Dying);
        return;
    }

    table.env_free(env_id);

    if is_cur {
        mpconfig::this_cpu_mut().unset_env();
        drop(table);
        sched::sched_yield();
    }
}

/// Check that the environment is allowed to access [va, va+len) with
/// `perm | PTE_U`. On failure the environment is destroyed, and if it
/// is the current environment this call does not return.
pub(crate) fn user_mem_assert(env: &mut Env, va: VirtAddr, len: usize, perm: PteFlags) {
    let ok = {
        let mut allocator = pmap::page_allocator();
        env.pgdir()
            .user_mem_check(va, len, perm | PteFlags::U, &mut allocator)
    };

    if let Err(addr) = ok {
        log::warn!(
            "[{:08x}] user_mem_check assertion failure for va {:08x}",
            env.get_env_id(),
            addr.0
        );
        let env_id = env.get_env_id();
        env_destroy(env_id, env_table());
    }
}

/// Allocate an env running the given embedded ELF image. Only called
/// during kernel initialization, before the first env runs.
#[cfg(target_os = "none")]
pub(crate) fn env_create(binary: *const u8, typ: EnvType) -> EnvId {
    let mut table = ENV_TABLE.lock();
    let e = table
        .env_alloc(EnvId::NONE, typ)
        .expect("cannot create a boot-time env");
    let env_id = e.get_env_id();

    unsafe { load_icode(e, binary) };
    e.set_status(EnvStatus::Runnable);

    env_id
}

/// Load all loadable segments of the ELF binary into the env's address
/// space, zeroing bss, and map one page for the initial stack. Runs on
/// the env's own page directory so the copies hit its mappings.
#[cfg(target_os = "none")]
unsafe fn load_icode(e: &mut Env, binary: *const u8) {
    use crate::elf::{ElfParser, ProghdrType};
    use crate::util;

    let elf = ElfParser::new(binary).expect("binary is not a valid ELF");

    let kern_cr3 = x86::rcr3();
    x86::lcr3(e.pgdir().paddr());

    {
        let mut allocator = pmap::page_allocator();
        for ph in elf.program_headers() {
            if ph.p_type != ProghdrType::PtLoad {
                continue;
            }

            let src = VirtAddr(binary as usize + ph.p_offset as usize);
            let dst = VirtAddr(ph.p_vaddr as usize);
            let filesz = ph.p_filesz as usize;
            let memsz = ph.p_memsz as usize;

            e.pgdir().region_alloc(dst, memsz, &mut allocator);
            util::memcpy(dst, src, filesz);
            util::memset(dst + filesz, 0, memsz - filesz);
        }

        e.pgdir().region_alloc(
            VirtAddr(USTACKTOP - PGSIZE),
            PGSIZE,
            &mut allocator,
        );
    }

    x86::lcr3(kern_cr3);

    e.get_tf_mut().set_entry_point(elf.entry_point());
}

/// Rebuild the env table (and the rest of the simulated machine) for a
/// host test.
#[cfg(not(target_os = "none"))]
pub(crate) fn reset_for_test() {
    pmap::host::reset();
    mpconfig::reset_for_test();

    let mut table = ENV_TABLE.lock();
    if table.envs.is_null() {
        drop(table);
        env_init();
        return;
    }

    unsafe {
        core::ptr::write_bytes(table.envs as *mut u8, 0, NENV * mem::size_of::<Env>());
    }
    table.env_free_list = null_mut();
    for i in (0..NENV).rev() {
        let e = table.slot(i);
        e.env_link = table.env_free_list;
        table.env_free_list = e as *mut Env;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Allocate an env and make it this CPU's current, Running env.
    pub(crate) fn spawn_running(parent: EnvId) -> EnvId {
        let mut table = env_table();
        let e = table.env_alloc(parent, EnvType::User).unwrap();
        e.set_status(EnvStatus::Running);
        let id = e.get_env_id();
        mpconfig::this_cpu_mut().set_env(e as *mut Env);
        id
    }

    /// Allocate a plain NotRunnable env.
    pub(crate) fn spawn(parent: EnvId) -> EnvId {
        let mut table = env_table();
        let e = table.env_alloc(parent, EnvType::User).unwrap();
        e.get_env_id()
    }

    pub(crate) fn set_status(id: EnvId, status: EnvStatus) {
        let table = env_table();
        let e = table.slot(id.index());
        assert_eq!(e.get_env_id(), id);
        e.set_status(status);
    }

    pub(crate) fn make_current(id: EnvId) {
        let table = env_table();
        let e = table.slot(id.index());
        assert_eq!(e.get_env_id(), id);
        e.set_status(EnvStatus::Running);
        mpconfig::this_cpu_mut().set_env(e as *mut Env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kerntest;

    #[test]
    fn alloc_assigns_generation_tagged_ids() {
        kerntest::with_kernel(|| {
            let first = testutil::spawn_running(EnvId::NONE);
            assert_eq!(first.index(), 0);
            assert_eq!(first.0 & !(NENV as u32 - 1), 1 << ENVGENSHIFT);

            let second = testutil::spawn(EnvId::NONE);
            assert_eq!(second.index(), 1);
            assert_ne!(first, second);
        });
    }

    #[test]
    fn envid2env_resolves_and_rejects() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let child = testutil::spawn(me);
            let stranger = testutil::spawn(child);

            let mut table = env_table();

            // Id 0 is the caller, permission check or not.
            assert_eq!(table.envid2env(EnvId::NONE, true).unwrap().get_env_id(), me);

            // A child passes the permission check; a grandchild doesn't.
            assert!(table.envid2env(child, true).is_ok());
            assert_eq!(table.envid2env(stranger, true).err(), Some(Error::BadEnv));
            assert!(table.envid2env(stranger, false).is_ok());

            // A nonexistent id for a live slot fails the generation check.
            let stale = EnvId(child.0 + (1 << ENVGENSHIFT));
            assert_eq!(table.envid2env(stale, false).err(), Some(Error::BadEnv));
        });
    }

    #[test]
    fn ids_remain_valid_until_destroy_and_fail_after() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let victim = testutil::spawn(me);

            {
                let mut table = env_table();
                assert!(table.envid2env(victim, false).is_ok());
            }

            env_destroy(victim, env_table());

            let mut table = env_table();
            assert_eq!(table.envid2env(victim, false).err(), Some(Error::BadEnv));
            let _ = me;
        });
    }

    #[test]
    fn freed_slot_is_reused_with_fresh_generation() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let old = testutil::spawn(me);
            let old_idx = old.index();

            env_destroy(old, env_table());

            // The free list is LIFO, so the next alloc reuses the slot.
            let new = testutil::spawn(me);
            assert_eq!(new.index(), old_idx);
            assert_ne!(new, old);

            let mut table = env_table();
            assert_eq!(table.envid2env(old, false).err(), Some(Error::BadEnv));
            assert!(table.envid2env(new, false).is_ok());
        });
    }

    #[test]
    fn destroy_of_env_running_elsewhere_marks_it_dying() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let other = testutil::spawn(me);
            testutil::set_status(other, EnvStatus::Running);

            // `other` is Running but is not this CPU's curenv, so it
            // must only be marked Dying, to be reaped by its own CPU.
            env_destroy(other, env_table());

            let mut table = env_table();
            let e = table.envid2env(other, false).unwrap();
            assert!(e.is_dying());
        });
    }

    #[test]
    fn exhausting_the_table_reports_no_free_env() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let mut allocated = 1;
            loop {
                let mut table = env_table();
                match table.env_alloc(me, EnvType::User) {
                    Ok(_) => allocated += 1,
                    Err(e) => {
                        assert_eq!(e, Error::NoFreeEnv);
                        break;
                    }
                }
                assert!(allocated <= NENV, "allocated more envs than NENV");
            }
            assert_eq!(allocated, NENV);
        });
    }
}

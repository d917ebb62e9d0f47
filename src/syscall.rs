// The thirteen system-call primitives.
//
// Dispatch receives the raw registers saved at the trap and hands back
// the value for the saved eax. Each call validates its arguments
// completely before mutating anything, so a failed call leaves both the
// caller and any target environment untouched.

use core::cmp;

use crate::constants::*;
use crate::env::{self, EnvId, EnvStatus, EnvType};
use crate::error::Error;
use crate::pmap::{self, AllocFlag, PageDirectory, PteFlags, VirtAddr};
use crate::{console, sched};
use consts::*;

pub(crate) mod consts {
    // System call numbers, wire-stable.
    pub(crate) const SYS_CPUTS: u32 = 0;
    pub(crate) const SYS_CGETC: u32 = 1;
    pub(crate) const SYS_GETENVID: u32 = 2;
    pub(crate) const SYS_ENV_DESTROY: u32 = 3;
    pub(crate) const SYS_PAGE_ALLOC: u32 = 4;
    pub(crate) const SYS_PAGE_MAP: u32 = 5;
    pub(crate) const SYS_PAGE_UNMAP: u32 = 6;
    pub(crate) const SYS_EXOFORK: u32 = 7;
    pub(crate) const SYS_ENV_SET_STATUS: u32 = 8;
    pub(crate) const SYS_ENV_SET_PGFAULT_UPCALL: u32 = 9;
    pub(crate) const SYS_YIELD: u32 = 10;
    pub(crate) const SYS_IPC_TRY_SEND: u32 = 11;
    pub(crate) const SYS_IPC_RECV: u32 = 12;
}

/// Page-operation address rule: below UTOP and page-aligned.
fn check_va(va: usize) -> Result<VirtAddr, Error> {
    if va >= UTOP || va % PGSIZE != 0 {
        return Err(Error::Inval);
    }
    Ok(VirtAddr(va))
}

/// Page-operation permission rule: PTE_U and PTE_P must be set, and
/// nothing outside the syscall-permitted mask may be.
fn check_perm(perm: u32) -> Result<PteFlags, Error> {
    let flags = PteFlags::from_bits(perm).ok_or(Error::Inval)?;
    if !flags.contains(PteFlags::U | PteFlags::P) {
        return Err(Error::Inval);
    }
    if !PteFlags::SYSCALL.contains(flags) {
        return Err(Error::Inval);
    }
    Ok(flags)
}

/// Print a string from the caller's memory to the system console.
/// Destroys the environment on memory errors.
fn sys_cputs(s: usize, len: usize) -> Result<u32, Error> {
    let curenv = env::cur_env_mut().ok_or(Error::BadEnv)?;

    // Check that the user has permission to read [s, s+len); the env
    // dies here otherwise.
    env::user_mem_assert(curenv, VirtAddr(s), len, PteFlags::U);

    // Copy out through the direct map, page by page.
    let mut off = 0;
    while off < len {
        let va = VirtAddr(s + off);
        let chunk = cmp::min(PGSIZE - (va.0 & (PGSIZE - 1)), len - off);
        let pa = {
            let mut allocator = pmap::page_allocator();
            curenv
                .pgdir()
                .convert_to_pa(va, &mut allocator)
                .ok_or(Error::Fault)?
        };
        let bytes = unsafe { core::slice::from_raw_parts(pa.to_va().as_ptr::<u8>(), chunk) };
        match core::str::from_utf8(bytes) {
            Ok(text) => print!("{}", text),
            Err(_) => {
                for &b in bytes {
                    print!("{}", b as char);
                }
            }
        }
        off += chunk;
    }

    Ok(0)
}

/// Read a character from the system console without blocking.
/// Returns the character, or 0 if there is no input waiting.
fn sys_cgetc() -> Result<u32, Error> {
    Ok(console::cons_getc() as u32)
}

fn sys_getenvid() -> Result<u32, Error> {
    let curenv = env::cur_env().ok_or(Error::BadEnv)?;
    Ok(curenv.get_env_id().0)
}

/// Destroy a given environment, possibly the caller. Does not return
/// when the caller destroys itself.
fn sys_env_destroy(envid: EnvId) -> Result<u32, Error> {
    let mut table = env::env_table();
    let e = table.envid2env(envid, true)?;

    let cur_id = env::cur_env().map(|c| c.get_env_id());
    if cur_id == Some(e.get_env_id()) {
        log::info!("[{:08x}] exiting gracefully", e.get_env_id());
    } else {
        log::info!(
            "[{:08x}] destroying {:08x}",
            cur_id.unwrap_or(EnvId::NONE).0,
            e.get_env_id()
        );
    }

    let env_id = e.get_env_id();
    env::env_destroy(env_id, table);
    Ok(0)
}

/// Allocate a zeroed page and map it at va in envid's address space.
/// An existing mapping at va is replaced. The fresh frame is handed
/// back if the mapping cannot be completed.
fn sys_page_alloc(envid: EnvId, va: usize, perm: u32) -> Result<u32, Error> {
    let mut table = env::env_table();
    let e = table.envid2env(envid, true)?;
    let va = check_va(va)?;
    let perm = check_perm(perm)?;

    let mut allocator = pmap::page_allocator();
    let pa = allocator.alloc(AllocFlag::Zero).ok_or(Error::NoMem)?;
    if let Err(err) = e.pgdir().insert(pa, va, perm, &mut allocator) {
        // No memory for an intermediate page table; the frame must not
        // leak.
        allocator.free(pa);
        return Err(err);
    }

    Ok(0)
}

/// Map the page at srcva in srcenvid's space at dstva in dstenvid's
/// space. The frame is shared; write permission may not be granted on
/// a read-only source mapping.
fn sys_page_map(
    srcenvid: EnvId,
    srcva: usize,
    dstenvid: EnvId,
    dstva: usize,
    perm: u32,
) -> Result<u32, Error> {
    let mut table = env::env_table();
    // Resolve the two owners in separate scopes: envid 0 and a real id
    // can name the same slot, and two live borrows of one record must
    // never exist. Everything past resolution goes through the raw
    // directory pointers.
    let (src_id, src_pgdir) = {
        let e = table.envid2env(srcenvid, true)?;
        (e.get_env_id(), e.pgdir() as *mut PageDirectory)
    };
    let dst_pgdir = {
        let e = table.envid2env(dstenvid, true)?;
        if e.get_env_id() == src_id {
            // Both sides are the same environment; reuse the pointer.
            src_pgdir
        } else {
            e.pgdir() as *mut PageDirectory
        }
    };
    let srcva = check_va(srcva)?;
    let dstva = check_va(dstva)?;
    let perm = check_perm(perm)?;

    let mut allocator = pmap::page_allocator();
    let (pa, src_flags) = {
        let pte = unsafe { &mut *src_pgdir }
            .lookup(srcva, &mut allocator)
            .ok_or(Error::Inval)?;
        (pte.addr(), pte.flags())
    };
    if perm.contains(PteFlags::W) && !src_flags.contains(PteFlags::W) {
        return Err(Error::Inval);
    }

    unsafe { &mut *dst_pgdir }.insert(pa, dstva, perm, &mut allocator)?;
    Ok(0)
}

/// Unmap the page at va in envid's address space; silently succeeds if
/// nothing is mapped there.
fn sys_page_unmap(envid: EnvId, va: usize) -> Result<u32, Error> {
    let mut table = env::env_table();
    let e = table.envid2env(envid, true)?;
    let va = check_va(va)?;

    let mut allocator = pmap::page_allocator();
    e.pgdir().remove(va, &mut allocator);
    Ok(0)
}

/// Allocate a suspended child with an empty address space and the
/// caller's register snapshot, tweaked so the call appears to return 0
/// in the child once it is eventually resumed.
fn sys_exofork() -> Result<u32, Error> {
    let parent = env::cur_env().ok_or(Error::BadEnv)?;
    let parent_id = parent.get_env_id();

    let mut table = env::env_table();
    let child = table.env_alloc(parent_id, EnvType::User)?;

    // env_alloc left the child NotRunnable; the parent makes it
    // runnable with sys_env_set_status once the address space is built.
    child.set_tf(parent.get_tf());
    child.get_tf_mut().tf_regs.reg_eax = 0;

    Ok(child.get_env_id().0)
}

/// Set envid's status; only the Runnable <-> NotRunnable transitions
/// are reachable from user space.
fn sys_env_set_status(envid: EnvId, status: u32) -> Result<u32, Error> {
    let status = match status {
        s if s == EnvStatus::Runnable as u32 => EnvStatus::Runnable,
        s if s == EnvStatus::NotRunnable as u32 => EnvStatus::NotRunnable,
        _ => return Err(Error::Inval),
    };

    let mut table = env::env_table();
    let e = table.envid2env(envid, true)?;
    e.set_status(status);
    Ok(0)
}

/// Register envid's page-fault upcall entry point.
fn sys_env_set_pgfault_upcall(envid: EnvId, func: usize) -> Result<u32, Error> {
    let mut table = env::env_table();
    let e = table.envid2env(envid, true)?;
    e.set_pgfault_upcall(VirtAddr(func));
    Ok(0)
}

/// Record that the caller wants a message (and at which address it
/// wants a transferred page, if any) and park it. The caller resumes
/// with 0 in eax when a sender delivers; only validation errors return
/// here.
pub(crate) fn ipc_recv_prepare(dstva: usize) -> Result<(), Error> {
    let curenv = env::cur_env_mut().ok_or(Error::BadEnv)?;

    let dstva = if dstva < UTOP {
        if dstva % PGSIZE != 0 {
            return Err(Error::Inval);
        }
        VirtAddr(dstva)
    } else {
        // Not willing to receive a page.
        VirtAddr(UTOP)
    };

    curenv.ipc_start_recv(dstva);
    Ok(())
}

/// Try to deliver value (and optionally the page at srcva) to envid.
///
/// Fails with IpcNotRecv unless the target is blocked in sys_ipc_recv.
/// A page moves only when the sender offers one (srcva < UTOP) and the
/// receiver asked for one (its dstva < UTOP); otherwise the transfer
/// silently degrades to value-only. Nothing observable happens to the
/// target until every check has passed.
fn sys_ipc_try_send(envid: EnvId, value: u32, srcva: usize, perm: u32) -> Result<u32, Error> {
    let curenv = env::cur_env_mut().ok_or(Error::BadEnv)?;
    let cur_id = curenv.get_env_id();

    let mut table = env::env_table();
    // No permission check: anyone may send to a willing receiver.
    let dstenv = table.envid2env(envid, false)?;

    if !dstenv.ipc_recving() {
        return Err(Error::IpcNotRecv);
    }

    let mut xfer_perm = PteFlags::empty();
    if srcva < UTOP && dstenv.ipc_dstva().0 < UTOP {
        if srcva % PGSIZE != 0 {
            return Err(Error::Inval);
        }
        let perm = check_perm(perm | PteFlags::P.bits())?;

        let mut allocator = pmap::page_allocator();
        let (pa, src_flags) = {
            let pte = curenv
                .pgdir()
                .lookup(VirtAddr(srcva), &mut allocator)
                .ok_or(Error::Inval)?;
            (pte.addr(), pte.flags())
        };
        if perm.contains(PteFlags::W) && !src_flags.contains(PteFlags::W) {
            return Err(Error::Inval);
        }

        let dstva = dstenv.ipc_dstva();
        dstenv.pgdir().insert(pa, dstva, perm, &mut allocator)?;
        xfer_perm = perm;
    }

    // Every check has passed; commit the delivery and wake the
    // receiver. Its saved eax becomes sys_ipc_recv's return value.
    dstenv.ipc_deliver(cur_id, value, xfer_perm);
    Ok(0)
}

/// Dispatch to the right kernel function, passing the arguments.
pub(crate) fn syscall(syscallno: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
    let res = match syscallno {
        SYS_CPUTS => sys_cputs(a1 as usize, a2 as usize),
        SYS_CGETC => sys_cgetc(),
        SYS_GETENVID => sys_getenvid(),
        SYS_ENV_DESTROY => sys_env_destroy(EnvId(a1)),
        SYS_PAGE_ALLOC => sys_page_alloc(EnvId(a1), a2 as usize, a3),
        SYS_PAGE_MAP => sys_page_map(EnvId(a1), a2 as usize, EnvId(a3), a4 as usize, a5),
        SYS_PAGE_UNMAP => sys_page_unmap(EnvId(a1), a2 as usize),
        SYS_EXOFORK => sys_exofork(),
        SYS_ENV_SET_STATUS => sys_env_set_status(EnvId(a1), a2),
        SYS_ENV_SET_PGFAULT_UPCALL => sys_env_set_pgfault_upcall(EnvId(a1), a2 as usize),
        SYS_YIELD => sched::sched_yield(),
        SYS_IPC_TRY_SEND => sys_ipc_try_send(EnvId(a1), a2, a3 as usize, a4),
        SYS_IPC_RECV => match ipc_recv_prepare(a1 as usize) {
            Ok(()) => sched::sched_yield(),
            Err(e) => Err(e),
        },
        _ => Err(Error::Inval),
    };

    match res {
        Ok(v) => v as i32,
        Err(e) => -e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::testutil;
    use crate::kerntest;

    const UP: u32 = PteFlags::U.bits() | PteFlags::P.bits();
    const UPW: u32 = UP | PteFlags::W.bits();

    fn lookup_flags(id: EnvId, va: usize) -> Option<(u32, PteFlags)> {
        let mut table = env::env_table();
        let e = table.envid2env(id, false).unwrap();
        let mut allocator = pmap::page_allocator();
        e.pgdir()
            .lookup(VirtAddr(va), &mut allocator)
            .map(|pte| (pte.addr().0, pte.flags()))
    }

    #[test]
    fn va_boundaries() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let _ = me;

            // va = UTOP is out; the last page below it is in.
            assert_eq!(sys_page_alloc(EnvId::NONE, UTOP, UP), Err(Error::Inval));
            assert_eq!(sys_page_alloc(EnvId::NONE, UTOP - PGSIZE, UP), Ok(0));
            // Unaligned addresses are out for every va-taking call.
            assert_eq!(sys_page_alloc(EnvId::NONE, 0x1234, UP), Err(Error::Inval));
            assert_eq!(sys_page_unmap(EnvId::NONE, 0x1234), Err(Error::Inval));
            assert_eq!(
                sys_page_map(EnvId::NONE, 0x1000, EnvId::NONE, 0x2f00, UP),
                Err(Error::Inval)
            );
        });
    }

    #[test]
    fn perm_mask_boundaries() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let _ = me;
            let va = 0x40_0000;

            // U and P are mandatory.
            assert_eq!(
                sys_page_alloc(EnvId::NONE, va, PteFlags::P.bits()),
                Err(Error::Inval)
            );
            assert_eq!(
                sys_page_alloc(EnvId::NONE, va, PteFlags::U.bits()),
                Err(Error::Inval)
            );
            // Bits outside the syscall mask are rejected...
            assert_eq!(
                sys_page_alloc(EnvId::NONE, va, UP | PteFlags::PCD.bits()),
                Err(Error::Inval)
            );
            assert_eq!(sys_page_alloc(EnvId::NONE, va, UP | 0x1000), Err(Error::Inval));
            // ...while the AVAIL bits (the COW encoding) are fine.
            assert_eq!(
                sys_page_alloc(EnvId::NONE, va, UP | PteFlags::COW.bits()),
                Ok(0)
            );
        });
    }

    #[test]
    fn page_alloc_then_unmap_leaves_no_residue() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let va = 0x80_0000;

            assert_eq!(sys_page_alloc(EnvId::NONE, va, UPW), Ok(0));
            let (pa, flags) = lookup_flags(me, va).unwrap();
            assert!(flags.contains(PteFlags::U | PteFlags::W | PteFlags::P));

            // The frame came back zeroed.
            let frame = crate::pmap::PhysAddr(pa).to_va();
            let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr::<u8>(), PGSIZE) };
            assert!(bytes.iter().all(|&b| b == 0));

            assert_eq!(sys_page_unmap(EnvId::NONE, va), Ok(0));
            assert!(lookup_flags(me, va).is_none());

            // Unmapping again still succeeds silently.
            assert_eq!(sys_page_unmap(EnvId::NONE, va), Ok(0));
        });
    }

    #[test]
    fn page_map_shares_the_frame() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let child = testutil::spawn(me);
            let (a, b) = (0x40_0000, 0x70_0000);

            assert_eq!(sys_page_alloc(EnvId::NONE, a, UPW), Ok(0));
            assert_eq!(sys_page_map(EnvId::NONE, a, child, b, UPW), Ok(0));

            let (pa_src, _) = lookup_flags(me, a).unwrap();
            let (pa_dst, _) = lookup_flags(child, b).unwrap();
            assert_eq!(pa_src, pa_dst, "mapping a page must share its frame");

            // Unmapping the destination leaves the source intact.
            assert_eq!(sys_page_unmap(child, b), Ok(0));
            assert!(lookup_flags(child, b).is_none());
            assert!(lookup_flags(me, a).is_some());
        });
    }

    #[test]
    fn page_map_refuses_write_grant_on_readonly_source() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let child = testutil::spawn(me);
            let va = 0x40_0000;

            assert_eq!(sys_page_alloc(EnvId::NONE, va, UP), Ok(0));
            assert_eq!(
                sys_page_map(EnvId::NONE, va, child, va, UPW),
                Err(Error::Inval)
            );
            // Read-only sharing of the same page is fine.
            assert_eq!(sys_page_map(EnvId::NONE, va, child, va, UP), Ok(0));
        });
    }

    #[test]
    fn page_map_requires_a_source_mapping() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let child = testutil::spawn(me);
            let _ = me;
            assert_eq!(
                sys_page_map(EnvId::NONE, 0x40_0000, child, 0x40_0000, UP),
                Err(Error::Inval)
            );
        });
    }

    #[test]
    fn page_ops_reject_strangers() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let child = testutil::spawn(me);
            let grandchild = testutil::spawn(child);
            let va = 0x40_0000;

            // A direct child is fair game, a grandchild is not.
            assert_eq!(sys_page_alloc(child, va, UPW), Ok(0));
            assert_eq!(sys_page_alloc(grandchild, va, UPW), Err(Error::BadEnv));
            assert_eq!(sys_page_unmap(grandchild, va), Err(Error::BadEnv));
        });
    }

    #[test]
    fn exofork_clones_registers_and_returns_zero_in_child() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);

            // Give the parent's saved frame a recognizable shape.
            {
                let mut table = env::env_table();
                let e = table.envid2env(me, false).unwrap();
                let tf = e.get_tf_mut();
                tf.tf_regs.reg_eax = 0xdead_beef;
                tf.tf_regs.reg_ebx = 0x1111_2222;
                tf.tf_eip = 0x80_4321;
            }

            let child_raw = sys_exofork().unwrap();
            assert!(child_raw as i32 > 0, "parent sees a positive child id");
            let child = EnvId(child_raw);

            let mut table = env::env_table();
            let e = table.envid2env(child, false).unwrap();
            assert_eq!(e.status(), EnvStatus::NotRunnable);
            assert_eq!(e.parent_id(), me);
            // Same snapshot, except eax reads 0 when the child runs.
            assert_eq!(e.get_tf().tf_regs.reg_eax, 0);
            assert_eq!(e.get_tf().tf_regs.reg_ebx, 0x1111_2222);
            assert_eq!(e.get_tf().tf_eip, 0x80_4321);
        });
    }

    #[test]
    fn set_status_allows_only_the_two_user_states() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let child = testutil::spawn(me);

            assert_eq!(
                sys_env_set_status(child, EnvStatus::Runnable as u32),
                Ok(0)
            );
            assert_eq!(
                sys_env_set_status(child, EnvStatus::NotRunnable as u32),
                Ok(0)
            );
            assert_eq!(
                sys_env_set_status(child, EnvStatus::Running as u32),
                Err(Error::Inval)
            );
            assert_eq!(
                sys_env_set_status(child, EnvStatus::Free as u32),
                Err(Error::Inval)
            );
            assert_eq!(sys_env_set_status(EnvId(0x7777), 2), Err(Error::BadEnv));
        });
    }

    #[test]
    fn pgfault_upcall_is_stored() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            assert_eq!(sys_env_set_pgfault_upcall(EnvId::NONE, 0x80_1000), Ok(0));

            let mut table = env::env_table();
            let e = table.envid2env(me, false).unwrap();
            assert_eq!(e.pgfault_upcall().0, 0x80_1000);
        });
    }

    #[test]
    fn ipc_recv_validates_and_parks() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);

            // Unaligned receive address is refused outright.
            assert_eq!(ipc_recv_prepare(0x1001), Err(Error::Inval));

            // An address above UTOP means "no page wanted".
            assert_eq!(ipc_recv_prepare(usize::MAX), Ok(()));
            {
                let mut table = env::env_table();
                let e = table.envid2env(me, false).unwrap();
                assert!(e.ipc_recving());
                assert_eq!(e.ipc_dstva().0, UTOP);
                assert_eq!(e.status(), EnvStatus::NotRunnable);
            }
        });
    }

    #[test]
    fn ipc_send_fails_until_receiver_is_parked() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let peer = testutil::spawn(me);

            assert_eq!(
                sys_ipc_try_send(peer, 42, usize::MAX, 0),
                Err(Error::IpcNotRecv)
            );

            // Park the peer, then the same send goes through.
            {
                let mut table = env::env_table();
                let e = table.envid2env(peer, false).unwrap();
                e.ipc_start_recv(VirtAddr(UTOP));
            }
            assert_eq!(sys_ipc_try_send(peer, 42, usize::MAX, 0), Ok(0));

            let mut table = env::env_table();
            let e = table.envid2env(peer, false).unwrap();
            assert_eq!(e.ipc_value(), 42);
            assert_eq!(e.ipc_from(), me);
            assert_eq!(e.ipc_perm(), PteFlags::empty());
            assert!(!e.ipc_recving());
            assert_eq!(e.status(), EnvStatus::Runnable);
            assert_eq!(e.get_tf().tf_regs.reg_eax, 0);

            // A second send finds nobody listening again.
            drop(table);
            assert_eq!(
                sys_ipc_try_send(peer, 43, usize::MAX, 0),
                Err(Error::IpcNotRecv)
            );
        });
    }

    #[test]
    fn ipc_page_transfer_maps_the_same_frame() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let peer = testutil::spawn(me);
            let (srcva, dstva) = (0x40_0000, 0x60_0000);

            assert_eq!(sys_page_alloc(EnvId::NONE, srcva, UPW), Ok(0));
            {
                let mut table = env::env_table();
                let e = table.envid2env(peer, false).unwrap();
                e.ipc_start_recv(VirtAddr(dstva));
            }

            assert_eq!(sys_ipc_try_send(peer, 7, srcva, UPW), Ok(0));

            let (pa_src, _) = lookup_flags(me, srcva).unwrap();
            let (pa_dst, dst_flags) = lookup_flags(peer, dstva).unwrap();
            assert_eq!(pa_src, pa_dst, "transferred page must share its frame");
            assert!(dst_flags.contains(PteFlags::U | PteFlags::W | PteFlags::P));

            let mut table = env::env_table();
            let e = table.envid2env(peer, false).unwrap();
            assert_eq!(e.ipc_value(), 7);
            assert!(e.ipc_perm().contains(PteFlags::U | PteFlags::W | PteFlags::P));
        });
    }

    #[test]
    fn ipc_degrades_to_value_only_when_no_page_wanted() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let peer = testutil::spawn(me);
            let srcva = 0x40_0000;

            assert_eq!(sys_page_alloc(EnvId::NONE, srcva, UPW), Ok(0));
            {
                let mut table = env::env_table();
                let e = table.envid2env(peer, false).unwrap();
                // Receiver asked for a value only.
                e.ipc_start_recv(VirtAddr(UTOP));
            }

            assert_eq!(sys_ipc_try_send(peer, 9, srcva, UPW), Ok(0));

            let mut table = env::env_table();
            let e = table.envid2env(peer, false).unwrap();
            assert_eq!(e.ipc_value(), 9);
            assert_eq!(e.ipc_perm(), PteFlags::empty());
            drop(table);
            assert!(lookup_flags(peer, srcva).is_none());
        });
    }

    #[test]
    fn failed_ipc_send_leaves_receiver_untouched() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let peer = testutil::spawn(me);
            let (srcva, dstva) = (0x40_0000, 0x60_0000);

            // srcva is not mapped in the sender, so the send must fail...
            {
                let mut table = env::env_table();
                let e = table.envid2env(peer, false).unwrap();
                e.ipc_start_recv(VirtAddr(dstva));
            }
            assert_eq!(sys_ipc_try_send(peer, 11, srcva, UPW), Err(Error::Inval));

            // ...without any observable mutation of the receiver.
            let mut table = env::env_table();
            let e = table.envid2env(peer, false).unwrap();
            assert!(e.ipc_recving());
            assert_eq!(e.status(), EnvStatus::NotRunnable);
            assert_eq!(e.ipc_value(), 0);
        });
    }

    #[test]
    fn cow_lattice_and_repair_sequence() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let child = testutil::spawn(me);
            let va = 0x40_0000;
            let cow = UP | PteFlags::COW.bits();

            // A writable page goes to the child as COW: write clear,
            // COW set, same frame; then the parent downgrades itself.
            assert_eq!(sys_page_alloc(EnvId::NONE, va, UPW), Ok(0));
            assert_eq!(sys_page_map(EnvId::NONE, va, child, va, cow), Ok(0));
            assert_eq!(sys_page_map(EnvId::NONE, va, EnvId::NONE, va, cow), Ok(0));

            let (parent_pa, parent_flags) = lookup_flags(me, va).unwrap();
            let (child_pa, child_flags) = lookup_flags(child, va).unwrap();
            assert_eq!(parent_pa, child_pa);
            for flags in [parent_flags, child_flags] {
                assert!(flags.contains(PteFlags::COW));
                assert!(!flags.contains(PteFlags::W), "COW implies write-clear");
            }

            // The repair sequence the user fault handler runs: fresh
            // page at the scratch address, remap over the faulting va
            // with write restored, drop the scratch mapping.
            assert_eq!(sys_page_alloc(EnvId::NONE, PFTEMP, UPW), Ok(0));
            assert_eq!(sys_page_map(EnvId::NONE, PFTEMP, EnvId::NONE, va, UPW), Ok(0));
            assert_eq!(sys_page_unmap(EnvId::NONE, PFTEMP), Ok(0));

            let (new_pa, new_flags) = lookup_flags(me, va).unwrap();
            assert_ne!(new_pa, parent_pa, "repair must produce a private frame");
            assert!(new_flags.contains(PteFlags::W));
            assert!(!new_flags.contains(PteFlags::COW));

            // The child still sees the original frame, still COW.
            let (child_pa2, child_flags2) = lookup_flags(child, va).unwrap();
            assert_eq!(child_pa2, child_pa);
            assert!(child_flags2.contains(PteFlags::COW));
        });
    }

    #[test]
    fn dispatcher_routes_and_reports_errors() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);

            assert_eq!(syscall(SYS_GETENVID, 0, 0, 0, 0, 0), me.0 as i32);
            assert_eq!(
                syscall(SYS_PAGE_ALLOC, 0, UTOP as u32, UP, 0, 0),
                -Error::Inval.code()
            );
            assert_eq!(syscall(999, 0, 0, 0, 0, 0), -Error::Inval.code());
        });
    }

    #[test]
    fn cputs_copies_through_the_mapping() {
        kerntest::with_kernel(|| {
            let me = testutil::spawn_running(EnvId::NONE);
            let _ = me;
            let va = 0x40_0000;
            assert_eq!(sys_page_alloc(EnvId::NONE, va, UPW), Ok(0));

            // Write through the frame, read back through the syscall.
            let (pa, _) = lookup_flags(EnvId::NONE, va).unwrap();
            let frame = crate::pmap::PhysAddr(pa).to_va();
            unsafe {
                core::ptr::copy_nonoverlapping(b"hi".as_ptr(), frame.as_mut_ptr::<u8>(), 2);
            }

            assert_eq!(sys_cputs(va, 2), Ok(0));
        });
    }
}

// User-level fork with copy-on-write.
//
// The kernel only supplies exofork and the page primitives; this module
// builds the child's address space by walking the read-only page tables
// at UVPT and downgrading every writable mapping to COW on both sides,
// then repairs COW pages one at a time in the page-fault handler.

use crate::constants::*;
use crate::env::EnvStatus;
use crate::pmap::PteFlags;
use crate::trap::UTrapframe;

use super::pgfault::{self, set_pgfault_handler};
use super::syscall::*;
use super::set_thisenv;

// The kernel maps the current page tables read-only at UVPT via the
// self-referencing directory slot; the directory itself shows up at the
// self-referencing position inside that window.
const UVPD: usize = UVPT + (UVPT >> 12) * 4;

fn uvpd_entry(va: usize) -> u32 {
    unsafe { *((UVPD + (va >> 22) * 4) as *const u32) }
}

fn uvpt_entry(va: usize) -> u32 {
    unsafe { *((UVPT + (va >> PGSHIFT) * 4) as *const u32) }
}

/// Page table entry for va, or 0 when even the page table is absent.
fn get_pte(va: usize) -> u32 {
    if uvpd_entry(va) & PteFlags::P.bits() == 0 {
        return 0;
    }
    uvpt_entry(va)
}

/// What fork does with one of the parent's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupKind {
    /// Not mapped (or not user-visible): nothing to do.
    Skip,
    /// Read-only: child shares the mapping as-is.
    Share,
    /// Writable or already COW: both sides get the COW encoding.
    Cow,
}

pub(crate) fn duppage_kind(pte: u32) -> DupKind {
    let flags = PteFlags::from_bits_truncate(pte);
    if !flags.contains(PteFlags::P | PteFlags::U) {
        DupKind::Skip
    } else if flags.intersects(PteFlags::W | PteFlags::COW) {
        DupKind::Cow
    } else {
        DupKind::Share
    }
}

/// Map our page pn into the target env at the same address. Writable
/// and COW pages become COW in the child first, then are re-marked COW
/// in the parent, so the first write on either side faults.
fn duppage(envid: i32, pn: usize) -> i32 {
    let va = pn << PGSHIFT;
    let cow = (PteFlags::P | PteFlags::U | PteFlags::COW).bits();
    let ro = (PteFlags::P | PteFlags::U).bits();

    match duppage_kind(get_pte(va)) {
        DupKind::Skip => 0,
        DupKind::Share => sys_page_map(0, va, envid, va, ro),
        DupKind::Cow => {
            let r = sys_page_map(0, va, envid, va, cow);
            if r < 0 {
                return r;
            }
            // The parent's own mapping must flip to COW as well, even
            // if it already was: a plain writable alias would let the
            // parent scribble on pages the child thinks are frozen.
            sys_page_map(0, va, 0, va, cow)
        }
    }
}

/// COW repair: on a write fault to a COW page, copy the page into a
/// private frame at the faulting address. Anything else is fatal for
/// the environment.
extern "C" fn pgfault(utf: &mut UTrapframe) {
    let addr = utf.utf_fault_va as usize;
    let err = utf.utf_err;

    if err & FEC_WR == 0 {
        crate::upanic!(
            "page fault at va {:#x} eip {:#x} was not a write",
            addr,
            utf.utf_eip
        );
    }
    let pte = get_pte(addr);
    if duppage_kind(pte) != DupKind::Cow || pte & PteFlags::COW.bits() == 0 {
        crate::upanic!("write fault at va {:#x} on a non-COW page", addr);
    }

    // Fresh page at PFTEMP, copy, swing it over the faulting address,
    // drop the scratch mapping.
    let perm = (PteFlags::P | PteFlags::U | PteFlags::W).bits();
    let r = sys_page_alloc(0, PFTEMP, perm);
    if r < 0 {
        crate::upanic!("pgfault: page_alloc: {}", r);
    }

    let page = addr & !(PGSIZE - 1);
    unsafe {
        core::ptr::copy_nonoverlapping(page as *const u8, PFTEMP as *mut u8, PGSIZE);
    }

    let r = sys_page_map(0, PFTEMP, 0, page, perm);
    if r < 0 {
        crate::upanic!("pgfault: page_map: {}", r);
    }
    let r = sys_page_unmap(0, PFTEMP);
    if r < 0 {
        crate::upanic!("pgfault: page_unmap: {}", r);
    }
}

/// Fork this environment with copy-on-write.
///
/// Returns the child's envid to the parent and 0 to the child; the
/// child must re-resolve "self" because it shares the parent's memory
/// image, which is done here before it sees user code.
pub fn fork() -> i32 {
    set_pgfault_handler(pgfault);

    let child = sys_exofork();
    if child == 0 {
        set_thisenv();
        return 0;
    }
    if child < 0 {
        return child;
    }

    // The child needs its own exception stack; the fault handler runs
    // on it, so it can never be COW.
    let perm = (PteFlags::P | PteFlags::U | PteFlags::W).bits();
    let r = sys_page_alloc(child, UXSTACKTOP - PGSIZE, perm);
    if r < 0 {
        crate::upanic!("fork: allocating the child exception stack: {}", r);
    }
    let r = sys_env_set_pgfault_upcall(child, pgfault::upcall_va());
    if r < 0 {
        crate::upanic!("fork: setting the child upcall: {}", r);
    }

    // Every present user page below the stack top moves over; the
    // exception stack page was handled above and is skipped here.
    for pn in (UTEXT >> PGSHIFT)..(USTACKTOP >> PGSHIFT) {
        let r = duppage(child, pn);
        if r < 0 {
            crate::upanic!("fork: duppage: {}", r);
        }
    }

    let r = sys_env_set_status(child, EnvStatus::Runnable as u32);
    if r < 0 {
        crate::upanic!("fork: marking the child runnable: {}", r);
    }

    child
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u32 = 0x1;
    const W: u32 = 0x2;
    const U: u32 = 0x4;
    const COW: u32 = 0x800;

    #[test]
    fn unmapped_and_kernel_pages_are_skipped() {
        assert_eq!(duppage_kind(0), DupKind::Skip);
        assert_eq!(duppage_kind(P | W), DupKind::Skip); // kernel-only
        assert_eq!(duppage_kind(U), DupKind::Skip); // not present
    }

    #[test]
    fn readonly_pages_are_shared() {
        assert_eq!(duppage_kind(P | U), DupKind::Share);
    }

    #[test]
    fn writable_and_cow_pages_go_cow() {
        assert_eq!(duppage_kind(P | U | W), DupKind::Cow);
        assert_eq!(duppage_kind(P | U | COW), DupKind::Cow);
        assert_eq!(duppage_kind(P | U | W | COW), DupKind::Cow);
    }
}

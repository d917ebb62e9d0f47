// Blocking IPC on top of the try-send/recv primitives.

use crate::constants::UTOP;
use crate::env::{EnvType, NENV};
use crate::error::Error;
use crate::pmap::PteFlags;

use super::syscall::*;
use super::thisenv;

/// Receive a value (and possibly a page at pg) from any sender.
///
/// On success the sender's envid lands in from_env_store and the page
/// permission (nonzero iff a page actually arrived) in perm_store, and
/// the sent value is returned. On error both stores read 0.
pub fn ipc_recv(
    from_env_store: Option<&mut i32>,
    pg: Option<usize>,
    perm_store: Option<&mut u32>,
) -> i32 {
    // Zero is a perfectly valid place to map a page, so "no page" needs
    // an address the kernel reads as a refusal.
    let dstva = pg.unwrap_or(UTOP);

    let r = sys_ipc_recv(dstva);
    if r < 0 {
        if let Some(store) = from_env_store {
            *store = 0;
        }
        if let Some(store) = perm_store {
            *store = 0;
        }
        return r;
    }

    let me = thisenv();
    if let Some(store) = from_env_store {
        *store = me.ipc_from().0 as i32;
    }
    if let Some(store) = perm_store {
        *store = me.ipc_perm().bits();
    }
    me.ipc_value() as i32
}

/// Send val (and the page at pg with perm, if given) to to_env,
/// retrying until the receiver is ready. Busy-yields between attempts;
/// there is no fairness among competing senders.
pub fn ipc_send(to_env: i32, val: u32, pg: Option<usize>, perm: u32) {
    let (srcva, perm) = match pg {
        Some(va) => (va, perm | PteFlags::P.bits()),
        None => (UTOP, 0),
    };

    loop {
        let r = sys_ipc_try_send(to_env, val, srcva, perm);
        if r == 0 {
            return;
        }
        if r != -Error::IpcNotRecv.code() {
            crate::upanic!("ipc_send to {:08x}: {}", to_env, r);
        }
        sys_yield();
    }
}

/// The first environment of the given type, or 0 if none exists. Used
/// to find well-known service environments.
pub fn ipc_find_env(typ: EnvType) -> i32 {
    for idx in 0..NENV {
        let e = unsafe { &*crate::env::uenv_va(idx).as_ptr::<crate::env::Env>() };
        if !e.is_free() && e.env_type() == typ {
            return e.get_env_id().0 as i32;
        }
    }
    0
}

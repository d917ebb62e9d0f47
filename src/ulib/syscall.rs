// User-side system call wrappers.
//
// Arguments travel in eax (number), edx, ecx, ebx, edi, esi; the result
// comes back in eax. The common path goes through the _usyscall stub in
// usys.S, which saves the callee-owned registers around the int.
// sys_exofork is the exception: the child resumes at the instruction
// after the int with the parent's registers, so the trap must be inline
// in the caller's frame rather than behind a call.

use crate::syscall::consts::*;

#[cfg(target_os = "none")]
fn syscall(num: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
    extern "C" {
        fn _usyscall(num: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32;
    }
    unsafe { _usyscall(num, a1, a2, a3, a4, a5) }
}

#[cfg(not(target_os = "none"))]
fn syscall(_num: u32, _a1: u32, _a2: u32, _a3: u32, _a4: u32, _a5: u32) -> i32 {
    unimplemented!("user system calls only exist on the target")
}

pub fn sys_cputs(s: &[u8]) {
    syscall(SYS_CPUTS, s.as_ptr() as usize as u32, s.len() as u32, 0, 0, 0);
}

/// One console character, or 0 if no input is pending.
pub fn sys_cgetc() -> u8 {
    syscall(SYS_CGETC, 0, 0, 0, 0, 0) as u8
}

pub fn sys_getenvid() -> i32 {
    syscall(SYS_GETENVID, 0, 0, 0, 0, 0)
}

pub fn sys_env_destroy(envid: i32) -> i32 {
    syscall(SYS_ENV_DESTROY, envid as u32, 0, 0, 0, 0)
}

pub fn sys_yield() {
    syscall(SYS_YIELD, 0, 0, 0, 0, 0);
}

pub fn sys_page_alloc(envid: i32, va: usize, perm: u32) -> i32 {
    syscall(SYS_PAGE_ALLOC, envid as u32, va as u32, perm, 0, 0)
}

pub fn sys_page_map(srcenv: i32, srcva: usize, dstenv: i32, dstva: usize, perm: u32) -> i32 {
    syscall(
        SYS_PAGE_MAP,
        srcenv as u32,
        srcva as u32,
        dstenv as u32,
        dstva as u32,
        perm,
    )
}

pub fn sys_page_unmap(envid: i32, va: usize) -> i32 {
    syscall(SYS_PAGE_UNMAP, envid as u32, va as u32, 0, 0, 0)
}

/// Spawn a suspended child sharing the caller's registers. Returns the
/// child id in the parent and 0 in the child (once it runs).
#[cfg(target_arch = "x86")]
#[inline(always)]
pub fn sys_exofork() -> i32 {
    let ret: i32;
    unsafe {
        core::arch::asm!(
            "int 48",
            inlateout("eax") SYS_EXOFORK => ret,
        );
    }
    ret
}

#[cfg(not(target_arch = "x86"))]
pub fn sys_exofork() -> i32 {
    unimplemented!("user system calls only exist on the target")
}

pub fn sys_env_set_status(envid: i32, status: u32) -> i32 {
    syscall(SYS_ENV_SET_STATUS, envid as u32, status, 0, 0, 0)
}

pub fn sys_env_set_pgfault_upcall(envid: i32, upcall: usize) -> i32 {
    syscall(SYS_ENV_SET_PGFAULT_UPCALL, envid as u32, upcall as u32, 0, 0, 0)
}

pub fn sys_ipc_try_send(envid: i32, value: u32, srcva: usize, perm: u32) -> i32 {
    syscall(SYS_IPC_TRY_SEND, envid as u32, value, srcva as u32, perm, 0)
}

/// Block until a message arrives. dstva above UTOP refuses any page.
pub fn sys_ipc_recv(dstva: usize) -> i32 {
    syscall(SYS_IPC_RECV, dstva as u32, 0, 0, 0, 0)
}

use crate::pmap::VirtAddr;

pub(crate) unsafe fn memset(va: VirtAddr, c: u8, n: usize) {
    core::ptr::write_bytes(va.as_mut_ptr::<u8>(), c, n);
}

pub(crate) unsafe fn memcpy(dest: VirtAddr, src: VirtAddr, n: usize) {
    core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dest.as_mut_ptr::<u8>(), n);
}

#[cfg(target_os = "none")]
pub(crate) unsafe fn memmove(dest: VirtAddr, src: VirtAddr, n: usize) {
    core::ptr::copy(src.as_ptr::<u8>(), dest.as_mut_ptr::<u8>(), n);
}

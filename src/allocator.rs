// Kernel heap, carved out of the KHEAPBASE window mapped by mem_init.
// Host builds use the host allocator instead; the bare-metal image is
// the only place this global allocator exists.

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hand the heap its backing window. Must be called exactly once,
/// after the window is mapped and before the first allocation.
#[cfg(target_os = "none")]
pub(crate) unsafe fn heap_init(base: usize, size: usize) {
    HEAP.lock().init(base as *mut u8, size);
}

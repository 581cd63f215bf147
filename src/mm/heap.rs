// rCore buddy system allocator
use buddy_system_allocator::LockedHeap;

use crate::arch::PAGE_SIZE;

/// Minimum heap carved out between the kernel image and the page pool.
pub const HEAP_INIT_MIN: usize = 1024 * PAGE_SIZE;

#[cfg_attr(not(test), global_allocator)]
pub static HEAP_ALLOCATOR: LockedHeap<32> = LockedHeap::empty();

pub fn heap_init(base: usize, size: usize) {
    assert!(size >= HEAP_INIT_MIN);
    unsafe {
        HEAP_ALLOCATOR.lock().init(base, size);
    }
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("alloc_error_handler: heap exhausted allocating {:?}", layout);
}

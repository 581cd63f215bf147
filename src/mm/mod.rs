pub mod heap;
mod page_pool;
mod vmspace;

pub use page_pool::{
    alloc_page, alloc_pages, alloc_zeroed_page, free_page, free_page_count, free_pages,
};
pub use vmspace::{
    alloc_and_map_range, clone_active_mspace, discard_active_mspace, handle_umode_page_fault,
    main_mspace, map_page, map_range, reset_active_mspace, set_range_flags, switch_mspace,
    unmap_and_free_range, validate_vptr, validate_vstr, PteFlags, UMEM_END_VMA, UMEM_START_VMA,
};

/// Bring up the heap, the physical page pool and the boot address space.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    vmspace::memory_init();
}

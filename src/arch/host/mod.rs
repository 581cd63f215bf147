//! Host-side arch backend. Provides the same surface as the riscv64 module
//! with inert interrupt and MMU plumbing so the allocator, cache, filesystem
//! and I/O logic can run under `cargo test`. Nothing here ever context
//! switches or enters user mode.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::arch::{ArchTrait, ContextFrame, ThreadContext};

pub struct Arch;

static INT_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME: AtomicU64 = AtomicU64::new(0);
static PAGE_TABLE: AtomicUsize = AtomicUsize::new(0);

impl ArchTrait for Arch {
    fn exception_init() {}

    fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    fn nop() {}

    fn install_page_table(tag: usize) {
        PAGE_TABLE.store(tag, Ordering::Relaxed);
    }

    fn active_page_table() -> usize {
        PAGE_TABLE.load(Ordering::Relaxed)
    }

    fn invalidate_tlb_all() {}

    fn invalidate_tlb_page(_va: usize) {}

    fn interrupt_disable() -> bool {
        INT_ENABLED.swap(false, Ordering::Relaxed)
    }

    fn interrupt_restore(was_enabled: bool) {
        if was_enabled {
            INT_ENABLED.store(true, Ordering::Relaxed);
        }
    }

    fn interrupt_enable() {
        INT_ENABLED.store(true, Ordering::Relaxed);
    }

    fn timer_counter() -> u64 {
        TIME.fetch_add(1, Ordering::Relaxed)
    }

    fn timer_set_compare(_tval: u64) {}

    fn timer_irq_enable(_en: bool) {}

    fn external_irq_enable(_en: bool) {}

    fn enable_user_access() {}

    fn set_trap_stack_anchor(_anchor: usize) {}
}

pub unsafe fn thread_context_switch(_old: *mut ThreadContext, _new: *mut ThreadContext) {
    unimplemented!("context switch is target-only");
}

pub fn thread_startup_pc() -> usize {
    0
}

pub fn global_pointer() -> usize {
    0
}

pub fn boot_stack_top() -> usize {
    #[repr(align(4096))]
    struct BootStack([u8; 2 * crate::arch::PAGE_SIZE]);
    static BOOT_STACK: BootStack = BootStack([0; 2 * crate::arch::PAGE_SIZE]);
    BOOT_STACK.0.as_ptr() as usize + BOOT_STACK.0.len()
}

pub unsafe fn trap_frame_restore(_ctx: *mut ContextFrame) -> ! {
    unimplemented!("user mode is target-only");
}

pub fn halt_success() -> ! {
    panic!("halt");
}

pub fn halt_failure(code: u16) -> ! {
    panic!("halt with code {}", code);
}

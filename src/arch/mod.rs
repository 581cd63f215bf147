mod context_frame;
mod traits;

pub use context_frame::{ContextFrame, ThreadContext};
pub use traits::*;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();
pub const PTE_PER_PAGE: usize = PAGE_SIZE / WORD_SIZE;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub use riscv64::*;
    } else {
        // Inert backend so the core logic can be unit-tested on the host.
        mod host;
        pub use host::*;
    }
}

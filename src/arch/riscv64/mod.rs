mod exception;
mod interface;
mod start;
mod switch;

pub use exception::trap_frame_restore;
pub use interface::{boot_stack_top, global_pointer, halt_failure, halt_success, Arch};
pub use switch::{thread_context_switch, thread_startup_pc};

pub mod alarm;
pub mod elf;
pub mod error;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod thread;

pub use alarm::{interrupter_init, timer_init, timer_isr, Alarm};
pub use error::{KernelError, KernelResult};
pub use process::{current_process, process_exec, process_exit, process_fork, process_init};
pub use syscall::syscall_handler;
pub use thread::{
    current_tid, thread_exit, thread_init, thread_join, thread_spawn, thread_yield,
};

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), feature(alloc_error_handler))]
#![cfg_attr(test, allow(dead_code, unused_imports))]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate memoffset;
#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate bitflags;

#[macro_use]
mod macros;

mod arch;
mod banner;
mod board;
mod device;
mod driver;
mod fs;
mod io;
mod kernel;
mod mm;
mod panic;
mod util;

use arch::{Arch, ArchTrait};

#[cfg(target_arch = "riscv64")]
#[no_mangle]
pub extern "C" fn rust_main(hartid: usize) -> ! {
    init(hartid)
}

#[cfg(target_arch = "riscv64")]
pub fn init(hartid: usize) -> ! {
    banner::init();
    util::logger::logger_init().unwrap();
    info!("Welcome to {} on hart {}!", env!("CARGO_PKG_NAME"), hartid);
    info!("Built At {}", env!("BUILD_TIME"));

    mm::init();
    Arch::exception_init();
    kernel::thread_init();
    kernel::timer_init();
    driver::init();
    kernel::process_init();
    kernel::interrupter_init();
    Arch::interrupt_enable();

    match driver::virtio::primary() {
        Some(blk) => match fs::ktfs::mount_or_format(blk) {
            Ok(()) => run_init_program(),
            Err(err) => error!("ktfs: mount failed: {}", err),
        },
        None => warn!("no block device, running without a filesystem"),
    }

    info!("nothing left to run, idling");
    loop {
        kernel::thread_yield();
        Arch::wait_for_interrupt();
    }
}

#[cfg(target_arch = "riscv64")]
fn run_init_program() {
    use alloc::string::String;

    match fs::ktfs::fs_open("init") {
        Ok(exe) => {
            info!("starting init");
            let argv = [String::from("init")];
            if let Err(err) = kernel::process_exec(exe, &argv) {
                error!("exec of init failed: {}", err);
            }
        }
        Err(kernel::KernelError::NotFound) => info!("no init program on the volume"),
        Err(err) => error!("opening init failed: {}", err),
    }
}

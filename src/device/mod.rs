//! Device registry: name + instance number to an open constructor. Drivers
//! register at boot; the DEVOPEN syscall resolves through here.

use alloc::vec::Vec;

use spin::Mutex;

use crate::io::IoRef;
use crate::kernel::{KernelError, KernelResult};

pub const NDEV: usize = 16;

pub type DeviceOpenFn = fn(instance: usize) -> KernelResult<IoRef>;

struct DeviceEntry {
    name: &'static str,
    instance: usize,
    open: DeviceOpenFn,
}

static DEVTAB: Mutex<Vec<DeviceEntry>> = Mutex::new(Vec::new());

/// Register a device. Double registration of a (name, instance) pair is a
/// driver bug.
pub fn register_device(name: &'static str, instance: usize, open: DeviceOpenFn) {
    let mut devtab = DEVTAB.lock();
    if devtab.len() >= NDEV {
        panic!("register_device: table full registering {}{}", name, instance);
    }
    if devtab
        .iter()
        .any(|dev| dev.name == name && dev.instance == instance)
    {
        panic!("register_device: duplicate {}{}", name, instance);
    }
    debug!("register_device: {}{}", name, instance);
    devtab.push(DeviceEntry {
        name,
        instance,
        open,
    });
}

pub fn open_device(name: &str, instance: usize) -> KernelResult<IoRef> {
    let open = {
        let devtab = DEVTAB.lock();
        devtab
            .iter()
            .find(|dev| dev.name == name && dev.instance == instance)
            .map(|dev| dev.open)
            .ok_or(KernelError::NotFound)?
    };
    open(instance)
}

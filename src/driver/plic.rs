//! PLIC, S-mode context of hart 0: priorities, enables, threshold and the
//! claim/complete cycle.

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::ReadWrite;

use crate::board::PLAT_DESC;

// context 1 is hart 0 S-mode on the qemu virt layout
const CONTEXT: usize = 1;

const ENABLE_BASE: usize = 0x2000;
const ENABLE_STRIDE: usize = 0x80;
const CONTEXT_BASE: usize = 0x20_0000;
const CONTEXT_STRIDE: usize = 0x1000;

register_structs! {
    /// One word of priority per interrupt source.
    PriorityRegisters {
        (0x0000 => priority: [ReadWrite<u32>; 1024]),
        (0x1000 => @END),
    }
}

register_structs! {
    /// One context's enable bits, one bit per source.
    EnableRegisters {
        (0x00 => enable: [ReadWrite<u32>; 32]),
        (0x80 => @END),
    }
}

register_structs! {
    /// One context's threshold and claim/complete window.
    ContextRegisters {
        (0x00 => threshold: ReadWrite<u32>),
        (0x04 => claim: ReadWrite<u32>),
        (0x08 => @END),
    }
}

fn priorities() -> &'static PriorityRegisters {
    unsafe { &*(PLAT_DESC.plic_base as *const PriorityRegisters) }
}

fn enables() -> &'static EnableRegisters {
    let base = PLAT_DESC.plic_base + ENABLE_BASE + CONTEXT * ENABLE_STRIDE;
    unsafe { &*(base as *const EnableRegisters) }
}

fn context() -> &'static ContextRegisters {
    let base = PLAT_DESC.plic_base + CONTEXT_BASE + CONTEXT * CONTEXT_STRIDE;
    unsafe { &*(base as *const ContextRegisters) }
}

pub fn init() {
    // accept every priority
    context().threshold.set(0);
}

pub fn enable_irq(irq: usize) {
    priorities().priority[irq].set(1);
    let word = &enables().enable[irq / 32];
    word.set(word.get() | 1 << (irq % 32));
}

pub fn claim() -> u32 {
    context().claim.get()
}

pub fn complete(irq: u32) {
    context().claim.set(irq);
}

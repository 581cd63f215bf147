pub mod console;
pub mod plic;
pub mod rtc;
pub mod uart;
pub mod virtio;

use crate::arch::{Arch, ArchTrait};

pub type IrqHandler = fn();

const NIRQ: usize = 64;

static mut ISR_TABLE: [Option<IrqHandler>; NIRQ] = [None; NIRQ];

/// Claim a PLIC source for `handler` and enable it. Registration happens at
/// boot, before external interrupts are turned on.
pub fn register_isr(irq: usize, handler: IrqHandler) {
    assert!(irq > 0 && irq < NIRQ, "register_isr: bad irq {}", irq);
    let prev = Arch::interrupt_disable();
    unsafe {
        let table = &mut *core::ptr::addr_of_mut!(ISR_TABLE);
        assert!(table[irq].is_none(), "register_isr: irq {} taken", irq);
        table[irq] = Some(handler);
    }
    Arch::interrupt_restore(prev);
    plic::enable_irq(irq);
}

/// Supervisor external-interrupt entry: claim, dispatch, complete.
pub fn external_isr() {
    loop {
        let irq = plic::claim();
        if irq == 0 {
            break;
        }
        let handler = if (irq as usize) < NIRQ {
            unsafe { (*core::ptr::addr_of!(ISR_TABLE))[irq as usize] }
        } else {
            None
        };
        match handler {
            Some(handler) => handler(),
            None => warn!("external_isr: spurious irq {}", irq),
        }
        plic::complete(irq);
    }
}

/// Bring up the interrupt fabric and every platform device.
pub fn init() {
    plic::init();
    uart::init();
    rtc::init();
    virtio::init();
    Arch::external_irq_enable(true);
}

//! NS8250 serial port as a blocking character device. Software rings on
//! both sides: the ISR fills the receive ring and drains the transmit ring
//! under the trap's interrupts-off window, threads block on the paired
//! conditions.

use alloc::sync::Arc;
use core::cell::UnsafeCell;

use spin::Once;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

use crate::arch::{Arch, ArchTrait};
use crate::board::PLAT_DESC;
use crate::io::{Io, IoRef};
use crate::kernel::sync::{Condition, Lock};
use crate::kernel::KernelResult;

register_bitfields![u8,
    IER [
        ERBFI OFFSET(0) NUMBITS(1) [],
        ETBEI OFFSET(1) NUMBITS(1) []
    ],
    FCR [
        ENABLE OFFSET(0) NUMBITS(1) []
    ],
    LCR [
        WLS OFFSET(0) NUMBITS(2) [
            Bits8 = 0b11
        ]
    ],
    LSR [
        DR OFFSET(0) NUMBITS(1) [],
        THRE OFFSET(5) NUMBITS(1) []
    ]
];

#[repr(C)]
struct Ns8250Registers {
    rbr_thr: ReadWrite<u8>,
    ier: ReadWrite<u8, IER::Register>,
    isr_fcr: ReadWrite<u8, FCR::Register>,
    lcr: ReadWrite<u8, LCR::Register>,
    mcr: ReadWrite<u8>,
    lsr: ReadOnly<u8, LSR::Register>,
    msr: ReadOnly<u8>,
    scr: ReadWrite<u8>,
}

const RING_SIZE: usize = 64;

struct ByteRing {
    buf: [u8; RING_SIZE],
    head: usize,
    count: usize,
}

impl ByteRing {
    const fn new() -> Self {
        ByteRing {
            buf: [0; RING_SIZE],
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.count == RING_SIZE {
            return false;
        }
        self.buf[(self.head + self.count) % RING_SIZE] = byte;
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % RING_SIZE;
        self.count -= 1;
        Some(byte)
    }
}

struct UartState {
    rx: ByteRing,
    tx: ByteRing,
}

pub struct Uart {
    base: usize,
    /// Serializes readers and writers; the rings themselves are shared with
    /// the ISR under interrupts-off.
    read_lock: Lock,
    write_lock: Lock,
    state: UnsafeCell<UartState>,
    can_rx: Condition,
    can_tx: Condition,
}

unsafe impl Send for Uart {}
unsafe impl Sync for Uart {}

impl Uart {
    fn regs(&self) -> &Ns8250Registers {
        unsafe { &*(self.base as *const Ns8250Registers) }
    }

    fn state(&self) -> &mut UartState {
        // interrupts-off only
        unsafe { &mut *self.state.get() }
    }

    fn new(base: usize) -> Self {
        Uart {
            base,
            read_lock: Lock::new("uart.read"),
            write_lock: Lock::new("uart.write"),
            state: UnsafeCell::new(UartState {
                rx: ByteRing::new(),
                tx: ByteRing::new(),
            }),
            can_rx: Condition::new("uart.can_rx"),
            can_tx: Condition::new("uart.can_tx"),
        }
    }

    fn hw_init(&self) {
        let regs = self.regs();
        regs.lcr.write(LCR::WLS::Bits8);
        regs.isr_fcr.write(FCR::ENABLE::SET);
        regs.ier.write(IER::ERBFI::SET);
    }

    /// Return at least one byte, blocking while the receive ring is empty.
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_lock.acquire();
        let prev = Arch::interrupt_disable();
        while self.state().rx.count == 0 {
            self.can_rx.wait_raw();
        }
        let mut n = 0;
        while n < buf.len() {
            match self.state().rx.pop() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Arch::interrupt_restore(prev);
        self.read_lock.release();
        Ok(n)
    }

    /// Transfer every byte, blocking while the transmit ring is full.
    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        self.write_lock.acquire();
        for &byte in buf {
            let prev = Arch::interrupt_disable();
            while !self.state().tx.push(byte) {
                self.can_tx.wait_raw();
            }
            // kick the transmitter; the ISR keeps it fed from the ring and
            // drops ETBEI once it drains
            self.regs().ier.write(IER::ERBFI::SET + IER::ETBEI::SET);
            Arch::interrupt_restore(prev);
        }
        self.write_lock.release();
        Ok(buf.len())
    }

    /// Runs inside the trap's interrupts-off window.
    fn isr(&self) {
        let regs = self.regs();
        let state = self.state();
        let mut got_rx = false;
        while regs.lsr.is_set(LSR::DR) {
            let byte = regs.rbr_thr.get();
            // overflow drops the byte
            state.rx.push(byte);
            got_rx = true;
        }
        if got_rx {
            self.can_rx.broadcast();
        }
        if regs.lsr.is_set(LSR::THRE) {
            match state.tx.pop() {
                Some(byte) => regs.rbr_thr.set(byte),
                None => regs.ier.write(IER::ERBFI::SET),
            }
            self.can_tx.broadcast();
        }
    }
}

#[derive(Debug)]
struct UartIo;

impl Io for UartIo {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        uart0().read(buf)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        uart0().write(buf)
    }
}

static UART0: Once<Uart> = Once::new();

fn uart0() -> &'static Uart {
    UART0.get().expect("uart: not initialized")
}

fn uart0_isr() {
    uart0().isr();
}

fn open_uart(_instance: usize) -> KernelResult<IoRef> {
    Ok(Arc::new(UartIo))
}

pub fn init() {
    let uart = UART0.call_once(|| Uart::new(PLAT_DESC.uart_desc.base));
    uart.hw_init();
    crate::driver::register_isr(PLAT_DESC.uart_desc.irq, uart0_isr);
    crate::device::register_device("ser", 0, open_uart);
}

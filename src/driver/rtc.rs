//! Goldfish RTC: a nanosecond wall clock behind two 32-bit MMIO words.
//! Reading the low word latches the high word.

use alloc::sync::Arc;

use tock_registers::interfaces::Readable;
use tock_registers::registers::ReadOnly;

use crate::board::PLAT_DESC;
use crate::io::{Io, IoRef};
use crate::kernel::KernelResult;

#[repr(C)]
struct GoldfishRtcRegisters {
    time_low: ReadOnly<u32>,
    time_high: ReadOnly<u32>,
}

fn regs() -> &'static GoldfishRtcRegisters {
    unsafe { &*(PLAT_DESC.rtc_desc.base as *const GoldfishRtcRegisters) }
}

pub fn read_time_ns() -> u64 {
    let low = regs().time_low.get() as u64;
    let high = regs().time_high.get() as u64;
    high << 32 | low
}

#[derive(Debug)]
struct RtcIo;

impl Io for RtcIo {
    /// The device produces the current time as 8 little-endian bytes.
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let stamp = read_time_ns().to_le_bytes();
        let n = buf.len().min(stamp.len());
        buf[..n].copy_from_slice(&stamp[..n]);
        Ok(n)
    }

    fn readat(&self, _pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.read(buf)
    }
}

fn open_rtc(_instance: usize) -> KernelResult<IoRef> {
    Ok(Arc::new(RtcIo))
}

pub fn init() {
    crate::device::register_device("rtc", 0, open_rtc);
}

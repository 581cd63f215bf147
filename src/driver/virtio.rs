//! Legacy VirtIO-MMIO block devices. One 8-entry virtqueue per device and
//! one request in flight at a time under the device lock: a three-part
//! descriptor chain (header, 512-byte payload, status byte), published with
//! the required fences, completion signalled from the used-ring ISR.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, Ordering};

use spin::Once;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use crate::arch::{Arch, ArchTrait, PAGE_SIZE};
use crate::board::PLAT_DESC;
use crate::io::{Io, IoCtl, IoRef};
use crate::kernel::sync::{Condition, Lock};
use crate::kernel::{KernelError, KernelResult};
use crate::mm::alloc_pages;

pub const SECTOR_SIZE: usize = 512;
const QUEUE_SIZE: usize = 8;

register_structs! {
    /// Legacy (version 1) VirtIO-MMIO window.
    VirtioMmioRegisters {
        (0x000 => magic: ReadOnly<u32>),
        (0x004 => version: ReadOnly<u32>),
        (0x008 => device_id: ReadOnly<u32>),
        (0x00c => vendor_id: ReadOnly<u32>),
        (0x010 => device_features: ReadOnly<u32>),
        (0x014 => device_features_sel: WriteOnly<u32>),
        (0x018 => _reserved0),
        (0x020 => driver_features: WriteOnly<u32>),
        (0x024 => driver_features_sel: WriteOnly<u32>),
        (0x028 => guest_page_size: WriteOnly<u32>),
        (0x02c => _reserved1),
        (0x030 => queue_sel: WriteOnly<u32>),
        (0x034 => queue_num_max: ReadOnly<u32>),
        (0x038 => queue_num: WriteOnly<u32>),
        (0x03c => queue_align: WriteOnly<u32>),
        (0x040 => queue_pfn: ReadWrite<u32>),
        (0x044 => _reserved2),
        (0x050 => queue_notify: WriteOnly<u32>),
        (0x054 => _reserved3),
        (0x060 => interrupt_status: ReadOnly<u32>),
        (0x064 => interrupt_ack: WriteOnly<u32>),
        (0x068 => _reserved4),
        (0x070 => status: ReadWrite<u32>),
        (0x074 => _reserved5),
        (0x100 => config: [ReadOnly<u32>; 2]),
        (0x108 => @END),
    }
}

const VIRTIO_MAGIC: u32 = 0x7472_6976;
const VIRTIO_VERSION_LEGACY: u32 = 1;
const VIRTIO_DEVICE_BLOCK: u32 = 2;

const STATUS_ACKNOWLEDGE: u32 = 1;
const STATUS_DRIVER: u32 = 2;
const STATUS_DRIVER_OK: u32 = 4;

const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;

const BLK_T_IN: u32 = 0;
const BLK_T_OUT: u32 = 1;
const BLK_S_OK: u8 = 0;

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

/// Ring indices are shared with the device, so they live in register cells;
/// the descriptor and ring bodies are published by the fences around the
/// index updates.
#[repr(C)]
struct VirtqAvail {
    flags: u16,
    idx: ReadWrite<u16>,
    ring: [u16; QUEUE_SIZE],
    used_event: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    flags: u16,
    idx: ReadOnly<u16>,
    ring: [VirtqUsedElem; QUEUE_SIZE],
}

#[repr(C)]
struct BlkReqHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

struct QueueMemory {
    desc: *mut VirtqDesc,
    avail: *mut VirtqAvail,
    used: *mut VirtqUsed,
    avail_idx: u16,
}

#[derive(Debug)]
pub struct VirtioBlk {
    base: usize,
    lock: Lock,
    queue: UnsafeCell<QueueMemory>,
    request_done: Condition,
    capacity_bytes: u64,
}

unsafe impl Send for VirtioBlk {}
unsafe impl Sync for VirtioBlk {}

impl VirtioBlk {
    fn probe(base: usize) -> KernelResult<Option<VirtioBlk>> {
        let regs = unsafe { &*(base as *const VirtioMmioRegisters) };
        if regs.magic.get() != VIRTIO_MAGIC || regs.device_id.get() != VIRTIO_DEVICE_BLOCK {
            return Ok(None);
        }
        if regs.version.get() != VIRTIO_VERSION_LEGACY {
            warn!("virtio: block device at {:#x} is not legacy, skipped", base);
            return Ok(None);
        }

        regs.status.set(0);
        regs.status.set(STATUS_ACKNOWLEDGE);
        regs.status.set(STATUS_ACKNOWLEDGE | STATUS_DRIVER);

        let _features = regs.device_features.get();
        regs.driver_features.set(0);
        regs.guest_page_size.set(PAGE_SIZE as u32);

        regs.queue_sel.set(0);
        if (regs.queue_num_max.get() as usize) < QUEUE_SIZE {
            return Err(KernelError::Io);
        }
        regs.queue_num.set(QUEUE_SIZE as u32);
        regs.queue_align.set(PAGE_SIZE as u32);

        // legacy queue layout: descriptors + avail in the first page, used
        // ring on the second
        let queue_pa = alloc_pages(2)?;
        unsafe {
            core::ptr::write_bytes(queue_pa as *mut u8, 0, 2 * PAGE_SIZE);
        }
        regs.queue_pfn.set((queue_pa / PAGE_SIZE) as u32);

        regs.status
            .set(STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_DRIVER_OK);

        // config space: capacity in 512-byte sectors
        let cap_low = regs.config[0].get() as u64;
        let cap_high = regs.config[1].get() as u64;
        let capacity_bytes = (cap_high << 32 | cap_low) * SECTOR_SIZE as u64;

        Ok(Some(VirtioBlk {
            base,
            lock: Lock::new("virtio.blk"),
            queue: UnsafeCell::new(QueueMemory {
                desc: queue_pa as *mut VirtqDesc,
                avail: (queue_pa + QUEUE_SIZE * core::mem::size_of::<VirtqDesc>())
                    as *mut VirtqAvail,
                used: (queue_pa + PAGE_SIZE) as *mut VirtqUsed,
                avail_idx: 0,
            }),
            request_done: Condition::new("virtio.request_done"),
            capacity_bytes,
        }))
    }

    fn regs(&self) -> &'static VirtioMmioRegisters {
        unsafe { &*(self.base as *const VirtioMmioRegisters) }
    }

    fn queue(&self) -> &mut QueueMemory {
        // guarded by self.lock / interrupts-off
        unsafe { &mut *self.queue.get() }
    }

    /// Run one 512-byte transfer and wait for the used ring to report it.
    fn transfer(&self, sector: u64, buf: *mut u8, device_writes: bool) -> KernelResult {
        let header = BlkReqHeader {
            req_type: if device_writes { BLK_T_IN } else { BLK_T_OUT },
            reserved: 0,
            sector,
        };
        let mut status: u8 = 0xff;

        self.lock.acquire();
        let queue = self.queue();
        unsafe {
            let desc = queue.desc;
            (*desc.add(0)) = VirtqDesc {
                addr: &header as *const _ as u64,
                len: core::mem::size_of::<BlkReqHeader>() as u32,
                flags: DESC_F_NEXT,
                next: 1,
            };
            (*desc.add(1)) = VirtqDesc {
                addr: buf as u64,
                len: SECTOR_SIZE as u32,
                flags: DESC_F_NEXT | if device_writes { DESC_F_WRITE } else { 0 },
                next: 2,
            };
            (*desc.add(2)) = VirtqDesc {
                addr: &mut status as *mut _ as u64,
                len: 1,
                flags: DESC_F_WRITE,
                next: 0,
            };

            let avail = queue.avail;
            (*avail).ring[queue.avail_idx as usize % QUEUE_SIZE] = 0;
            // descriptors must be visible before the index moves, the index
            // before the notify
            fence(Ordering::SeqCst);
            queue.avail_idx = queue.avail_idx.wrapping_add(1);
            (*avail).idx.set(queue.avail_idx);
            fence(Ordering::SeqCst);
            self.regs().queue_notify.set(0);

            let target = queue.avail_idx;
            let prev = Arch::interrupt_disable();
            while {
                fence(Ordering::SeqCst);
                (*queue.used).idx.get() != target
            } {
                self.request_done.wait_raw();
            }
            Arch::interrupt_restore(prev);
        }
        self.lock.release();

        // the device stored the status by DMA
        if unsafe { core::ptr::read_volatile(&status) } != BLK_S_OK {
            return Err(KernelError::Io);
        }
        Ok(())
    }

    fn isr(&self) {
        let regs = self.regs();
        regs.interrupt_ack.set(regs.interrupt_status.get());
        fence(Ordering::SeqCst);
        self.request_done.broadcast();
    }
}

impl Io for VirtioBlk {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if pos % SECTOR_SIZE as u64 != 0 || buf.len() % SECTOR_SIZE != 0 {
            return Err(KernelError::InvalidArg);
        }
        if pos + buf.len() as u64 > self.capacity_bytes {
            return Err(KernelError::InvalidArg);
        }
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.transfer(
                pos / SECTOR_SIZE as u64 + i as u64,
                chunk.as_mut_ptr(),
                true,
            )?;
        }
        Ok(buf.len())
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        if pos % SECTOR_SIZE as u64 != 0 || buf.len() % SECTOR_SIZE != 0 {
            return Err(KernelError::InvalidArg);
        }
        if pos + buf.len() as u64 > self.capacity_bytes {
            return Err(KernelError::InvalidArg);
        }
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.transfer(
                pos / SECTOR_SIZE as u64 + i as u64,
                chunk.as_ptr() as *mut u8,
                false,
            )?;
        }
        Ok(buf.len())
    }

    fn cntl(&self, cmd: IoCtl) -> KernelResult<u64> {
        match cmd {
            IoCtl::GetBlkSz => Ok(SECTOR_SIZE as u64),
            IoCtl::GetEnd => Ok(self.capacity_bytes),
            _ => Err(KernelError::NotSupported),
        }
    }
}

static BLK_DEVICES: Once<Vec<Arc<VirtioBlk>>> = Once::new();

fn blk_isr() {
    if let Some(devices) = BLK_DEVICES.get() {
        for dev in devices {
            dev.isr();
        }
    }
}

fn open_blk(instance: usize) -> KernelResult<IoRef> {
    let devices = BLK_DEVICES.get().ok_or(KernelError::NotFound)?;
    let dev = devices.get(instance).ok_or(KernelError::NotFound)?;
    Ok(dev.clone())
}

/// The first probed block device, for mounting the root filesystem.
pub fn primary() -> Option<IoRef> {
    let devices = BLK_DEVICES.get()?;
    let dev: IoRef = devices.first()?.clone();
    Some(dev)
}

pub fn init() {
    let mut devices = Vec::new();
    for slot in PLAT_DESC.virtio_desc {
        match VirtioBlk::probe(slot.base) {
            Ok(Some(dev)) => {
                info!(
                    "virtio: block device {} at {:#x}, {} MiB",
                    devices.len(),
                    slot.base,
                    dev.capacity_bytes >> 20
                );
                crate::driver::register_isr(slot.irq, blk_isr);
                crate::device::register_device("blk", devices.len(), open_blk);
                devices.push(Arc::new(dev));
            }
            Ok(None) => {}
            Err(err) => warn!("virtio: probe at {:#x} failed: {}", slot.base, err),
        }
    }
    BLK_DEVICES.call_once(|| devices);
}

//! QEMU `virt` machine description. Single hart in S-mode under an SBI
//! firmware: the kernel image sits at 0x8020_0000, above the 2 MiB firmware
//! hole at 0x8000_0000, and owns the 126 MiB of DRAM from there up. The
//! MMIO identity window lies below the hole.

pub const RAM_START: usize = 0x8020_0000;
pub const RAM_SIZE: usize = 0x7e0_0000;
pub const RAM_END: usize = RAM_START + RAM_SIZE;

pub struct PlatMemoryConfig {
    pub base: usize,
    pub size: usize,
}

pub struct PlatMmioDesc {
    pub base: usize,
    pub irq: usize,
}

pub struct PlatformConfig {
    pub mem_desc: PlatMemoryConfig,
    pub uart_desc: PlatMmioDesc,
    pub rtc_desc: PlatMmioDesc,
    pub virtio_desc: &'static [PlatMmioDesc],
    pub plic_base: usize,
    pub timebase_freq: usize,
}

pub static PLAT_DESC: PlatformConfig = PlatformConfig {
    mem_desc: PlatMemoryConfig {
        base: RAM_START,
        size: RAM_SIZE,
    },
    uart_desc: PlatMmioDesc {
        base: 0x1000_0000,
        irq: 10,
    },
    rtc_desc: PlatMmioDesc {
        base: 0x10_1000,
        irq: 11,
    },
    virtio_desc: &[
        PlatMmioDesc {
            base: 0x1000_1000,
            irq: 1,
        },
        PlatMmioDesc {
            base: 0x1000_2000,
            irq: 2,
        },
        PlatMmioDesc {
            base: 0x1000_3000,
            irq: 3,
        },
        PlatMmioDesc {
            base: 0x1000_4000,
            irq: 4,
        },
        PlatMmioDesc {
            base: 0x1000_5000,
            irq: 5,
        },
        PlatMmioDesc {
            base: 0x1000_6000,
            irq: 6,
        },
        PlatMmioDesc {
            base: 0x1000_7000,
            irq: 7,
        },
        PlatMmioDesc {
            base: 0x1000_8000,
            irq: 8,
        },
    ],
    plic_base: 0x0c00_0000,
    timebase_freq: 10_000_000,
};

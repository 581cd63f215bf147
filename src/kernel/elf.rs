//! ELF64 loader for user executables: little-endian RISC-V `ET_EXEC`,
//! `PT_LOAD` segments only, confined to the user window. Segments load under
//! R/W/U and are tightened to their program-header flags afterwards.

use crate::io::{Io, IoRef};
use crate::kernel::{KernelError, KernelResult};
use crate::mm::{alloc_and_map_range, set_range_flags, PteFlags, UMEM_END_VMA, UMEM_START_VMA};
use crate::util::{round_down, round_up};

const EI_NIDENT: usize = 16;

const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const PAGE_SIZE: usize = crate::arch::PAGE_SIZE;

#[repr(C)]
#[derive(Clone, Copy)]
struct Ehdr {
    ident: [u8; EI_NIDENT],
    etype: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Phdr {
    ptype: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

fn read_struct<T: Copy>(io: &IoRef, pos: u64) -> KernelResult<T> {
    let mut raw = [0u8; 128];
    let size = core::mem::size_of::<T>();
    assert!(size <= raw.len());
    let got = io.readat(pos, &mut raw[..size])?;
    if got != size {
        return Err(KernelError::BadFormat);
    }
    Ok(unsafe { (raw.as_ptr() as *const T).read_unaligned() })
}

fn read_ehdr(io: &IoRef) -> KernelResult<Ehdr> {
    let ehdr: Ehdr = read_struct(io, 0)?;
    if ehdr.ident[..4] != ELFMAG
        || ehdr.ident[4] != ELFCLASS64
        || ehdr.ident[5] != ELFDATA2LSB
        || ehdr.ident[6] != EV_CURRENT
        || ehdr.etype != ET_EXEC
        || ehdr.machine != EM_RISCV
        || ehdr.version != EV_CURRENT as u32
        || ehdr.phentsize as usize != core::mem::size_of::<Phdr>()
    {
        return Err(KernelError::BadFormat);
    }
    Ok(ehdr)
}

/// Header sanity check without touching the address space; exec runs it
/// before tearing the old image down.
pub fn elf_precheck(io: &IoRef) -> KernelResult {
    read_ehdr(io).map(|_| ())
}

/// Load every PT_LOAD segment into the active address space and return the
/// entry point.
pub fn elf_load(io: &IoRef) -> KernelResult<usize> {
    let ehdr = read_ehdr(io)?;

    for ph in 0..ehdr.phnum as u64 {
        let phdr: Phdr = read_struct(io, ehdr.phoff + ph * core::mem::size_of::<Phdr>() as u64)?;
        if phdr.ptype != PT_LOAD {
            continue;
        }
        if phdr.filesz > phdr.memsz
            || (phdr.vaddr as usize) < UMEM_START_VMA
            || phdr.vaddr.checked_add(phdr.memsz).is_none()
            || (phdr.vaddr + phdr.memsz) as usize > UMEM_END_VMA
        {
            return Err(KernelError::BadFormat);
        }

        let seg_start = round_down(phdr.vaddr as usize, PAGE_SIZE);
        let seg_size = round_up((phdr.vaddr + phdr.memsz) as usize, PAGE_SIZE) - seg_start;
        alloc_and_map_range(seg_start, seg_size, PteFlags::RW | PteFlags::USER)?;

        // file content lands directly in the fresh mapping; the BSS tail
        // stays zero from the page allocator
        let dst = unsafe {
            core::slice::from_raw_parts_mut(phdr.vaddr as *mut u8, phdr.filesz as usize)
        };
        let mut done = 0;
        while done < dst.len() {
            let got = io.readat(phdr.offset + done as u64, &mut dst[done..])?;
            if got == 0 {
                return Err(KernelError::BadFormat);
            }
            done += got;
        }

        let mut flags = PteFlags::USER;
        if phdr.flags & PF_R != 0 {
            flags |= PteFlags::READ;
        }
        if phdr.flags & PF_W != 0 {
            flags |= PteFlags::WRITE;
        }
        if phdr.flags & PF_X != 0 {
            flags |= PteFlags::EXEC;
        }
        set_range_flags(seg_start, seg_size, flags)?;
    }

    let entry = ehdr.entry as usize;
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&entry) {
        return Err(KernelError::BadFormat);
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemIo;
    use alloc::sync::Arc;
    use alloc::vec;

    fn minimal_header() -> vec::Vec<u8> {
        let mut ident = [0u8; EI_NIDENT];
        ident[..4].copy_from_slice(&ELFMAG);
        ident[4] = ELFCLASS64;
        ident[5] = ELFDATA2LSB;
        ident[6] = EV_CURRENT;
        let ehdr = Ehdr {
            ident,
            etype: ET_EXEC,
            machine: EM_RISCV,
            version: 1,
            entry: 0xc000_0000,
            phoff: 64,
            shoff: 0,
            flags: 0,
            ehsize: 64,
            phentsize: core::mem::size_of::<Phdr>() as u16,
            phnum: 0,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        };
        let mut raw = vec![0u8; 512];
        unsafe { (raw.as_mut_ptr() as *mut Ehdr).write_unaligned(ehdr) };
        raw
    }

    #[test]
    fn precheck_accepts_riscv_exec() {
        let io: IoRef = Arc::new(MemIo::from_bytes(minimal_header(), 1));
        elf_precheck(&io).unwrap();
    }

    #[test]
    fn precheck_rejects_wrong_machine() {
        let mut raw = minimal_header();
        raw[18] = 62; // EM_X86_64
        let io: IoRef = Arc::new(MemIo::from_bytes(raw, 1));
        assert_eq!(elf_precheck(&io).unwrap_err(), KernelError::BadFormat);
    }

    #[test]
    fn precheck_rejects_truncated_image() {
        let io: IoRef = Arc::new(MemIo::from_bytes(vec![0x7f; 8], 1));
        assert!(elf_precheck(&io).is_err());
    }
}

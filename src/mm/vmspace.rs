//! Sv39 address spaces: three-level page tables, the boot mapping, and the
//! per-process clone/reset/discard lifecycle. Kernel mappings are global and
//! identity-mapped, so table memory is always reachable through the physical
//! address.

use crate::arch::{Arch, ArchTrait, PAGE_SHIFT, PAGE_SIZE, PTE_PER_PAGE};
use crate::kernel::{KernelError, KernelResult};

use super::page_pool::{alloc_zeroed_page, free_page};

/// User memory window; the user stack occupies the topmost page.
pub const UMEM_START_VMA: usize = 0xc000_0000;
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

const SATP_MODE_SV39: usize = 8 << 60;
const SATP_PPN_MASK: usize = (1 << 44) - 1;

const PTE_PPN_SHIFT: usize = 10;
const VPN_MASK: usize = PTE_PER_PAGE - 1;

const LEVEL_TOP: usize = 2;

bitflags! {
    pub struct PteFlags: usize {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

impl PteFlags {
    pub const RW: Self = Self::from_bits_truncate(Self::READ.bits | Self::WRITE.bits);

    fn is_leaf(self) -> bool {
        self.intersects(PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC)
    }
}

/// One Sv39 page-table entry: `ppn << 10 | flags`. Either invalid, a leaf
/// (any of R/W/X), or a pointer to the next-level table (none of R/W/X).
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    pub const fn invalid() -> Self {
        Pte(0)
    }

    pub fn leaf(pa: usize, flags: PteFlags) -> Self {
        let flags = flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY;
        Pte((pa >> PAGE_SHIFT) << PTE_PPN_SHIFT | flags.bits())
    }

    pub fn table(pa: usize) -> Self {
        Pte((pa >> PAGE_SHIFT) << PTE_PPN_SHIFT | PteFlags::VALID.bits())
    }

    pub fn pa(self) -> usize {
        (self.0 >> PTE_PPN_SHIFT) << PAGE_SHIFT
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().is_leaf()
    }

    pub fn is_table(self) -> bool {
        self.is_valid() && !self.flags().is_leaf()
    }

    pub fn is_global(self) -> bool {
        self.flags().contains(PteFlags::GLOBAL)
    }

    fn set_flags(&mut self, flags: PteFlags) {
        let flags = flags | PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY;
        self.0 = (self.0 >> PTE_PPN_SHIFT) << PTE_PPN_SHIFT | flags.bits();
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pte")
            .field("pa", &self.pa())
            .field("flags", &self.flags())
            .finish()
    }
}

#[inline(always)]
fn vpn(va: usize, level: usize) -> usize {
    (va >> (PAGE_SHIFT + 9 * level)) & VPN_MASK
}

/// A virtual address is well formed when bits 63:38 are a sign extension.
pub fn vaddr_is_canonical(va: usize) -> bool {
    let upper = va >> 38;
    upper == 0 || upper == (1 << 26) - 1
}

unsafe fn table_at(pa: usize) -> &'static mut [Pte; PTE_PER_PAGE] {
    &mut *(pa as *mut [Pte; PTE_PER_PAGE])
}

fn tag_to_root(tag: usize) -> usize {
    (tag & SATP_PPN_MASK) << PAGE_SHIFT
}

fn root_to_tag(root: usize) -> usize {
    SATP_MODE_SV39 | root >> PAGE_SHIFT
}

static MAIN_MTAG: spin::Once<usize> = spin::Once::new();

pub fn main_mspace() -> usize {
    *MAIN_MTAG.get().expect("main_mspace: memory_init not done")
}

pub fn active_mspace() -> usize {
    Arch::active_page_table()
}

/// Install `tag` and return the previously active tag.
pub fn switch_mspace(tag: usize) -> usize {
    let old = Arch::active_page_table();
    if old != tag {
        Arch::install_page_table(tag);
    }
    old
}

fn active_root() -> usize {
    tag_to_root(Arch::active_page_table())
}

/// Walk to the level-0 entry for `va`, allocating intermediate tables when
/// `create` is set.
fn walk(root: usize, va: usize, create: bool) -> KernelResult<*mut Pte> {
    if !vaddr_is_canonical(va) {
        return Err(KernelError::InvalidArg);
    }
    let mut table_pa = root;
    for level in (1..=LEVEL_TOP).rev() {
        let entry = unsafe { &mut table_at(table_pa)[vpn(va, level)] };
        if entry.is_leaf() {
            // a mega/giga mapping shadows this range
            return Err(KernelError::Busy);
        }
        if !entry.is_valid() {
            if !create {
                return Err(KernelError::NotFound);
            }
            let page = alloc_zeroed_page()?;
            *entry = Pte::table(page);
        }
        table_pa = entry.pa();
    }
    Ok(unsafe { &mut table_at(table_pa)[vpn(va, 0)] })
}

fn map_page_at(root: usize, va: usize, pa: usize, flags: PteFlags) -> KernelResult {
    let pte = walk(root, va, true)?;
    unsafe {
        if (*pte).is_valid() {
            return Err(KernelError::Busy);
        }
        *pte = Pte::leaf(pa, flags);
    }
    Ok(())
}

fn unmap_range_at(root: usize, va: usize, size: usize, free_pages: bool) {
    let mut va = va & !(PAGE_SIZE - 1);
    let end = va + size;
    while va < end {
        if let Ok(pte) = walk(root, va, false) {
            let entry = unsafe { &mut *pte };
            if entry.is_leaf() && !entry.is_global() {
                if free_pages {
                    free_page(entry.pa());
                }
                *entry = Pte::invalid();
            }
        }
        va += PAGE_SIZE;
    }
}

/// Map one page in the active space. Fails with `Busy` when the leaf is
/// already valid.
pub fn map_page(va: usize, pa: usize, flags: PteFlags) -> KernelResult {
    map_page_at(active_root(), va, pa, flags)
}

/// `map_page` iterated over `[va, va+size)`; a partial failure unmaps what
/// was already placed before reporting.
#[allow(dead_code)]
pub fn map_range(va: usize, size: usize, pa: usize, flags: PteFlags) -> KernelResult {
    let root = active_root();
    let pages = crate::util::round_up(size, PAGE_SIZE) / PAGE_SIZE;
    for i in 0..pages {
        if let Err(err) = map_page_at(root, va + i * PAGE_SIZE, pa + i * PAGE_SIZE, flags) {
            unmap_range_at(root, va, i * PAGE_SIZE, false);
            return Err(err);
        }
    }
    Ok(())
}

/// Allocate fresh zeroed pages and map them over `[va, va+size)`; a partial
/// failure frees and unmaps what was already placed.
pub fn alloc_and_map_range(va: usize, size: usize, flags: PteFlags) -> KernelResult {
    let root = active_root();
    let pages = crate::util::round_up(size, PAGE_SIZE) / PAGE_SIZE;
    for i in 0..pages {
        let page = match alloc_zeroed_page() {
            Ok(page) => page,
            Err(err) => {
                unmap_range_at(root, va, i * PAGE_SIZE, true);
                return Err(err);
            }
        };
        if let Err(err) = map_page_at(root, va + i * PAGE_SIZE, page, flags) {
            free_page(page);
            unmap_range_at(root, va, i * PAGE_SIZE, true);
            return Err(err);
        }
    }
    Ok(())
}

/// Rewrite the leaf flags of every mapped page in the range; A, D and V stay
/// set.
pub fn set_range_flags(va: usize, size: usize, flags: PteFlags) -> KernelResult {
    let root = active_root();
    let pages = crate::util::round_up(size, PAGE_SIZE) / PAGE_SIZE;
    for i in 0..pages {
        let pte = walk(root, va + i * PAGE_SIZE, false)?;
        unsafe {
            if !(*pte).is_leaf() {
                return Err(KernelError::NotFound);
            }
            (*pte).set_flags(flags);
        }
    }
    Arch::invalidate_tlb_all();
    Ok(())
}

/// Unmap and free every valid non-global page in the range. Global and
/// higher-level leaves are left alone. Single hart, so a local fence is
/// enough; it must happen before the next user-mode entry.
#[allow(dead_code)]
pub fn unmap_and_free_range(va: usize, size: usize) {
    unmap_range_at(active_root(), va, size, true);
    Arch::invalidate_tlb_all();
}

fn clone_table(src_pa: usize, level: usize) -> usize {
    let dst_pa = alloc_zeroed_page().expect("clone_mspace: no page for table");
    let src = unsafe { table_at(src_pa) };
    let dst = unsafe { table_at(dst_pa) };
    for idx in 0..PTE_PER_PAGE {
        let entry = src[idx];
        if !entry.is_valid() {
            continue;
        }
        if entry.is_leaf() {
            if level > 0 || entry.is_global() {
                // kernel giga/mega mappings and globals are shared by
                // reference
                dst[idx] = entry;
            } else {
                let page = alloc_zeroed_page().expect("clone_mspace: no page for copy");
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        entry.pa() as *const u8,
                        page as *mut u8,
                        PAGE_SIZE,
                    );
                }
                dst[idx] = Pte::leaf(page, entry.flags());
            }
        } else {
            dst[idx] = Pte::table(clone_table(entry.pa(), level - 1));
        }
    }
    dst_pa
}

/// Deep-copy the active space: fresh interior tables at every level, user
/// pages materialized by copy, global and large leaves shared. Panics when
/// memory runs out mid-copy.
pub fn clone_active_mspace() -> usize {
    root_to_tag(clone_table(active_root(), LEVEL_TOP))
}

fn reset_table(table_pa: usize, level: usize) {
    let table = unsafe { table_at(table_pa) };
    for idx in 0..PTE_PER_PAGE {
        let entry = &mut table[idx];
        if !entry.is_valid() {
            continue;
        }
        if entry.is_leaf() {
            if level == 0 && !entry.is_global() {
                free_page(entry.pa());
                *entry = Pte::invalid();
            }
        } else {
            reset_table(entry.pa(), level - 1);
        }
    }
}

/// Free every non-global leaf page of the active space and clear its PTE.
pub fn reset_active_mspace() {
    reset_table(active_root(), LEVEL_TOP);
    Arch::invalidate_tlb_all();
}

fn free_space_tables(table_pa: usize, level: usize) {
    let table = unsafe { table_at(table_pa) };
    for idx in 0..PTE_PER_PAGE {
        let entry = table[idx];
        if level > 0 && entry.is_table() {
            free_space_tables(entry.pa(), level - 1);
        }
    }
    free_page(table_pa);
}

/// Reset the active space, switch back to the main space and release the
/// discarded space's table pages. Returns the main tag.
pub fn discard_active_mspace() -> usize {
    let main = main_mspace();
    let old = active_mspace();
    reset_active_mspace();
    switch_mspace(main);
    if old != main {
        free_space_tables(tag_to_root(old), LEVEL_TOP);
    }
    main
}

/// Lazy user-page allocator: a fault inside the user window materializes a
/// fresh zeroed R/W/U page.
pub fn handle_umode_page_fault(vma: usize) -> KernelResult {
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&vma) {
        return Err(KernelError::NoAccess);
    }
    let va = vma & !(PAGE_SIZE - 1);
    let page = alloc_zeroed_page()?;
    map_page(va, page, PteFlags::RW | PteFlags::USER).map_err(|err| {
        free_page(page);
        err
    })?;
    Arch::invalidate_tlb_page(va);
    Ok(())
}

/// Confirm that every page backing `[vp, vp+len)` carries at least `flags`.
pub fn validate_vptr(vp: usize, len: usize, flags: PteFlags) -> KernelResult {
    if len == 0 {
        return Ok(());
    }
    let end = vp.checked_add(len).ok_or(KernelError::InvalidArg)?;
    if vp == 0 || !vaddr_is_canonical(vp) || !vaddr_is_canonical(end - 1) {
        return Err(KernelError::InvalidArg);
    }
    let root = active_root();
    let mut va = vp & !(PAGE_SIZE - 1);
    while va < end {
        let pte = walk(root, va, false).map_err(|_| KernelError::InvalidArg)?;
        let entry = unsafe { *pte };
        if !entry.is_leaf() {
            return Err(KernelError::InvalidArg);
        }
        if !entry.flags().contains(flags) {
            return Err(KernelError::NoAccess);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Longest string a user pointer may name.
pub const VSTR_MAX: usize = 8192;

/// Validate a NUL-terminated user string and return its length (terminator
/// excluded).
pub fn validate_vstr(vp: usize, flags: PteFlags) -> KernelResult<usize> {
    if vp == 0 || !vaddr_is_canonical(vp) {
        return Err(KernelError::InvalidArg);
    }
    let root = active_root();
    let mut len = 0usize;
    let mut va = vp;
    loop {
        let pte = walk(root, va & !(PAGE_SIZE - 1), false).map_err(|_| KernelError::InvalidArg)?;
        let entry = unsafe { *pte };
        if !entry.is_leaf() {
            return Err(KernelError::InvalidArg);
        }
        if !entry.flags().contains(flags) {
            return Err(KernelError::NoAccess);
        }
        let page_end = (va & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        while va < page_end {
            if len >= VSTR_MAX {
                return Err(KernelError::InvalidArg);
            }
            let byte = unsafe { *(va as *const u8) };
            if byte == 0 {
                return Ok(len);
            }
            len += 1;
            va += 1;
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub fn memory_init() {
    use crate::board::{RAM_END, RAM_START};
    use crate::util::round_up;

    extern "C" {
        static _kimg_text_end: u8;
        static _kimg_rodata_start: u8;
        static _kimg_rodata_end: u8;
        static _kimg_data_start: u8;
        static _kimg_end: u8;
    }

    let text_end = unsafe { &_kimg_text_end as *const _ as usize };
    let rodata_start = unsafe { &_kimg_rodata_start as *const _ as usize };
    let rodata_end = unsafe { &_kimg_rodata_end as *const _ as usize };
    let data_start = unsafe { &_kimg_data_start as *const _ as usize };
    let kimg_end = unsafe { &_kimg_end as *const _ as usize };

    // heap right after the image, the rest of RAM seeds the page pool
    let heap_base = round_up(kimg_end, PAGE_SIZE);
    super::heap::heap_init(heap_base, super::heap::HEAP_INIT_MIN);
    super::page_pool::pool_init(heap_base + super::heap::HEAP_INIT_MIN, RAM_END);

    let root = alloc_zeroed_page().expect("memory_init: no root table");

    const GIGA_SIZE: usize = 1 << 30;
    const MEGA_SIZE: usize = 1 << 21;
    let kernel = PteFlags::GLOBAL;

    fn boot_map_section(root: usize, from: usize, to: usize, flags: PteFlags) {
        let mut va = from;
        while va < to {
            map_page_at(root, va, va, flags | PteFlags::GLOBAL).expect("memory_init: boot map");
            va += PAGE_SIZE;
        }
    }

    // MMIO: identity R/W gigapages covering everything below 2 GiB; the
    // firmware hole between them and the image stays unmapped
    unsafe {
        table_at(root)[0] = Pte::leaf(0, PteFlags::RW | kernel);
        table_at(root)[1] = Pte::leaf(GIGA_SIZE, PteFlags::RW | kernel);
    }

    // kernel image, mapped per page with section-accurate permissions
    boot_map_section(root, RAM_START, text_end, PteFlags::READ | PteFlags::EXEC);
    boot_map_section(root, rodata_start, rodata_end, PteFlags::READ);
    boot_map_section(root, data_start, RAM_START + MEGA_SIZE, PteFlags::RW);

    // remaining RAM as R/W megapages
    let mut va = RAM_START + MEGA_SIZE;
    while va < RAM_END {
        let l1 = unsafe {
            let entry = &mut table_at(root)[vpn(va, 2)];
            if !entry.is_valid() {
                *entry = Pte::table(alloc_zeroed_page().expect("memory_init: no l1 table"));
            }
            entry.pa()
        };
        unsafe {
            table_at(l1)[vpn(va, 1)] = Pte::leaf(va, PteFlags::RW | kernel);
        }
        va += MEGA_SIZE;
    }

    let tag = root_to_tag(root);
    MAIN_MTAG.call_once(|| tag);
    Arch::install_page_table(tag);
    Arch::enable_user_access();
    info!(
        "memory_init: heap {:#x}..{:#x}, satp {:#x}",
        heap_base,
        heap_base + super::heap::HEAP_INIT_MIN,
        tag
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page_pool;
    use core::alloc::Layout;

    // a shared arena feeds the global pool for table allocations
    fn seed_pool() {
        static SEEDED: spin::Once<()> = spin::Once::new();
        SEEDED.call_once(|| {
            let layout = Layout::from_size_align(512 * PAGE_SIZE, PAGE_SIZE).unwrap();
            let base = unsafe { alloc::alloc::alloc_zeroed(layout) } as usize;
            assert_ne!(base, 0);
            page_pool::pool_init(base, base + 512 * PAGE_SIZE);
        });
    }

    #[test]
    fn vpn_split() {
        let va = 0xc000_0000usize + (5 << 21) + (7 << 12) + 0x123;
        assert_eq!(vpn(va, 2), 3);
        assert_eq!(vpn(va, 1), 5);
        assert_eq!(vpn(va, 0), 7);
    }

    #[test]
    fn canonical_addresses() {
        assert!(vaddr_is_canonical(0));
        assert!(vaddr_is_canonical(0x3f_ffff_ffff));
        assert!(!vaddr_is_canonical(0x40_0000_0000));
        assert!(vaddr_is_canonical(0xffff_ffc0_0000_0000));
        assert!(!vaddr_is_canonical(0x8000_0000_0000_0000));
    }

    #[test]
    fn pte_roundtrip() {
        let pte = Pte::leaf(0x8040_2000, PteFlags::RW | PteFlags::USER);
        assert!(pte.is_leaf());
        assert_eq!(pte.pa(), 0x8040_2000);
        assert!(pte.flags().contains(PteFlags::USER | PteFlags::VALID));
        assert!(!pte.is_global());

        let table = Pte::table(0x8040_3000);
        assert!(table.is_table());
        assert!(!table.is_leaf());
    }

    #[test]
    fn map_walk_unmap() {
        seed_pool();
        let root = page_pool::alloc_zeroed_page().unwrap();
        let page = page_pool::alloc_zeroed_page().unwrap();
        let va = 0xc004_2000usize;

        map_page_at(root, va, page, PteFlags::RW | PteFlags::USER).unwrap();
        // double map refused
        assert_eq!(
            map_page_at(root, va, page, PteFlags::RW | PteFlags::USER),
            Err(KernelError::Busy)
        );
        let pte = unsafe { *walk(root, va, false).unwrap() };
        assert_eq!(pte.pa(), page);

        unmap_range_at(root, va, PAGE_SIZE, true);
        let pte = unsafe { *walk(root, va, false).unwrap() };
        assert!(!pte.is_valid());
    }

    #[test]
    fn clone_copies_user_pages_and_shares_globals() {
        seed_pool();
        let root = page_pool::alloc_zeroed_page().unwrap();
        // one global kernel page, one user page with content
        let kpage = page_pool::alloc_zeroed_page().unwrap();
        let upage = page_pool::alloc_zeroed_page().unwrap();
        unsafe { (upage as *mut u8).write_bytes(0xab, PAGE_SIZE) };
        map_page_at(root, 0xc000_0000, kpage, PteFlags::RW | PteFlags::GLOBAL).unwrap();
        map_page_at(root, 0xc000_1000, upage, PteFlags::RW | PteFlags::USER).unwrap();

        let cloned_root = clone_table(root, LEVEL_TOP);
        let kc = unsafe { *walk(cloned_root, 0xc000_0000, false).unwrap() };
        let uc = unsafe { *walk(cloned_root, 0xc000_1000, false).unwrap() };
        assert_eq!(kc.pa(), kpage, "global leaf shared by reference");
        assert_ne!(uc.pa(), upage, "user leaf materialized");
        let copied = unsafe { core::slice::from_raw_parts(uc.pa() as *const u8, PAGE_SIZE) };
        assert!(copied.iter().all(|&b| b == 0xab));

        // writes to the copy leave the original alone
        unsafe { (uc.pa() as *mut u8).write_bytes(0xcd, 1) };
        assert_eq!(unsafe { *(upage as *const u8) }, 0xab);
    }
}

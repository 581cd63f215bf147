//! KTFS: a flat-directory inode filesystem over 512-byte blocks.
//!
//! On-disk layout, in block order: superblock, `B` bitmap blocks (one bit
//! per data-region block, clear = free), `N` inode blocks, then the data
//! region. Inodes carry three direct pointers, one indirect block and two
//! double-indirect trees of 128-entry index blocks; all stored block numbers
//! are data-region-relative and little-endian. Block number 0 never backs a
//! file: the formatter reserves data block 0 so 0 can mark an absent
//! pointer.
//!
//! A single filesystem-wide lock serializes every operation; the block
//! cache keeps its own lock underneath.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use spin::Once;

use super::cache::{BlockCache, CACHE_BLKSZ};
use crate::io::{Io, IoCtl, IoRef, SeekIo};
use crate::kernel::sync::Lock;
use crate::kernel::{KernelError, KernelResult};

pub const KTFS_BLKSZ: usize = CACHE_BLKSZ;
pub const KTFS_MAX_FILENAME_LEN: usize = 28;
pub const KTFS_MAX_OPEN: usize = 96;

const KTFS_INOSZ: usize = 32;
const INODES_PER_BLOCK: usize = KTFS_BLKSZ / KTFS_INOSZ;
const DIRENT_SIZE: usize = 32;
const DIRENTS_PER_BLOCK: usize = KTFS_BLKSZ / DIRENT_SIZE;

const NUM_DIRECT: usize = 3;
const PTRS_PER_BLOCK: usize = KTFS_BLKSZ / 4;
const INDIRECT_SPAN: usize = PTRS_PER_BLOCK;
const DINDIRECT_SPAN: usize = PTRS_PER_BLOCK * PTRS_PER_BLOCK;
const MAX_FILE_BLOCKS: usize = NUM_DIRECT + INDIRECT_SPAN + 2 * DINDIRECT_SPAN;

/// 3 + 128 + 2*128² blocks of 512 bytes.
pub const KTFS_MAX_FILE_SIZE: u64 = (MAX_FILE_BLOCKS * KTFS_BLKSZ) as u64;

const BITS_PER_BLOCK: usize = KTFS_BLKSZ * 8;

const INODE_IN_USE: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Superblock {
    block_count: u32,
    bitmap_block_count: u32,
    inode_block_count: u32,
    root_inode: u16,
    _pad: u16,
}

const_assert_eq!(core::mem::size_of::<Superblock>(), 16);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Inode {
    size: u32,
    flags: u32,
    block: [u32; NUM_DIRECT],
    indirect: u32,
    dindirect: [u32; 2],
}

const_assert_eq!(core::mem::size_of::<Inode>(), KTFS_INOSZ);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DirEntry {
    name: [u8; KTFS_MAX_FILENAME_LEN],
    inode: u16,
    _pad: u16,
}

const_assert_eq!(core::mem::size_of::<DirEntry>(), DIRENT_SIZE);

// Plain-old-data moves between block buffers and structs; the on-disk
// format is little-endian, as are riscv64 and the test hosts.
fn get_struct<T: Copy>(buf: &[u8], off: usize) -> T {
    assert!(off + core::mem::size_of::<T>() <= buf.len());
    unsafe { (buf.as_ptr().add(off) as *const T).read_unaligned() }
}

fn put_struct<T: Copy>(buf: &mut [u8], off: usize, val: T) {
    assert!(off + core::mem::size_of::<T>() <= buf.len());
    unsafe { (buf.as_mut_ptr().add(off) as *mut T).write_unaligned(val) }
}

fn encode_name(name: &str) -> KernelResult<[u8; KTFS_MAX_FILENAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > KTFS_MAX_FILENAME_LEN || bytes.contains(&0) {
        return Err(KernelError::InvalidArg);
    }
    let mut out = [0u8; KTFS_MAX_FILENAME_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

#[derive(Clone)]
struct OpenFile {
    entry: DirEntry,
    fsize: u32,
    flags: u32,
}

#[derive(Debug)]
pub struct Ktfs {
    lock: Lock,
    cache: BlockCache,
    sb: Superblock,
    open: UnsafeCell<Vec<Option<OpenFile>>>,
}

unsafe impl Send for Ktfs {}
unsafe impl Sync for Ktfs {}

impl Ktfs {
    /// Build a cache over `io`, read the superblock and compute the region
    /// layout.
    pub fn mount(io: IoRef) -> KernelResult<Self> {
        let cache = BlockCache::new(io);
        let blk = cache.get_block(0)?;
        let sb: Superblock = get_struct(blk.data(), 0);
        blk.release(false)?;

        let used = 1u64 + sb.bitmap_block_count as u64 + sb.inode_block_count as u64;
        let device_end = cache.backing_end()?;
        if sb.block_count == 0
            || sb.bitmap_block_count == 0
            || sb.inode_block_count == 0
            || used >= sb.block_count as u64
            || sb.block_count as u64 * KTFS_BLKSZ as u64 > device_end
            || sb.root_inode as usize >= sb.inode_block_count as usize * INODES_PER_BLOCK
        {
            return Err(KernelError::BadFormat);
        }
        info!(
            "ktfs: {} blocks, {} bitmap, {} inode, root inode {}",
            sb.block_count, sb.bitmap_block_count, sb.inode_block_count, sb.root_inode
        );
        Ok(Ktfs {
            lock: Lock::new("ktfs"),
            cache,
            sb,
            open: UnsafeCell::new(vec![None; KTFS_MAX_OPEN]),
        })
    }

    /// Lay down an empty volume: superblock, bitmap with data block 0
    /// reserved, zeroed inodes and an empty root directory at inode 0.
    pub fn format(io: &dyn Io) -> KernelResult {
        let total = (io.cntl(IoCtl::GetEnd)? / KTFS_BLKSZ as u64) as usize;
        if total < 8 {
            return Err(KernelError::InvalidArg);
        }
        let inode_blocks = (total / 64).clamp(1, 64);
        let mut bitmap_blocks = 1;
        let data_blocks = loop {
            let data = total - 1 - inode_blocks - bitmap_blocks;
            let need = (data + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
            if need <= bitmap_blocks {
                break data;
            }
            bitmap_blocks = need;
        };

        let mut block = [0u8; KTFS_BLKSZ];
        put_struct(
            &mut block,
            0,
            Superblock {
                block_count: total as u32,
                bitmap_block_count: bitmap_blocks as u32,
                inode_block_count: inode_blocks as u32,
                root_inode: 0,
                _pad: 0,
            },
        );
        io.writeat(0, &block)?;

        // bitmap: bit 0 reserved (0 marks an absent pointer), the slack
        // past the data region permanently taken
        for bmp in 0..bitmap_blocks {
            let mut block = [0u8; KTFS_BLKSZ];
            for bit in 0..BITS_PER_BLOCK {
                let global = bmp * BITS_PER_BLOCK + bit;
                if global == 0 || global >= data_blocks {
                    block[bit / 8] |= 1 << (bit % 8);
                }
            }
            io.writeat(((1 + bmp) * KTFS_BLKSZ) as u64, &block)?;
        }

        let zero = [0u8; KTFS_BLKSZ];
        for ino_blk in 0..inode_blocks {
            io.writeat(((1 + bitmap_blocks + ino_blk) * KTFS_BLKSZ) as u64, &zero)?;
        }

        // root directory: in use, empty
        let mut block = [0u8; KTFS_BLKSZ];
        put_struct(
            &mut block,
            0,
            Inode {
                size: 0,
                flags: INODE_IN_USE,
                ..Inode::default()
            },
        );
        io.writeat(((1 + bitmap_blocks) * KTFS_BLKSZ) as u64, &block)?;
        info!(
            "ktfs: formatted {} blocks ({} bitmap, {} inode, {} data)",
            total, bitmap_blocks, inode_blocks, data_blocks
        );
        Ok(())
    }

    fn open_table(&self) -> &mut Vec<Option<OpenFile>> {
        // guarded by self.lock
        unsafe { &mut *self.open.get() }
    }

    fn data_start(&self) -> u64 {
        1 + self.sb.bitmap_block_count as u64 + self.sb.inode_block_count as u64
    }

    fn data_block_pos(&self, blkno: u32) -> u64 {
        (self.data_start() + blkno as u64) * KTFS_BLKSZ as u64
    }

    fn data_block_count(&self) -> usize {
        self.sb.block_count as usize - self.data_start() as usize
    }

    fn inode_count(&self) -> usize {
        self.sb.inode_block_count as usize * INODES_PER_BLOCK
    }

    fn inode_pos(&self, ino: u16) -> (u64, usize) {
        let block = 1 + self.sb.bitmap_block_count as u64 + (ino as usize / INODES_PER_BLOCK) as u64;
        (block * KTFS_BLKSZ as u64, ino as usize % INODES_PER_BLOCK * KTFS_INOSZ)
    }

    fn read_inode(&self, ino: u16) -> KernelResult<Inode> {
        let (pos, off) = self.inode_pos(ino);
        let blk = self.cache.get_block(pos)?;
        let inode = get_struct(blk.data(), off);
        blk.release(false)?;
        Ok(inode)
    }

    fn write_inode(&self, ino: u16, inode: Inode) -> KernelResult {
        let (pos, off) = self.inode_pos(ino);
        let mut blk = self.cache.get_block(pos)?;
        put_struct(blk.data_mut(), off, inode);
        blk.release(true)
    }

    fn index_entry(&self, index_blk: u32, slot: usize) -> KernelResult<u32> {
        let blk = self.cache.get_block(self.data_block_pos(index_blk))?;
        let val = get_struct(blk.data(), slot * 4);
        blk.release(false)?;
        Ok(val)
    }

    fn set_index_entry(&self, index_blk: u32, slot: usize, val: u32) -> KernelResult {
        let mut blk = self.cache.get_block(self.data_block_pos(index_blk))?;
        put_struct(blk.data_mut(), slot * 4, val);
        blk.release(true)
    }

    /// Map a file-block index to its data-region block number; `None` is a
    /// hole. Out of range is a caller error.
    fn get_data_block(&self, inode: &Inode, idx: usize) -> KernelResult<Option<u32>> {
        fn nz(blkno: u32) -> Option<u32> {
            (blkno != 0).then(|| blkno)
        }
        if idx < NUM_DIRECT {
            return Ok(nz(inode.block[idx]));
        }
        if idx < NUM_DIRECT + INDIRECT_SPAN {
            if inode.indirect == 0 {
                return Ok(None);
            }
            return Ok(nz(self.index_entry(inode.indirect, idx - NUM_DIRECT)?));
        }
        if idx < MAX_FILE_BLOCKS {
            let j = idx - NUM_DIRECT - INDIRECT_SPAN;
            let tree = inode.dindirect[j / DINDIRECT_SPAN];
            if tree == 0 {
                return Ok(None);
            }
            let rest = j % DINDIRECT_SPAN;
            let l0 = self.index_entry(tree, rest / PTRS_PER_BLOCK)?;
            if l0 == 0 {
                return Ok(None);
            }
            return Ok(nz(self.index_entry(l0, rest % PTRS_PER_BLOCK)?));
        }
        Err(KernelError::InvalidArg)
    }

    /// Find a clear bitmap bit, set it and hand back the zeroed data block.
    /// The scan is O(bits), byte by byte.
    fn find_free_data_block(&self) -> KernelResult<u32> {
        let data_blocks = self.data_block_count();
        for bmp in 0..self.sb.bitmap_block_count as usize {
            let mut blk = self.cache.get_block(((1 + bmp) * KTFS_BLKSZ) as u64)?;
            let mut found = None;
            'scan: for (byte_idx, byte) in blk.data().iter().enumerate() {
                if *byte == 0xff {
                    continue;
                }
                for bit in 0..8 {
                    if byte & (1 << bit) == 0 {
                        let global = bmp * BITS_PER_BLOCK + byte_idx * 8 + bit;
                        if global < data_blocks {
                            found = Some((byte_idx, bit, global));
                        }
                        break 'scan;
                    }
                }
            }
            match found {
                Some((byte_idx, bit, global)) => {
                    blk.data_mut()[byte_idx] |= 1 << bit;
                    blk.release(true)?;
                    self.zero_data_block(global as u32)?;
                    return Ok(global as u32);
                }
                None => blk.release(false)?,
            }
        }
        Err(KernelError::Io)
    }

    fn zero_data_block(&self, blkno: u32) -> KernelResult {
        let mut blk = self.cache.get_block(self.data_block_pos(blkno))?;
        blk.data_mut().fill(0);
        blk.release(true)
    }

    fn clear_data_block_bit(&self, blkno: u32) -> KernelResult {
        let bmp = blkno as usize / BITS_PER_BLOCK;
        let bit = blkno as usize % BITS_PER_BLOCK;
        let mut blk = self.cache.get_block(((1 + bmp) * KTFS_BLKSZ) as u64)?;
        blk.data_mut()[bit / 8] &= !(1 << (bit % 8));
        blk.release(true)
    }

    /// Install a fresh data block at file-block `idx`, allocating and
    /// zero-filling intermediate index blocks on demand.
    fn install_data_block(&self, inode: &mut Inode, idx: usize) -> KernelResult {
        let data = self.find_free_data_block()?;
        if idx < NUM_DIRECT {
            inode.block[idx] = data;
            return Ok(());
        }
        if idx < NUM_DIRECT + INDIRECT_SPAN {
            if inode.indirect == 0 {
                inode.indirect = self.find_free_data_block()?;
            }
            return self.set_index_entry(inode.indirect, idx - NUM_DIRECT, data);
        }
        if idx >= MAX_FILE_BLOCKS {
            return Err(KernelError::InvalidArg);
        }
        let j = idx - NUM_DIRECT - INDIRECT_SPAN;
        let which = j / DINDIRECT_SPAN;
        if inode.dindirect[which] == 0 {
            inode.dindirect[which] = self.find_free_data_block()?;
        }
        let rest = j % DINDIRECT_SPAN;
        let l1_slot = rest / PTRS_PER_BLOCK;
        let mut l0 = self.index_entry(inode.dindirect[which], l1_slot)?;
        if l0 == 0 {
            l0 = self.find_free_data_block()?;
            self.set_index_entry(inode.dindirect[which], l1_slot, l0)?;
        }
        self.set_index_entry(l0, rest % PTRS_PER_BLOCK, data)
    }

    /// Copy bytes out of a file image; holes read as zeroes.
    fn inode_read_extent(&self, inode: &Inode, pos: u64, buf: &mut [u8]) -> KernelResult {
        let mut cur = pos;
        let mut done = 0;
        while done < buf.len() {
            let idx = (cur / KTFS_BLKSZ as u64) as usize;
            let off = (cur % KTFS_BLKSZ as u64) as usize;
            let chunk = (KTFS_BLKSZ - off).min(buf.len() - done);
            match self.get_data_block(inode, idx)? {
                Some(blkno) => {
                    let blk = self.cache.get_block(self.data_block_pos(blkno))?;
                    buf[done..done + chunk].copy_from_slice(&blk.data()[off..off + chunk]);
                    blk.release(false)?;
                }
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
            cur += chunk as u64;
        }
        Ok(())
    }

    /// Copy bytes into a file image; every touched block must be present.
    fn inode_write_extent(&self, inode: &Inode, pos: u64, buf: &[u8]) -> KernelResult {
        let mut cur = pos;
        let mut done = 0;
        while done < buf.len() {
            let idx = (cur / KTFS_BLKSZ as u64) as usize;
            let off = (cur % KTFS_BLKSZ as u64) as usize;
            let chunk = (KTFS_BLKSZ - off).min(buf.len() - done);
            let blkno = self
                .get_data_block(inode, idx)?
                .ok_or(KernelError::Io)?;
            let mut blk = self.cache.get_block(self.data_block_pos(blkno))?;
            blk.data_mut()[off..off + chunk].copy_from_slice(&buf[done..done + chunk]);
            blk.release(true)?;
            done += chunk;
            cur += chunk as u64;
        }
        Ok(())
    }

    fn dir_entry_at(&self, root: &Inode, idx: usize) -> KernelResult<DirEntry> {
        let mut raw = [0u8; DIRENT_SIZE];
        self.inode_read_extent(root, (idx * DIRENT_SIZE) as u64, &mut raw)?;
        Ok(get_struct(&raw, 0))
    }

    fn put_dir_entry(&self, root: &Inode, idx: usize, entry: DirEntry) -> KernelResult {
        let mut raw = [0u8; DIRENT_SIZE];
        put_struct(&mut raw, 0, entry);
        self.inode_write_extent(root, (idx * DIRENT_SIZE) as u64, &raw)
    }

    /// Linear scan of the root directory.
    fn lookup(&self, name: &[u8; KTFS_MAX_FILENAME_LEN]) -> KernelResult<Option<(usize, DirEntry)>> {
        let root = self.read_inode(self.sb.root_inode)?;
        let count = root.size as usize / DIRENT_SIZE;
        for idx in 0..count {
            let entry = self.dir_entry_at(&root, idx)?;
            if entry.name == *name {
                return Ok(Some((idx, entry)));
            }
        }
        Ok(None)
    }

    fn find_free_inode(&self) -> KernelResult<u16> {
        for ino in 0..self.inode_count() as u16 {
            if ino == self.sb.root_inode {
                continue;
            }
            if self.read_inode(ino)? == Inode::default() {
                return Ok(ino);
            }
        }
        Err(KernelError::Io)
    }

    /// Create an empty file. Fails with `Busy` when the name exists.
    pub fn create(&self, name: &str) -> KernelResult {
        let name = encode_name(name)?;
        self.lock.acquire();
        let result = self.create_locked(&name);
        self.lock.release();
        result
    }

    fn create_locked(&self, name: &[u8; KTFS_MAX_FILENAME_LEN]) -> KernelResult {
        if self.lookup(name)?.is_some() {
            return Err(KernelError::Busy);
        }
        let mut root = self.read_inode(self.sb.root_inode)?;
        let count = root.size as usize / DIRENT_SIZE;

        // the directory grows at its tail; crossing into a fresh block means
        // installing one, unless a shrink left the block behind earlier
        let blk_idx = count / DIRENTS_PER_BLOCK;
        if count % DIRENTS_PER_BLOCK == 0 && self.get_data_block(&root, blk_idx)?.is_none() {
            self.install_data_block(&mut root, blk_idx)?;
        }

        let ino = self.find_free_inode()?;
        self.write_inode(
            ino,
            Inode {
                size: 0,
                flags: INODE_IN_USE,
                ..Inode::default()
            },
        )?;
        self.put_dir_entry(
            &root,
            count,
            DirEntry {
                name: *name,
                inode: ino,
                _pad: 0,
            },
        )?;
        root.size += DIRENT_SIZE as u32;
        self.write_inode(self.sb.root_inode, root)
    }

    /// Delete a file: close it if open, pack the directory by swapping the
    /// last entry in, clear every bitmap bit the inode references, zero the
    /// inode.
    pub fn delete(&self, name: &str) -> KernelResult {
        let name = encode_name(name)?;
        self.lock.acquire();
        let result = self.delete_locked(&name);
        self.lock.release();
        result
    }

    fn delete_locked(&self, name: &[u8; KTFS_MAX_FILENAME_LEN]) -> KernelResult {
        let (idx, victim) = self.lookup(name)?.ok_or(KernelError::NotFound)?;

        for slot in self.open_table().iter_mut() {
            if matches!(slot, Some(open) if open.entry.name == *name) {
                *slot = None;
            }
        }

        let mut root = self.read_inode(self.sb.root_inode)?;
        let count = root.size as usize / DIRENT_SIZE;
        let last = count - 1;
        if idx != last {
            let tail = self.dir_entry_at(&root, last)?;
            self.put_dir_entry(&root, idx, tail)?;
        }
        root.size -= DIRENT_SIZE as u32;
        self.write_inode(self.sb.root_inode, root)?;
        // a directory block emptied by the shrink is deliberately left
        // allocated

        let inode = self.read_inode(victim.inode)?;
        for blkno in inode.block {
            if blkno != 0 {
                self.clear_data_block_bit(blkno)?;
            }
        }
        if inode.indirect != 0 {
            self.free_index_block(inode.indirect)?;
        }
        for tree in inode.dindirect {
            if tree == 0 {
                continue;
            }
            for slot in 0..PTRS_PER_BLOCK {
                let l0 = self.index_entry(tree, slot)?;
                if l0 != 0 {
                    self.free_index_block(l0)?;
                }
            }
            self.clear_data_block_bit(tree)?;
        }
        self.write_inode(victim.inode, Inode::default())
    }

    /// Clear every referenced bit of an index block, then the block's own.
    fn free_index_block(&self, index_blk: u32) -> KernelResult {
        for slot in 0..PTRS_PER_BLOCK {
            let blkno = self.index_entry(index_blk, slot)?;
            if blkno != 0 {
                self.clear_data_block_bit(blkno)?;
            }
        }
        self.clear_data_block_bit(index_blk)
    }

    /// Exclusive open: a name can sit in the open-file table once.
    pub fn open(&'static self, name: &str) -> KernelResult<IoRef> {
        let name = encode_name(name)?;
        self.lock.acquire();
        let result = self.open_locked(&name);
        self.lock.release();
        let (slot, ino) = result?;
        let file = Arc::new(KtfsFile {
            fs: self,
            slot,
            ino,
        });
        let io: IoRef = SeekIo::new(file)?;
        Ok(io)
    }

    fn open_locked(&self, name: &[u8; KTFS_MAX_FILENAME_LEN]) -> KernelResult<(usize, u16)> {
        let (_, entry) = self.lookup(name)?.ok_or(KernelError::NotFound)?;
        let table = self.open_table();
        if table
            .iter()
            .any(|slot| matches!(slot, Some(open) if open.entry.name == *name))
        {
            return Err(KernelError::Busy);
        }
        let slot = table
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(KernelError::TooManyFiles)?;
        let inode = self.read_inode(entry.inode)?;
        table[slot] = Some(OpenFile {
            entry,
            fsize: inode.size,
            flags: inode.flags,
        });
        Ok((slot, entry.inode))
    }

    /// Write every dirty cache slot back to the device.
    pub fn flush(&self) -> KernelResult {
        self.lock.acquire();
        let result = self.cache.flush();
        self.lock.release();
        result
    }

    fn checked_open(&self, slot: usize, ino: u16) -> KernelResult<OpenFile> {
        match &self.open_table()[slot] {
            Some(open) if open.entry.inode == ino => Ok(open.clone()),
            _ => Err(KernelError::Io),
        }
    }

    fn file_readat(&self, slot: usize, ino: u16, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.lock.acquire();
        let result = (|| {
            let open = self.checked_open(slot, ino)?;
            let fsize = open.fsize as u64;
            if pos >= fsize {
                return Ok(0);
            }
            let n = buf.len().min((fsize - pos) as usize);
            let inode = self.read_inode(ino)?;
            self.inode_read_extent(&inode, pos, &mut buf[..n])?;
            Ok(n)
        })();
        self.lock.release();
        result
    }

    fn file_writeat(&self, slot: usize, ino: u16, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        self.lock.acquire();
        let result = (|| {
            let open = self.checked_open(slot, ino)?;
            let fsize = open.fsize as u64;
            // no extension on write: growing needs a SETEND first
            if pos >= fsize {
                return Ok(0);
            }
            let n = buf.len().min((fsize - pos) as usize);
            let inode = self.read_inode(ino)?;
            self.inode_write_extent(&inode, pos, &buf[..n])?;
            Ok(n)
        })();
        self.lock.release();
        result
    }

    fn file_set_end(&self, slot: usize, ino: u16, new_size: u64) -> KernelResult {
        self.lock.acquire();
        let result = (|| {
            self.checked_open(slot, ino)?;
            let mut inode = self.read_inode(ino)?;
            if new_size < inode.size as u64 || new_size > KTFS_MAX_FILE_SIZE {
                return Err(KernelError::InvalidArg);
            }
            let old_blocks = (inode.size as u64 + KTFS_BLKSZ as u64 - 1) / KTFS_BLKSZ as u64;
            let new_blocks = (new_size + KTFS_BLKSZ as u64 - 1) / KTFS_BLKSZ as u64;
            for idx in old_blocks..new_blocks {
                self.install_data_block(&mut inode, idx as usize)?;
            }
            inode.size = new_size as u32;
            self.write_inode(ino, inode)?;
            if let Some(open) = &mut self.open_table()[slot] {
                open.fsize = new_size as u32;
            }
            Ok(())
        })();
        self.lock.release();
        result
    }

    fn file_end(&self, slot: usize, ino: u16) -> KernelResult<u64> {
        self.lock.acquire();
        let result = self.checked_open(slot, ino).map(|open| open.fsize as u64);
        self.lock.release();
        result
    }

    fn file_close(&self, slot: usize, ino: u16) {
        self.lock.acquire();
        let table = self.open_table();
        if matches!(&table[slot], Some(open) if open.entry.inode == ino) {
            table[slot] = None;
        }
        self.lock.release();
    }
}

/// One open file; always wrapped in a `SeekIo` with block size 1.
#[derive(Debug)]
struct KtfsFile {
    fs: &'static Ktfs,
    slot: usize,
    ino: u16,
}

impl Io for KtfsFile {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.fs.file_readat(self.slot, self.ino, pos, buf)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        self.fs.file_writeat(self.slot, self.ino, pos, buf)
    }

    fn cntl(&self, cmd: IoCtl) -> KernelResult<u64> {
        match cmd {
            IoCtl::GetBlkSz => Ok(1),
            IoCtl::GetEnd => self.fs.file_end(self.slot, self.ino),
            IoCtl::SetEnd(size) => {
                self.fs.file_set_end(self.slot, self.ino, size)?;
                Ok(0)
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}

impl Drop for KtfsFile {
    fn drop(&mut self) {
        self.fs.file_close(self.slot, self.ino);
    }
}

static FS: Once<Ktfs> = Once::new();

/// Mount the global filesystem, formatting the volume first when the
/// superblock does not parse.
pub fn mount_or_format(io: IoRef) -> KernelResult<()> {
    let fs = match Ktfs::mount(io.clone()) {
        Ok(fs) => fs,
        Err(KernelError::BadFormat) => {
            warn!("ktfs: no filesystem on device, formatting");
            Ktfs::format(&*io)?;
            Ktfs::mount(io)?
        }
        Err(err) => return Err(err),
    };
    FS.call_once(|| fs);
    Ok(())
}

fn fs() -> KernelResult<&'static Ktfs> {
    FS.get().ok_or(KernelError::NotSupported)
}

pub fn fs_open(name: &str) -> KernelResult<IoRef> {
    fs()?.open(name)
}

pub fn fs_create(name: &str) -> KernelResult {
    fs()?.create(name)
}

pub fn fs_delete(name: &str) -> KernelResult {
    fs()?.delete(name)
}

pub fn fs_flush() -> KernelResult {
    fs()?.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemIo;

    fn fresh_fs(bytes: usize) -> &'static Ktfs {
        let io: IoRef = Arc::new(MemIo::with_block_size(bytes, KTFS_BLKSZ as u64));
        Ktfs::format(&*io).unwrap();
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Ktfs::mount(io).unwrap()))
    }

    #[test]
    fn format_then_mount_roundtrips_layout() {
        let io: IoRef = Arc::new(MemIo::with_block_size(1 << 20, KTFS_BLKSZ as u64));
        Ktfs::format(&*io).unwrap();
        let fs = Ktfs::mount(io).unwrap();
        assert_eq!(fs.sb.block_count as usize, (1 << 20) / KTFS_BLKSZ);
        assert!(fs.data_block_count() > 0);
    }

    #[test]
    fn mount_rejects_garbage() {
        let io: IoRef = Arc::new(MemIo::with_block_size(1 << 16, KTFS_BLKSZ as u64));
        assert_eq!(Ktfs::mount(io).unwrap_err(), KernelError::BadFormat);
    }

    #[test]
    fn create_write_read_roundtrip() {
        let fs = fresh_fs(1 << 20);
        fs.create("alpha").unwrap();
        let file = fs.open("alpha").unwrap();
        file.cntl(IoCtl::SetEnd(1024)).unwrap();

        let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(file.writeat(0, &pattern).unwrap(), 1024);
        let mut back = vec![0u8; 1024];
        assert_eq!(file.readat(0, &mut back).unwrap(), 1024);
        assert_eq!(back, pattern);
    }

    #[test]
    fn data_survives_cache_rebuild() {
        let io: IoRef = Arc::new(MemIo::with_block_size(1 << 20, KTFS_BLKSZ as u64));
        Ktfs::format(&*io).unwrap();
        {
            let fs: &'static Ktfs =
                alloc::boxed::Box::leak(alloc::boxed::Box::new(Ktfs::mount(io.clone()).unwrap()));
            fs.create("a").unwrap();
            let file = fs.open("a").unwrap();
            file.cntl(IoCtl::SetEnd(1024)).unwrap();
            let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
            file.writeat(0, &pattern).unwrap();
            drop(file);
            fs.flush().unwrap();
        }
        // reboot-emulate: a fresh mount over the same device
        let fs: &'static Ktfs = alloc::boxed::Box::leak(alloc::boxed::Box::new(Ktfs::mount(io).unwrap()));
        let file = fs.open("a").unwrap();
        let mut back = vec![0u8; 1024];
        assert_eq!(file.readat(0, &mut back).unwrap(), 1024);
        for (i, b) in back.iter().enumerate() {
            assert_eq!(*b as usize, i % 256);
        }
    }

    #[test]
    fn open_is_exclusive_and_bounded() {
        let fs = fresh_fs(1 << 20);
        fs.create("solo").unwrap();
        let first = fs.open("solo").unwrap();
        assert_eq!(fs.open("solo").unwrap_err(), KernelError::Busy);
        drop(first);
        let again = fs.open("solo").unwrap();
        drop(again);
    }

    #[test]
    fn open_table_fills_at_96() {
        let fs = fresh_fs(4 << 20);
        let mut names = Vec::new();
        for i in 0..=KTFS_MAX_OPEN {
            names.push(alloc::format!("f{}", i));
        }
        let mut held = Vec::new();
        for name in names.iter().take(KTFS_MAX_OPEN) {
            fs.create(name).unwrap();
            held.push(fs.open(name).unwrap());
        }
        fs.create(&names[KTFS_MAX_OPEN]).unwrap();
        assert_eq!(
            fs.open(&names[KTFS_MAX_OPEN]).unwrap_err(),
            KernelError::TooManyFiles
        );
        drop(held);
    }

    #[test]
    fn reads_clamp_and_writes_do_not_extend() {
        let fs = fresh_fs(1 << 20);
        fs.create("clamp").unwrap();
        let file = fs.open("clamp").unwrap();
        file.cntl(IoCtl::SetEnd(100)).unwrap();

        let mut buf = [0u8; 64];
        // read crossing fsize clamps
        assert_eq!(file.readat(80, &mut buf).unwrap(), 20);
        // read past fsize returns 0
        assert_eq!(file.readat(100, &mut buf).unwrap(), 0);
        assert_eq!(file.readat(200, &mut buf).unwrap(), 0);
        // write past fsize transfers nothing
        assert_eq!(file.writeat(100, &buf).unwrap(), 0);
        // write crossing fsize clamps
        assert_eq!(file.writeat(90, &buf).unwrap(), 10);
    }

    #[test]
    fn setend_bounds() {
        let fs = fresh_fs(24 << 20);
        fs.create("big").unwrap();
        let file = fs.open("big").unwrap();
        assert_eq!(
            file.cntl(IoCtl::SetEnd(KTFS_MAX_FILE_SIZE + 1)).unwrap_err(),
            KernelError::InvalidArg
        );
        file.cntl(IoCtl::SetEnd(KTFS_MAX_FILE_SIZE)).unwrap();
        assert_eq!(file.cntl(IoCtl::GetEnd).unwrap(), KTFS_MAX_FILE_SIZE);
        // shrink refused
        assert_eq!(
            file.cntl(IoCtl::SetEnd(0)).unwrap_err(),
            KernelError::InvalidArg
        );
        // the double-indirect tail is reachable
        let probe = [0x7eu8; 16];
        let tail = KTFS_MAX_FILE_SIZE - 16;
        assert_eq!(file.writeat(tail, &probe).unwrap(), 16);
        let mut back = [0u8; 16];
        assert_eq!(file.readat(tail, &mut back).unwrap(), 16);
        assert_eq!(back, probe);
    }

    #[test]
    fn delete_packs_directory_and_frees_blocks() {
        let fs = fresh_fs(1 << 20);
        for name in ["a", "b", "c"] {
            fs.create(name).unwrap();
        }
        {
            let file = fs.open("b").unwrap();
            file.cntl(IoCtl::SetEnd(4096)).unwrap();
        }
        let free_before = count_free_bits(fs);
        fs.delete("b").unwrap();
        // b's 8 data blocks plus its indirect index block came back
        assert_eq!(count_free_bits(fs), free_before + 9);
        assert_eq!(fs.open("b").unwrap_err(), KernelError::NotFound);
        // survivors still resolve; the swapped-in tail entry too
        fs.open("a").unwrap();
        fs.open("c").unwrap();
        // deleting again reports the absence
        assert_eq!(fs.delete("b").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn delete_while_open_closes_the_file() {
        let fs = fresh_fs(1 << 20);
        fs.create("gone").unwrap();
        let file = fs.open("gone").unwrap();
        fs.delete("gone").unwrap();
        // the stale handle reports an error rather than touching freed state
        let mut buf = [0u8; 8];
        assert!(file.readat(0, &mut buf).is_err());
    }

    #[test]
    fn sparse_reads_return_zeroes() {
        let fs = fresh_fs(1 << 20);
        fs.create("holes").unwrap();
        let file = fs.open("holes").unwrap();
        file.cntl(IoCtl::SetEnd(2048)).unwrap();
        let mut buf = [0xffu8; 512];
        assert_eq!(file.readat(512, &mut buf).unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn names_validate() {
        let fs = fresh_fs(1 << 20);
        assert_eq!(fs.create("").unwrap_err(), KernelError::InvalidArg);
        let long = "x".repeat(KTFS_MAX_FILENAME_LEN + 1);
        assert_eq!(fs.create(&long).unwrap_err(), KernelError::InvalidArg);
        let exact = "y".repeat(KTFS_MAX_FILENAME_LEN);
        fs.create(&exact).unwrap();
        fs.open(&exact).unwrap();
    }

    fn count_free_bits(fs: &Ktfs) -> usize {
        let mut free = 0;
        let data_blocks = fs.data_block_count();
        for bmp in 0..fs.sb.bitmap_block_count as usize {
            let blk = fs.cache.get_block(((1 + bmp) * KTFS_BLKSZ) as u64).unwrap();
            for (byte_idx, byte) in blk.data().iter().enumerate() {
                for bit in 0..8 {
                    let global = bmp * BITS_PER_BLOCK + byte_idx * 8 + bit;
                    if global < data_blocks && byte & (1 << bit) == 0 {
                        free += 1;
                    }
                }
            }
            blk.release(false).unwrap();
        }
        free
    }
}

//! Block cache between the filesystem and a block endpoint. A fixed set of
//! 512-byte slots kept in MRU-to-LRU order; the tail is the eviction victim.
//! Every operation runs under the cache-wide reentrant lock, and a pinned
//! block keeps that lock held until it is released, so a pinned slot can
//! never be evicted and the backing endpoint is only touched under the lock.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use crate::io::{Io, IoRef};
use crate::kernel::sync::Lock;
use crate::kernel::{KernelError, KernelResult};

pub const CACHE_BLKSZ: usize = 512;
pub const CACHE_CAPACITY: usize = 64;

#[derive(Debug)]
struct Slot {
    pos: u64,
    valid: bool,
    dirty: bool,
    buf: [u8; CACHE_BLKSZ],
}

#[derive(Debug)]
struct CacheInner {
    slots: Vec<Slot>,
    /// Slot indices, MRU at the front. Every slot is always listed; invalid
    /// slots drift toward the tail until first use.
    order: VecDeque<usize>,
}

#[derive(Debug)]
pub struct BlockCache {
    lock: Lock,
    inner: UnsafeCell<CacheInner>,
    backing: IoRef,
}

unsafe impl Send for BlockCache {}
unsafe impl Sync for BlockCache {}

/// A pinned block. The pin is the cache lock itself (reentrant, so nested
/// pins by one thread work); release it promptly and exactly once.
pub struct BlockGuard<'c> {
    cache: &'c BlockCache,
    slot: usize,
    released: bool,
}

impl BlockCache {
    pub fn new(backing: IoRef) -> Self {
        let mut slots = Vec::with_capacity(CACHE_CAPACITY);
        let mut order = VecDeque::with_capacity(CACHE_CAPACITY);
        for idx in 0..CACHE_CAPACITY {
            slots.push(Slot {
                pos: 0,
                valid: false,
                dirty: false,
                buf: [0; CACHE_BLKSZ],
            });
            order.push_back(idx);
        }
        BlockCache {
            lock: Lock::new("cache"),
            inner: UnsafeCell::new(CacheInner { slots, order }),
            backing,
        }
    }

    fn inner(&self) -> &mut CacheInner {
        // guarded by self.lock
        unsafe { &mut *self.inner.get() }
    }

    /// Pin the block at byte position `pos` (a multiple of the block size).
    pub fn get_block(&self, pos: u64) -> KernelResult<BlockGuard<'_>> {
        if pos % CACHE_BLKSZ as u64 != 0 {
            return Err(KernelError::InvalidArg);
        }
        self.lock.acquire();
        match self.get_block_locked(pos) {
            Ok(slot) => Ok(BlockGuard {
                cache: self,
                slot,
                released: false,
            }),
            Err(err) => {
                self.lock.release();
                Err(err)
            }
        }
    }

    fn get_block_locked(&self, pos: u64) -> KernelResult<usize> {
        debug_assert!(self.lock.held_by_current());
        let inner = self.inner();

        // hit: promote to MRU
        if let Some(rank) = inner
            .order
            .iter()
            .position(|&idx| inner.slots[idx].valid && inner.slots[idx].pos == pos)
        {
            let idx = inner.order.remove(rank).unwrap();
            inner.order.push_front(idx);
            return Ok(idx);
        }

        // cold slot: fill in place, promotion happens on the next hit
        if let Some(idx) = (0..inner.slots.len()).find(|&idx| !inner.slots[idx].valid) {
            fill_slot(&self.backing, &mut inner.slots[idx], pos)?;
            return Ok(idx);
        }

        // evict the LRU tail, write-back first if needed, re-thread to MRU
        let victim = *inner.order.back().unwrap();
        if inner.slots[victim].dirty {
            let slot = &inner.slots[victim];
            write_backing(&self.backing, slot.pos, &slot.buf)?;
            inner.slots[victim].dirty = false;
        }
        inner.slots[victim].valid = false;
        fill_slot(&self.backing, &mut inner.slots[victim], pos)?;
        inner.order.pop_back();
        inner.order.push_front(victim);
        Ok(victim)
    }

    /// Write back every valid dirty slot and clear its dirty bit.
    pub fn flush(&self) -> KernelResult {
        self.lock.acquire();
        let result = (|| {
            let inner = self.inner();
            for slot in inner.slots.iter_mut() {
                if slot.valid && slot.dirty {
                    write_backing(&self.backing, slot.pos, &slot.buf)?;
                    slot.dirty = false;
                }
            }
            Ok(())
        })();
        self.lock.release();
        result
    }

    pub fn backing_end(&self) -> KernelResult<u64> {
        self.backing.cntl(crate::io::IoCtl::GetEnd)
    }
}

fn write_backing(backing: &IoRef, pos: u64, buf: &[u8; CACHE_BLKSZ]) -> KernelResult {
    let put = backing.writeat(pos, buf)?;
    if put != CACHE_BLKSZ {
        return Err(KernelError::Io);
    }
    Ok(())
}

fn fill_slot(backing: &IoRef, slot: &mut Slot, pos: u64) -> KernelResult {
    let got = backing.readat(pos, &mut slot.buf)?;
    if got != CACHE_BLKSZ {
        return Err(KernelError::Io);
    }
    slot.pos = pos;
    slot.valid = true;
    slot.dirty = false;
    Ok(())
}

impl<'c> BlockGuard<'c> {
    pub fn data(&self) -> &[u8; CACHE_BLKSZ] {
        &self.cache.inner().slots[self.slot].buf
    }

    pub fn data_mut(&mut self) -> &mut [u8; CACHE_BLKSZ] {
        &mut self.cache.inner().slots[self.slot].buf
    }

    /// Unpin. A dirty release writes the block through to the backing
    /// endpoint immediately; the dirty bit is left clear either way.
    pub fn release(mut self, dirty: bool) -> KernelResult {
        self.released = true;
        let result = if dirty {
            let inner = self.cache.inner();
            let slot = &mut inner.slots[self.slot];
            slot.dirty = true;
            let written = write_backing(&self.cache.backing, slot.pos, &slot.buf);
            if written.is_ok() {
                slot.dirty = false;
            }
            written
        } else {
            Ok(())
        };
        self.cache.lock.release();
        result
    }
}

impl<'c> Drop for BlockGuard<'c> {
    fn drop(&mut self) {
        if !self.released {
            self.cache.lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemIo;
    use alloc::sync::Arc;

    fn ram_cache(blocks: usize) -> (BlockCache, IoRef) {
        let io: IoRef = Arc::new(MemIo::with_block_size(
            blocks * CACHE_BLKSZ,
            CACHE_BLKSZ as u64,
        ));
        (BlockCache::new(io.clone()), io)
    }

    #[test]
    fn read_returns_backing_content() {
        let (cache, io) = ram_cache(4);
        io.writeat(512, &[7u8; CACHE_BLKSZ]).unwrap();
        let blk = cache.get_block(512).unwrap();
        assert!(blk.data().iter().all(|&b| b == 7));
        blk.release(false).unwrap();
    }

    #[test]
    fn dirty_release_writes_through() {
        let (cache, io) = ram_cache(4);
        let mut blk = cache.get_block(1024).unwrap();
        blk.data_mut().fill(0x5a);
        blk.release(true).unwrap();

        let mut raw = [0u8; CACHE_BLKSZ];
        io.readat(1024, &mut raw).unwrap();
        assert!(raw.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn eviction_keeps_recently_used_blocks() {
        let (cache, _io) = ram_cache(3 * CACHE_CAPACITY);

        // fill the cache, then promote block 0 with a hit
        for i in 0..CACHE_CAPACITY as u64 {
            cache.get_block(i * 512).unwrap().release(false).unwrap();
        }
        cache.get_block(0).unwrap().release(false).unwrap();

        // a fresh position must evict someone, but not the promoted block
        let far = (2 * CACHE_CAPACITY as u64) * 512;
        cache.get_block(far).unwrap().release(false).unwrap();
        let inner = cache.inner();
        assert!(inner
            .slots
            .iter()
            .any(|slot| slot.valid && slot.pos == 0));
    }

    #[test]
    fn misaligned_position_is_rejected() {
        let (cache, _io) = ram_cache(2);
        assert!(cache.get_block(100).is_err());
    }

    #[test]
    fn writes_survive_cache_rebuild() {
        let (cache, io) = ram_cache(8);
        for (i, fill) in [(0u64, 0x11u8), (1, 0x22), (2, 0x33)] {
            let mut blk = cache.get_block(i * 512).unwrap();
            blk.data_mut().fill(fill);
            blk.release(true).unwrap();
        }
        cache.flush().unwrap();

        // a new cache over the same endpoint observes the same bytes
        let rebuilt = BlockCache::new(io);
        for (i, fill) in [(0u64, 0x11u8), (1, 0x22), (2, 0x33)] {
            let blk = rebuilt.get_block(i * 512).unwrap();
            assert!(blk.data().iter().all(|&b| b == fill));
            blk.release(false).unwrap();
        }
        assert_eq!(rebuilt.backing_end().unwrap(), 8 * 512);
    }
}

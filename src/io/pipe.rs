use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::sync::Arc;
use core::alloc::Layout;
use core::cell::UnsafeCell;

use super::Io;
use crate::arch::PAGE_SIZE;
use crate::kernel::sync::{Condition, Lock};
use crate::kernel::{KernelError, KernelResult};

/// Ring capacity: one page.
const PIPE_CAPACITY: usize = PAGE_SIZE;

#[derive(Debug)]
struct PipeState {
    buf: *mut u8,
    head: usize,
    count: usize,
    writer_open: bool,
    reader_open: bool,
}

/// Shared half of a pipe pair. Byte-at-a-time transfers with a broadcast
/// after every byte keep the two directions simple and correct; throughput
/// was not the point here.
#[derive(Debug)]
struct PipeShared {
    lock: Lock,
    state: UnsafeCell<PipeState>,
    can_read: Condition,
    can_write: Condition,
}

unsafe impl Send for PipeShared {}
unsafe impl Sync for PipeShared {}

impl PipeShared {
    fn state(&self) -> &mut PipeState {
        // guarded by self.lock
        unsafe { &mut *self.state.get() }
    }
}

impl Drop for PipeShared {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(PIPE_CAPACITY, PAGE_SIZE).unwrap();
        unsafe { dealloc(self.state().buf, layout) };
    }
}

#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

/// Create a connected pipe pair, returned writer first.
pub fn pipe_new() -> KernelResult<(Arc<PipeWriter>, Arc<PipeReader>)> {
    let layout = Layout::from_size_align(PIPE_CAPACITY, PAGE_SIZE).unwrap();
    let buf = unsafe { alloc_zeroed(layout) };
    if buf.is_null() {
        return Err(KernelError::OutOfMemory);
    }
    let shared = Arc::new(PipeShared {
        lock: Lock::new("pipe"),
        state: UnsafeCell::new(PipeState {
            buf,
            head: 0,
            count: 0,
            writer_open: true,
            reader_open: true,
        }),
        can_read: Condition::new("pipe.can_read"),
        can_write: Condition::new("pipe.can_write"),
    });
    Ok((
        Arc::new(PipeWriter {
            shared: shared.clone(),
        }),
        Arc::new(PipeReader { shared }),
    ))
}

impl Io for PipeReader {
    /// Block while the ring is empty and the writer lives; once bytes are
    /// available return what is there, up to `buf.len()`. 0 only after the
    /// writer closed and the ring drained.
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let sh = &*self.shared;
        sh.lock.acquire();
        let mut n = 0;
        while n < buf.len() {
            let state = sh.state();
            if state.count == 0 {
                if n > 0 || !state.writer_open {
                    break;
                }
                sh.can_read.wait(&sh.lock);
                continue;
            }
            buf[n] = unsafe { *state.buf.add(state.head) };
            state.head = (state.head + 1) % PIPE_CAPACITY;
            state.count -= 1;
            n += 1;
            sh.can_write.broadcast();
        }
        sh.lock.release();
        Ok(n)
    }
}

impl Io for PipeWriter {
    /// Block while the ring is full; fail with `BrokenPipe` once the reader
    /// is gone.
    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let sh = &*self.shared;
        sh.lock.acquire();
        let mut n = 0;
        while n < buf.len() {
            let state = sh.state();
            if !state.reader_open {
                sh.lock.release();
                return Err(KernelError::BrokenPipe);
            }
            if state.count == PIPE_CAPACITY {
                sh.can_write.wait(&sh.lock);
                continue;
            }
            let tail = (state.head + state.count) % PIPE_CAPACITY;
            unsafe { *state.buf.add(tail) = buf[n] };
            state.count += 1;
            n += 1;
            sh.can_read.broadcast();
        }
        sh.lock.release();
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let sh = &*self.shared;
        sh.lock.acquire();
        sh.state().reader_open = false;
        sh.lock.release();
        sh.can_write.broadcast();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let sh = &*self.shared;
        sh.lock.acquire();
        sh.state().writer_open = false;
        sh.lock.release();
        sh.can_read.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_within_capacity() {
        let (w, r) = pipe_new().unwrap();
        let msg = b"through the ring";
        assert_eq!(w.write(msg).unwrap(), msg.len());
        let mut buf = [0u8; 64];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], msg);
    }

    #[test]
    fn wraparound_keeps_order() {
        let (w, r) = pipe_new().unwrap();
        let mut buf = [0u8; 3000];
        // push the indices most of the way around the ring
        w.write(&[0xaa; 3000]).unwrap();
        r.read(&mut buf).unwrap();
        w.write(&[0xaa; 3000]).unwrap();
        r.read(&mut buf).unwrap();

        let payload: alloc::vec::Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        w.write(&payload).unwrap();
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[test]
    fn reader_sees_eof_after_writer_close() {
        let (w, r) = pipe_new().unwrap();
        w.write(b"tail").unwrap();
        drop(w);
        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writer_breaks_when_reader_closes() {
        let (w, r) = pipe_new().unwrap();
        drop(r);
        assert_eq!(w.write(b"x"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn zero_length_transfers_do_nothing() {
        let (w, r) = pipe_new().unwrap();
        assert_eq!(w.write(&[]).unwrap(), 0);
        assert_eq!(r.read(&mut []).unwrap(), 0);
    }
}

use alloc::sync::Arc;

use spin::Mutex;

use super::{Io, IoCtl, IoRef};
use crate::kernel::{KernelError, KernelResult};

#[derive(Debug)]
struct SeekState {
    pos: u64,
    end: u64,
    blksz: u64,
}

/// Seekable adapter over a positioned endpoint: carries a cursor and
/// forwards `readat`/`writeat` directly. Stream `read`/`write` lengths must
/// be multiples of the (power-of-two) block size and are truncated to block
/// multiples at the end of the medium.
#[derive(Debug)]
pub struct SeekIo {
    backing: IoRef,
    state: Mutex<SeekState>,
}

impl SeekIo {
    pub fn new(backing: IoRef) -> KernelResult<Arc<Self>> {
        let blksz = backing.cntl(IoCtl::GetBlkSz)?;
        if blksz == 0 || !blksz.is_power_of_two() {
            return Err(KernelError::InvalidArg);
        }
        let end = backing.cntl(IoCtl::GetEnd)?;
        Ok(Arc::new(SeekIo {
            backing,
            state: Mutex::new(SeekState { pos: 0, end, blksz }),
        }))
    }

    fn stream_span(&self, len: usize) -> KernelResult<(u64, usize)> {
        let state = self.state.lock();
        if len as u64 % state.blksz != 0 {
            return Err(KernelError::InvalidArg);
        }
        let left = state.end.saturating_sub(state.pos);
        let mut n = (len as u64).min(left);
        n -= n % state.blksz;
        Ok((state.pos, n as usize))
    }
}

impl Io for SeekIo {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let (pos, n) = self.stream_span(buf.len())?;
        if n == 0 {
            return Ok(0);
        }
        let done = self.backing.readat(pos, &mut buf[..n])?;
        self.state.lock().pos = pos + done as u64;
        Ok(done)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let (pos, n) = self.stream_span(buf.len())?;
        if n == 0 {
            return Ok(0);
        }
        let done = self.backing.writeat(pos, &buf[..n])?;
        self.state.lock().pos = pos + done as u64;
        Ok(done)
    }

    fn readat(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.backing.readat(pos, buf)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        self.backing.writeat(pos, buf)
    }

    fn cntl(&self, cmd: IoCtl) -> KernelResult<u64> {
        match cmd {
            IoCtl::GetBlkSz => Ok(self.state.lock().blksz),
            IoCtl::GetPos => Ok(self.state.lock().pos),
            IoCtl::SetPos(pos) => {
                let mut state = self.state.lock();
                if pos > state.end {
                    return Err(KernelError::InvalidArg);
                }
                state.pos = pos;
                Ok(0)
            }
            IoCtl::GetEnd => Ok(self.state.lock().end),
            IoCtl::SetEnd(end) => {
                self.backing.cntl(IoCtl::SetEnd(end))?;
                self.state.lock().end = self.backing.cntl(IoCtl::GetEnd)?;
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemIo;

    #[test]
    fn sequential_reads_advance_the_cursor() {
        let backing = Arc::new(MemIo::new(8));
        backing.writeat(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let seek = SeekIo::new(backing).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(seek.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(seek.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [4, 5, 6]);
        assert_eq!(seek.cntl(IoCtl::GetPos).unwrap(), 6);
        // truncated at the end of the medium
        assert_eq!(seek.read(&mut buf).unwrap(), 2);
        assert_eq!(seek.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn block_endpoints_require_whole_blocks() {
        let backing = Arc::new(MemIo::with_block_size(2048, 512));
        let seek = SeekIo::new(backing).unwrap();
        let mut small = [0u8; 100];
        assert_eq!(seek.read(&mut small), Err(KernelError::InvalidArg));
        let mut block = [0u8; 512];
        assert_eq!(seek.read(&mut block).unwrap(), 512);
    }

    #[test]
    fn setpos_bounds_checked() {
        let seek = SeekIo::new(Arc::new(MemIo::new(16))).unwrap();
        assert_eq!(seek.cntl(IoCtl::SetPos(16)).unwrap(), 0);
        assert_eq!(
            seek.cntl(IoCtl::SetPos(17)),
            Err(KernelError::InvalidArg)
        );
    }
}

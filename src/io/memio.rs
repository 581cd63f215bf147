use alloc::vec::Vec;

use spin::Mutex;

use super::{Io, IoCtl};
use crate::kernel::{KernelError, KernelResult};

/// Byte-addressable endpoint over an in-memory buffer. Doubles as the
/// ram-disk backing in tests: `readat`/`writeat` clamp to the buffer and
/// `GETEND` reports its size.
#[derive(Debug)]
pub struct MemIo {
    data: Mutex<Vec<u8>>,
    blksz: u64,
}

impl MemIo {
    pub fn new(size: usize) -> Self {
        Self::with_block_size(size, 1)
    }

    pub fn with_block_size(size: usize, blksz: u64) -> Self {
        assert!(blksz >= 1 && size as u64 % blksz == 0);
        MemIo {
            data: Mutex::new(vec![0; size]),
            blksz,
        }
    }

    pub fn from_bytes(data: Vec<u8>, blksz: u64) -> Self {
        MemIo {
            data: Mutex::new(data),
            blksz,
        }
    }
}

impl Io for MemIo {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let data = self.data.lock();
        if pos > data.len() as u64 {
            return Err(KernelError::InvalidArg);
        }
        let n = buf.len().min(data.len() - pos as usize);
        buf[..n].copy_from_slice(&data[pos as usize..pos as usize + n]);
        Ok(n)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> KernelResult<usize> {
        let mut data = self.data.lock();
        if pos > data.len() as u64 {
            return Err(KernelError::InvalidArg);
        }
        let n = buf.len().min(data.len() - pos as usize);
        data[pos as usize..pos as usize + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn cntl(&self, cmd: IoCtl) -> KernelResult<u64> {
        match cmd {
            IoCtl::GetBlkSz => Ok(self.blksz),
            IoCtl::GetEnd => Ok(self.data.lock().len() as u64),
            _ => Err(KernelError::NotSupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readat_clamps_to_end() {
        let io = MemIo::new(16);
        io.writeat(12, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 8];
        let n = io.readat(12, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_position_is_invalid() {
        let io = MemIo::new(16);
        assert_eq!(io.readat(17, &mut [0; 1]), Err(KernelError::InvalidArg));
        assert_eq!(io.writeat(17, &[0; 1]), Err(KernelError::InvalidArg));
    }

    #[test]
    fn reports_size_and_block_size() {
        let io = MemIo::with_block_size(1024, 512);
        assert_eq!(io.cntl(IoCtl::GetEnd).unwrap(), 1024);
        assert_eq!(io.cntl(IoCtl::GetBlkSz).unwrap(), 512);
        assert_eq!(io.cntl(IoCtl::GetPos), Err(KernelError::NotSupported));
    }
}

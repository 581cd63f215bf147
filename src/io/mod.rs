//! Polymorphic I/O endpoints. An endpoint is an `Arc<dyn Io>`: cloning the
//! arc duplicates the reference, dropping the last one destroys the object,
//! and endpoint-specific teardown lives in `Drop` impls. Any operation an
//! endpoint does not implement reports `NotSupported`.

mod memio;
mod pipe;
mod seek;

pub use memio::MemIo;
pub use pipe::{pipe_new, PipeReader, PipeWriter};
pub use seek::SeekIo;

use crate::kernel::{KernelError, KernelResult};

/// Control operations, numbered for the syscall ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCtl {
    GetBlkSz,
    GetPos,
    SetPos(u64),
    GetEnd,
    SetEnd(u64),
}

impl IoCtl {
    pub const CMD_GETBLKSZ: usize = 0;
    pub const CMD_GETPOS: usize = 1;
    pub const CMD_SETPOS: usize = 2;
    pub const CMD_GETEND: usize = 3;
    pub const CMD_SETEND: usize = 4;
}

pub trait Io: Send + Sync + core::fmt::Debug {
    /// Stream read: at least one byte, or block; 0 only at end-of-stream.
    fn read(&self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn readat(&self, _pos: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn writeat(&self, _pos: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn cntl(&self, cmd: IoCtl) -> KernelResult<u64> {
        match cmd {
            IoCtl::GetBlkSz => Ok(1),
            _ => Err(KernelError::NotSupported),
        }
    }
}

pub type IoRef = alloc::sync::Arc<dyn Io>;
